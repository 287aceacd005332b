//! Collaborators supplied by the embedding platform.

use crate::reactor::Shared;
use std::fmt;
use std::sync::Weak;

/// Supplies the session credential.
///
/// The reactor asks for a token whenever it joins and has no valid stored
/// credential, and reports server-side rotations through `on_refresh`.
pub trait CredentialProvider: Send + Sync {
    /// Returns the token to present, if any.
    fn current_token(&self) -> Option<String>;

    /// Called when the server rotates the credential.
    fn on_refresh(&self, _token: &str) {}
}

/// A provider that always returns the same token.
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    token: String,
}

impl StaticCredentials {
    /// Creates a provider for a fixed token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn current_token(&self) -> Option<String> {
        Some(self.token.clone())
    }
}

/// Reports device connectivity to the reactor.
///
/// `watch` is called once when the reactor is built; the listener keeps the
/// [`NetworkHints`] and calls it whenever the platform's connectivity
/// changes. While offline the reactor does not attempt to reconnect; coming
/// back online skips any remaining backoff.
pub trait NetworkListener: Send + Sync {
    /// Returns whether the device is currently online.
    fn is_online(&self) -> bool {
        true
    }

    /// Starts delivering connectivity changes.
    fn watch(&self, hints: NetworkHints);
}

/// Handle a [`NetworkListener`] uses to report connectivity changes.
#[derive(Clone)]
pub struct NetworkHints {
    shared: Weak<Shared>,
}

impl NetworkHints {
    pub(crate) fn new(shared: Weak<Shared>) -> Self {
        Self { shared }
    }

    /// Reports whether the device is online.
    pub fn set_online(&self, online: bool) {
        if let Some(shared) = self.shared.upgrade() {
            shared.with_core(|core| core.set_online(online));
        }
    }
}

impl fmt::Debug for NetworkHints {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkHints").finish_non_exhaustive()
    }
}
