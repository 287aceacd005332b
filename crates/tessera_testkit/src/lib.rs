//! # Tessera Testkit
//!
//! Test utilities for the Tessera sync reactor.
//!
//! This crate provides:
//! - [`RecordingTransport`], a scripted in-process transport that records
//!   every client frame and lets a test play the server
//! - [`ManualClock`] for driving backoff and heartbeat deadlines
//! - Fixtures for queries, operations and server messages
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tessera_testkit::prelude::*;
//!
//! #[test]
//! fn replays_after_reconnect() {
//!     let harness = Harness::new();
//!     let sub = harness.reactor.subscribe_query(&query(json!({"todos": {}})), |_| {}).unwrap();
//!     harness.transport.connect_and_join();
//!     // ... play the server
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod fixtures;
pub mod generators;
pub mod transport;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::clock::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::transport::*;
    pub use crate::init_tracing;
    pub use serde_json::json;
}

pub use clock::*;
pub use fixtures::*;
pub use generators::*;
pub use transport::*;

/// Installs a test-friendly tracing subscriber once per process.
///
/// Output is filtered by `RUST_LOG` and captured by the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
