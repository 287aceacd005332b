//! Configuration for the sync reactor.

use crate::error::{ReactorError, ReactorResult};
use rand::Rng;
use std::time::Duration;
use tessera_protocol::PROTOCOL_VERSION;

/// Configuration for a [`crate::Reactor`].
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Application id sent in the join handshake.
    pub app_id: String,
    /// Server endpoint, used by network transports.
    pub endpoint: String,
    /// Protocol version.
    pub protocol_version: u16,
    /// Reconnect backoff.
    pub retry: RetryConfig,
    /// Interval between heartbeat pings. `None` disables the heartbeat.
    pub heartbeat_interval: Option<Duration>,
    /// How long to wait for a pong before treating the connection as lost.
    pub heartbeat_timeout: Duration,
    /// Number of query results kept in the persisted cache.
    pub query_cache_limit: usize,
}

impl ReactorConfig {
    /// Creates a new configuration.
    pub fn new(app_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            endpoint: endpoint.into(),
            protocol_version: PROTOCOL_VERSION,
            retry: RetryConfig::default(),
            heartbeat_interval: Some(Duration::from_secs(30)),
            heartbeat_timeout: Duration::from_secs(10),
            query_cache_limit: 10,
        }
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the heartbeat interval and pong timeout.
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self.heartbeat_timeout = timeout;
        self
    }

    /// Disables the heartbeat.
    pub fn without_heartbeat(mut self) -> Self {
        self.heartbeat_interval = None;
        self
    }

    /// Sets how many query results are cached across restarts.
    pub fn with_query_cache_limit(mut self, limit: usize) -> Self {
        self.query_cache_limit = limit;
        self
    }

    /// Sets the protocol version.
    pub fn with_protocol_version(mut self, version: u16) -> Self {
        self.protocol_version = version;
        self
    }

    /// Checks that the configuration can drive a reactor.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Config`] if the app id is empty, the retry
    /// settings are inconsistent, or the heartbeat has a zero interval or
    /// timeout.
    pub fn validate(&self) -> ReactorResult<()> {
        if self.app_id.is_empty() {
            return Err(ReactorError::Config("app id must not be empty".into()));
        }
        self.retry.validate()?;
        if let Some(interval) = self.heartbeat_interval {
            if interval.is_zero() {
                return Err(ReactorError::Config(
                    "heartbeat interval must be greater than zero".into(),
                ));
            }
            if self.heartbeat_timeout.is_zero() {
                return Err(ReactorError::Config(
                    "heartbeat timeout must be greater than zero".into(),
                ));
            }
        }
        Ok(())
    }
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self::new("", "")
    }
}

/// Configuration for reconnect backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for the delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration with the given bounds.
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, enabled: bool) -> Self {
        self.add_jitter = enabled;
        self
    }

    /// Checks that delays stay finite and non-decreasing.
    ///
    /// # Errors
    ///
    /// Returns [`ReactorError::Config`] if the multiplier is not a finite
    /// number of at least 1.0 or `initial_delay` exceeds `max_delay`.
    pub fn validate(&self) -> ReactorResult<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ReactorError::Config(format!(
                "backoff multiplier must be a finite number >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(ReactorError::Config(format!(
                "initial delay {:?} exceeds max delay {:?}",
                self.initial_delay, self.max_delay
            )));
        }
        Ok(())
    }

    /// Calculates the delay before retry `attempt` (1-indexed; 0 means no delay).
    ///
    /// The delay grows geometrically up to `max_delay`. Jitter adds up to 25%
    /// on top, so the ceiling is `max_delay * 1.25`. A configuration that
    /// fails [`RetryConfig::validate`] never yields a negative delay.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64()).max(0.0);

        if self.add_jitter {
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reactor_config_builder() {
        let config = ReactorConfig::new("app-1", "ws://localhost:8888/runtime")
            .with_heartbeat(Duration::from_secs(5), Duration::from_secs(2))
            .with_query_cache_limit(3);

        assert_eq!(config.app_id, "app-1");
        assert_eq!(config.endpoint, "ws://localhost:8888/runtime");
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
        assert_eq!(config.heartbeat_interval, Some(Duration::from_secs(5)));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(2));
        assert_eq!(config.query_cache_limit, 3);
        assert_eq!(config.without_heartbeat().heartbeat_interval, None);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new(Duration::from_millis(100), Duration::from_secs(30))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay3 = config.delay_for_attempt(3);
        assert!(delay3 >= Duration::from_millis(400));
        assert!(delay3 <= Duration::from_millis(500));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new(Duration::from_secs(1), Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn retry_delay_stays_in_bounds_for_bad_multipliers() {
        let base = RetryConfig::new(Duration::from_secs(1), Duration::from_secs(5)).with_jitter(false);
        let negative = base.clone().with_backoff_multiplier(-2.0);
        assert_eq!(negative.delay_for_attempt(2), Duration::ZERO);
        assert_eq!(negative.delay_for_attempt(3), Duration::from_secs(4));
        let nan = base.with_backoff_multiplier(f64::NAN);
        assert_eq!(nan.delay_for_attempt(2), Duration::from_secs(5));
    }

    #[test]
    fn validate_rejects_unusable_settings() {
        let base = RetryConfig::new(Duration::from_secs(1), Duration::from_secs(5));
        assert!(base.validate().is_ok());
        for multiplier in [-2.0, 0.5, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                base.clone().with_backoff_multiplier(multiplier).validate(),
                Err(ReactorError::Config(_))
            ));
        }
        assert!(base.clone().with_max_delay(Duration::from_millis(10)).validate().is_err());

        let config = ReactorConfig::new("app", "mem://");
        assert!(config.validate().is_ok());
        assert!(ReactorConfig::default().validate().is_err());
        assert!(config
            .clone()
            .with_heartbeat(Duration::from_secs(1), Duration::ZERO)
            .validate()
            .is_err());
        assert!(config
            .clone()
            .with_heartbeat(Duration::ZERO, Duration::ZERO)
            .without_heartbeat()
            .validate()
            .is_ok());
        assert!(config
            .with_retry(base.with_backoff_multiplier(-2.0))
            .validate()
            .is_err());
    }
}
