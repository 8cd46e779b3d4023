//! Stage engine configuration.
//!
//! All tunables have compile-time defaults; consumers override fields on the
//! struct literal. Per-call parameters (stage id, user id, role, media
//! constraints) travel in the join request instead.

use std::time::Duration;
use thiserror::Error;

/// Default bounded timeout for the signaling join acknowledgement.
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(15);

/// Default bound for a single peer link's offer/answer/ICE convergence.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Default grace period before a disconnected peer link is pruned.
///
/// The transport already retries internally, so this stays short.
pub const DEFAULT_DISCONNECT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Default cap on consecutive reconnect attempts before a terminal error.
pub const DEFAULT_RECONNECT_ATTEMPT_CAP: u32 = 5;

/// Default base delay for exponential reconnect backoff.
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Default ceiling for the reconnect backoff delay.
pub const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(15);

/// Default orchestrator housekeeping tick (link pruning, quality sampling).
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Default channel buffer size for the orchestrator mailbox.
pub const DEFAULT_COMMAND_BUFFER: usize = 64;

/// Default capacity of the event broadcast channel.
pub const DEFAULT_EVENT_BUFFER: usize = 128;

/// Stage engine configuration.
#[derive(Debug, Clone)]
pub struct StageConfig {
    /// Bounded timeout for the signaling join acknowledgement.
    pub join_timeout: Duration,

    /// Bound for a single peer link's negotiation to converge.
    pub negotiation_timeout: Duration,

    /// Grace period before a disconnected peer link is pruned.
    pub disconnect_grace_period: Duration,

    /// Cap on consecutive reconnect attempts before a terminal error.
    pub reconnect_attempt_cap: u32,

    /// Base delay for exponential reconnect backoff.
    pub reconnect_base_delay: Duration,

    /// Ceiling for the reconnect backoff delay.
    pub reconnect_max_delay: Duration,

    /// Orchestrator housekeeping tick interval.
    pub tick_interval: Duration,

    /// Orchestrator mailbox buffer size.
    pub command_buffer: usize,

    /// Event broadcast channel capacity.
    pub event_buffer: usize,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            disconnect_grace_period: DEFAULT_DISCONNECT_GRACE_PERIOD,
            reconnect_attempt_cap: DEFAULT_RECONNECT_ATTEMPT_CAP,
            reconnect_base_delay: DEFAULT_RECONNECT_BASE_DELAY,
            reconnect_max_delay: DEFAULT_RECONNECT_MAX_DELAY,
            tick_interval: DEFAULT_TICK_INTERVAL,
            command_buffer: DEFAULT_COMMAND_BUFFER,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl StageConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.join_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "join_timeout must be non-zero".to_string(),
            ));
        }
        if self.negotiation_timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "negotiation_timeout must be non-zero".to_string(),
            ));
        }
        if self.reconnect_attempt_cap == 0 {
            return Err(ConfigError::InvalidValue(
                "reconnect_attempt_cap must be at least 1".to_string(),
            ));
        }
        if self.reconnect_base_delay.is_zero() {
            return Err(ConfigError::InvalidValue(
                "reconnect_base_delay must be non-zero".to_string(),
            ));
        }
        if self.reconnect_max_delay < self.reconnect_base_delay {
            return Err(ConfigError::InvalidValue(
                "reconnect_max_delay must be >= reconnect_base_delay".to_string(),
            ));
        }
        if self.command_buffer == 0 || self.event_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "channel buffers must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(StageConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_attempt_cap_is_rejected() {
        let config = StageConfig {
            reconnect_attempt_cap: 0,
            ..StageConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_backoff_bounds_are_rejected() {
        let config = StageConfig {
            reconnect_base_delay: Duration::from_secs(30),
            reconnect_max_delay: Duration::from_secs(1),
            ..StageConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
