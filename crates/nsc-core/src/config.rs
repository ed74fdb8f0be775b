//! Timing and retry configuration for the connection state machine.
//!
//! Values are stored as milliseconds so they read naturally in TOML:
//!
//! ```toml
//! [connect]
//! grace_window_ms = 3000
//! settle_delay_ms = 500
//! slow_warning_ms = 15000
//! signer_wait_timeout_ms = 120000
//! auth_timeout_ms = 30000
//! max_approval_retries = 5
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::ConnectError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectTimings {
    /// How long a "secret rejected" outcome waits for a late approval URL
    #[serde(default = "default_grace_window_ms")]
    pub grace_window_ms: u64,

    /// Pause between `connected` and starting the sign-in
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Informational warning threshold, once per episode
    #[serde(default = "default_slow_warning_ms")]
    pub slow_warning_ms: u64,

    /// Hard timeout while waiting for a signer to attach
    #[serde(default = "default_signer_wait_timeout_ms")]
    pub signer_wait_timeout_ms: u64,

    /// Hard timeout handed to the authentication completer
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,

    /// Upper bound on `retry_after_approval` calls for one bunker URL
    #[serde(default = "default_max_approval_retries")]
    pub max_approval_retries: u32,
}

fn default_grace_window_ms() -> u64 {
    3_000
}

fn default_settle_delay_ms() -> u64 {
    500
}

fn default_slow_warning_ms() -> u64 {
    15_000
}

fn default_signer_wait_timeout_ms() -> u64 {
    120_000
}

fn default_auth_timeout_ms() -> u64 {
    30_000
}

fn default_max_approval_retries() -> u32 {
    5
}

impl Default for ConnectTimings {
    fn default() -> Self {
        Self {
            grace_window_ms: default_grace_window_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            slow_warning_ms: default_slow_warning_ms(),
            signer_wait_timeout_ms: default_signer_wait_timeout_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
            max_approval_retries: default_max_approval_retries(),
        }
    }
}

impl ConnectTimings {
    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.grace_window_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn slow_warning(&self) -> Duration {
        Duration::from_millis(self.slow_warning_ms)
    }

    pub fn signer_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.signer_wait_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConnectError> {
        if self.grace_window_ms == 0 {
            return Err(ConnectError::InvalidConfig(
                "grace_window_ms must be greater than 0".into(),
            ));
        }
        if self.signer_wait_timeout_ms == 0 || self.auth_timeout_ms == 0 {
            return Err(ConnectError::InvalidConfig(
                "timeouts must be greater than 0".into(),
            ));
        }
        if self.slow_warning_ms >= self.signer_wait_timeout_ms {
            return Err(ConnectError::InvalidConfig(format!(
                "slow_warning_ms ({}) must be below signer_wait_timeout_ms ({})",
                self.slow_warning_ms, self.signer_wait_timeout_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let timings = ConnectTimings::default();
        assert!(timings.validate().is_ok());
        assert_eq!(timings.grace_window(), Duration::from_secs(3));
    }

    #[test]
    fn test_slow_warning_must_precede_timeout() {
        let timings = ConnectTimings {
            slow_warning_ms: 5_000,
            signer_wait_timeout_ms: 5_000,
            ..Default::default()
        };
        let err = timings.validate().unwrap_err();
        assert!(err.to_string().contains("slow_warning_ms"));
    }

    #[test]
    fn test_legacy_attempts_key_is_ignored() {
        let timings: ConnectTimings =
            serde_json::from_str(r#"{"bunker_attempts": 3, "grace_window_ms": 1000}"#).unwrap();
        assert_eq!(timings.grace_window_ms, 1_000);
        assert_eq!(
            timings,
            ConnectTimings {
                grace_window_ms: 1_000,
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_zero_grace_window_rejected() {
        let timings = ConnectTimings {
            grace_window_ms: 0,
            ..Default::default()
        };
        assert!(timings.validate().is_err());
    }
}
