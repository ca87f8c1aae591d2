use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Timing knobs for the server side of the handshake.
///
/// Times are stored as integer milliseconds so they read naturally in a
/// config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// How long a rejected peer stays connected before it is closed, so the
    /// failure response has time to reach it.
    ///
    /// Default: 1000 ms.
    pub grace_delay_ms: u64,

    /// How long a peer may wait in `PendingValidation` before it is rejected
    /// as if validation had failed. `0` waits forever.
    ///
    /// Default: 30 000 ms.
    pub validation_timeout_ms: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            grace_delay_ms: 1_000,
            validation_timeout_ms: 30_000,
        }
    }
}

impl AuthConfig {
    pub fn grace_delay(&self) -> Duration {
        Duration::from_millis(self.grace_delay_ms)
    }

    /// `None` when the timeout is disabled.
    pub fn validation_timeout(&self) -> Option<Duration> {
        (self.validation_timeout_ms > 0)
            .then(|| Duration::from_millis(self.validation_timeout_ms))
    }
}
