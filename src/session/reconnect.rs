//! Reconnection policy.
//!
//! After an unrecoverable connection failure the session asks its policy
//! whether to reconnect and how long to back off. The default is
//! truncated binary exponential backoff: attempt `n` sleeps uniformly in
//! `[0, (2^n - 1) * slot)`, with the exponent clamped at a ceiling so
//! later attempts keep the same delay distribution.

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectConfig;
use crate::error::Error;

/// Decides whether and when the session reconnects after a failure.
pub trait ReconnectPolicy: Send + Sync {
    /// Whether a reconnect attempt should be made for this failure.
    ///
    /// A `conflict` stream error means another session deliberately
    /// replaced this one; reconnecting would only steal it back.
    fn may_reconnect(&self, cause: &Error) -> bool {
        !cause.is_conflict()
    }

    /// Delay before attempt `attempt` (1-based).
    fn delay(&self, attempt: u32, cause: &Error) -> Duration;
}

/// Truncated binary exponential backoff with randomized slot selection.
#[derive(Debug, Clone)]
pub struct BinaryExponentialBackoff {
    config: ReconnectConfig,
}

impl BinaryExponentialBackoff {
    /// Create a policy from configuration.
    pub fn new(config: ReconnectConfig) -> Self {
        Self { config }
    }

    /// Upper bound of the delay window for a given attempt.
    pub fn window(&self, attempt: u32) -> Duration {
        let exponent = attempt.max(1).min(self.config.ceiling);
        let slots = (1u64 << exponent) - 1;
        Duration::from_secs(slots.saturating_mul(self.config.slot_secs))
    }
}

impl ReconnectPolicy for BinaryExponentialBackoff {
    fn may_reconnect(&self, cause: &Error) -> bool {
        self.config.enabled && !cause.is_conflict()
    }

    fn delay(&self, attempt: u32, _cause: &Error) -> Duration {
        let window = self.window(attempt);
        if window.is_zero() {
            return Duration::ZERO;
        }
        let millis = rand::thread_rng().gen_range(0..window.as_millis() as u64);
        Duration::from_millis(millis)
    }
}
