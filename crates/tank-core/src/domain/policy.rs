//! Reconnect backoff policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned for an inconsistent policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("base delay must be greater than zero")]
    ZeroBaseDelay,
    #[error("base delay {base:?} exceeds max delay {max:?}")]
    BaseExceedsMax { base: Duration, max: Duration },
}

/// Exponential backoff configuration.
///
/// The `n`-th retry (0-based) waits `min(base_delay * 2^n, max_delay)`.
/// After `max_attempts` retries without a successful handshake the link
/// gives up.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use tank_core::ReconnectPolicy;
///
/// let policy = ReconnectPolicy::new(
///     Duration::from_millis(1000),
///     Duration::from_millis(5000),
///     5,
/// ).unwrap();
/// assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
/// assert_eq!(policy.delay_for(2), Duration::from_millis(4000));
/// assert_eq!(policy.delay_for(3), Duration::from_millis(5000));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// Builds a validated policy.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError`] if `base_delay` is zero or larger than `max_delay`.
    pub fn new(
        base_delay: Duration,
        max_delay: Duration,
        max_attempts: u32,
    ) -> Result<Self, PolicyError> {
        if base_delay.is_zero() {
            return Err(PolicyError::ZeroBaseDelay);
        }
        if base_delay > max_delay {
            return Err(PolicyError::BaseExceedsMax {
                base: base_delay,
                max: max_delay,
            });
        }
        Ok(Self {
            base_delay,
            max_delay,
            max_attempts,
        })
    }

    /// Delay before retry number `attempt` (0-based).
    ///
    /// Saturates instead of overflowing for large attempt numbers.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Returns `true` if another retry may be scheduled after
    /// `attempts_so_far` retries.
    pub fn allows_retry(&self, attempts_so_far: u32) -> bool {
        attempts_so_far < self.max_attempts
    }

    /// The full delay schedule, one entry per permitted retry.
    pub fn schedule(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts).map(move |n| self.delay_for(n))
    }
}

impl Default for ReconnectPolicy {
    /// 1 s base, 30 s cap, 5 retries.
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            max_attempts: 5,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
