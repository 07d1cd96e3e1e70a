//! Capped exponential backoff.
//!
//! Used twice by the session: for the short in-cycle discovery retries and for
//! reconnect delays between failed connection cycles.

use std::time::Duration;

/// Delay law `min(base * 2^(attempt - 1), max)`.
///
/// The delay grows strictly until it reaches `max` and then holds steady.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub base: Duration,
    /// Ceiling the delay never exceeds.
    pub max: Duration,
}

impl Backoff {
    /// Create a backoff law.
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `attempt` (1-based). Attempt 0 waits nothing.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let shift = (attempt - 1).min(31);
        self.base
            .checked_mul(1u32 << shift)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Sum of the delays for attempts `1..=attempts`.
    #[must_use]
    pub fn total(&self, attempts: u32) -> Duration {
        (1..=attempts).map(|a| self.delay(a)).sum()
    }
}
