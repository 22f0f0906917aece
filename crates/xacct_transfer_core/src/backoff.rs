//! Retry delay computation.
//!
//! Only the arithmetic lives here; sleeping and re-invoking is done by the
//! runtime crate so this module stays executor-free.

use std::time::Duration;

use rand::Rng;

pub const THROTTLE_MAX_ATTEMPTS: u32 = 5;
pub const THROTTLE_BASE_DELAY: Duration = Duration::from_secs(1);
pub const THROTTLE_MAX_DELAY: Duration = Duration::from_secs(60);

pub const STAGE_MAX_ATTEMPTS: u32 = 3;
pub const STAGE_BASE_DELAY: Duration = Duration::from_secs(2);
pub const STAGE_MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Jitter {
    /// Sleep exactly the exponential ceiling.
    None,
    /// Sleep a uniform random duration in `[0, ceiling]`.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total invocations, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: Jitter,
}

impl BackoffPolicy {
    /// Policy used by the transfer executor for throttling signals.
    pub fn throttle() -> Self {
        Self {
            max_attempts: THROTTLE_MAX_ATTEMPTS,
            base_delay: THROTTLE_BASE_DELAY,
            max_delay: THROTTLE_MAX_DELAY,
            jitter: Jitter::Full,
        }
    }

    /// Policy used by the orchestrator for transient service faults.
    pub fn stage() -> Self {
        Self {
            max_attempts: STAGE_MAX_ATTEMPTS,
            base_delay: STAGE_BASE_DELAY,
            max_delay: STAGE_MAX_DELAY,
            jitter: Jitter::None,
        }
    }

    /// Upper bound of the delay after the failed attempt `attempt` (0-based):
    /// `min(max_delay, base_delay * 2^attempt)`.
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn delay(&self, attempt: u32, rng: &mut impl Rng) -> Duration {
        let ceiling = self.ceiling(attempt);
        match self.jitter {
            Jitter::None => ceiling,
            Jitter::Full => {
                let ceiling_ms = u64::try_from(ceiling.as_millis()).unwrap_or(u64::MAX);
                if ceiling_ms == 0 {
                    return Duration::ZERO;
                }
                Duration::from_millis(rng.gen_range(0..=ceiling_ms))
            }
        }
    }

    /// Whether another attempt is allowed after `attempts_made` invocations.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}
