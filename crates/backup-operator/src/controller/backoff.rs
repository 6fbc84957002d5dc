//! Exponential backoff for failed reconciliations, tracked per object.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use rand::Rng;

/// Delay after the first failure.
pub const BASE_DELAY: Duration = Duration::from_secs(5);

/// Upper bound of the delay, before jitter is applied.
pub const MAX_DELAY: Duration = Duration::from_secs(5 * 60);

/// Relative amount the delay is randomly shifted by, in both directions.
pub const JITTER: f64 = 0.1;

/// Entries without a failure for this long are dropped. A failing object is retried well within
/// this time, so only objects which were deleted (or never reconciled again) are affected.
pub const STALE_AFTER: Duration = Duration::from_secs(2 * 5 * 60);

#[derive(Debug)]
struct Failures {
    count: u32,
    last_failure: Instant,
}

/// Counts consecutive failures per object and derives the delay before the next attempt.
#[derive(Debug, Default)]
pub struct BackoffTable {
    failures: HashMap<String, Failures>,
}

impl BackoffTable {
    /// Records a failure of `key` and returns the (jittered) delay before the next attempt.
    pub fn next_delay(&mut self, key: &str) -> Duration {
        let delay = self.record_failure(key, Instant::now());
        jitter(delay, &mut rand::rng())
    }

    /// Records a failure of `key` at `now`, returning the delay without jitter. Stale entries of
    /// other objects are pruned on the way.
    fn record_failure(&mut self, key: &str, now: Instant) -> Duration {
        self.prune(now);

        let failures = self.failures.entry(key.to_owned()).or_insert(Failures {
            count: 0,
            last_failure: now,
        });
        let delay = delay_for_attempt(failures.count);
        failures.count = failures.count.saturating_add(1);
        failures.last_failure = now;

        delay
    }

    /// Drops the entries whose last failure is more than [`STALE_AFTER`] before `now`.
    pub fn prune(&mut self, now: Instant) {
        self.failures.retain(|_, failures| {
            now.saturating_duration_since(failures.last_failure) <= STALE_AFTER
        });
    }

    /// Forgets all failures of `key`, the next failure starts at [`BASE_DELAY`] again.
    pub fn reset(&mut self, key: &str) {
        self.failures.remove(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.failures
            .get(key)
            .map(|failures| failures.count)
            .unwrap_or_default()
    }
}

/// The delay before retry number `attempt` (starting at 0), without jitter.
pub fn delay_for_attempt(attempt: u32) -> Duration {
    // 5s * 2^7 already exceeds the maximum
    let factor = 2u32.saturating_pow(attempt.min(16));
    BASE_DELAY.saturating_mul(factor).min(MAX_DELAY)
}

/// Shifts `delay` by a random amount of up to [`JITTER`] in either direction.
pub fn jitter(delay: Duration, rng: &mut impl Rng) -> Duration {
    delay.mul_f64(1.0 + rng.random_range(-JITTER..=JITTER))
}
