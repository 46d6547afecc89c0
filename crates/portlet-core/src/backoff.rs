// ── Retry backoff ──
//
// Exponential backoff with jitter for transient probe failures.
// The delay sequence never shrinks between resets and never exceeds
// the configured cap.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::time::Duration;

use tracing::debug;

/// Exponential backoff configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry. Default: 1s.
    pub initial: Duration,
    /// Upper bound on any delay. Default: 30s.
    pub max: Duration,
    /// Growth factor per attempt. Values below 1.0 are treated as 1.0.
    pub multiplier: f64,
    /// Maximum extra fraction added on top of the exponential delay.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

/// Per-service retry state.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
    last: Duration,
    /// Per-instance offset of the jitter frequency, in `[0, 1)`.
    phase: f64,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            attempt: 0,
            last: Duration::ZERO,
            phase: 0.0,
        }
    }

    /// Backoff whose jitter is seeded from `key`, so retries of different
    /// services drift apart after the first delay.
    pub fn seeded(config: BackoffConfig, key: impl Hash) -> Self {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let bucket = u32::try_from(hasher.finish() % 10_000).unwrap_or(0);
        Self {
            phase: f64::from(bucket) / 10_000.0,
            ..Self::new(config)
        }
    }

    /// Delay to wait before the next attempt. Advances the attempt counter.
    ///
    /// `delay = max(last, min(max, min(initial * multiplier^attempt, max) * (1 + jitter)))`
    pub fn next_delay(&mut self) -> Duration {
        let cap = self.config.max.as_secs_f64();
        let growth = self.config.multiplier.max(1.0);
        let exponent = i32::try_from(self.attempt).unwrap_or(i32::MAX);
        let base = (self.config.initial.as_secs_f64() * growth.powi(exponent)).min(cap);
        let jittered = (base * jitter_factor(self.attempt, self.phase, self.config.jitter)).min(cap);

        let delay = Duration::try_from_secs_f64(jittered)
            .unwrap_or(self.config.max)
            .max(self.last);

        self.attempt = self.attempt.saturating_add(1);
        self.last = delay;
        debug!(attempt = self.attempt, ?delay, "backoff delay");
        delay
    }

    /// Back to the initial delay.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}

/// Deterministic jitter in `[1, 1 + jitter]`. Attempt 0 is never
/// jittered; `phase` shifts the frequency for later attempts.
fn jitter_factor(attempt: u32, phase: f64, jitter: f64) -> f64 {
    let spread = jitter.clamp(0.0, 1.0);
    1.0 + spread * (f64::from(attempt) * (7.3 + phase)).sin().abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast() -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }

    #[test]
    fn default_config_matches_documented_values() {
        let config = BackoffConfig::default();
        assert_eq!(config.initial, Duration::from_secs(1));
        assert_eq!(config.max, Duration::from_secs(30));
    }

    #[test]
    fn first_delay_is_initial() {
        // sin(0) = 0, so attempt 0 carries no jitter.
        let mut backoff = Backoff::new(fast());
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.attempt(), 1);
    }

    #[test]
    fn delays_never_decrease_and_stay_capped() {
        let mut backoff = Backoff::new(fast());
        let mut previous = Duration::ZERO;
        for _ in 0..40 {
            let delay = backoff.next_delay();
            assert!(delay >= previous, "{delay:?} < {previous:?}");
            assert!(delay <= Duration::from_secs(2), "{delay:?} exceeds cap");
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(2));
    }

    #[test]
    fn delays_grow_exponentially_before_cap() {
        let mut backoff = Backoff::new(BackoffConfig {
            jitter: 0.0,
            ..fast()
        });
        let delays: Vec<u128> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, [100, 200, 400, 800, 1600]);
    }

    #[test]
    fn reset_returns_to_initial() {
        let mut backoff = Backoff::new(fast());
        for _ in 0..6 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn seeded_instances_drift_apart_after_first_delay() {
        let mut web = Backoff::seeded(BackoffConfig::default(), "svc-web");
        let mut db = Backoff::seeded(BackoffConfig::default(), "svc-db");

        let web_delays: Vec<Duration> = (0..5).map(|_| web.next_delay()).collect();
        let db_delays: Vec<Duration> = (0..5).map(|_| db.next_delay()).collect();

        assert_eq!(web_delays[0], Duration::from_secs(1));
        assert_eq!(db_delays[0], Duration::from_secs(1));
        assert_ne!(web_delays[1..], db_delays[1..]);
    }

    #[test]
    fn same_seed_gives_same_sequence() {
        let mut a = Backoff::seeded(fast(), "svc-web");
        let mut b = Backoff::seeded(fast(), "svc-web");
        for _ in 0..6 {
            assert_eq!(a.next_delay(), b.next_delay());
        }
    }

    #[test]
    fn shrinking_multiplier_is_clamped() {
        let mut backoff = Backoff::new(BackoffConfig {
            multiplier: 0.5,
            jitter: 0.0,
            ..fast()
        });
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
