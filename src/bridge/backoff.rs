//! Reconnect backoff
//!
//! Delays grow by `multiplier` from `initial` up to `max`, with a random
//! positive jitter proportional to the base delay. Within one retry run the
//! sequence never decreases; [`Backoff::reset`] starts a new run.

use crate::config::ReconnectSection;
use rand::Rng;
use std::time::Duration;

/// Shape of a backoff sequence
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
}

impl BackoffPolicy {
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: if multiplier.is_finite() && multiplier >= 1.0 {
                multiplier
            } else {
                1.0
            },
            jitter: if jitter.is_finite() {
                jitter.clamp(0.0, 1.0)
            } else {
                0.0
            },
        }
    }

    pub fn from_section(section: &ReconnectSection) -> Self {
        Self::new(
            Duration::from_millis(section.initial_delay_ms),
            Duration::from_millis(section.max_delay_ms),
            section.multiplier,
            section.jitter,
        )
    }

    /// Policy without randomness, handy for deterministic schedules
    pub fn fixed_ratio(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self::new(initial, max, multiplier, 0.0)
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }

    /// Un-jittered delay for the given 1-based attempt
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let max_millis = self.max.as_millis() as f64;
        if !millis.is_finite() || millis >= max_millis {
            self.max
        } else {
            Duration::from_millis(millis as u64)
        }
    }

    fn jittered(&self, base: Duration) -> Duration {
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(0.0..=self.jitter);
        base.saturating_add(base.mul_f64(factor))
    }

    /// Start a fresh retry run
    pub fn start(&self) -> Backoff {
        Backoff::new(self.clone())
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_section(&ReconnectSection::default())
    }
}

/// Stateful cursor over a [`BackoffPolicy`]
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
    last: Duration,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    /// Delay before the next attempt
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        let base = self.policy.base_delay(self.attempt);
        let delay = self
            .policy
            .jittered(base)
            .min(self.policy.max)
            .max(self.last);
        self.last = delay;
        delay
    }

    /// Back to the initial delay after a successful session
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }

    /// Retries taken in the current run
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ms(value: u64) -> Duration {
        Duration::from_millis(value)
    }

    #[test]
    fn test_exponential_growth_without_jitter() {
        let mut backoff = BackoffPolicy::fixed_ratio(ms(100), ms(1000), 2.0).start();
        let delays: Vec<_> = (0..6).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![ms(100), ms(200), ms(400), ms(800), ms(1000), ms(1000)]
        );
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = BackoffPolicy::fixed_ratio(ms(100), ms(1000), 2.0).start();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), ms(100));
    }

    #[test]
    fn test_invalid_parameters_are_normalised() {
        let policy = BackoffPolicy::new(ms(500), ms(100), 0.5, f64::NAN);
        assert_eq!(policy.max_delay(), ms(500));
        assert_eq!(policy.base_delay(10), ms(500));
    }

    #[test]
    fn test_huge_attempt_counts_saturate_at_cap() {
        let policy = BackoffPolicy::fixed_ratio(ms(1), ms(60_000), 10.0);
        assert_eq!(policy.base_delay(u32::MAX), ms(60_000));
    }

    #[test]
    fn test_from_section() {
        let policy = BackoffPolicy::from_section(&ReconnectSection::default());
        assert_eq!(policy.base_delay(1), ms(1000));
        assert_eq!(policy.max_delay(), ms(60_000));
    }

    proptest! {
        #[test]
        fn delays_never_decrease_and_respect_cap(
            initial in 1u64..5_000,
            extra in 0u64..120_000,
            multiplier in 1.0f64..4.0,
            jitter in 0.0f64..1.0,
            steps in 1usize..40,
        ) {
            let cap = ms(initial + extra);
            let mut backoff = BackoffPolicy::new(ms(initial), cap, multiplier, jitter).start();
            let mut previous = Duration::ZERO;
            for _ in 0..steps {
                let delay = backoff.next_delay();
                prop_assert!(delay >= previous, "{:?} < {:?}", delay, previous);
                prop_assert!(delay <= cap, "{:?} > cap {:?}", delay, cap);
                previous = delay;
            }
        }
    }
}
