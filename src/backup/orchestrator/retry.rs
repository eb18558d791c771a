use crate::backup::orchestrator::cancel::CancelToken;
use crate::backup::orchestrator::clock::Clock;
use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use bon::Builder;
use getset::CopyGetters;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;
use validator::Validate;

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(300)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

/// Exponential backoff for retryable failures.
///
/// The delay before attempt `n + 1` is `base_delay * multiplier^(n - 1)`,
/// capped at `max_delay` and spread by `±jitter` of itself.
#[derive(Clone, Debug, Serialize, Deserialize, Validate, Builder, CopyGetters, PartialEq)]
#[serde(deny_unknown_fields)]
#[getset(get_copy = "pub")]
pub struct RetryConfig {
    /// Total attempts per phase, the first one included
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1))]
    #[builder(default = default_max_attempts())]
    max_attempts: u32,
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    #[builder(default = default_base_delay())]
    base_delay: Duration,
    #[serde(default = "default_max_delay", with = "humantime_serde")]
    #[builder(default = default_max_delay())]
    max_delay: Duration,
    #[serde(default = "default_multiplier")]
    #[validate(range(min = 1.0))]
    #[builder(default = default_multiplier())]
    multiplier: f64,
    #[serde(default = "default_jitter")]
    #[validate(range(min = 0.0, max = 1.0))]
    #[builder(default = default_jitter())]
    jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig::builder().build()
    }
}

impl RetryConfig {
    /// Backoff before the attempt following failed attempt `attempt` (1-based),
    /// without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        base.mul_f64(factor)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or
    /// runs out of attempts. Waiting between attempts is cut short by
    /// `cancel`.
    pub fn run<T, F>(&self, clock: &dyn Clock, cancel: &CancelToken, mut op: F) -> Result<T>
    where
        F: FnMut(u32) -> Result<T>,
    {
        let mut attempt = 1;
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !e.class().is_retryable() || attempt >= self.max_attempts {
                        return Err(e);
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        "Attempt {}/{} failed ({}), retrying in {:?}",
                        attempt,
                        self.max_attempts,
                        e.class(),
                        delay
                    );
                    if clock.sleep(delay, cancel) {
                        return Err(Error::Cancelled);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::result_error::class::ErrorClass;
    use crate::backup::testing::FakeClock;

    fn config(max_attempts: u32) -> RetryConfig {
        RetryConfig::builder()
            .max_attempts(max_attempts)
            .base_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(5))
            .jitter(0.0)
            .build()
    }

    fn transient() -> Error {
        Error::DumpFailed {
            target: "shop".into(),
            class: ErrorClass::Transient,
            diagnostic: "lost connection".into(),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = config(10);
        let delays: Vec<_> = (1..=5).map(|n| config.base_delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let config = RetryConfig::builder()
            .base_delay(Duration::from_secs(10))
            .jitter(0.5)
            .build();
        for _ in 0..100 {
            let delay = config.delay_for(1);
            assert!(delay >= Duration::from_secs(5) && delay <= Duration::from_secs(15));
        }
    }

    #[test]
    fn test_retries_transient_until_success() {
        let clock = FakeClock::default();
        let mut failures = vec![];
        let result = config(3).run(&clock, &CancelToken::new(), |attempt| {
            if attempt < 3 {
                failures.push(attempt);
                Err(transient())
            } else {
                Ok(attempt)
            }
        });
        assert_eq!(result.unwrap(), 3);
        assert_eq!(failures, vec![1, 2]);
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let clock = FakeClock::default();
        let mut calls = 0;
        let result: Result<()> = config(2).run(&clock, &CancelToken::new(), |_| {
            calls += 1;
            Err(transient())
        });
        assert_eq!(result.unwrap_err().class(), ErrorClass::Transient);
        assert_eq!(calls, 2);
    }

    #[test]
    fn test_permanent_failure_not_retried() {
        let clock = FakeClock::default();
        let mut calls = 0;
        let result: Result<()> = config(5).run(&clock, &CancelToken::new(), |_| {
            calls += 1;
            Err(Error::MissingCredential("DB_PASSWORD".into()))
        });
        assert_eq!(result.unwrap_err().class(), ErrorClass::PermanentConfig);
        assert_eq!(calls, 1);
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn test_cancel_interrupts_backoff() {
        let clock = FakeClock::default();
        let cancel = CancelToken::new();
        clock.cancel_on_sleep(cancel.clone());
        let result: Result<()> = config(5).run(&clock, &cancel, |_| Err(transient()));
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_deserialize_defaults() {
        let config: RetryConfig = serde_yml::from_str("base_delay: 2s\n").unwrap();
        assert_eq!(config.max_attempts(), 3);
        assert_eq!(config.base_delay(), Duration::from_secs(2));
        assert_eq!(config.max_delay(), Duration::from_secs(300));
        config.validate().unwrap();
    }
}
