//! Exponential backoff with optional jitter and clamping.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero behaves as one.
    pub attempts: u32,
    /// Base delay in seconds, doubled on every attempt.
    pub base: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Random spread as a fraction of the delay, clamped to `0.0..=1.0`.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Startup probe: a single attempt, 2s base.
    pub fn startup_default() -> Self {
        Self {
            attempts: 1,
            base: 2.0,
            min: None,
            max: None,
            jitter: 0.0,
        }
    }

    /// Forwarded requests: no retries, 1s base.
    pub fn request_default() -> Self {
        Self {
            attempts: 0,
            base: 1.0,
            min: None,
            max: None,
            jitter: 0.0,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.attempts.max(1)
    }

    /// Delay after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        self.backoff_with_factor(attempt, factor)
    }

    fn backoff_with_factor(&self, attempt: u32, factor: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let mut secs = self.base * 2f64.powi(exponent) * factor;
        if let Some(min) = self.min {
            secs = secs.max(min);
        }
        if let Some(max) = self.max {
            secs = secs.min(max);
        }
        if !secs.is_finite() || secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// policy runs out of attempts. Sleeps `policy.backoff(n)` between attempts.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.max_attempts();
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts && is_transient(&err) => {
                let delay = policy.backoff(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}; retry in {:.1}s",
                    label,
                    attempt,
                    attempts,
                    err,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base: 2.0,
            min: None,
            max: None,
            jitter: 0.0,
        }
    }

    #[test]
    fn backoff_doubles() {
        let p = policy(5);
        assert_eq!(p.backoff(1), Duration::from_secs(2));
        assert_eq!(p.backoff(2), Duration::from_secs(4));
        assert_eq!(p.backoff(3), Duration::from_secs(8));
    }

    #[test]
    fn backoff_is_clamped() {
        let p = RetryPolicy {
            min: Some(5.0),
            max: Some(30.0),
            ..policy(10)
        };
        assert_eq!(p.backoff(1), Duration::from_secs(5));
        assert_eq!(p.backoff(3), Duration::from_secs(8));
        assert_eq!(p.backoff(10), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_in_range() {
        let p = RetryPolicy {
            jitter: 0.2,
            ..policy(3)
        };
        for _ in 0..100 {
            let d = p.backoff(2).as_secs_f64();
            assert!((3.19..=4.81).contains(&d), "{d}");
        }
    }

    #[test]
    fn degenerate_values_do_not_panic() {
        let p = RetryPolicy {
            base: -1.0,
            jitter: 5.0,
            ..policy(3)
        };
        assert_eq!(p.backoff(1), Duration::ZERO);
        assert!(policy(1).backoff(200) > Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_until_success() {
        let calls = &AtomicU32::new(0);
        let result: Result<u32, String> = retry(&policy(3), "probe", |_| true, move || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("boom {n}"))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = retry(&policy(2), "probe", |_| true, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("down".to_string())
        })
        .await;
        assert_eq!(result, Err("down".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let is_transient = |e: &String| e != "fatal";
        let result: Result<(), String> = retry(&policy(5), "probe", is_transient, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("fatal".to_string())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_attempts_runs_once() {
        let calls = &AtomicU32::new(0);
        let _: Result<(), String> = retry(&policy(0), "request", |_| true, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("x".to_string())
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
