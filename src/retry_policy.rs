//! Bounded exponential backoff, independent of what is being retried.
//!
//! Delays grow as `base * multiplier^n` (capped at `max_delay`) with optional
//! additive jitter, so a delay is never shorter than its nominal value.

use std::future::Future;
use std::time::Duration;

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Extra random delay as a fraction of the nominal delay (0.0 disables)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    /// 3 attempts, 1s base, doubling: waits 1s then 2s.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.max(0.0);
        self
    }

    /// Nominal delay before retry number `retry` (0 = the wait after the first failure)
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(31) as i32);
        let millis = (self.base_delay.as_millis() as f64 * factor).min(u64::MAX as f64) as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Delay actually slept: nominal plus jitter
    pub fn delay_for(&self, retry: u32) -> Duration {
        let nominal = self.nominal_delay(retry);
        if self.jitter == 0.0 {
            return nominal;
        }
        let extra = nominal.as_millis() as f64 * self.jitter * rand::random::<f64>();
        nominal + Duration::from_millis(extra as u64)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or `max_attempts` is reached. The last error is returned unchanged.
    ///
    /// `on_retry(attempt, &err, delay)` fires before each backoff sleep.
    pub async fn run<F, Fut, T, E, P, R>(
        &self,
        operation: F,
        is_retryable: P,
        on_retry: R,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        R: FnMut(u32, &E, Duration),
    {
        self.run_until(operation, is_retryable, on_retry, std::future::pending())
            .await
    }

    /// Like `run`, but a backoff sleep ends early when `stop` resolves; the
    /// error that caused the wait is returned. Attempts in progress are not
    /// interrupted.
    pub async fn run_until<F, Fut, T, E, P, R, S>(
        &self,
        mut operation: F,
        is_retryable: P,
        mut on_retry: R,
        stop: S,
    ) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        R: FnMut(u32, &E, Duration),
        S: Future<Output = ()>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt: u32 = 1;
        tokio::pin!(stop);

        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= max_attempts || !is_retryable(&err) {
                        return Err(err);
                    }

                    let delay = self.delay_for(attempt - 1);
                    on_retry(attempt, &err, delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = &mut stop => return Err(err),
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
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[test]
    fn test_default_backoff_sequence() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.nominal_delay(0), Duration::from_secs(1));
        assert_eq!(policy.nominal_delay(1), Duration::from_secs(2));
        assert_eq!(policy.nominal_delay(2), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.nominal_delay(10), Duration::from_secs(30));
        assert_eq!(policy.nominal_delay(31), Duration::from_secs(30));
        assert_eq!(policy.nominal_delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_never_shortens_delay() {
        let policy = RetryPolicy::default().with_jitter(0.1);
        for retry in 0..6 {
            let nominal = policy.nominal_delay(retry);
            let actual = policy.delay_for(retry);
            assert!(actual >= nominal, "retry {}: {:?} < {:?}", retry, actual, nominal);
            assert!(actual <= nominal + nominal / 10 + Duration::from_millis(1));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_succeeds_after_transient_failures() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let mut delays = Vec::new();
        let start = Instant::now();

        let result: Result<&str, &str> = policy
            .run(
                move |_| async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("flaky")
                    } else {
                        Ok("done")
                    }
                },
                |_| true,
                |_, _, delay| delays.push(delay),
            )
            .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(delays, vec![Duration::from_secs(1), Duration::from_secs(2)]);
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_returns_last_error_when_exhausted() {
        let policy = RetryPolicy::default();
        let result: Result<(), String> = policy
            .run(
                |attempt| async move { Err(format!("failure {}", attempt)) },
                |_| true,
                |_, _, _| {},
            )
            .await;
        assert_eq!(result, Err("failure 3".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cuts_backoff_short() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let start = Instant::now();

        let result: Result<(), &str> = policy
            .run_until(
                move |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("flaky")
                },
                |_| true,
                |_, _, _| {},
                tokio::time::sleep(Duration::from_millis(300)),
            )
            .await;

        assert_eq!(result, Err("flaky"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_non_retryable() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), &str> = policy
            .run(
                move |_| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("fatal")
                },
                |e| *e != "fatal",
                |_, _, _| {},
            )
            .await;
        assert_eq!(result, Err("fatal"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
