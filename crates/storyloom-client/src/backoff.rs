use std::future::Future;
use std::time::Duration;

/// Exponential reconnect schedule: `base * 2^attempt`, clamped to `max_delay`,
/// giving up after `max_retries` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 5)
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Delay before retry number `attempt` (zero based), or `None` once retries
    /// are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        Some(
            self.base_delay
                .checked_mul(factor)
                .map_or(self.max_delay, |delay| delay.min(self.max_delay)),
        )
    }

    /// Runs `op` until it succeeds or retries run out, sleeping between attempts.
    /// The last error is returned when every attempt fails.
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => match self.delay_for(attempt) {
                    Some(delay) => {
                        tracing::debug!(
                            target = "stream.transport",
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %err,
                            "retrying after failure"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(err),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_until_capped() {
        let policy = ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(5), 5);
        let delays: Vec<_> = (0..6).map(|n| policy.delay_for(n)).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_secs(1)),
                Some(Duration::from_secs(2)),
                Some(Duration::from_secs(4)),
                Some(Duration::from_secs(5)),
                Some(Duration::from_secs(5)),
                None,
            ]
        );
    }

    #[test]
    fn huge_attempts_do_not_overflow() {
        let policy = ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 100);
        assert_eq!(policy.delay_for(64), Some(Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_returns_last_error_after_exhaustion() {
        let policy = ReconnectPolicy::new(Duration::from_millis(10), Duration::from_millis(40), 3);
        let mut calls = 0;
        let result: Result<(), String> = policy
            .retry(|attempt| {
                calls += 1;
                async move { Err(format!("attempt {attempt}")) }
            })
            .await;
        assert_eq!(result.unwrap_err(), "attempt 3");
        assert_eq!(calls, 4);
    }
}
