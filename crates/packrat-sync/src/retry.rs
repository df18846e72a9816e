//! Bounded retry with server-directed delays.
//!
//! Rate-limited requests honor the `Retry-After` header when present and
//! fall back to a fixed delay otherwise. The attempt budget is small; a
//! persistently throttled pass fails fast instead of backing off forever.

use std::future::Future;
use std::time::Duration;

/// How an operation classified its own failure.
pub enum RetryDecision<E> {
    /// Transient: wait (server-directed when given) and try again.
    Retry { after: Option<Duration>, error: E },
    /// Not worth retrying; surface immediately.
    Fatal(E),
}

/// Sleep seam so retry timing is testable without waiting.
#[async_trait::async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper backed by the tokio timer.
pub struct TokioSleeper;

#[async_trait::async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Retry budget for remote adapter calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub default_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            default_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Run `op` until it succeeds, fails fatally, or the attempt budget is
    /// spent. Budget exhaustion surfaces the last transient error.
    pub async fn run<T, E, F, Fut>(&self, sleeper: &dyn Sleeper, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RetryDecision<E>>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(RetryDecision::Fatal(error)) => return Err(error),
                Err(RetryDecision::Retry { after, error }) => {
                    if attempt >= self.max_attempts {
                        return Err(error);
                    }
                    let delay = after.unwrap_or(self.default_delay);
                    tracing::debug!(
                        "Transient failure (attempt {attempt}/{}), retrying in {delay:?}",
                        self.max_attempts
                    );
                    sleeper.sleep(delay).await;
                }
            }
        }
    }
}

/// Parse a `Retry-After` header value. Only the delta-seconds form is
/// supported; HTTP-date values fall back to the default delay.
#[must_use]
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    value
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Records requested delays instead of sleeping.
    #[derive(Default)]
    struct RecordingSleeper {
        delays: Mutex<Vec<Duration>>,
    }

    #[async_trait::async_trait]
    impl Sleeper for RecordingSleeper {
        async fn sleep(&self, duration: Duration) {
            self.delays.lock().unwrap().push(duration);
        }
    }

    #[tokio::test]
    async fn success_on_first_attempt_never_sleeps() {
        let sleeper = RecordingSleeper::default();
        let result: Result<i32, &str> = RetryPolicy::default()
            .run(&sleeper, || async { Ok(7) })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn rate_limit_honors_server_delay_then_succeeds() {
        let sleeper = RecordingSleeper::default();
        let attempts = AtomicU32::new(0);

        let result: Result<&str, &str> = RetryPolicy::default()
            .run(&sleeper, || {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(RetryDecision::Retry {
                            after: parse_retry_after(Some("2")),
                            error: "rate limited",
                        })
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        let delays = sleeper.delays.lock().unwrap();
        assert_eq!(delays.as_slice(), &[Duration::from_secs(2)]);
    }

    #[tokio::test]
    async fn persistent_rate_limit_exhausts_budget() {
        let sleeper = RecordingSleeper::default();
        let attempts = AtomicU32::new(0);

        let result: Result<(), &str> = RetryPolicy::default()
            .run(&sleeper, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(RetryDecision::Retry {
                        after: None,
                        error: "rate limited",
                    })
                }
            })
            .await;

        assert_eq!(result.unwrap_err(), "rate limited");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // Two sleeps between three attempts, both at the default delay.
        let delays = sleeper.delays.lock().unwrap();
        assert_eq!(
            delays.as_slice(),
            &[Duration::from_secs(5), Duration::from_secs(5)]
        );
    }

    #[tokio::test]
    async fn fatal_error_short_circuits() {
        let sleeper = RecordingSleeper::default();
        let attempts = AtomicU32::new(0);

        let result: Result<(), &str> = RetryPolicy::default()
            .run(&sleeper, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(RetryDecision::Fatal("forbidden")) }
            })
            .await;

        assert_eq!(result.unwrap_err(), "forbidden");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(sleeper.delays.lock().unwrap().is_empty());
    }

    #[test]
    fn retry_after_parses_delta_seconds_only() {
        assert_eq!(parse_retry_after(Some("2")), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_after(Some(" 10 ")), Some(Duration::from_secs(10)));
        assert_eq!(parse_retry_after(Some("Wed, 21 Oct 2026 07:28:00 GMT")), None);
        assert_eq!(parse_retry_after(None), None);
    }
}
