use std::error::Error as StdError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{BrokerError, RetryError};

/// Errors that know whether another attempt could succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for BrokerError {
    fn is_transient(&self) -> bool {
        !self.is_fatal()
    }
}

/// Bounded retry with a fixed delay between attempts.
///
/// This is the only retry policy in the crate: the producer's initial
/// connection, its health monitor and the consumer's receive worker all go
/// through it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Pause between two consecutive attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Run `operation` until it succeeds, fails with a non-transient error,
    /// or `max_attempts` calls have failed.
    ///
    /// **Parameters**
    /// - `what`: short label used in diagnostics.
    /// - `operation`: called with the 1-based attempt number.
    ///
    /// **Returns**
    /// - `Ok(value)` from the first successful attempt.
    /// - `Err(RetryError::Exhausted)` carrying the last failure once the
    ///   budget is spent.
    /// - `Err(RetryError::Fatal)` as soon as an attempt fails with an error
    ///   that is not [`Transient`].
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + Transient + 'static,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(what, attempt, "succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(e) if !e.is_transient() => {
                    tracing::error!(what, attempt, error = %e, "non-retryable failure");
                    return Err(RetryError::Fatal { attempt, source: e });
                }
                Err(e) if attempt >= max_attempts => {
                    tracing::error!(what, attempts = attempt, error = %e, "retries exhausted");
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        source: e,
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        what,
                        attempt,
                        max_attempts,
                        delay = ?self.delay,
                        error = %e,
                        "attempt failed, retrying"
                    );
                    sleep(self.delay).await;
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
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn two_failures_then_success_takes_three_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_secs(5));

        let calls_op = Arc::clone(&calls);
        let result = policy
            .run("connect", move |_| {
                let calls = Arc::clone(&calls_op);
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(BrokerError::Connection("refused".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_keeps_last_cause() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let err = policy
            .run("connect", |attempt| async move {
                Err::<(), _>(BrokerError::Connection(format!("attempt {attempt}")))
            })
            .await
            .unwrap_err();

        match err {
            RetryError::Exhausted { attempts, source } => {
                assert_eq!(attempts, 3);
                assert_eq!(source.to_string(), "broker connection failed: attempt 3");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_fixed_delay_between_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_secs(2));
        let start = tokio::time::Instant::now();
        let _ = policy
            .run("connect", |_| async {
                Err::<(), _>(BrokerError::Connection("down".into()))
            })
            .await;
        // Two pauses: none after the final attempt.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(4) && elapsed < Duration::from_secs(6));
    }

    #[tokio::test]
    async fn topology_conflicts_are_not_retried() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_secs(60));
        let err = policy
            .run("declare", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(BrokerError::TopologyConflict {
                        entity: "queue q".into(),
                        reason: "args differ".into(),
                    })
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RetryError::Fatal { attempt: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
