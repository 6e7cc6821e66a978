use std::future::Future;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{Error, Result};

/// Exponential backoff policy bounded by a wall-clock deadline.
///
/// Every polling loop in the engine (task completion, VM status, agent
/// liveness, exec completion) is an instance of this policy: delays start
/// near 100ms and grow by a fixed factor until the deadline, at which
/// point the operation fails with [`Error::ProvisioningTimeout`] rather
/// than hanging.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f64,
    pub deadline: Duration,
}

impl Backoff {
    /// Standard schedule: 100ms start, 1.3x growth, caller's deadline.
    pub const fn with_deadline(deadline: Duration) -> Self {
        Self {
            initial: Duration::from_millis(100),
            factor: 1.3,
            deadline,
        }
    }

    pub const fn new(initial: Duration, factor: f64, deadline: Duration) -> Self {
        Self {
            initial,
            factor,
            deadline,
        }
    }

    /// Drive `f` until it succeeds or the deadline lapses. Every error is
    /// treated as retryable; the final failure is a `ProvisioningTimeout`
    /// carrying the last observation.
    pub async fn retry<T, F, Fut>(&self, operation: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.retry_if(operation, |_| true, f).await
    }

    /// Like [`Backoff::retry`], but only errors matching `retryable` are
    /// retried; others propagate immediately.
    pub async fn retry_if<T, F, Fut, P>(&self, operation: &str, retryable: P, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&Error) -> bool,
    {
        let started = Instant::now();
        let mut delay = self.initial;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(err) if !retryable(&err) => return Err(err),
                Err(err) => {
                    if started.elapsed() + delay > self.deadline {
                        return Err(Error::ProvisioningTimeout {
                            operation: operation.to_string(),
                            after: started.elapsed(),
                            last: err.to_string(),
                        });
                    }
                    debug!(
                        operation,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "not ready, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = Duration::from_secs_f64(delay.as_secs_f64() * self.factor);
                }
            }
        }
    }

    /// Drive `f` until it yields `Some(value)` or the deadline lapses.
    /// `Ok(None)` means "not ready yet"; errors propagate immediately.
    pub async fn poll_until<T, F, Fut>(&self, operation: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let started = Instant::now();
        let mut delay = self.initial;
        loop {
            match f().await? {
                Some(value) => return Ok(value),
                None => {
                    if started.elapsed() + delay > self.deadline {
                        return Err(Error::ProvisioningTimeout {
                            operation: operation.to_string(),
                            after: started.elapsed(),
                            last: "condition not met".to_string(),
                        });
                    }
                    debug!(
                        operation,
                        delay_ms = delay.as_millis() as u64,
                        "condition not met, polling again"
                    );
                    tokio::time::sleep(delay).await;
                    delay = Duration::from_secs_f64(delay.as_secs_f64() * self.factor);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast() -> Backoff {
        Backoff::new(Duration::from_millis(1), 1.3, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result = fast().retry("noop", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let count = Cell::new(0u32);
        let result = fast()
            .retry("flaky", || {
                let attempt = count.get() + 1;
                count.set(attempt);
                async move {
                    if attempt < 3 {
                        Err(Error::Agent("not yet".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_deadline_yields_timeout() {
        let result: Result<()> = fast()
            .retry("never", || async { Err(Error::Agent("still broken".into())) })
            .await;
        match result {
            Err(Error::ProvisioningTimeout { operation, last, .. }) => {
                assert_eq!(operation, "never");
                assert!(last.contains("still broken"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retry_if_propagates_structural_errors() {
        let count = Cell::new(0u32);
        let result: Result<()> = fast()
            .retry_if(
                "structural",
                |e| !matches!(e, Error::Configuration(_)),
                || {
                    count.set(count.get() + 1);
                    async { Err(Error::Configuration("bad input".into())) }
                },
            )
            .await;
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_eq!(count.get(), 1);
    }

    #[tokio::test]
    async fn test_poll_until_resolves() {
        let count = Cell::new(0u32);
        let result = fast()
            .poll_until("counter", || {
                let attempt = count.get() + 1;
                count.set(attempt);
                async move { Ok(if attempt >= 4 { Some(attempt) } else { None }) }
            })
            .await;
        assert_eq!(result.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_poll_until_propagates_errors() {
        let result: Result<u32> = fast()
            .poll_until("broken", || async { Err(Error::Agent("boom".into())) })
            .await;
        assert!(matches!(result, Err(Error::Agent(_))));
    }

    #[tokio::test]
    async fn test_poll_until_deadline() {
        let result: Result<u32> = fast().poll_until("never", || async { Ok(None) }).await;
        assert!(matches!(result, Err(Error::ProvisioningTimeout { .. })));
    }
}
