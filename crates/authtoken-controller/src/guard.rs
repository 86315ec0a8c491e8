//! Deadline and shutdown bounds for external calls

use std::future::Future;
use std::time::Duration;

use authtoken_common::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Bounds every external call of a reconcile pass
///
/// Each call gets its own deadline. All calls abort as soon as the token is
/// cancelled, leaving whatever was already created for the next pass.
#[derive(Clone, Debug)]
pub struct CallGuard {
    timeout: Duration,
    cancel: CancellationToken,
}

impl CallGuard {
    /// Create a guard with a per-call timeout and a shutdown token
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }

    /// Whether shutdown was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `fut`, failing with `Timeout` after the deadline or `Cancelled` on shutdown
    pub async fn run<T, F>(&self, operation: &str, fut: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        if self.cancel.is_cancelled() {
            return Err(Error::cancelled(operation));
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                debug!(operation, "call aborted by shutdown");
                Err(Error::cancelled(operation))
            }
            res = tokio::time::timeout(self.timeout, fut) => match res {
                Ok(inner) => inner,
                Err(_) => Err(Error::timeout(operation, self.timeout)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use authtoken_common::ErrorClass;

    #[tokio::test]
    async fn passes_through_results() {
        let guard = CallGuard::new(Duration::from_secs(1), CancellationToken::new());
        assert_eq!(guard.run("op", async { Ok(7) }).await.unwrap(), 7);

        let err = guard
            .run::<(), _>("op", async { Err(Error::internal("boom")) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal { .. }));
    }

    #[tokio::test]
    async fn slow_calls_time_out_as_transient() {
        let guard = CallGuard::new(Duration::from_millis(20), CancellationToken::new());
        let err = guard
            .run("create Role ns1/reader", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(err.class(), ErrorClass::Transient);
        assert!(err.to_string().contains("create Role ns1/reader"));
    }

    /// Story: shutdown aborts an in-flight call promptly
    #[tokio::test]
    async fn story_shutdown_aborts_outstanding_call() {
        let cancel = CancellationToken::new();
        let guard = CallGuard::new(Duration::from_secs(60), cancel.clone());

        let call = tokio::spawn({
            let guard = guard.clone();
            async move {
                guard
                    .run("mint token", async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(())
                    })
                    .await
            }
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let err = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .expect("guard should return promptly")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
        assert!(guard.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_guard_does_not_start_calls() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let guard = CallGuard::new(Duration::from_secs(1), cancel);
        let err = guard
            .run::<(), _>("get Namespace ns1", async { unreachable!("must not be polled") })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { .. }));
    }
}
