//! Per-call deadline and cancellation for external capability calls

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Default deadline for a single external call
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Wraps every suspension point of one invocation
#[derive(Debug, Clone)]
pub struct CallGuard {
    timeout: Duration,
    cancel: CancellationToken,
}

impl CallGuard {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `fut` under the deadline, racing the invocation's cancellation token
    pub async fn call<T, F>(&self, stage: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled(stage)),
            res = tokio::time::timeout(self.timeout, fut) => match res {
                Ok(inner) => inner,
                Err(_) => {
                    tracing::warn!(stage, timeout = ?self.timeout, "external call timed out");
                    Err(Error::Timeout {
                        stage,
                        elapsed: self.timeout,
                    })
                }
            },
        }
    }
}

impl Default for CallGuard {
    fn default() -> Self {
        Self::new(DEFAULT_CALL_TIMEOUT, CancellationToken::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_passes_through_result() {
        let guard = CallGuard::default();
        let out = guard.call("classify", async { Ok::<_, Error>(7) }).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn test_call_times_out() {
        let guard = CallGuard::new(Duration::from_millis(20), CancellationToken::new());
        let err = guard
            .call("summarize", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, Error>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(err.to_string().starts_with("summarize timed out"));
    }

    #[tokio::test]
    async fn test_call_observes_cancellation() {
        let token = CancellationToken::new();
        let guard = CallGuard::new(Duration::from_secs(5), token.clone());
        token.cancel();
        let err = guard
            .call("generate", async { Ok::<_, Error>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled("generate")));
        assert!(guard.is_cancelled());
    }
}
