//! Fan-out executor: one task per replica, early stop at the success
//! target.
//!
//! Results arrive through a buffer sized to the peer count, so producers
//! never block; a task still in flight when the caller stops waiting runs
//! to completion in the background. No retries, and no per-task
//! cancellation on early success: only the caller stops waiting.

use crate::client::ClientError;
use std::future::Future;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// The most recent per-node failure once the success target became
/// unreachable.
#[derive(Debug)]
pub(crate) struct FanoutFailure {
    pub node: String,
    pub error: ClientError,
}

/// Run `op` against every node concurrently and wait until `target`
/// replies succeeded.
///
/// The target is unreachable once the observed failures exceed
/// `nodes.len() - target`; the most recent failure is returned with its
/// node tag. Cancelling `cancel` resolves every in-flight task to
/// [`ClientError::Cancelled`].
pub(crate) async fn pull<T, F, Fut>(
    nodes: &[String],
    target: usize,
    deadline: Instant,
    cancel: &CancellationToken,
    op: F,
) -> Result<Vec<(String, T)>, FanoutFailure>
where
    T: Send + 'static,
    F: Fn(usize, String) -> Fut,
    Fut: Future<Output = Result<T, ClientError>> + Send + 'static,
{
    let n = nodes.len();
    debug_assert!(target >= 1 && target <= n);

    let (tx, mut rx) = mpsc::channel(n);
    for (i, node) in nodes.iter().enumerate() {
        let tx = tx.clone();
        let cancel = cancel.clone();
        let fut = op(i, node.clone());
        let node = node.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                r = fut => r,
                _ = cancel.cancelled() => Err(ClientError::Cancelled),
            };
            // Capacity matches the producer count, so this never blocks;
            // it only errors once the consumer has stopped listening.
            let _ = tx.send((node, result)).await;
        });
    }
    drop(tx);

    let mut successes = Vec::with_capacity(target);
    let mut failures = 0usize;
    let mut last: Option<FanoutFailure> = None;

    while let Some((node, result)) = tokio::time::timeout_at(deadline, rx.recv())
        .await
        .ok()
        .flatten()
    {
        match result {
            Ok(value) => {
                successes.push((node, value));
                if successes.len() >= target {
                    return Ok(successes);
                }
            }
            Err(error) => {
                let failure = FanoutFailure { node, error };
                tracing::error!(
                    replica = %failure.node,
                    error = %failure.error,
                    "replica read failed"
                );
                failures += 1;
                if failures > n - target {
                    return Err(failure);
                }
                last = Some(failure);
            }
        }
    }

    // The deadline elapsed short of the target.
    Err(last.unwrap_or(FanoutFailure {
        node: String::new(),
        error: ClientError::Timeout,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn nodes(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_stops_at_target() {
        let cancel = CancellationToken::new();
        let got = pull(
            &nodes(&["A", "B", "C"]),
            2,
            deadline(),
            &cancel,
            |_, node| async move {
                if node == "C" {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                Ok(node)
            },
        )
        .await
        .unwrap();
        assert_eq!(got.len(), 2);
        assert!(got.iter().all(|(n, _)| n != "C"));
    }

    #[tokio::test]
    async fn test_impossible_returns_last_error() {
        let cancel = CancellationToken::new();
        let err = pull(
            &nodes(&["A", "B", "C"]),
            3,
            deadline(),
            &cancel,
            |_, node| async move {
                if node == "B" {
                    Err(ClientError::Rpc("boom".into()))
                } else {
                    Ok(node)
                }
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.node, "B");
        assert!(matches!(err.error, ClientError::Rpc(_)));
    }

    #[tokio::test]
    async fn test_tolerates_failures_below_target() {
        let cancel = CancellationToken::new();
        let got = pull(
            &nodes(&["A", "B", "C"]),
            1,
            deadline(),
            &cancel,
            |_, node| async move {
                if node == "C" {
                    Ok(node)
                } else {
                    Err(ClientError::Rpc("down".into()))
                }
            },
        )
        .await
        .unwrap();
        assert_eq!(got, vec![("C".to_string(), "C".to_string())]);
    }

    #[tokio::test]
    async fn test_cancellation_resolves_inflight_tasks() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pull(
            &nodes(&["A", "B"]),
            2,
            deadline(),
            &cancel,
            |_, node: String| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(node)
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.error, ClientError::Cancelled);
    }

    #[tokio::test]
    async fn test_deadline_elapses() {
        let cancel = CancellationToken::new();
        let err = pull(
            &nodes(&["A"]),
            1,
            Instant::now() + Duration::from_millis(20),
            &cancel,
            |_, node: String| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(node)
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.error, ClientError::Timeout);
    }
}
