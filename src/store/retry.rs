use std::future::Future;
use std::time::Duration;

use crate::error::{ControlPlaneError, Result};

/// Bounded exponential-backoff retry for optimistic-concurrency conflicts
/// (spec.md §4.A / §9: "default backoff ≈100ms start, ≈5 attempts").
///
/// `op` re-reads and re-derives its mutation on every attempt — it must
/// never retry a stale copy (Design Notes §9).
pub async fn with_retry<T, F, Fut>(
    start: Duration,
    max_attempts: u32,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    let mut delay = start;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt + 1 < max_attempts => {
                attempt += 1;
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(err) => {
                return Err(if matches!(err, ControlPlaneError::Conflict { .. }) {
                    ControlPlaneError::conflict(format!(
                        "exhausted retry budget ({attempt} attempts): {err}"
                    ))
                } else {
                    err
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_until_success() {
        let attempts = AtomicU32::new(0);
        let result = with_retry(Duration::from_millis(1), 5, || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(ControlPlaneError::conflict("stale"))
            } else {
                Ok(n)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let result: Result<()> =
            with_retry(Duration::from_millis(1), 3, || async { Err(ControlPlaneError::conflict("stale")) })
                .await;
        assert!(result.is_err());
    }
}
