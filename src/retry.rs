/// Bounded retry with a fixed backoff schedule.
///
/// Used where the action is synchronous and user-facing (the interactive code
/// exchange); everywhere else failures are captured and returned as data.
use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff used by the interactive code exchange: 3 attempts total, 1s then 2s
pub const CODE_EXCHANGE_BACKOFF: &[Duration] = &[Duration::from_secs(1), Duration::from_secs(2)];

/// Run `op` up to `max_attempts` times, sleeping through `backoff` between
/// attempts. Only errors accepted by `is_retryable` consume retry budget;
/// anything else returns immediately.
pub async fn with_retry<T, F, Fut, P>(
    max_attempts: usize,
    backoff: &[Duration],
    is_retryable: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&anyhow::Error) -> bool,
{
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= max_attempts || !is_retryable(&err) {
                    return Err(err);
                }

                let delay = backoff
                    .get(attempt - 1)
                    .or_else(|| backoff.last())
                    .copied()
                    .unwrap_or(Duration::from_secs(1));

                warn!(attempt, error = %err, "transient failure, retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Transient error classes: network failure, timeout, connection abort.
/// Matched by error category and text, not by the HTTP status of a
/// successful-but-rejected exchange.
pub fn is_transient(err: &anyhow::Error) -> bool {
    for cause in err.chain() {
        if let Some(req_err) = cause.downcast_ref::<reqwest::Error>() {
            if req_err.is_timeout() || req_err.is_connect() || req_err.is_request() {
                return true;
            }
        }
    }

    let text = err.to_string().to_lowercase();
    text.contains("timed out")
        || text.contains("timeout")
        || text.contains("connection reset")
        || text.contains("connection refused")
        || text.contains("connection aborted")
        || text.contains("network")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn transient() -> anyhow::Error {
        anyhow::anyhow!("request timed out")
    }

    fn permanent() -> anyhow::Error {
        anyhow::anyhow!("invalid_grant: code already redeemed")
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let calls = AtomicUsize::new(0);

        let result = with_retry(3, CODE_EXCHANGE_BACKOFF, is_transient, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(transient())
            } else {
                Ok("token")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "token");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_retry_budget() {
        let calls = AtomicUsize::new(0);

        let result: Result<&str> = with_retry(3, CODE_EXCHANGE_BACKOFF, is_transient, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(transient())
        })
        .await;

        assert!(result.is_err());
        // Exactly 2 additional attempts after the first
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_returns_immediately() {
        let calls = AtomicUsize::new(0);

        let result: Result<&str> = with_retry(3, CODE_EXCHANGE_BACKOFF, is_transient, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(permanent())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&anyhow::anyhow!("operation timed out")));
        assert!(is_transient(&anyhow::anyhow!("connection reset by peer")));
        assert!(is_transient(&anyhow::anyhow!("network unreachable")));
        assert!(!is_transient(&anyhow::anyhow!("invalid_grant")));
        assert!(!is_transient(&anyhow::anyhow!("Token exchange failed: 400 bad code")));
    }
}
