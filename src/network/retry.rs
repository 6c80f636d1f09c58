use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::{sleep, Instant};

/// Total time budget for a retried operation.
const RETRY_WINDOW: Duration = Duration::from_secs(60);

/// First backoff pause; doubles after every failed attempt.
const RETRY_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Retries an operation with exponential backoff for up to 60 seconds.
///
/// Kernel programming races against interface creation on peers and the
/// orchestrator API can be briefly unreachable; both resolve within seconds.
/// When the window is exhausted the last operation error is returned, not a
/// deadline error, so callers see the root cause.
pub async fn retry<F, Fut, T, E>(description: &str, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    retry_with(RETRY_WINDOW, RETRY_INITIAL_BACKOFF, description, operation).await
}

pub async fn retry_with<F, Fut, T, E>(
    window: Duration,
    initial_backoff: Duration,
    description: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let deadline = Instant::now() + window;
    let mut backoff = initial_backoff;
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(operation = description, attempt, "succeeded after retries");
                }
                return Ok(value);
            }
            Err(err) => {
                attempt += 1;
                let now = Instant::now();
                if now >= deadline {
                    return Err(err);
                }

                let pause = backoff.min(deadline - now);
                tracing::warn!(
                    operation = description,
                    attempt,
                    error = %err,
                    backoff_ms = pause.as_millis() as u64,
                    "operation failed, retrying",
                );
                sleep(pause).await;
                backoff = backoff.saturating_mul(2);
            }
        }
    }
}
