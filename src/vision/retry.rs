//! Bounded retry with exponential backoff for transient inference errors.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::PipelineResult;

/// Runs `operation` up to `1 + retry_cap` times, sleeping between
/// attempts with exponential backoff plus jitter. Only transient errors
/// are retried; malformed output and contract violations propagate
/// immediately so their own (stricter) handling applies.
pub async fn with_backoff<T, F, Fut>(
    retry_cap: u32,
    backoff_base_ms: u64,
    mut operation: F,
) -> PipelineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PipelineResult<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < retry_cap => {
                let delay = backoff_delay(backoff_base_ms, attempt);
                log::warn!(
                    "transient inference error (attempt {}/{}), retrying in {:?}: {err}",
                    attempt + 1,
                    retry_cap,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.min(6));
    let jitter = rand::thread_rng().gen_range(0..=exp / 2);
    Duration::from_millis(exp + jitter)
}
