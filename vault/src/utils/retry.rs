use std::future::Future;
use std::time::Duration;

/// Retries `f` after `interval` has elapsed, until `max_attempts` is
/// reached. Returns the first success or the latest error if all attempts
/// fail.
pub async fn retry<F, Fut, T, E>(max_attempts: usize, interval: Duration, mut f: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_err = None;
    for _ in 0..max_attempts {
        match f().await {
            Ok(result) => return Ok(result),
            Err(err) => {
                last_err = Some(err);
                tokio::time::sleep(interval).await;
            }
        }
    }
    Err(last_err.expect("some error must exist at this point"))
}

/// Exponential backoff for reconnect attempts: `2^n` seconds capped at the
/// given ceiling.
pub fn backoff(attempt: u32, cap: Duration) -> Duration {
    Duration::from_secs(2u64.saturating_pow(attempt)).min(cap)
}
