use crate::*;
use std::future::Future;
use std::time::Duration;

/// Run `f` once, then up to `retries` more times while it fails, sleeping
/// `initial_backoff` before the first retry and doubling after each.
/// The last error is returned when every attempt failed.
pub async fn retry_with_backoff<T, E, F, Fut>(
    hint: &'static str,
    retries: u32,
    initial_backoff: Duration,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
{
    let mut backoff = initial_backoff;
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(r) => return Ok(r),
            Err(err) if attempt < retries => {
                attempt += 1;
                debug!(op = hint, attempt, ?err, ?backoff, "retrying");
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(err) => {
                warn!(op = hint, attempts = attempt + 1, ?err, "giving up");
                return Err(err);
            }
        }
    }
}
