use std::future::Future;

use tracing::warn;

use super::DeviceError;

/// Runs `operation` up to `attempts` times, retrying transient failures only.
///
/// A permanent failure, or the last transient one, is returned unchanged.
/// `attempts` below 1 is treated as 1.
pub async fn with_retries<T, F, Fut>(
    attempts: u32,
    operation: &str,
    mut run: F,
) -> Result<T, DeviceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DeviceError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match run().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                warn!(operation, attempt, attempts, error = %err, "Transient device failure, retrying");
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
