use rand::Rng;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

use crate::errors::Result;

pub(crate) fn get_random_id() -> u64 {
    let mut rng = rand::thread_rng();
    rng.gen::<u64>()
}

/// Milliseconds since the unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub(crate) fn join_path(parts: &[&str]) -> String {
    let mut result = String::new();

    for (i, part) in parts.iter().enumerate() {
        // Remove trailing slashes from all parts
        let part = part.trim_end_matches('/');

        if i == 0 {
            result.push_str(part);
        } else {
            if !part.is_empty() && !part.starts_with('/') {
                result.push('/');
            }
            result.push_str(part);
        }
    }

    result
}

// exponential, capped to 32x the base, plus up to 50% jitter
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1 << attempt.min(5));
    let jitter = if exp > 1 {
        rand::thread_rng().gen_range(0..=exp / 2)
    } else {
        0
    };
    Duration::from_millis(exp + jitter)
}

/// Runs the store operation up to `attempts` times, sleeping with backoff between the
/// transient failures. Non transient errors are returned right away.
pub(crate) async fn retry_with_backoff<T, F, Fut>(
    operation: &str,
    attempts: u32,
    base_backoff_ms: u64,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < attempts => {
                let delay = backoff_delay(base_backoff_ms, attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "store operation failed, retrying: {}",
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::LoadManagerError;
    use danube_metadata_store::MetadataError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_basic() {
        let parts = ["/one/two/three", "four", "five"];
        assert_eq!(join_path(&parts), "/one/two/three/four/five");
    }

    #[test]
    fn test_all_parts_with_slash() {
        let parts = ["/one", "/two", "/three"];
        assert_eq!(join_path(&parts), "/one/two/three");
    }

    #[test]
    fn test_bundle_id_part() {
        let parts = ["/loadbalance/ownership", "ns1/0x00-0xFF"];
        assert_eq!(join_path(&parts), "/loadbalance/ownership/ns1/0x00-0xFF");
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry_with_backoff("test", 3, 1, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(LoadManagerError::Store(MetadataError::ConnectionError(
                    "down".to_string(),
                )))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry_with_backoff("test", 3, 1, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LoadManagerError::Store(MetadataError::ConnectionError(
                "down".to_string(),
            )))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_retry_on_permanent_error() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry_with_backoff("test", 3, 1, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LoadManagerError::InvalidBundle("bad".to_string()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
