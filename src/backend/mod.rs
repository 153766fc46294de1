//! Key-value backend interface.
//!
//! The engine consumes a deliberately small surface: `get`, a conditional
//! update expressed as a read-modify-write callback, and `delete`. Every
//! call may fail transiently; callers go through the retry helpers below
//! rather than treating the first failure as fatal.

use crate::core::Result;
use async_trait::async_trait;
use log::warn;
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;

pub mod memory;

pub use memory::MemoryBackend;

/// Read-modify-write callback for [`KvBackend::update`].
///
/// Receives the currently stored blob (or `None` when absent) and returns
/// the blob to store, or `None` to leave the key unchanged. The backend
/// runs the callback inside its own read-modify-write window; the callback
/// may run more than once when the surrounding call is retried.
pub type UpdateFn<'a> = dyn FnMut(Option<&Value>) -> Option<Value> + Send + 'a;

#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Fetch the blob stored under `key`, or `None` when absent.
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Conditionally update `key` through a read-modify-write callback.
    /// Returns the blob stored under the key after the call, whether or
    /// not the callback chose to write.
    async fn update(
        &self,
        key: &str,
        apply: &mut UpdateFn<'_>,
        ttl_hint: Option<Duration>,
    ) -> Result<Option<Value>>;

    /// Remove the blob stored under `key`. Removing an absent key is not
    /// an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Retry behavior for transient backend failures.
///
/// The wait grows linearly with the attempt number: `base_backoff × attempt`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_backoff * attempt.max(1)
    }
}

pub async fn get_with_retry(
    backend: &dyn KvBackend,
    key: &str,
    policy: &RetryPolicy,
) -> Result<Option<Value>> {
    let max_attempts = policy.max_attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=max_attempts {
        match backend.get(key).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!("get '{}' attempt {}/{}: {}", key, attempt, max_attempts, err);
                last_err = Some(err);
            }
        }
        if attempt < max_attempts {
            sleep(policy.backoff(attempt)).await;
        }
    }

    Err(last_err.unwrap_or_else(|| unreachable!()))
}

pub async fn update_with_retry(
    backend: &dyn KvBackend,
    key: &str,
    apply: &mut UpdateFn<'_>,
    ttl_hint: Option<Duration>,
    policy: &RetryPolicy,
) -> Result<Option<Value>> {
    let max_attempts = policy.max_attempts.max(1);
    let mut last_err = None;

    for attempt in 1..=max_attempts {
        match backend.update(key, apply, ttl_hint).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                warn!(
                    "update '{}' attempt {}/{}: {}",
                    key, attempt, max_attempts, err
                );
                last_err = Some(err);
            }
        }
        if attempt < max_attempts {
            sleep(policy.backoff(attempt)).await;
        }
    }

    Err(last_err.unwrap_or_else(|| unreachable!()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_linearly() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_get_with_retry_recovers_from_transient_failures() {
        let backend = MemoryBackend::new();
        backend.insert_raw("k", serde_json::json!({"a": 1})).await;
        backend.fail_next(2);

        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
        };
        let value = get_with_retry(&backend, "k", &policy).await.unwrap();
        assert_eq!(value, Some(serde_json::json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_get_with_retry_exhausts() {
        let backend = MemoryBackend::new();
        backend.fail_next(5);

        let policy = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(1),
        };
        assert!(get_with_retry(&backend, "k", &policy).await.is_err());
    }
}
