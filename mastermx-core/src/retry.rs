//! Bounded retry and operation timeout around any store
//!
//! - every call is bounded by `timeout_ms`; an elapsed timeout is reported as
//!   `Unreachable`, never as an ambiguous success
//! - `get`, `head`, `list` and `copy` are retried on transient errors
//! - `put` and `delete` are attempted exactly once: a write whose response
//!   was lost may still have been applied

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::storage::{ObjectMeta, ObjectStore, PutMode, Result, StorageError, StoredObject, VersionTag};

/// Retry and timeout settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts for idempotent operations, including the first one
    pub max_attempts: u32,
    /// Fixed pause between attempts
    pub delay_ms: u64,
    /// Upper bound on a single store call
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 200,
            timeout_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// No retries; only the timeout applies
    pub fn no_retry(timeout_ms: u64) -> Self {
        Self {
            max_attempts: 1,
            delay_ms: 0,
            timeout_ms,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Store wrapper applying a [`RetryPolicy`]
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: ObjectStore> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    async fn bounded<T, F>(&self, op: &str, key: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.policy.timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Unreachable(format!(
                "{op} {key} timed out after {} ms",
                self.policy.timeout_ms
            ))),
        }
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, key: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.bounded(op, key, call()).await {
                Err(e) if e.is_transient() && attempt < attempts => {
                    debug!(
                        "{} {} failed (attempt {}/{}): {}; retrying",
                        op, key, attempt, attempts, e
                    );
                    attempt += 1;
                    tokio::time::sleep(self.policy.delay()).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!("{} {} failed after {} attempt(s): {}", op, key, attempt, e);
                    }
                    return Err(e);
                }
                Ok(value) => return Ok(value),
            }
        }
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for RetryingStore<S> {
    async fn get(&self, key: &str) -> Result<StoredObject> {
        self.with_retry("get", key, || self.inner.get(key)).await
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        self.with_retry("head", key, || self.inner.head(key)).await
    }

    async fn put(&self, key: &str, data: Bytes, mode: PutMode) -> Result<VersionTag> {
        self.bounded("put", key, self.inner.put(key, data, mode)).await
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<VersionTag> {
        self.with_retry("copy", src, || self.inner.copy(src, dst)).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.bounded("delete", key, self.inner.delete(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.with_retry("list", prefix, || self.inner.list(prefix)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls of every operation with `Unreachable`.
    struct Flaky {
        inner: MemoryStore,
        failures: u32,
        calls: AtomicU32,
        hang: bool,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures,
                calls: AtomicU32::new(0),
                hang: false,
            }
        }

        async fn gate(&self) -> Result<()> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(StorageError::Unreachable("connection reset".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl ObjectStore for Flaky {
        async fn get(&self, key: &str) -> Result<StoredObject> {
            self.gate().await?;
            self.inner.get(key).await
        }
        async fn head(&self, key: &str) -> Result<ObjectMeta> {
            self.gate().await?;
            self.inner.head(key).await
        }
        async fn put(&self, key: &str, data: Bytes, mode: PutMode) -> Result<VersionTag> {
            self.gate().await?;
            self.inner.put(key, data, mode).await
        }
        async fn copy(&self, src: &str, dst: &str) -> Result<VersionTag> {
            self.gate().await?;
            self.inner.copy(src, dst).await
        }
        async fn delete(&self, key: &str) -> Result<()> {
            self.gate().await?;
            self.inner.delete(key).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
            self.gate().await?;
            self.inner.list(prefix).await
        }
    }

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay_ms: 1,
            timeout_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn test_reads_are_retried() {
        let store = RetryingStore::new(Flaky::new(2), fast(3));
        let listing = store.list("any/").await.unwrap();
        assert!(listing.is_empty());
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let store = RetryingStore::new(Flaky::new(5), fast(2));
        let err = store.head("k").await.unwrap_err();
        assert!(matches!(err, StorageError::Unreachable(_)));
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_writes_are_never_retried() {
        let store = RetryingStore::new(Flaky::new(1), fast(5));
        let err = store
            .put("k", Bytes::from_static(b"v"), PutMode::Overwrite)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unreachable(_)));
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 1);
        assert!(store.inner().inner.is_empty().await);
    }

    #[tokio::test]
    async fn test_non_transient_errors_fail_fast() {
        let store = RetryingStore::new(Flaky::new(0), fast(5));
        let err = store.get("missing").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_unreachable() {
        let mut flaky = Flaky::new(0);
        flaky.hang = true;
        let store = RetryingStore::new(flaky, RetryPolicy::no_retry(50));
        let err = store
            .put("k", Bytes::from_static(b"v"), PutMode::Overwrite)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unreachable(msg) if msg.contains("timed out")));
    }
}
