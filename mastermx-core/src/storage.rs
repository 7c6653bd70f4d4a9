//! Storage abstraction layer for mastermx
//!
//! Defines the object-store capability the rest of the crate is written
//! against:
//! - keyed objects with an opaque, store-assigned version tag
//! - conditional writes (`PutMode::Update`) used as a compare-and-swap token
//! - write-once creation (`PutMode::Create`) for snapshots and audit objects
//! - prefix listing, copy and delete for promotion and retention
//!
//! `MemoryStore` implements the capability natively under a lock. See
//! [`crate::fs_store`] for a backend that has to emulate conditional writes.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Object already exists: {0}")]
    AlreadyExists(String),

    #[error(
        "Version conflict on {key}: expected {expected}, found {}",
        .actual.as_ref().map(VersionTag::as_str).unwrap_or("<absent>")
    )]
    VersionConflict {
        key: String,
        expected: VersionTag,
        actual: Option<VersionTag>,
    },

    #[error("Store unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid object key: {0:?}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether a retry of the same idempotent request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unreachable(_))
    }
}

/// Opaque version token assigned by the store on every write.
///
/// Tags are only ever compared for equality; they carry no ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionTag(String);

impl VersionTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// A fresh random tag (used by stores that mint their own tags).
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VersionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Descriptor returned by `head` and `list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub version: VersionTag,
}

/// Object content together with its descriptor
#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub meta: ObjectMeta,
}

/// Precondition attached to a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutMode {
    /// Unconditional write.
    Overwrite,
    /// Write only if the key does not exist yet.
    Create,
    /// Write only if the key's current version equals the given tag.
    Update(VersionTag),
}

/// Generic object store interface
///
/// All backends must implement this trait. Keys are `/`-separated relative
/// paths; `list` returns descriptors sorted lexicographically by key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get object content and descriptor
    async fn get(&self, key: &str) -> Result<StoredObject>;

    /// Get the descriptor only
    async fn head(&self, key: &str) -> Result<ObjectMeta>;

    /// Write an object under the given precondition, returning its new version
    async fn put(&self, key: &str, data: Bytes, mode: PutMode) -> Result<VersionTag>;

    /// Copy an object to another key (overwriting the destination)
    async fn copy(&self, src: &str, dst: &str) -> Result<VersionTag>;

    /// Delete an object
    async fn delete(&self, key: &str) -> Result<()>;

    /// List all objects whose key starts with `prefix`
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;
}

/// Reject keys that could escape a bucket or alias another key.
///
/// A trailing `/` is accepted: some engines write zero-byte "directory"
/// placeholder objects.
pub fn validate_key(key: &str) -> Result<()> {
    let body = key.strip_suffix('/').unwrap_or(key);
    if body.is_empty() || body.starts_with('/') || body.contains('\\') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    if body
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

struct MemoryEntry {
    data: Bytes,
    version: VersionTag,
    last_modified: DateTime<Utc>,
}

impl MemoryEntry {
    fn meta(&self, key: &str) -> ObjectMeta {
        ObjectMeta {
            key: key.to_string(),
            size: self.data.len() as u64,
            last_modified: self.last_modified,
            version: self.version.clone(),
        }
    }
}

#[derive(Default)]
struct MemoryState {
    objects: BTreeMap<String, MemoryEntry>,
    last_stamp: Option<DateTime<Utc>>,
}

impl MemoryState {
    /// Modification stamps are strictly increasing so creation order is total.
    fn next_stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + Duration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    fn insert_object(&mut self, key: &str, data: Bytes) -> VersionTag {
        let version = VersionTag::random();
        let last_modified = self.next_stamp();
        self.objects.insert(
            key.to_string(),
            MemoryEntry {
                data,
                version: version.clone(),
                last_modified,
            },
        );
        version
    }
}

/// In-memory store with native compare-and-swap
///
/// Every write happens under one lock, so a conditional write is atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub async fn len(&self) -> usize {
        self.state.read().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<StoredObject> {
        validate_key(key)?;
        let state = self.state.read().await;
        let entry = state
            .objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(StoredObject {
            data: entry.data.clone(),
            meta: entry.meta(key),
        })
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        validate_key(key)?;
        let state = self.state.read().await;
        state
            .objects
            .get(key)
            .map(|entry| entry.meta(key))
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: Bytes, mode: PutMode) -> Result<VersionTag> {
        validate_key(key)?;
        let mut state = self.state.write().await;
        let current = state.objects.get(key).map(|entry| entry.version.clone());

        match (&mode, current) {
            (PutMode::Overwrite, _) | (PutMode::Create, None) => {}
            (PutMode::Create, Some(_)) => {
                return Err(StorageError::AlreadyExists(key.to_string()));
            }
            (PutMode::Update(expected), actual) => {
                if actual.as_ref() != Some(expected) {
                    return Err(StorageError::VersionConflict {
                        key: key.to_string(),
                        expected: expected.clone(),
                        actual,
                    });
                }
            }
        }

        Ok(state.insert_object(key, data))
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<VersionTag> {
        validate_key(src)?;
        validate_key(dst)?;
        let mut state = self.state.write().await;
        let data = state
            .objects
            .get(src)
            .map(|entry| entry.data.clone())
            .ok_or_else(|| StorageError::NotFound(src.to_string()))?;
        Ok(state.insert_object(dst, data))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        let mut state = self.state.write().await;
        state
            .objects
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let state = self.state.read().await;
        Ok(state
            .objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, entry)| entry.meta(key))
            .collect())
    }
}
