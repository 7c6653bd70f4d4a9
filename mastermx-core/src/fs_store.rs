//! Local filesystem object store
//!
//! A directory acts as the bucket and every object is a plain file under it.
//! Layout on disk:
//! ```text
//! {root}/
//!   <key>                         object content
//!   .versions/<key>.tag           JSON sidecar: version tag + content digest
//!   .versions/.staging/*.part     temp files, renamed into place
//! ```
//!
//! Files have no native version, so the tag lives in the sidecar. A sidecar
//! whose digest no longer matches the content (the file was replaced by some
//! other tool) is ignored and the tag becomes `sha256:<hex>` of the content.
//!
//! Conditional writes are read-verify-write under an in-process mutex. They
//! are atomic with respect to other callers of the same `LocalFsStore`, but
//! NOT across processes: two processes can both pass the version check
//! before either renames its file, and the later rename wins silently.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::storage::{
    ObjectMeta, ObjectStore, PutMode, Result, StorageError, StoredObject, VersionTag, validate_key,
};

const VERSIONS_DIR: &str = ".versions";
const STAGING_DIR: &str = ".staging";

#[derive(Serialize, Deserialize)]
struct VersionRecord {
    version: VersionTag,
    sha256: String,
}

fn digest_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Filesystem-backed store rooted at one directory
pub struct LocalFsStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalFsStore {
    /// Open a store on an existing directory.
    ///
    /// The directory is not checked here; operations on a missing root fail
    /// with `Unreachable`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Create the root directory if needed and open a store on it
    pub async fn create(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn versions_dir(&self) -> PathBuf {
        self.root.join(VERSIONS_DIR)
    }

    async fn ensure_root(&self) -> Result<()> {
        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            _ => Err(StorageError::Unreachable(format!(
                "store root {} is not an accessible directory",
                self.root.display()
            ))),
        }
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        if key == VERSIONS_DIR || key.starts_with(&format!("{VERSIONS_DIR}/")) {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.versions_dir().join(format!("{key}.tag"))
    }

    fn key_of(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let segments = relative
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()?;
        Some(segments.join("/"))
    }

    /// Write through a staging file so readers never see partial content.
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let staging = self.versions_dir().join(STAGING_DIR);
        fs::create_dir_all(&staging).await?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = staging.join(format!("{}.part", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp_path, data).await?;
        if let Err(e) = fs::rename(&tmp_path, path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn version_of(&self, key: &str, data: &[u8]) -> Result<VersionTag> {
        let digest = digest_hex(data);
        match fs::read(self.sidecar_path(key)).await {
            Ok(raw) => {
                if let Ok(record) = serde_json::from_slice::<VersionRecord>(&raw) {
                    if record.sha256 == digest {
                        return Ok(record.version);
                    }
                }
                debug!("Stale version sidecar for {}, using content digest", key);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(VersionTag::new(format!("sha256:{digest}")))
    }

    async fn read_object(&self, key: &str) -> Result<Option<StoredObject>> {
        let path = self.object_path(key)?;
        let meta = match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let version = self.version_of(key, &data).await?;
        let last_modified: DateTime<Utc> = meta.modified()?.into();
        Ok(Some(StoredObject {
            meta: ObjectMeta {
                key: key.to_string(),
                size: data.len() as u64,
                last_modified,
                version,
            },
            data: Bytes::from(data),
        }))
    }

    /// Unconditionally write content and mint a fresh tag. Caller holds the lock.
    async fn write_object(&self, key: &str, data: &[u8]) -> Result<VersionTag> {
        let path = self.object_path(key)?;
        if key.ends_with('/') {
            // Directory placeholder: nothing to store
            fs::create_dir_all(&path).await?;
            return Ok(VersionTag::new(format!("sha256:{}", digest_hex(&[]))));
        }

        let version = VersionTag::random();
        let record = VersionRecord {
            version: version.clone(),
            sha256: digest_hex(data),
        };
        let record =
            serde_json::to_vec(&record).map_err(|e| StorageError::Backend(e.to_string()))?;

        self.write_atomic(&path, data).await?;
        self.write_atomic(&self.sidecar_path(key), &record).await?;
        Ok(version)
    }
}

#[async_trait]
impl ObjectStore for LocalFsStore {
    async fn get(&self, key: &str) -> Result<StoredObject> {
        self.ensure_root().await?;
        self.read_object(key)
            .await?
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn head(&self, key: &str) -> Result<ObjectMeta> {
        self.get(key).await.map(|object| object.meta)
    }

    async fn put(&self, key: &str, data: Bytes, mode: PutMode) -> Result<VersionTag> {
        self.ensure_root().await?;
        let _guard = self.write_lock.lock().await;
        let current = self.read_object(key).await?.map(|object| object.meta.version);

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

        let version = self.write_object(key, &data).await?;
        debug!("Wrote {} ({} bytes) as {}", key, data.len(), version);
        Ok(version)
    }

    async fn copy(&self, src: &str, dst: &str) -> Result<VersionTag> {
        self.ensure_root().await?;
        self.object_path(dst)?;
        let _guard = self.write_lock.lock().await;
        let source = self
            .read_object(src)
            .await?
            .ok_or_else(|| StorageError::NotFound(src.to_string()))?;
        self.write_object(dst, &source.data).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.ensure_root().await?;
        let path = self.object_path(key)?;
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.to_string()));
            }
            Err(e) => return Err(e.into()),
        }
        match fs::remove_file(self.sidecar_path(key)).await {
            Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.ensure_root().await?;
        let versions_dir = self.versions_dir();
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    if path != versions_dir {
                        pending.push(path);
                    }
                } else if file_type.is_file() {
                    match self.key_of(&path) {
                        Some(key) if key.starts_with(prefix) => keys.push(key),
                        _ => {}
                    }
                }
            }
        }

        keys.sort();
        let mut listing = Vec::with_capacity(keys.len());
        for key in keys {
            // Deleted between the walk and the read: skip it
            if let Some(object) = self.read_object(&key).await? {
                listing.push(object.meta);
            }
        }
        Ok(listing)
    }
}
