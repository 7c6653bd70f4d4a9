//! Immutable point-in-time copies of the canonical object

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::debug;

use crate::codec::{self, TableFormat};
use crate::error::Result;
use crate::layout::{Namespace, StoreLayout};
use crate::storage::{self, ObjectMeta, ObjectStore, PutMode};
use crate::table::Table;

/// Writes and reads the snapshot namespace
///
/// Every snapshot is created with `PutMode::Create`, so an existing key is
/// never overwritten; uniqueness comes from the random id in the name.
pub struct SnapshotWriter {
    store: Arc<dyn ObjectStore>,
    layout: StoreLayout,
}

impl SnapshotWriter {
    pub fn new(store: Arc<dyn ObjectStore>, layout: StoreLayout) -> Self {
        Self { store, layout }
    }

    /// Write `content` as a new snapshot and return its key.
    ///
    /// The key depends only on `at`, `id` and `format`.
    pub async fn write(
        &self,
        content: &Bytes,
        format: TableFormat,
        at: DateTime<Utc>,
        id: &str,
    ) -> storage::Result<String> {
        let key = self.layout.snapshot_key(at, id, format);
        self.store.put(&key, content.clone(), PutMode::Create).await?;
        debug!("Wrote snapshot {} ({} bytes)", key, content.len());
        Ok(key)
    }

    /// All snapshots, newest first
    pub async fn list(&self) -> storage::Result<Vec<ObjectMeta>> {
        let prefix = self.layout.namespace_prefix(Namespace::Snapshots);
        let mut snapshots: Vec<ObjectMeta> = self
            .store
            .list(&prefix)
            .await?
            .into_iter()
            .filter(|meta| !meta.key.ends_with('/'))
            .collect();
        snapshots.sort_by_key(|meta| Reverse((meta.last_modified, meta.key.clone())));
        Ok(snapshots)
    }

    /// Decode one snapshot
    pub async fn read(&self, key: &str) -> Result<Table> {
        let object = self.store.get(key).await?;
        let table = codec::decode(&object.data, TableFormat::from_key(key))?;
        Ok(table)
    }
}
