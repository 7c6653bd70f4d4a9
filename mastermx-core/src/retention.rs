//! Retention of snapshot and audit objects
//!
//! Keeps the newest `keep` objects under a prefix and relocates the rest to
//! `<archive>/<YYYY-MM-DD>/<original key>`. Nothing is deleted outright:
//! relocation is a copy followed by a delete of the original. If a run stops
//! between the two, the next run copies the same bytes again and finishes
//! the delete.

use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{MasterError, Result};
use crate::layout::{StoreLayout, normalize_prefix};
use crate::storage::{ObjectMeta, ObjectStore, StorageError};

/// One relocated object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedObject {
    pub from: String,
    pub to: String,
}

/// Outcome of a prune
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    /// Retained keys, newest first
    pub kept: Vec<String>,
    pub archived: Vec<ArchivedObject>,
}

pub struct RetentionPruner {
    store: Arc<dyn ObjectStore>,
    layout: StoreLayout,
}

impl RetentionPruner {
    pub fn new(store: Arc<dyn ObjectStore>, layout: StoreLayout) -> Self {
        Self { store, layout }
    }

    /// Keep the `keep` newest objects under `prefix`, archive the rest.
    ///
    /// Objects are ordered by `last_modified`, newest first, with ties broken
    /// by key (descending). Running it again right away archives nothing.
    pub async fn prune(&self, prefix: &str, keep: usize) -> Result<PruneReport> {
        let prefix = normalize_prefix(prefix);
        let archive = normalize_prefix(&self.layout.archive_prefix);
        if prefix.is_empty() || archive.is_empty() {
            return Err(MasterError::InvalidPrefix(prefix));
        }
        if archive.starts_with(&prefix) || prefix.starts_with(&archive) {
            return Err(MasterError::InvalidPrefix(format!(
                "{prefix} overlaps the archive namespace {archive}"
            )));
        }

        let mut objects: Vec<ObjectMeta> = self
            .store
            .list(&prefix)
            .await?
            .into_iter()
            .filter(|meta| !meta.key.ends_with('/'))
            .collect();
        objects.sort_by_key(|meta| Reverse((meta.last_modified, meta.key.clone())));

        let mut report = PruneReport::default();
        let split = keep.min(objects.len());
        let (retained, expired) = objects.split_at(split);
        report.kept = retained.iter().map(|meta| meta.key.clone()).collect();

        for meta in expired {
            let destination = self
                .layout
                .archive_key(&meta.key, meta.last_modified.date_naive());
            self.store.copy(&meta.key, &destination).await?;
            match self.store.delete(&meta.key).await {
                Ok(()) | Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
            debug!("Archived {} -> {}", meta.key, destination);
            report.archived.push(ArchivedObject {
                from: meta.key.clone(),
                to: destination,
            });
        }

        info!(
            "Pruned {}: kept {}, archived {}",
            prefix,
            report.kept.len(),
            report.archived.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, PutMode};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_prefix_is_not_a_string_prefix() {
        let store = Arc::new(MemoryStore::new());
        for key in ["snapshots/a.csv", "snapshots/b.csv", "snapshots-old/c.csv"] {
            store
                .put(key, Bytes::from_static(b"x"), PutMode::Create)
                .await
                .unwrap();
        }
        let pruner = RetentionPruner::new(store.clone(), StoreLayout::default());
        let report = pruner.prune("snapshots", 1).await.unwrap();
        assert_eq!(report.kept, vec!["snapshots/b.csv".to_string()]);
        assert_eq!(report.archived.len(), 1);
        assert!(store.head("snapshots-old/c.csv").await.is_ok());
    }

    #[tokio::test]
    async fn test_archive_overlap_rejected() {
        let store = Arc::new(MemoryStore::new());
        let pruner = RetentionPruner::new(store, StoreLayout::default());
        assert!(matches!(
            pruner.prune("archive/2024-07-01", 1).await,
            Err(MasterError::InvalidPrefix(_))
        ));
        assert!(matches!(pruner.prune("", 1).await, Err(MasterError::InvalidPrefix(_))));
    }
}
