//! Collaborator-facing operations
//!
//! `MasterService` wires the versioned master, promotion and retention to
//! one store and one layout.

use chrono::NaiveDate;
use std::sync::Arc;
use tracing::info;

use crate::audit::{self, AuditRecord};
use crate::clock::{Clock, IdSource, SystemClock, UuidIds};
use crate::config::{MasterConfig, RetentionConfig};
use crate::error::Result;
use crate::layout::{Namespace, StoreLayout};
use crate::master::{LoadedMaster, Provenance, SaveReceipt, VersionedMaster};
use crate::promotion::{PromotionPipeline, PromotionReport};
use crate::retention::{PruneReport, RetentionPruner};
use crate::storage::{ObjectMeta, ObjectStore, VersionTag};
use crate::table::Table;

pub struct MasterService {
    master: VersionedMaster,
    promotion: PromotionPipeline,
    retention: RetentionPruner,
    keep: RetentionConfig,
}

impl MasterService {
    pub fn new(store: Arc<dyn ObjectStore>, layout: StoreLayout, keep: RetentionConfig) -> Self {
        Self::with_sources(store, layout, keep, Arc::new(SystemClock), Arc::new(UuidIds))
    }

    pub fn with_sources(
        store: Arc<dyn ObjectStore>,
        layout: StoreLayout,
        keep: RetentionConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdSource>,
    ) -> Self {
        Self {
            promotion: PromotionPipeline::new(store.clone(), layout.format()),
            retention: RetentionPruner::new(store.clone(), layout.clone()),
            master: VersionedMaster::with_sources(store, layout, clock, ids),
            keep,
        }
    }

    /// Service over the store described by `config`
    pub fn from_config(config: &MasterConfig) -> Self {
        Self::new(
            config.open_store(),
            config.layout.clone(),
            config.retention.clone(),
        )
    }

    pub fn master(&self) -> &VersionedMaster {
        &self.master
    }

    pub fn layout(&self) -> &StoreLayout {
        self.master.layout()
    }

    pub async fn load_master(&self) -> Result<LoadedMaster> {
        self.master.load().await
    }

    /// Save `table` if the canonical object is still at `expected`.
    ///
    /// `expected = None` creates the canonical object and fails if it exists.
    pub async fn save_master(
        &self,
        table: Table,
        expected: Option<&VersionTag>,
        user: &str,
        note: &str,
    ) -> Result<SaveReceipt> {
        self.master
            .save(table, expected, Provenance { user, note })
            .await
    }

    /// Promote the parts under `prefix`.
    ///
    /// Without an explicit `expected` tag the canonical object's current tag
    /// is used, so the promotion replaces whatever is there now.
    pub async fn promote_from_working_prefix(
        &self,
        prefix: &str,
        expected: Option<&VersionTag>,
        user: &str,
        note: &str,
    ) -> Result<PromotionReport> {
        let current;
        let expected = match expected {
            Some(tag) => Some(tag),
            None => {
                current = self.master.current_version().await?;
                current.as_ref()
            }
        };
        self.promotion
            .promote(&self.master, prefix, expected, Provenance { user, note })
            .await
    }

    /// Archive all but the newest objects of a namespace.
    ///
    /// `keep` defaults to the configured retention.
    pub async fn prune_older_than(
        &self,
        namespace: Namespace,
        keep: Option<usize>,
    ) -> Result<PruneReport> {
        let keep = keep.unwrap_or(match namespace {
            Namespace::Snapshots => self.keep.keep_snapshots,
            Namespace::Audit => self.keep.keep_audit,
        });
        let prefix = self.layout().namespace_prefix(namespace);
        self.retention.prune(&prefix, keep).await
    }

    /// Save a snapshot's content as a new version, with its own snapshot and
    /// audit record.
    pub async fn restore_snapshot(
        &self,
        snapshot_key: &str,
        expected: Option<&VersionTag>,
        user: &str,
        note: &str,
    ) -> Result<SaveReceipt> {
        let table = self.master.snapshots().read(snapshot_key).await?;
        let receipt = self.save_master(table, expected, user, note).await?;
        info!("Restored {} as {}", snapshot_key, receipt.new_version);
        Ok(receipt)
    }

    /// Snapshots, newest first
    pub async fn list_snapshots(&self) -> Result<Vec<ObjectMeta>> {
        Ok(self.master.snapshots().list().await?)
    }

    /// Audit records of one day (or all), oldest first
    pub async fn audit_trail(&self, day: Option<NaiveDate>) -> Result<Vec<AuditRecord>> {
        self.master.audit().records(day).await
    }

    /// Check that the audit records link up; returns the number checked
    pub async fn verify_audit_trail(&self, day: Option<NaiveDate>) -> Result<usize> {
        let records = self.audit_trail(day).await?;
        audit::verify_chain(&records)
    }
}
