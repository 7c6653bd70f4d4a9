//! Append-only audit trail of accepted saves
//!
//! Each save produces one fresh JSONL object under
//! `<audit>/<YYYY-MM-DD>/<user>_<stamp>_<id>.jsonl` holding a single record.
//! Objects are created with `PutMode::Create` and never read back for
//! modification, so concurrent writers cannot clobber each other.

use bytes::Bytes;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::{MasterError, Result};
use crate::layout::{Namespace, StoreLayout};
use crate::storage::{self, ObjectStore, PutMode, VersionTag};

/// Provenance and shape of one accepted save
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub user: String,
    pub note: String,
    /// Tag the saver loaded; `None` for the save that created the object
    pub prev_version: Option<VersionTag>,
    pub new_version: VersionTag,
    pub snapshot_key: String,
    pub row_count: usize,
    pub column_count: usize,
}

impl AuditRecord {
    /// One JSON line, newline terminated
    pub fn to_line(&self) -> std::result::Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Writes and reads the audit namespace
pub struct AuditLogger {
    store: Arc<dyn ObjectStore>,
    layout: StoreLayout,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn ObjectStore>, layout: StoreLayout) -> Self {
        Self { store, layout }
    }

    /// Store `record` as a new audit object and return its key
    pub async fn append(&self, record: &AuditRecord, id: &str) -> storage::Result<String> {
        let key = self.layout.audit_key(record.timestamp, &record.user, id);
        let line = record
            .to_line()
            .map_err(|e| storage::StorageError::Backend(e.to_string()))?;
        self.store
            .put(&key, Bytes::from(line), PutMode::Create)
            .await?;
        debug!("Wrote audit record {}", key);
        Ok(key)
    }

    /// Records of one day, or of the whole namespace, oldest first
    pub async fn records(&self, day: Option<NaiveDate>) -> Result<Vec<AuditRecord>> {
        let prefix = match day {
            Some(day) => self.layout.audit_day_prefix(day),
            None => self.layout.namespace_prefix(Namespace::Audit),
        };

        let mut records = Vec::new();
        for meta in self.store.list(&prefix).await? {
            if meta.key.ends_with('/') {
                continue;
            }
            let object = self.store.get(&meta.key).await?;
            let text = std::str::from_utf8(&object.data).map_err(|e| {
                MasterError::MalformedAudit {
                    key: meta.key.clone(),
                    reason: e.to_string(),
                }
            })?;
            for line in text.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                let record: AuditRecord =
                    serde_json::from_str(line).map_err(|e| MasterError::MalformedAudit {
                        key: meta.key.clone(),
                        reason: e.to_string(),
                    })?;
                records.push(record);
            }
        }

        // Listing order is by key; stable sort keeps it for equal timestamps
        records.sort_by_key(|record| record.timestamp);
        Ok(records)
    }
}

/// Check that consecutive records link up.
///
/// Each record's `prev_version` must equal the `new_version` of the record
/// before it. The first record is not checked, since older records may have
/// been archived. Returns the number of records checked.
pub fn verify_chain(records: &[AuditRecord]) -> Result<usize> {
    for (index, pair) in records.windows(2).enumerate() {
        let (previous, current) = (&pair[0], &pair[1]);
        if current.prev_version.as_ref() != Some(&previous.new_version) {
            return Err(MasterError::AuditChainBreak {
                index: index + 1,
                expected: Some(previous.new_version.clone()),
                actual: current.prev_version.clone(),
            });
        }
    }
    Ok(records.len())
}
