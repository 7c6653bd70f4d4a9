//! Versioned master object
//!
//! The load/validate/save cycle of the canonical object under optimistic
//! concurrency. A save attempt moves through:
//!
//! ```text
//! Loaded(tag) → Validated → Saving → Saved(new tag)
//!                   │           └──→ Conflicted
//!                   └──────────────→ Rejected
//! ```
//!
//! The caller keeps the `LoadedMaster` it got from `load()` and hands its
//! version tag back to `save()`; there is no ambient "current master".
//! The conditional write comes first. Only after it is confirmed are the
//! snapshot and then the audit record written; if either fails the save is
//! reported as `PartialSaveFailure` and nothing is rolled back.

use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::audit::{AuditLogger, AuditRecord};
use crate::clock::{Clock, IdSource, SystemClock, UuidIds};
use crate::codec::{self, EncodedTable, TableFormat};
use crate::error::{MasterError, Result, SavePhase, SideEffect};
use crate::layout::StoreLayout;
use crate::snapshot::SnapshotWriter;
use crate::storage::{ObjectStore, PutMode, StorageError, VersionTag};
use crate::table::{Schema, Table};

/// The canonical object as seen at load time
#[derive(Debug, Clone)]
pub struct LoadedMaster {
    pub table: Table,
    /// Tag to pass back to `save`
    pub version: VersionTag,
    pub format: TableFormat,
    pub size: u64,
    /// Differences from the master schema
    pub drift: Vec<String>,
}

/// A table that passed validation and may be written
#[derive(Debug, Clone)]
pub struct Validated {
    table: Table,
    drift: Vec<String>,
}

impl Validated {
    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn row_count(&self) -> usize {
        self.table.row_count()
    }

    pub fn column_count(&self) -> usize {
        self.table.column_count()
    }

    pub fn drift(&self) -> &[String] {
        &self.drift
    }

    pub fn into_table(self) -> Table {
        self.table
    }
}

/// Outcome of an accepted save
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReceipt {
    pub new_version: VersionTag,
    pub previous_version: Option<VersionTag>,
    pub snapshot_key: String,
    pub audit_key: String,
    pub row_count: usize,
    pub column_count: usize,
    pub drift: Vec<String>,
}

/// Who saves and why
#[derive(Debug, Clone, Copy)]
pub struct Provenance<'a> {
    pub user: &'a str,
    pub note: &'a str,
}

pub struct VersionedMaster {
    store: Arc<dyn ObjectStore>,
    layout: StoreLayout,
    snapshots: SnapshotWriter,
    audit: AuditLogger,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
}

impl VersionedMaster {
    /// Master on `store` using the wall clock and UUID ids
    pub fn new(store: Arc<dyn ObjectStore>, layout: StoreLayout) -> Self {
        Self::with_sources(store, layout, Arc::new(SystemClock), Arc::new(UuidIds))
    }

    pub fn with_sources(
        store: Arc<dyn ObjectStore>,
        layout: StoreLayout,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdSource>,
    ) -> Self {
        Self {
            snapshots: SnapshotWriter::new(store.clone(), layout.clone()),
            audit: AuditLogger::new(store.clone(), layout.clone()),
            store,
            layout,
            clock,
            ids,
        }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn format(&self) -> TableFormat {
        self.layout.format()
    }

    pub fn snapshots(&self) -> &SnapshotWriter {
        &self.snapshots
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Current tag of the canonical object, `None` if it does not exist yet
    pub async fn current_version(&self) -> Result<Option<VersionTag>> {
        match self.store.head(&self.layout.master_key).await {
            Ok(meta) => Ok(Some(meta.version)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch the canonical object and the tag that is the baseline of a save
    pub async fn load(&self) -> Result<LoadedMaster> {
        let key = &self.layout.master_key;
        let object = self.store.get(key).await?;
        let format = self.format();
        let table = codec::decode(&object.data, format)?;

        let drift = table.schema().drift_from(&Schema::master());
        if !drift.is_empty() {
            warn!("Master {} drifts from the master schema: {}", key, drift.join("; "));
        }
        debug!(
            "{}: {} at {} ({} rows)",
            SavePhase::Loaded,
            key,
            object.meta.version,
            table.row_count()
        );

        Ok(LoadedMaster {
            table,
            version: object.meta.version,
            format,
            size: object.meta.size,
            drift,
        })
    }

    /// Check a candidate table before any write.
    ///
    /// Refuses empty tables and duplicate `(tow, net)` keys. Schema drift is
    /// reported, not refused.
    pub fn validate(&self, table: Table) -> Result<Validated> {
        if table.is_empty() {
            return Err(MasterError::EmptyTable);
        }

        let mut drift = table.schema().drift_from(&Schema::master());
        match table.duplicate_keys() {
            Some(duplicates) if !duplicates.is_empty() => {
                return Err(MasterError::DuplicateKey(duplicates));
            }
            Some(_) => {}
            None => drift.push("logical key columns missing; uniqueness not checked".to_string()),
        }
        if !drift.is_empty() {
            warn!("Candidate table drifts from the master schema: {}", drift.join("; "));
        }

        debug!(
            "{}: {} rows x {} columns",
            SavePhase::Validated,
            table.row_count(),
            table.column_count()
        );
        Ok(Validated { table, drift })
    }

    /// Validate, encode in the canonical format and save
    pub async fn save(
        &self,
        table: Table,
        expected: Option<&VersionTag>,
        provenance: Provenance<'_>,
    ) -> Result<SaveReceipt> {
        let validated = self.validate(table)?;
        let bytes = codec::encode(validated.table(), self.format())?;
        self.commit(validated, bytes, expected, provenance).await
    }

    /// Save content that is already encoded.
    ///
    /// The bytes are written verbatim when their format is the canonical one;
    /// otherwise the table is re-encoded.
    pub async fn save_encoded(
        &self,
        content: EncodedTable,
        expected: Option<&VersionTag>,
        provenance: Provenance<'_>,
    ) -> Result<SaveReceipt> {
        let canonical = self.format();
        let EncodedTable {
            table,
            bytes,
            format,
        } = content;
        let validated = self.validate(table)?;
        let bytes = if format == canonical {
            bytes
        } else {
            codec::encode(validated.table(), canonical)?
        };
        self.commit(validated, bytes, expected, provenance).await
    }

    async fn commit(
        &self,
        validated: Validated,
        bytes: Bytes,
        expected: Option<&VersionTag>,
        provenance: Provenance<'_>,
    ) -> Result<SaveReceipt> {
        let key = &self.layout.master_key;
        let mode = match expected {
            Some(tag) => PutMode::Update(tag.clone()),
            None => PutMode::Create,
        };
        debug!("{}: {} ({} bytes, {:?})", SavePhase::Saving, key, bytes.len(), mode);

        let new_version = match self.store.put(key, bytes.clone(), mode).await {
            Ok(version) => version,
            Err(StorageError::AlreadyExists(_)) => {
                warn!("{}: {} already exists", SavePhase::Conflicted, key);
                let actual = match self.current_version().await {
                    Ok(actual) => actual,
                    Err(e) => {
                        warn!("Cannot read the current version of {}: {}", key, e);
                        None
                    }
                };
                return Err(MasterError::VersionConflict {
                    expected: None,
                    actual,
                });
            }
            Err(StorageError::VersionConflict {
                expected, actual, ..
            }) => {
                warn!(
                    "{}: {} expected {}, store has {:?}",
                    SavePhase::Conflicted,
                    key,
                    expected,
                    actual.as_ref().map(VersionTag::as_str)
                );
                return Err(MasterError::VersionConflict {
                    expected: Some(expected),
                    actual,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let at = self.clock.now();
        let format = self.format();

        let snapshot_id = self.ids.next_id();
        let snapshot_key = self
            .snapshots
            .write(&bytes, format, at, &snapshot_id)
            .await
            .map_err(|source| {
                error!(
                    "Master {} saved as {} but its snapshot failed: {}",
                    key, new_version, source
                );
                MasterError::PartialSaveFailure {
                    stage: SideEffect::Snapshot,
                    new_version: new_version.clone(),
                    snapshot_key: None,
                    source,
                }
            })?;

        let record = AuditRecord {
            timestamp: at,
            user: provenance.user.to_string(),
            note: provenance.note.to_string(),
            prev_version: expected.cloned(),
            new_version: new_version.clone(),
            snapshot_key: snapshot_key.clone(),
            row_count: validated.row_count(),
            column_count: validated.column_count(),
        };
        let audit_id = self.ids.next_id();
        let audit_key = self.audit.append(&record, &audit_id).await.map_err(|source| {
            error!(
                "Master {} saved as {} with snapshot {} but its audit record failed: {}",
                key, new_version, snapshot_key, source
            );
            MasterError::PartialSaveFailure {
                stage: SideEffect::Audit,
                new_version: new_version.clone(),
                snapshot_key: Some(snapshot_key.clone()),
                source,
            }
        })?;

        info!(
            "{}: {} {} -> {} by {} ({} rows, snapshot {})",
            SavePhase::Saved,
            key,
            expected.map(VersionTag::as_str).unwrap_or("<new>"),
            new_version,
            provenance.user,
            record.row_count,
            snapshot_key
        );

        Ok(SaveReceipt {
            new_version,
            previous_version: record.prev_version,
            snapshot_key,
            audit_key,
            row_count: record.row_count,
            column_count: record.column_count,
            drift: validated.drift,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{FixedClock, SequentialIds};
    use crate::storage::{MemoryStore, ObjectMeta, Result as StoreResult, StoredObject};
    use crate::table::{Column, ColumnType, Value};
    use chrono::{TimeZone, Utc};

    fn master(store: Arc<MemoryStore>) -> VersionedMaster {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap());
        VersionedMaster::with_sources(
            store,
            StoreLayout::default(),
            Arc::new(clock),
            Arc::new(SequentialIds::new("id")),
        )
    }

    fn keyed(pairs: &[(i64, i64)]) -> Table {
        let schema = Schema::new(vec![
            Column::new("tow", ColumnType::Integer),
            Column::new("net", ColumnType::Integer),
        ])
        .unwrap();
        let rows = pairs
            .iter()
            .map(|(t, n)| vec![Value::Integer(*t), Value::Integer(*n)])
            .collect();
        Table::new(schema, rows).unwrap()
    }

    const WHO: Provenance<'static> = Provenance {
        user: "ana",
        note: "test",
    };

    #[test]
    fn test_validate_rejects_empty_and_duplicates() {
        let master = master(Arc::new(MemoryStore::new()));
        assert!(matches!(
            master.validate(keyed(&[])),
            Err(MasterError::EmptyTable)
        ));
        assert!(matches!(
            master.validate(keyed(&[(1, 1), (1, 1)])),
            Err(MasterError::DuplicateKey(keys)) if keys.len() == 1
        ));
        let validated = master.validate(keyed(&[(1, 1), (1, 2)])).unwrap();
        assert_eq!(validated.row_count(), 2);
        assert_eq!(validated.column_count(), 2);
        assert!(!validated.drift().is_empty());
    }

    #[test]
    fn test_missing_key_column_is_drift_not_error() {
        let master = master(Arc::new(MemoryStore::new()));
        let schema = Schema::new(vec![Column::new("tow", ColumnType::Integer)]).unwrap();
        let table = Table::new(schema, vec![vec![Value::Integer(1)], vec![Value::Integer(1)]])
            .unwrap();
        let validated = master.validate(table).unwrap();
        assert!(validated
            .drift()
            .iter()
            .any(|d| d.contains("uniqueness not checked")));
    }

    #[tokio::test]
    async fn test_bootstrap_then_update() {
        let store = Arc::new(MemoryStore::new());
        let master = master(store.clone());

        let first = master.save(keyed(&[(1, 1)]), None, WHO).await.unwrap();
        assert_eq!(first.previous_version, None);
        assert_eq!(first.snapshot_key, "snapshots/20240701T090000_id000001.csv");
        assert_eq!(first.audit_key, "audit/2024-07-01/ana_20240701T090000_id000002.jsonl");

        let loaded = master.load().await.unwrap();
        assert_eq!(loaded.version, first.new_version);
        assert_eq!(loaded.table.row_count(), 1);

        let second = master
            .save(keyed(&[(1, 1), (2, 1)]), Some(&loaded.version), WHO)
            .await
            .unwrap();
        assert_eq!(second.previous_version, Some(first.new_version));
        assert_eq!(second.row_count, 2);
    }

    #[tokio::test]
    async fn test_second_bootstrap_conflicts() {
        let store = Arc::new(MemoryStore::new());
        let master = master(store.clone());
        let first = master.save(keyed(&[(1, 1)]), None, WHO).await.unwrap();

        let err = master.save(keyed(&[(2, 2)]), None, WHO).await.unwrap_err();
        assert_eq!(err.phase(), SavePhase::Conflicted);
        assert!(matches!(
            err,
            MasterError::VersionConflict { expected: None, actual: Some(ref tag) }
                if *tag == first.new_version
        ));
    }

    /// Store whose `head` is down while everything else works
    struct NoHead(MemoryStore);

    #[async_trait::async_trait]
    impl ObjectStore for NoHead {
        async fn get(&self, key: &str) -> StoreResult<StoredObject> {
            self.0.get(key).await
        }
        async fn head(&self, _key: &str) -> StoreResult<ObjectMeta> {
            Err(StorageError::Unreachable("head timed out".into()))
        }
        async fn put(&self, key: &str, data: Bytes, mode: PutMode) -> StoreResult<VersionTag> {
            self.0.put(key, data, mode).await
        }
        async fn copy(&self, src: &str, dst: &str) -> StoreResult<VersionTag> {
            self.0.copy(src, dst).await
        }
        async fn delete(&self, key: &str) -> StoreResult<()> {
            self.0.delete(key).await
        }
        async fn list(&self, prefix: &str) -> StoreResult<Vec<ObjectMeta>> {
            self.0.list(prefix).await
        }
    }

    #[tokio::test]
    async fn test_bootstrap_conflict_survives_unreadable_head() {
        let store = Arc::new(NoHead(MemoryStore::new()));
        let master = VersionedMaster::with_sources(
            store,
            StoreLayout::default(),
            Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap())),
            Arc::new(SequentialIds::new("id")),
        );
        master.save(keyed(&[(1, 1)]), None, WHO).await.unwrap();

        let err = master.save(keyed(&[(2, 2)]), None, WHO).await.unwrap_err();
        assert!(matches!(
            err,
            MasterError::VersionConflict {
                expected: None,
                actual: None
            }
        ));
    }

    #[tokio::test]
    async fn test_load_missing_master() {
        let master = master(Arc::new(MemoryStore::new()));
        assert!(matches!(master.load().await, Err(MasterError::NotFound(_))));
        assert_eq!(master.current_version().await.unwrap(), None);
    }
}
