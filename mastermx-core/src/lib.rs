//! mastermx Core Library
//!
//! Versioned save protocol for one authoritative tabular "master" object
//! kept in an object store:
//! - Storage capability with conditional writes (memory and filesystem stores)
//! - Bounded retry and timeouts around any store
//! - Table model and CSV / Parquet codecs (Apache Arrow)
//! - Optimistic-concurrency load/validate/save cycle
//! - Immutable snapshots and an append-only audit trail per save
//! - Promotion of multi-part bulk rewrites into the canonical object
//! - Retention of snapshots and audit records into an archive namespace

pub mod audit;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod fs_store;
pub mod layout;
pub mod master;
pub mod promotion;
pub mod retention;
pub mod retry;
pub mod service;
pub mod snapshot;
pub mod storage;
pub mod table;

pub use audit::{AuditLogger, AuditRecord, verify_chain};
pub use clock::{Clock, FixedClock, IdSource, SequentialIds, SystemClock, UuidIds};
pub use codec::{CodecError, EncodedTable, TableFormat};
pub use config::{ConfigError, MasterConfig, RetentionConfig, StoreConfig, current_user};
pub use error::{MasterError, Result, SavePhase, SideEffect};
pub use fs_store::LocalFsStore;
pub use layout::{Namespace, StoreLayout};
pub use master::{LoadedMaster, Provenance, SaveReceipt, Validated, VersionedMaster};
pub use promotion::{PromotionPipeline, PromotionReport, Reconstruction};
pub use retention::{ArchivedObject, PruneReport, RetentionPruner};
pub use retry::{RetryPolicy, RetryingStore};
pub use service::MasterService;
pub use snapshot::SnapshotWriter;
pub use storage::{MemoryStore, ObjectMeta, ObjectStore, PutMode, StorageError, StoredObject, VersionTag};
pub use table::{Column, ColumnType, LogicalKey, MASTER_COLUMNS, Schema, Table, TableError, Value};
