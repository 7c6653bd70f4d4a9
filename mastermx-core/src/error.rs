//! Error taxonomy of the save protocol
//!
//! Every failure is terminal for the attempt that produced it. `phase()` tells
//! which terminal state of a save attempt an error corresponds to.

use crate::codec::CodecError;
use crate::storage::{StorageError, VersionTag};
use crate::table::{LogicalKey, TableError};

/// Result type for master-object operations
pub type Result<T> = std::result::Result<T, MasterError>;

/// States of one load/save attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavePhase {
    Loaded,
    Validated,
    Saving,
    Saved,
    Conflicted,
    Rejected,
}

impl std::fmt::Display for SavePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SavePhase::Loaded => "loaded",
            SavePhase::Validated => "validated",
            SavePhase::Saving => "saving",
            SavePhase::Saved => "saved",
            SavePhase::Conflicted => "conflicted",
            SavePhase::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Side effects written after the canonical object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    Snapshot,
    Audit,
}

impl std::fmt::Display for SideEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SideEffect::Snapshot => f.write_str("snapshot"),
            SideEffect::Audit => f.write_str("audit record"),
        }
    }
}

fn render_tag(tag: &Option<VersionTag>) -> &str {
    tag.as_ref().map(VersionTag::as_str).unwrap_or("<absent>")
}

fn render_keys(keys: &[LogicalKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors raised by the versioned master and the components around it
#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error("Master object not found: {0}")]
    NotFound(String),

    #[error("Store unreachable: {0}")]
    Unreachable(String),

    #[error(
        "Version conflict: expected {}, store has {}; reload and reapply your edits",
        render_tag(.expected),
        render_tag(.actual)
    )]
    VersionConflict {
        expected: Option<VersionTag>,
        actual: Option<VersionTag>,
    },

    #[error("Duplicate logical keys: {}", render_keys(.0))]
    DuplicateKey(Vec<LogicalKey>),

    #[error("Refusing to save an empty table")]
    EmptyTable,

    #[error("Invalid prefix {0:?}")]
    InvalidPrefix(String),

    #[error("Nothing to promote under {0}")]
    EmptyRewrite(String),

    #[error("Only a completion marker under {0}; the rewrite produced no data")]
    MarkerOnly(String),

    #[error("Cannot decode part {key}: {reason}")]
    PartDecodeError { key: String, reason: String },

    #[error(
        "Canonical object saved as {new_version} but the {stage} failed: {source}"
    )]
    PartialSaveFailure {
        stage: SideEffect,
        new_version: VersionTag,
        snapshot_key: Option<String>,
        #[source]
        source: StorageError,
    },

    #[error(
        "Audit chain broken at record {index}: expected prev_version {}, found {}",
        render_tag(.expected),
        render_tag(.actual)
    )]
    AuditChainBreak {
        index: usize,
        expected: Option<VersionTag>,
        actual: Option<VersionTag>,
    },

    #[error("Malformed audit record in {key}: {reason}")]
    MalformedAudit { key: String, reason: String },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Table error: {0}")]
    Table(#[from] TableError),

    #[error("Storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for MasterError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => MasterError::NotFound(key),
            StorageError::Unreachable(msg) => MasterError::Unreachable(msg),
            StorageError::VersionConflict {
                expected, actual, ..
            } => MasterError::VersionConflict {
                expected: Some(expected),
                actual,
            },
            other => MasterError::Storage(other),
        }
    }
}

impl MasterError {
    /// Terminal phase of a save attempt that failed with this error
    pub fn phase(&self) -> SavePhase {
        match self {
            MasterError::VersionConflict { .. } => SavePhase::Conflicted,
            MasterError::DuplicateKey(_)
            | MasterError::EmptyTable
            | MasterError::InvalidPrefix(_)
            | MasterError::EmptyRewrite(_)
            | MasterError::MarkerOnly(_)
            | MasterError::PartDecodeError { .. }
            | MasterError::Codec(_)
            | MasterError::Table(_) => SavePhase::Rejected,
            MasterError::NotFound(_)
            | MasterError::Unreachable(_)
            | MasterError::PartialSaveFailure { .. }
            | MasterError::AuditChainBreak { .. }
            | MasterError::MalformedAudit { .. }
            | MasterError::Storage(_) => SavePhase::Saving,
        }
    }

    /// Whether an operator has to be alerted: the canonical object changed
    /// but its history is incomplete.
    pub fn needs_operator(&self) -> bool {
        matches!(self, MasterError::PartialSaveFailure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_conflict_maps_to_master_conflict() {
        let err: MasterError = StorageError::VersionConflict {
            key: "data/master.csv".into(),
            expected: VersionTag::new("v1"),
            actual: Some(VersionTag::new("v2")),
        }
        .into();
        assert_eq!(err.phase(), SavePhase::Conflicted);
        assert!(err.to_string().contains("expected v1, store has v2"));
    }

    #[test]
    fn test_phases() {
        assert_eq!(MasterError::EmptyTable.phase(), SavePhase::Rejected);
        assert_eq!(
            MasterError::DuplicateKey(vec![LogicalKey {
                tow: Some("1".into()),
                net: Some("2".into())
            }])
            .phase(),
            SavePhase::Rejected
        );
        let partial = MasterError::PartialSaveFailure {
            stage: SideEffect::Audit,
            new_version: VersionTag::new("v9"),
            snapshot_key: Some("snapshots/x.csv".into()),
            source: StorageError::Unreachable("timeout".into()),
        };
        assert_eq!(partial.phase(), SavePhase::Saving);
        assert!(partial.needs_operator());
        assert!(partial.to_string().contains("audit record failed"));
    }

    #[test]
    fn test_duplicate_key_message_lists_keys() {
        let err = MasterError::DuplicateKey(vec![
            LogicalKey { tow: Some("1".into()), net: Some("1".into()) },
            LogicalKey { tow: None, net: Some("3".into()) },
        ]);
        assert_eq!(
            err.to_string(),
            "Duplicate logical keys: (tow=1, net=1), (tow=null, net=3)"
        );
    }
}
