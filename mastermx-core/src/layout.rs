//! Object key layout
//!
//! Every key the crate writes is built here:
//!
//! ```text
//! <master_key>                                         canonical object
//! <snapshots>/<YYYYMMDDTHHMMSS>_<id>.<ext>             immutable snapshots
//! <audit>/<YYYY-MM-DD>/<user>_<YYYYMMDDTHHMMSS>_<id>.jsonl   audit records
//! <archive>/<YYYY-MM-DD>/<original key>                pruned objects
//! ```

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::codec::TableFormat;

const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S";
const DAY_FORMAT: &str = "%Y-%m-%d";

/// Where the master object and its derived records live in the bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreLayout {
    /// Key of the canonical object
    pub master_key: String,
    pub snapshot_prefix: String,
    pub audit_prefix: String,
    pub archive_prefix: String,
    /// Explicit encoding; inferred from `master_key` when absent
    pub format: Option<TableFormat>,
}

impl Default for StoreLayout {
    fn default() -> Self {
        Self {
            master_key: "data/master.csv".to_string(),
            snapshot_prefix: "snapshots".to_string(),
            audit_prefix: "audit".to_string(),
            archive_prefix: "archive".to_string(),
            format: None,
        }
    }
}

/// Derived-record namespaces subject to retention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    Snapshots,
    Audit,
}

impl FromStr for Namespace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "snapshots" | "snapshot" => Ok(Namespace::Snapshots),
            "audit" => Ok(Namespace::Audit),
            other => Err(format!("unknown namespace: {other}")),
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Namespace::Snapshots => f.write_str("snapshots"),
            Namespace::Audit => f.write_str("audit"),
        }
    }
}

impl StoreLayout {
    /// Encoding of the canonical object
    pub fn format(&self) -> TableFormat {
        self.format
            .unwrap_or_else(|| TableFormat::from_key(&self.master_key))
    }

    /// Listing prefix of a namespace, always ending in `/`
    pub fn namespace_prefix(&self, namespace: Namespace) -> String {
        match namespace {
            Namespace::Snapshots => normalize_prefix(&self.snapshot_prefix),
            Namespace::Audit => normalize_prefix(&self.audit_prefix),
        }
    }

    pub fn snapshot_key(&self, at: DateTime<Utc>, id: &str, format: TableFormat) -> String {
        format!(
            "{}{}_{}.{}",
            normalize_prefix(&self.snapshot_prefix),
            at.format(STAMP_FORMAT),
            id,
            format.extension()
        )
    }

    pub fn audit_day_prefix(&self, day: NaiveDate) -> String {
        format!(
            "{}{}/",
            normalize_prefix(&self.audit_prefix),
            day.format(DAY_FORMAT)
        )
    }

    pub fn audit_key(&self, at: DateTime<Utc>, user: &str, id: &str) -> String {
        format!(
            "{}{}_{}_{}.jsonl",
            self.audit_day_prefix(at.date_naive()),
            sanitize_user(user),
            at.format(STAMP_FORMAT),
            id
        )
    }

    /// Archive destination of `key`; the original key is kept verbatim.
    pub fn archive_key(&self, key: &str, day: NaiveDate) -> String {
        format!(
            "{}{}/{}",
            normalize_prefix(&self.archive_prefix),
            day.format(DAY_FORMAT),
            key
        )
    }
}

/// `"snapshots"`, `"/snapshots/"` and `"snapshots/"` all become `"snapshots/"`.
pub fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{trimmed}/")
    }
}

/// Restrict a user name to characters safe in an object key.
pub fn sanitize_user(user: &str) -> String {
    let cleaned: String = user
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 8, 5, 9).unwrap()
    }

    #[test]
    fn test_snapshot_key() {
        let layout = StoreLayout::default();
        assert_eq!(
            layout.snapshot_key(at(), "abc123", TableFormat::Parquet),
            "snapshots/20240701T080509_abc123.parquet"
        );
    }

    #[test]
    fn test_audit_key_is_partitioned_by_day_and_user() {
        let layout = StoreLayout {
            audit_prefix: "/logs/audit/".to_string(),
            ..StoreLayout::default()
        };
        assert_eq!(
            layout.audit_key(at(), "Jo Smith", "ff00"),
            "logs/audit/2024-07-01/Jo-Smith_20240701T080509_ff00.jsonl"
        );
    }

    #[test]
    fn test_archive_key_preserves_original() {
        let layout = StoreLayout::default();
        assert_eq!(
            layout.archive_key("snapshots/20240701T080509_a.csv", at().date_naive()),
            "archive/2024-07-01/snapshots/20240701T080509_a.csv"
        );
    }

    #[test]
    fn test_format_inference() {
        let mut layout = StoreLayout {
            master_key: "data/master.parquet".to_string(),
            ..StoreLayout::default()
        };
        assert_eq!(layout.format(), TableFormat::Parquet);
        layout.format = Some(TableFormat::Csv);
        assert_eq!(layout.format(), TableFormat::Csv);
    }

    #[test]
    fn test_helpers() {
        assert_eq!(normalize_prefix("snapshots"), "snapshots/");
        assert_eq!(normalize_prefix("/a/b/"), "a/b/");
        assert_eq!(normalize_prefix(""), "");
        assert_eq!(sanitize_user("  "), "unknown");
        assert_eq!(sanitize_user("dev.ops_1"), "dev.ops_1");
        assert_eq!("Audit".parse::<Namespace>().unwrap(), Namespace::Audit);
        assert!("logs".parse::<Namespace>().is_err());
    }
}
