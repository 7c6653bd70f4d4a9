//! Configuration for mastermx
//!
//! Read from a TOML file; a missing file yields the defaults. A handful of
//! environment variables override the file:
//!
//! | variable                   | field                    |
//! |----------------------------|--------------------------|
//! | `MASTERMX_ROOT`            | `store.root`             |
//! | `MASTERMX_BUCKET`          | `store.bucket`           |
//! | `MASTERMX_MASTER_KEY`      | `layout.master_key`      |
//! | `MASTERMX_SNAPSHOT_PREFIX` | `layout.snapshot_prefix` |
//! | `MASTERMX_AUDIT_PREFIX`    | `layout.audit_prefix`    |
//! | `MASTERMX_FORMAT`          | `layout.format`          |

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codec::{CodecError, TableFormat};
use crate::fs_store::LocalFsStore;
use crate::layout::StoreLayout;
use crate::retry::{RetryPolicy, RetryingStore};
use crate::storage::ObjectStore;

/// Errors raised while loading or saving configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config: {0}")]
    Write(#[from] std::io::Error),

    #[error("Invalid value for {var}: {source}")]
    InvalidFormat {
        var: String,
        #[source]
        source: CodecError,
    },
}

/// Location of the bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the buckets
    pub root: PathBuf,
    /// Bucket name; the bucket is the directory `<root>/<bucket>`
    pub bucket: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data"),
            bucket: "master".to_string(),
        }
    }
}

impl StoreConfig {
    pub fn bucket_path(&self) -> PathBuf {
        self.root.join(&self.bucket)
    }
}

/// How many derived objects stay in place when pruning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub keep_snapshots: usize,
    pub keep_audit: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_snapshots: 15,
            keep_audit: 500,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    pub store: StoreConfig,
    pub layout: StoreLayout,
    pub retry: RetryPolicy,
    pub retention: RetentionConfig,
}

impl MasterConfig {
    /// Load config from a TOML file, or defaults if the file does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&data)
    }

    pub fn from_toml_str(data: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(data)?)
    }

    /// Write config as TOML (temp file + rename)
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let data = toml::to_string_pretty(self)?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Apply `MASTERMX_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_with(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary variable lookup
    pub fn apply_overrides_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).filter(|value| !value.trim().is_empty());

        if let Some(root) = get("MASTERMX_ROOT") {
            self.store.root = PathBuf::from(root);
        }
        if let Some(bucket) = get("MASTERMX_BUCKET") {
            self.store.bucket = bucket;
        }
        if let Some(key) = get("MASTERMX_MASTER_KEY") {
            self.layout.master_key = key;
        }
        if let Some(prefix) = get("MASTERMX_SNAPSHOT_PREFIX") {
            self.layout.snapshot_prefix = prefix;
        }
        if let Some(prefix) = get("MASTERMX_AUDIT_PREFIX") {
            self.layout.audit_prefix = prefix;
        }
        if let Some(format) = get("MASTERMX_FORMAT") {
            let format = format
                .parse::<TableFormat>()
                .map_err(|source| ConfigError::InvalidFormat {
                    var: "MASTERMX_FORMAT".to_string(),
                    source,
                })?;
            self.layout.format = Some(format);
        }
        Ok(())
    }

    /// Open the configured bucket behind the retry policy
    pub fn open_store(&self) -> Arc<dyn ObjectStore> {
        let store = LocalFsStore::new(self.store.bucket_path());
        Arc::new(RetryingStore::new(store, self.retry.clone()))
    }
}

/// The acting user: `$USER`, then `$USERNAME`, then `unknown`
pub fn current_user() -> String {
    resolve_user(|var| std::env::var(var).ok())
}

pub fn resolve_user<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    ["USER", "USERNAME"]
        .into_iter()
        .filter_map(&lookup)
        .map(|user| user.trim().to_string())
        .find(|user| !user.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var: &str| map.get(var).cloned()
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = MasterConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config, MasterConfig::default());
        assert_eq!(config.layout.format(), TableFormat::Csv);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = MasterConfig::from_toml_str(
            r#"
            [layout]
            master_key = "plankton/master.parquet"

            [retry]
            max_attempts = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.layout.master_key, "plankton/master.parquet");
        assert_eq!(config.layout.format(), TableFormat::Parquet);
        assert_eq!(config.layout.snapshot_prefix, "snapshots");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.timeout_ms, RetryPolicy::default().timeout_ms);
        assert_eq!(config.retention.keep_snapshots, 15);
    }

    #[test]
    fn test_save_then_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("mastermx.toml");
        let mut config = MasterConfig::default();
        config.store.bucket = "survey".to_string();
        config.layout.format = Some(TableFormat::Parquet);
        config.save(&path).unwrap();
        assert_eq!(MasterConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = MasterConfig::default();
        config
            .apply_overrides_with(env(&[
                ("MASTERMX_BUCKET", "field-data"),
                ("MASTERMX_MASTER_KEY", "master/table.parquet"),
                ("MASTERMX_AUDIT_PREFIX", "logs/audit"),
                ("MASTERMX_FORMAT", "tabular-csv"),
                ("MASTERMX_ROOT", "  "),
            ]))
            .unwrap();
        assert_eq!(config.store.bucket, "field-data");
        assert_eq!(config.store.root, StoreConfig::default().root);
        assert_eq!(config.layout.audit_prefix, "logs/audit");
        assert_eq!(config.layout.format(), TableFormat::Csv);

        let err = config
            .apply_overrides_with(env(&[("MASTERMX_FORMAT", "xlsx")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidFormat { .. }));
    }

    #[test]
    fn test_user_resolution() {
        assert_eq!(resolve_user(env(&[("USER", "ana"), ("USERNAME", "x")])), "ana");
        assert_eq!(resolve_user(env(&[("USER", ""), ("USERNAME", "bo")])), "bo");
        assert_eq!(resolve_user(env(&[])), "unknown");
    }
}
