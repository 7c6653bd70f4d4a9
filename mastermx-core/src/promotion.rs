//! Promotion of bulk-rewrite output into the canonical object
//!
//! An external engine writes its result as a group of part objects under a
//! working prefix, usually followed by a `_SUCCESS` completion marker.
//! Promotion is two steps:
//! - `reconstruct` reads the parts in key order and rebuilds one table; it
//!   has no side effects, so running it twice on the same parts yields the
//!   same bytes
//! - `promote` hands that table to [`VersionedMaster::save_encoded`]
//!
//! Parts are never modified or deleted. Ordering a rewrite before its
//! promotion is up to the caller.

use std::sync::Arc;
use tracing::{debug, info};

use crate::codec::{self, EncodedTable, TableFormat};
use crate::error::{MasterError, Result};
use crate::layout::normalize_prefix;
use crate::master::{Provenance, SaveReceipt, VersionedMaster};
use crate::storage::{ObjectMeta, ObjectStore, VersionTag};
use crate::table::Table;

const COMPLETION_MARKER: &str = "_SUCCESS";

/// Candidate content rebuilt from a working prefix
#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub content: EncodedTable,
    /// Data parts, in the order their rows were concatenated
    pub parts: Vec<String>,
    pub marker_present: bool,
    /// The single part's bytes were reused without re-encoding
    pub verbatim: bool,
}

/// Outcome of a promotion
#[derive(Debug, Clone)]
pub struct PromotionReport {
    pub prefix: String,
    pub parts: Vec<String>,
    pub marker_present: bool,
    pub verbatim: bool,
    pub receipt: SaveReceipt,
}

fn file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Whether `key` is a completion marker written by the engine
pub fn is_completion_marker(key: &str) -> bool {
    file_name(key).contains(COMPLETION_MARKER)
}

pub struct PromotionPipeline {
    store: Arc<dyn ObjectStore>,
    canonical: TableFormat,
}

impl PromotionPipeline {
    pub fn new(store: Arc<dyn ObjectStore>, canonical: TableFormat) -> Self {
        Self { store, canonical }
    }

    /// Rebuild one table from the data parts under `prefix`
    pub async fn reconstruct(&self, prefix: &str) -> Result<Reconstruction> {
        let prefix = normalize_prefix(prefix);
        if prefix.is_empty() {
            return Err(MasterError::InvalidPrefix(prefix));
        }

        let listing = self.store.list(&prefix).await?;
        let (markers, parts): (Vec<ObjectMeta>, Vec<ObjectMeta>) = listing
            .into_iter()
            .filter(|meta| !meta.key.ends_with('/'))
            .partition(|meta| is_completion_marker(&meta.key));
        let marker_present = !markers.is_empty();

        if parts.is_empty() {
            return Err(if marker_present {
                MasterError::MarkerOnly(prefix)
            } else {
                MasterError::EmptyRewrite(prefix)
            });
        }
        debug!(
            "Reconstructing {} from {} part(s), marker present: {}",
            prefix,
            parts.len(),
            marker_present
        );

        let mut combined: Option<Table> = None;
        let mut single_part = None;
        let part_keys: Vec<String> = parts.iter().map(|meta| meta.key.clone()).collect();

        for key in &part_keys {
            let object = self.store.get(key).await?;
            let format = TableFormat::sniff(&object.data);
            let table = codec::decode(&object.data, format).map_err(|e| {
                MasterError::PartDecodeError {
                    key: key.clone(),
                    reason: e.to_string(),
                }
            })?;

            match combined.as_mut() {
                None => {
                    if part_keys.len() == 1 {
                        single_part = Some((object.data, format));
                    }
                    combined = Some(table);
                }
                Some(acc) => {
                    if acc.schema() != table.schema() {
                        let drift = table.schema().drift_from(acc.schema());
                        return Err(MasterError::PartDecodeError {
                            key: key.clone(),
                            reason: format!(
                                "schema differs from {}: {}",
                                part_keys[0],
                                drift.join("; ")
                            ),
                        });
                    }
                    acc.append(table)?;
                }
            }
        }

        let table = combined.ok_or_else(|| MasterError::EmptyRewrite(prefix.clone()))?;
        let (content, verbatim) = match single_part {
            Some((bytes, format)) if format == self.canonical => (
                EncodedTable {
                    table,
                    bytes,
                    format,
                },
                true,
            ),
            _ => (EncodedTable::encode(table, self.canonical)?, false),
        };

        Ok(Reconstruction {
            content,
            parts: part_keys,
            marker_present,
            verbatim,
        })
    }

    /// Reconstruct `prefix` and save the result as the new canonical content
    pub async fn promote(
        &self,
        master: &VersionedMaster,
        prefix: &str,
        expected: Option<&VersionTag>,
        provenance: Provenance<'_>,
    ) -> Result<PromotionReport> {
        let reconstruction = self.reconstruct(prefix).await?;
        let Reconstruction {
            content,
            parts,
            marker_present,
            verbatim,
        } = reconstruction;

        let receipt = master.save_encoded(content, expected, provenance).await?;
        info!(
            "Promoted {} part(s) from {} as {} ({} rows)",
            parts.len(),
            prefix,
            receipt.new_version,
            receipt.row_count
        );

        Ok(PromotionReport {
            prefix: normalize_prefix(prefix),
            parts,
            marker_present,
            verbatim,
            receipt,
        })
    }
}
