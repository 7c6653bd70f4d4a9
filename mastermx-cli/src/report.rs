//! Human-readable output for the mastermx CLI.

use anyhow::Result;
use mastermx_core::{
    AuditRecord, LoadedMaster, MasterError, ObjectMeta, PromotionReport, PruneReport, SaveReceipt,
};
use std::io::Write;

/// Object size in binary units, shared by `show` and the snapshot listing
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit + 1 < UNITS.len() {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

/// One line per audit record
pub fn format_record(record: &AuditRecord) -> String {
    format!(
        "[{}] {} | {} -> {} | {} rows x {} cols | {} | {}",
        record.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
        record.user,
        record
            .prev_version
            .as_ref()
            .map(|v| v.as_str())
            .unwrap_or("<new>"),
        record.new_version,
        record.row_count,
        record.column_count,
        record.snapshot_key,
        record.note,
    )
}

pub fn format_snapshot(meta: &ObjectMeta) -> String {
    format!(
        "{}  {:>10}  {}",
        meta.last_modified.format("%Y-%m-%d %H:%M:%S UTC"),
        human_size(meta.size),
        meta.key
    )
}

pub fn print_master(key: &str, loaded: &LoadedMaster, writer: &mut dyn Write) -> Result<()> {
    writeln!(writer, "Master:   {}", key)?;
    writeln!(writer, "Version:  {}", loaded.version)?;
    writeln!(writer, "Format:   {}", loaded.format)?;
    writeln!(writer, "Size:     {}", human_size(loaded.size))?;
    writeln!(
        writer,
        "Shape:    {} rows x {} columns",
        loaded.table.row_count(),
        loaded.table.column_count()
    )?;

    if loaded.drift.is_empty() {
        writeln!(writer, "Schema:   matches master schema")?;
    } else {
        writeln!(writer, "Schema drift:")?;
        for line in &loaded.drift {
            writeln!(writer, "  - {}", line)?;
        }
    }

    match loaded.table.duplicate_keys() {
        None => writeln!(writer, "Keys:     (tow, net) columns missing, not checked")?,
        Some(dups) if dups.is_empty() => writeln!(writer, "Keys:     (tow, net) unique")?,
        Some(dups) => {
            writeln!(writer, "Keys:     {} duplicated (tow, net) pairs", dups.len())?;
            for key in &dups {
                writeln!(writer, "  - {}", key)?;
            }
        }
    }
    Ok(())
}

pub fn print_receipt(receipt: &SaveReceipt, writer: &mut dyn Write) -> Result<()> {
    writeln!(writer, "Saved.")?;
    writeln!(
        writer,
        "  Version:  {} -> {}",
        receipt
            .previous_version
            .as_ref()
            .map(|v| v.as_str())
            .unwrap_or("<new>"),
        receipt.new_version
    )?;
    writeln!(
        writer,
        "  Shape:    {} rows x {} columns",
        receipt.row_count, receipt.column_count
    )?;
    writeln!(writer, "  Snapshot: {}", receipt.snapshot_key)?;
    writeln!(writer, "  Audit:    {}", receipt.audit_key)?;
    for line in &receipt.drift {
        writeln!(writer, "  Drift:    {}", line)?;
    }
    Ok(())
}

pub fn print_promotion(report: &PromotionReport, writer: &mut dyn Write) -> Result<()> {
    writeln!(
        writer,
        "Promoted {} part(s) from {}{}",
        report.parts.len(),
        report.prefix,
        if report.marker_present {
            ""
        } else {
            " (no completion marker)"
        }
    )?;
    for part in &report.parts {
        writeln!(writer, "  {}", part)?;
    }
    if report.verbatim {
        writeln!(writer, "  Single part written without re-encoding")?;
    }
    print_receipt(&report.receipt, writer)
}

pub fn print_prune(namespace: &str, report: &PruneReport, writer: &mut dyn Write) -> Result<()> {
    writeln!(
        writer,
        "Pruned {}: kept {}, archived {}",
        namespace,
        report.kept.len(),
        report.archived.len()
    )?;
    for moved in &report.archived {
        writeln!(writer, "  {} -> {}", moved.from, moved.to)?;
    }
    Ok(())
}

pub fn print_snapshots(snapshots: &[ObjectMeta], writer: &mut dyn Write) -> Result<()> {
    if snapshots.is_empty() {
        writeln!(writer, "No snapshots found.")?;
        return Ok(());
    }
    writeln!(writer, "Snapshots ({}, newest first):", snapshots.len())?;
    for meta in snapshots {
        writeln!(writer, "  {}", format_snapshot(meta))?;
    }
    Ok(())
}

pub fn print_audit(records: &[AuditRecord], writer: &mut dyn Write) -> Result<()> {
    if records.is_empty() {
        writeln!(writer, "No audit records found.")?;
        return Ok(());
    }

    writeln!(writer, "Audit trail ({} records):", records.len())?;
    writeln!(writer, "{}", "-".repeat(80))?;
    for record in records {
        writeln!(writer, "  {}", format_record(record))?;
    }
    writeln!(writer, "{}", "-".repeat(80))?;

    let mut users: Vec<&str> = records.iter().map(|r| r.user.as_str()).collect();
    users.sort_unstable();
    users.dedup();
    writeln!(
        writer,
        "Summary: {} saves by {} user(s)",
        records.len(),
        users.len()
    )?;
    Ok(())
}

/// Records as JSON lines, one per record
pub fn print_audit_json(records: &[AuditRecord], writer: &mut dyn Write) -> Result<()> {
    for record in records {
        writeln!(writer, "{}", serde_json::to_string(record)?)?;
    }
    Ok(())
}

/// Alert text for a save whose canonical write succeeded but whose history
/// is incomplete
pub fn operator_alert(err: &MasterError) -> Option<String> {
    match err {
        MasterError::PartialSaveFailure {
            stage,
            new_version,
            snapshot_key,
            source,
        } => Some(format!(
            "!! OPERATOR ATTENTION REQUIRED\n\
             !! The master object was saved as {new_version}, but writing its {stage} failed: {source}\n\
             !! Snapshot: {}\n\
             !! Do not retry the save. Restore the missing record by hand.",
            snapshot_key.as_deref().unwrap_or("<not written>")
        )),
        _ => None,
    }
}
