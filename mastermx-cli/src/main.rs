//! mastermx: versioned editing of a shared master table.
//!
//! Supports:
//! - Bootstrapping, inspecting and exporting the canonical object
//! - Optimistic-concurrency saves of locally edited copies
//! - Promotion of multi-part bulk rewrites
//! - Snapshot restore, retention and audit review
//!
//! # Usage
//!
//! ```bash
//! # Create the canonical object from a local file
//! mastermx init --input master.csv
//!
//! # Take a working copy and note its version
//! mastermx export --output work.csv
//!
//! # Save the edited copy against that version
//! mastermx save --input work.csv --expected-version <tag> --note "fix depths"
//!
//! # Promote the output of a bulk rewrite
//! mastermx promote --prefix rewrites/2024-07-01/ --note "recompute volumes"
//!
//! # Review history
//! mastermx snapshots
//! mastermx audit --date 2024-07-01 --verify
//! mastermx audit --json > audit.jsonl
//! mastermx prune --namespace snapshots --keep 15
//! ```

mod report;

use anyhow::{Context, Result, anyhow};
use bytes::Bytes;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use mastermx_core::{
    MasterConfig, MasterError, MasterService, Namespace, Table, TableFormat, VersionTag, codec,
    current_user,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mastermx")]
#[command(author = "mastermx Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Versioned editing of a shared master table")]
struct Cli {
    /// Configuration file (defaults are used if it does not exist)
    #[arg(long, global = true, default_value = "mastermx.toml")]
    config: PathBuf,

    /// Verbose logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the canonical object from a local file
    Init {
        /// CSV or Parquet file
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long, default_value = "initial load")]
        note: String,
        /// Acting user (default: $USER)
        #[arg(long)]
        user: Option<String>,
    },

    /// Show version, shape, drift and key health of the canonical object
    Show,

    /// Write the canonical content to a local file
    Export {
        /// Output file; its extension selects the format
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Save a locally edited file as the next version
    Save {
        #[arg(short, long)]
        input: PathBuf,
        /// Version tag printed by `export` or `show`
        #[arg(short = 'e', long)]
        expected_version: String,
        #[arg(short, long)]
        note: String,
        #[arg(long)]
        user: Option<String>,
    },

    /// Promote the parts of a bulk rewrite into the canonical object
    Promote {
        /// Working prefix holding the parts
        #[arg(short, long)]
        prefix: String,
        /// Expected version (default: the current one)
        #[arg(short = 'e', long)]
        expected_version: Option<String>,
        #[arg(short, long)]
        note: String,
        #[arg(long)]
        user: Option<String>,
    },

    /// Save a snapshot's content as the next version
    Restore {
        /// Snapshot key as listed by `snapshots`
        #[arg(short, long)]
        snapshot: String,
        #[arg(short = 'e', long)]
        expected_version: String,
        #[arg(short, long)]
        note: String,
        #[arg(long)]
        user: Option<String>,
    },

    /// Archive all but the newest snapshots or audit records
    Prune {
        /// `snapshots` or `audit`
        #[arg(long)]
        namespace: Namespace,
        /// How many to keep (default: from config)
        #[arg(short, long)]
        keep: Option<usize>,
    },

    /// List snapshots, newest first
    Snapshots,

    /// Print audit records
    Audit {
        /// Only records of this day (YYYY-MM-DD)
        #[arg(short, long)]
        date: Option<NaiveDate>,
        /// Check that consecutive records link up
        #[arg(long)]
        verify: bool,
        /// Print raw JSON lines instead of the table
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive(format!("mastermx={level}").parse()?)
                .add_directive(format!("mastermx_core={level}").parse()?),
        )
        .init();

    if let Err(err) = run(cli).await {
        if let Some(alert) = err.downcast_ref::<MasterError>().and_then(report::operator_alert) {
            eprintln!("{}", alert);
            std::process::exit(2);
        }
        return Err(err);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = MasterConfig::load(&cli.config)
        .with_context(|| format!("Failed to load config {:?}", cli.config))?;
    config.apply_env_overrides()?;
    info!(
        "Using bucket {} ({})",
        config.store.bucket_path().display(),
        config.layout.master_key
    );
    let service = MasterService::from_config(&config);
    let mut out = std::io::stdout().lock();

    match cli.command {
        Commands::Init { input, note, user } => {
            let table = read_table(&input)?;
            let user = user.unwrap_or_else(current_user);
            let receipt = service.save_master(table, None, &user, &note).await?;
            report::print_receipt(&receipt, &mut out)
        }

        Commands::Show => {
            let loaded = service.load_master().await?;
            report::print_master(&config.layout.master_key, &loaded, &mut out)
        }

        Commands::Export { output } => cmd_export(&service, &output, &mut out).await,

        Commands::Save {
            input,
            expected_version,
            note,
            user,
        } => {
            let table = read_table(&input)?;
            let user = user.unwrap_or_else(current_user);
            let expected = VersionTag::new(expected_version);
            let receipt = service
                .save_master(table, Some(&expected), &user, &note)
                .await?;
            report::print_receipt(&receipt, &mut out)
        }

        Commands::Promote {
            prefix,
            expected_version,
            note,
            user,
        } => {
            let user = user.unwrap_or_else(current_user);
            let expected = expected_version.map(VersionTag::new);
            let promotion = service
                .promote_from_working_prefix(&prefix, expected.as_ref(), &user, &note)
                .await?;
            report::print_promotion(&promotion, &mut out)
        }

        Commands::Restore {
            snapshot,
            expected_version,
            note,
            user,
        } => {
            let user = user.unwrap_or_else(current_user);
            let expected = VersionTag::new(expected_version);
            let receipt = service
                .restore_snapshot(&snapshot, Some(&expected), &user, &note)
                .await?;
            report::print_receipt(&receipt, &mut out)
        }

        Commands::Prune { namespace, keep } => {
            let pruned = service.prune_older_than(namespace, keep).await?;
            report::print_prune(&namespace.to_string(), &pruned, &mut out)
        }

        Commands::Snapshots => {
            let snapshots = service.list_snapshots().await?;
            report::print_snapshots(&snapshots, &mut out)
        }

        Commands::Audit {
            date,
            verify,
            json,
        } => {
            let records = service.audit_trail(date).await?;
            if json {
                report::print_audit_json(&records, &mut out)?;
            } else {
                report::print_audit(&records, &mut out)?;
            }
            if verify {
                let checked = service.verify_audit_trail(date).await?;
                writeln!(out, "Chain OK ({} records)", checked)?;
            }
            Ok(())
        }
    }
}

async fn cmd_export(service: &MasterService, output: &Path, out: &mut dyn Write) -> Result<()> {
    let loaded = service.load_master().await?;
    let format = TableFormat::from_key(&output.to_string_lossy());
    let data = codec::encode(&loaded.table, format)?;
    std::fs::write(output, &data)
        .with_context(|| format!("Failed to write {:?}", output))?;

    writeln!(out, "Exported {} rows to {:?}", loaded.table.row_count(), output)?;
    writeln!(out, "Version: {}", loaded.version)?;
    writeln!(
        out,
        "Pass --expected-version {} to `mastermx save`",
        loaded.version
    )?;
    Ok(())
}

/// Decode a local CSV or Parquet file, detecting the format from its content
fn read_table(path: &Path) -> Result<Table> {
    let data = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    if data.is_empty() {
        return Err(anyhow!("{:?} is empty", path));
    }
    let data = Bytes::from(data);
    let table = codec::decode(&data, TableFormat::sniff(&data))
        .with_context(|| format!("Failed to decode {:?}", path))?;
    Ok(table)
}
