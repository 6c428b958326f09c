//! Offline archive verifier.
//!
//! Rehashes every data file the index references and sweeps the data
//! tree for unreferenced files. Read-only unless `--remove-orphans` is
//! given. Rows reported as mismatched or incomplete are the ones a
//! `chronicle get-all --integrity` run will repair from the source.
//!
//! ```bash
//! chronicle-verify --repo ./chronicle_repo
//! chronicle-verify --repo ./chronicle_repo --remove-orphans
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use chronicle_ingest::Archive;

/// Verify data files against the archive index.
#[derive(Parser, Debug)]
#[command(name = "chronicle-verify")]
#[command(about = "Verify archive data files against their recorded hashes")]
#[command(version)]
struct Args {
    /// Path to the archive repository folder
    #[arg(long, default_value = "./chronicle_repo")]
    repo: PathBuf,

    /// Delete data files that no item references
    #[arg(long)]
    remove_orphans: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse().expect("static directive parses")),
        )
        .init();

    let args = Args::parse();

    let archive = Archive::open(&args.repo)
        .with_context(|| format!("opening archive at {}", args.repo.display()))?;

    let report = archive.audit_data_files().await?;

    for finding in &report.incomplete_downloads {
        tracing::warn!(
            "Incomplete download (no hash recorded): {} (item_id={})",
            finding.data_file,
            finding.item_id
        );
    }
    for finding in &report.missing_files {
        tracing::warn!(
            "Missing from disk: {} (item_id={})",
            finding.data_file,
            finding.item_id
        );
    }
    for finding in &report.hash_mismatches {
        tracing::warn!(
            "Hash mismatch: {} (item_id={})",
            finding.data_file,
            finding.item_id
        );
    }

    for orphan in &report.orphaned_files {
        if args.remove_orphans {
            match std::fs::remove_file(archive.full_path(orphan)) {
                Ok(()) => tracing::info!("Removed orphaned file: {}", orphan),
                Err(e) => tracing::error!("Removing orphaned file {}: {}", orphan, e),
            }
        } else {
            tracing::warn!("Orphaned file (no item references it): {}", orphan);
        }
    }

    archive.close();

    if report.is_clean() {
        tracing::info!("Archive verified: {} data files clean", report.items_checked);
    } else {
        tracing::info!(
            "Verification found {} missing, {} mismatched, {} incomplete, {} orphaned (of {} checked)",
            report.missing_files.len(),
            report.hash_mismatches.len(),
            report.incomplete_downloads.len(),
            report.orphaned_files.len(),
            report.items_checked
        );
        if !report.hash_mismatches.is_empty() || !report.incomplete_downloads.is_empty() {
            tracing::info!("Run a get-all with --integrity to repair from the source");
        }
        std::process::exit(1);
    }

    Ok(())
}
