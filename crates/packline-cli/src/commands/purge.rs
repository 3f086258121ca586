//! `packline purge-trash`: retention sweep over `_trash/` archives.
//!
//! Dry-run by default; `--execute` performs the deletions/compressions.

use std::path::Path;

use anyhow::Result;

use packline_core::contract::FieldContract;
use packline_core::photos::purge_all_jobs;

pub fn run(
    definition: &Path,
    jobs_root: &Path,
    specific_job: Option<&str>,
    execute: bool,
) -> Result<()> {
    let contract = FieldContract::load(definition).map_err(|e| anyhow::anyhow!("{e}"))?;
    let policy = &contract.photos().trash_retention;

    if !execute {
        println!("dry run (no deletions); pass --execute to apply");
    }
    println!(
        "policy: {} days, {} MB per job, mode {:?}, keep >= {}",
        policy.retention_days, policy.max_size_per_job_mb, policy.purge_mode, policy.min_keep_count
    );

    let report = purge_all_jobs(jobs_root, policy, execute, specific_job);

    println!(
        "scanned: {} jobs, {} buckets, {:.2} MB",
        report.scanned_jobs,
        report.scanned_buckets,
        report.scanned_bytes as f64 / (1024.0 * 1024.0)
    );
    println!(
        "purged:  {} buckets, {:.2} MB ({} compressed)",
        report.purged_buckets,
        report.purged_bytes as f64 / (1024.0 * 1024.0),
        report.compressed_archives
    );
    if report.over_total_ceiling {
        println!(
            "warning: total trash {:.2} GB exceeds the per-host ceiling",
            report.total_trash_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
        );
    }
    for error in &report.errors {
        eprintln!("error: {error}");
    }
    if report.errors.is_empty() {
        Ok(())
    } else {
        anyhow::bail!("{} purge errors", report.errors.len())
    }
}
