//! Trash retention: bounded archival storage per job directory.
//!
//! Eviction candidates are trash buckets (`_trash/<TS>-<run_id>/`). A bucket
//! is evicted when it is older than `retention_days`, or (oldest first)
//! while the job's trash exceeds `max_size_per_job_mb`. The newest
//! `min_keep_count` buckets are never evicted, regardless of age or size
//! pressure.
//!
//! `purge_mode` decides the fate of an evicted bucket: `delete` removes it,
//! `compress` repacks it as a single `.tar.gz` under `_archive/` and removes
//! the original, `external` is reserved and leaves everything in place.
//!
//! The total-size ceiling (`max_total_size_gb`) is a per-host quota owned by
//! the operator; the purger reports it and warns when exceeded but does not
//! evict across jobs on its own.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::config::LockConfig;
use crate::contract::{PurgeMode, RetentionSpec};
use crate::fsutil::{collision_free_path, dir_size_bytes};
use crate::ssot::acquire_job_lock;

/// Outcome of a purge sweep. All counters cover the sweep's whole scope.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub scanned_jobs: usize,
    pub scanned_buckets: usize,
    pub scanned_bytes: u64,
    pub purged_buckets: usize,
    pub purged_bytes: u64,
    pub compressed_archives: usize,
    pub total_trash_bytes: u64,
    pub over_total_ceiling: bool,
    pub errors: Vec<String>,
}

/// Purges one job directory's trash according to `policy`.
///
/// With `execute == false` this is a dry run: the report says what would
/// happen, the filesystem is untouched.
#[must_use]
pub fn purge_job_trash(job_dir: &Path, policy: &RetentionSpec, execute: bool) -> PurgeReport {
    let mut report = PurgeReport::default();
    purge_one_job(job_dir, policy, execute, &mut report);
    report.total_trash_bytes = dir_size_bytes(&job_dir.join("photos").join("_trash"));
    report
}

/// Purges every `JOB-*` directory under `jobs_root`, or just `specific_job`.
#[must_use]
pub fn purge_all_jobs(
    jobs_root: &Path,
    policy: &RetentionSpec,
    execute: bool,
    specific_job: Option<&str>,
) -> PurgeReport {
    let mut report = PurgeReport::default();

    let job_dirs: Vec<PathBuf> = match specific_job {
        Some(name) => vec![jobs_root.join(name)],
        None => {
            let Ok(entries) = std::fs::read_dir(jobs_root) else {
                report
                    .errors
                    .push(format!("jobs root unreadable: {}", jobs_root.display()));
                return report;
            };
            let mut dirs: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_dir())
                .collect();
            dirs.sort();
            dirs
        }
    };

    for job_dir in &job_dirs {
        purge_one_job(job_dir, policy, execute, &mut report);
        report.total_trash_bytes = report
            .total_trash_bytes
            .saturating_add(dir_size_bytes(&job_dir.join("photos").join("_trash")));
    }

    let ceiling = policy.max_total_size_gb.saturating_mul(1024 * 1024 * 1024);
    if report.total_trash_bytes > ceiling {
        report.over_total_ceiling = true;
        tracing::warn!(
            total_bytes = report.total_trash_bytes,
            ceiling_bytes = ceiling,
            "trash total exceeds the per-host ceiling; operator eviction required"
        );
    }
    report
}

fn purge_one_job(job_dir: &Path, policy: &RetentionSpec, execute: bool, report: &mut PurgeReport) {
    let trash_dir = job_dir.join("photos").join("_trash");
    let Ok(entries) = std::fs::read_dir(&trash_dir) else {
        return;
    };

    // Mutations to _trash/ and _archive/ run under the job-directory lock,
    // like every other mutating operation on a job directory. A job whose
    // lock cannot be taken is skipped this sweep, not forced.
    let _lock = if execute {
        match acquire_job_lock(job_dir, &LockConfig::default()) {
            Ok(lock) => Some(lock),
            Err(e) => {
                report
                    .errors
                    .push(format!("job busy, skipped: {}: {e}", job_dir.display()));
                return;
            }
        }
    } else {
        None
    };
    let mut buckets: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    if buckets.is_empty() {
        return;
    }
    report.scanned_jobs += 1;

    // Oldest first; the newest min_keep_count are protected outright.
    buckets.sort_by_key(|b| bucket_timestamp(b));
    report.scanned_buckets += buckets.len();
    let sizes: Vec<u64> = buckets.iter().map(|b| dir_size_bytes(b)).collect();
    report.scanned_bytes += sizes.iter().sum::<u64>();

    let protected_from = buckets.len().saturating_sub(policy.min_keep_count);
    let cutoff = chrono::Utc::now().naive_utc()
        - chrono::Duration::days(i64::from(policy.retention_days));
    let size_cap = policy.max_size_per_job_mb.saturating_mul(1024 * 1024);

    let mut evict = vec![false; buckets.len()];
    for (i, bucket) in buckets.iter().enumerate().take(protected_from) {
        if bucket_timestamp(bucket) < cutoff {
            evict[i] = true;
        }
    }

    let mut remaining: u64 = sizes
        .iter()
        .zip(&evict)
        .filter(|(_, e)| !**e)
        .map(|(s, _)| *s)
        .sum();
    for i in 0..protected_from {
        if remaining <= size_cap {
            break;
        }
        if !evict[i] {
            evict[i] = true;
            remaining = remaining.saturating_sub(sizes[i]);
        }
    }

    let archive_dir = job_dir.join("photos").join(&policy.archive_dir);
    for (i, bucket) in buckets.iter().enumerate() {
        if !evict[i] {
            continue;
        }
        purge_bucket(bucket, sizes[i], policy.purge_mode, &archive_dir, execute, report);
    }
}

fn purge_bucket(
    bucket: &Path,
    size: u64,
    mode: PurgeMode,
    archive_dir: &Path,
    execute: bool,
    report: &mut PurgeReport,
) {
    match mode {
        PurgeMode::Delete => {
            if execute {
                if let Err(e) = std::fs::remove_dir_all(bucket) {
                    report
                        .errors
                        .push(format!("delete failed {}: {e}", bucket.display()));
                    return;
                }
            }
            report.purged_buckets += 1;
            report.purged_bytes += size;
        }
        PurgeMode::Compress => {
            if execute {
                match compress_bucket(bucket, archive_dir) {
                    Ok(_) => {
                        if let Err(e) = std::fs::remove_dir_all(bucket) {
                            report
                                .errors
                                .push(format!("bucket removal failed {}: {e}", bucket.display()));
                            return;
                        }
                    }
                    Err(e) => {
                        report
                            .errors
                            .push(format!("compress failed {}: {e}", bucket.display()));
                        return;
                    }
                }
            }
            report.purged_buckets += 1;
            report.purged_bytes += size;
            report.compressed_archives += 1;
        }
        PurgeMode::External => {
            tracing::warn!(bucket = %bucket.display(), "external purge mode is reserved; bucket left in place");
        }
    }
}

/// Repacks a bucket as `<archive_dir>/<bucket_name>.tar.gz`.
fn compress_bucket(bucket: &Path, archive_dir: &Path) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(archive_dir)?;
    let bucket_name = bucket
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| std::io::Error::other("bucket has no name"))?;
    let archive_path = collision_free_path(archive_dir, &format!("{bucket_name}.tar.gz"));

    let file = std::fs::File::create(&archive_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(bucket_name, bucket)?;
    let encoder = builder.into_inner()?;
    let file = encoder.finish()?;
    file.sync_all()?;
    Ok(archive_path)
}

/// A bucket's age: parsed from its `<YYYY-MM-DDTHHMMSS>-...` name, falling
/// back to filesystem mtime for foreign names.
fn bucket_timestamp(bucket: &Path) -> NaiveDateTime {
    let name = bucket
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    if name.len() >= 17 {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(&name[..17], "%Y-%m-%dT%H%M%S") {
            return parsed;
        }
    }
    bucket
        .metadata()
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| {
            t.duration_since(std::time::SystemTime::UNIX_EPOCH)
                .ok()
                .and_then(|d| chrono::DateTime::from_timestamp(d.as_secs() as i64, 0))
        })
        .map_or_else(|| NaiveDateTime::UNIX_EPOCH, |dt| dt.naive_utc())
}
