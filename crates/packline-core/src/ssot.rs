//! Job identity store: `job.json` as the single source of truth.
//!
//! One identity per job directory, minted at first write and immutable
//! thereafter. Any later run whose `(wo_no, line)` disagrees with the
//! recorded identity is rejected.
//!
//! # Locking
//!
//! The store serialises writers with a directory lock: `.job_json.lock/` is
//! created by atomic `mkdir`, so exactly one entrant of a race wins. Losers
//! sleep `retry_interval` and retry up to `max_retries` times before
//! rejecting with `JOB_JSON_LOCK_TIMEOUT`. The guard removes the directory
//! via `rmdir` on drop, on normal and error paths alike. A lock orphaned by
//! process death is removable by the operator; the store never auto-clears
//! one, because a live holder is indistinguishable from a dead one without
//! outside knowledge.
//!
//! The same lock serialises the photo engine's mutating window and the
//! renderer against concurrent runs on the same job directory.
//!
//! # Publication
//!
//! `job.json` is written via temp file + fsync + rename, then the directory
//! is fsync'd, so a reader either sees no file or a complete one.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::config::LockConfig;
use crate::errors::{PolicyReject, RejectCode};
use crate::fsutil::atomic_write_json;
use crate::ids::{derive_job_id, JOB_ID_VERSION};
use crate::packet::NormalizedPacket;
use crate::runlog::now_iso;

/// Schema version written into `job.json` and every run record.
pub const SCHEMA_VERSION: &str = "1.0";

/// Lock directory name inside the job directory.
pub const LOCK_DIR_NAME: &str = ".job_json.lock";

/// The persisted job identity. `job_id` never changes after first write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobIdentity {
    pub job_id: String,
    pub job_id_version: u32,
    pub schema_version: String,
    pub created_at: String,
    pub wo_no: String,
    pub line: String,
}

/// RAII guard for the job-directory lock.
///
/// Holding a `&JobLockGuard` is the capability to mutate the job directory;
/// the photo publisher and the renderer take one by reference to make the
/// locking requirement part of their signatures.
#[derive(Debug)]
pub struct JobLockGuard {
    lock_dir: PathBuf,
}

impl JobLockGuard {
    /// The job directory this guard protects.
    #[must_use]
    pub fn job_dir(&self) -> &Path {
        self.lock_dir.parent().expect("lock dir lives in a job dir")
    }
}

impl Drop for JobLockGuard {
    fn drop(&mut self) {
        // rmdir, not rmtree: if something else appeared inside the lock dir
        // the removal fails and the orphan is left for the operator.
        if let Err(e) = std::fs::remove_dir(&self.lock_dir) {
            tracing::warn!(
                lock_dir = %self.lock_dir.display(),
                error = %e,
                "failed to release job directory lock"
            );
        }
    }
}

/// Acquires the job-directory lock, spinning with a bounded sleep.
///
/// # Errors
///
/// `JOB_JSON_LOCK_TIMEOUT` after `max_retries` failed attempts.
pub fn acquire_job_lock(job_dir: &Path, lock: &LockConfig) -> Result<JobLockGuard, PolicyReject> {
    std::fs::create_dir_all(job_dir).map_err(|e| {
        PolicyReject::new(RejectCode::JobJsonLockTimeout)
            .with("job_dir", job_dir.display().to_string())
            .with("error", format!("job dir not creatable: {e}"))
    })?;

    let lock_dir = job_dir.join(LOCK_DIR_NAME);
    let mut attempts = 0u32;
    loop {
        match std::fs::create_dir(&lock_dir) {
            Ok(()) => return Ok(JobLockGuard { lock_dir }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                attempts += 1;
                if attempts >= lock.max_retries {
                    return Err(PolicyReject::new(RejectCode::JobJsonLockTimeout)
                        .with("job_dir", job_dir.display().to_string())
                        .with("attempts", u64::from(attempts))
                        .with("total_wait_ms", lock.max_wait().as_millis() as u64));
                }
                std::thread::sleep(lock.retry_interval());
            }
            Err(e) => {
                return Err(PolicyReject::new(RejectCode::JobJsonLockTimeout)
                    .with("job_dir", job_dir.display().to_string())
                    .with("error", e.to_string()));
            }
        }
    }
}

/// Loads `job.json` if present.
///
/// # Errors
///
/// `JOB_JSON_CORRUPT` when the file exists but does not parse.
pub fn load_identity(job_dir: &Path) -> Result<Option<JobIdentity>, PolicyReject> {
    let path = job_dir.join("job.json");
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(PolicyReject::new(RejectCode::JobJsonCorrupt)
                .with("path", path.display().to_string())
                .with("error", e.to_string()));
        }
    };
    serde_json::from_str(&text).map(Some).map_err(|e| {
        PolicyReject::new(RejectCode::JobJsonCorrupt)
            .with("path", path.display().to_string())
            .with("error", e.to_string())
    })
}

/// Ensures the job identity exists and matches the packet. Must be called
/// with the lock held; the guard parameter is that proof.
///
/// - Absent `job.json`: mints a deterministic `job_id` from
///   `(wo_no, line, now)` and publishes it atomically.
/// - Present: verifies `(wo_no, line)` and returns the recorded identity
///   unchanged.
///
/// # Errors
///
/// `PACKET_JOB_MISMATCH` on an identity disagreement, `JOB_JSON_CORRUPT` on
/// an unreadable state file, `MISSING_CRITICAL_FIELD` when the packet lacks
/// the identity tuple.
pub fn ensure_identity(
    guard: &JobLockGuard,
    packet: &NormalizedPacket,
) -> Result<JobIdentity, PolicyReject> {
    let wo_no = packet.wo_no().ok_or_else(|| {
        PolicyReject::new(RejectCode::MissingCriticalField).with("field", "wo_no")
    })?;
    let line = packet
        .line()
        .ok_or_else(|| PolicyReject::new(RejectCode::MissingCriticalField).with("field", "line"))?;

    let job_dir = guard.job_dir();
    if let Some(existing) = load_identity(job_dir)? {
        verify_identity(&existing, wo_no, line)?;
        return Ok(existing);
    }

    let issued_at_nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as i128);
    let identity = JobIdentity {
        job_id: derive_job_id(wo_no, line, issued_at_nanos),
        job_id_version: JOB_ID_VERSION,
        schema_version: SCHEMA_VERSION.to_string(),
        created_at: now_iso(),
        wo_no: wo_no.to_string(),
        line: line.to_string(),
    };

    atomic_write_json(&job_dir.join("job.json"), &identity).map_err(|e| {
        PolicyReject::new(RejectCode::JobJsonCorrupt)
            .with("job_dir", job_dir.display().to_string())
            .with("error", format!("identity write failed: {e}"))
    })?;

    Ok(identity)
}

fn verify_identity(
    existing: &JobIdentity,
    wo_no: &str,
    line: &str,
) -> Result<(), PolicyReject> {
    for (field, recorded, current) in [
        ("wo_no", existing.wo_no.as_str(), wo_no),
        ("line", existing.line.as_str(), line),
    ] {
        if recorded != current {
            return Err(PolicyReject::new(RejectCode::PacketJobMismatch)
                .with("field", field)
                .with("existing", recorded)
                .with("current", current));
        }
    }
    Ok(())
}
