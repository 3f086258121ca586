//! Derived-folder publication: atomic per slot, dirty-state preventing.
//!
//! Publication order for a slot:
//!
//! 1. copy the chosen raw file to a temp name next to the destination and
//!    fsync it (an fsync failure degrades durability and emits the
//!    `FSYNC_FAILED` warning, but does not abort);
//! 2. move any existing `derived/<slot>.*` into the run's trash bucket
//!    `_trash/<YYYY-MM-DDTHHMMSS>-<run_id>/` by rename, resolving name
//!    collisions with `_1`, `_2`, ... suffixes;
//! 3. rename the temp file to `derived/<slot>.<ext>`.
//!
//! If step 2 fails the temp file is discarded and the slot fails with
//! `ARCHIVE_FAILED`: the previously published file stays in place, never
//! half-replaced. Consequently `derived/` holds at most one file per slot at
//! any consistent read, and everything in it is either freshly materialised
//! from `raw/` or has its predecessor in `_trash/`.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::errors::{PolicyReject, RejectCode};
use crate::fsutil::collision_free_path;
use crate::runlog::{RunRecordBuilder, WARN_FSYNC_FAILED};
use crate::ssot::JobLockGuard;

/// Name of the trash bucket for this run: `<YYYY-MM-DDTHHMMSS>-<run_id>`.
#[must_use]
pub fn trash_bucket_name(run_id: &str) -> String {
    format!("{}-{run_id}", Utc::now().format("%Y-%m-%dT%H%M%S"))
}

/// The result of publishing one slot.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub derived_path: PathBuf,
    pub archived_path: Option<PathBuf>,
}

/// Publishes `src` as `derived/<slot_key>.<ext>` under the job lock.
///
/// `trash_bucket` is the run-scoped bucket directory (created on first use).
/// The guard parameter proves the caller holds the job-directory lock.
///
/// # Errors
///
/// `ARCHIVE_FAILED` when the superseded file cannot be moved aside; I/O
/// failures on the copy path surface as `ARCHIVE_FAILED` with context.
pub fn publish_slot(
    _lock: &JobLockGuard,
    slot_key: &str,
    src: &Path,
    derived_dir: &Path,
    trash_bucket: &Path,
    log: &mut RunRecordBuilder,
) -> Result<PublishOutcome, PolicyReject> {
    std::fs::create_dir_all(derived_dir).map_err(|e| publish_reject(slot_key, "mkdir", &e))?;

    let extension = src
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();
    let final_path = derived_dir.join(format!("{slot_key}.{extension}"));

    // Step 1: temp copy next to the destination, fsync'd.
    let mut temp = tempfile::Builder::new()
        .prefix(&format!(".{slot_key}-"))
        .tempfile_in(derived_dir)
        .map_err(|e| publish_reject(slot_key, "temp create", &e))?;
    let bytes = std::fs::read(src).map_err(|e| publish_reject(slot_key, "read raw", &e))?;
    temp.write_all(&bytes)
        .map_err(|e| publish_reject(slot_key, "temp write", &e))?;
    if let Err(e) = temp.as_file().sync_all() {
        log.warn(
            WARN_FSYNC_FAILED,
            &format!("photo_publish_{slot_key}"),
            slot_key,
            format!("fsync failed, durability degraded: {e}"),
            None,
            None,
        );
    }

    // Step 2: archive the superseded file, if any.
    let archived_path = match find_existing_derived(derived_dir, slot_key) {
        Some(existing) => {
            let filename = existing
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if let Err(e) = std::fs::create_dir_all(trash_bucket) {
                return Err(archive_failed(slot_key, &existing, &e));
            }
            let destination = collision_free_path(trash_bucket, &filename);
            if let Err(e) = std::fs::rename(&existing, &destination) {
                // Temp discarded, prior derived content preserved.
                return Err(archive_failed(slot_key, &existing, &e));
            }
            Some(destination)
        }
        None => None,
    };

    // Step 3: temp into place.
    temp.persist(&final_path)
        .map_err(|e| publish_reject(slot_key, "final rename", &e.error))?;

    Ok(PublishOutcome {
        derived_path: final_path,
        archived_path,
    })
}

/// The currently published file for a slot, if any. `derived/<slot>.*` holds
/// at most one file per slot; the first hit wins on transient duplicates.
#[must_use]
pub fn find_existing_derived(derived_dir: &Path, slot_key: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(derived_dir).ok()?;
    let prefix = format!("{slot_key}.");
    let mut hits: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(&prefix))
        })
        .collect();
    hits.sort();
    hits.into_iter().next()
}

fn publish_reject(slot_key: &str, operation: &str, error: &std::io::Error) -> PolicyReject {
    PolicyReject::new(RejectCode::ArchiveFailed)
        .with("slot", slot_key)
        .with("operation", operation)
        .with("error", error.to_string())
}

fn archive_failed(slot_key: &str, existing: &Path, error: &std::io::Error) -> PolicyReject {
    PolicyReject::new(RejectCode::ArchiveFailed)
        .with("slot", slot_key)
        .with("operation", "archive rename")
        .with("existing", existing.display().to_string())
        .with("error", error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use crate::ssot::acquire_job_lock;

    fn log() -> RunRecordBuilder {
        RunRecordBuilder::new("run".to_string(), "test-1".to_string())
    }

    struct Setup {
        _tmp: tempfile::TempDir,
        lock: JobLockGuard,
        raw: PathBuf,
        derived: PathBuf,
        trash_bucket: PathBuf,
    }

    fn setup() -> Setup {
        let tmp = tempfile::tempdir().expect("tempdir");
        let job_dir = tmp.path().join("job");
        let lock = acquire_job_lock(&job_dir, &LockConfig::default()).expect("lock");
        let raw = job_dir.join("photos/raw");
        let derived = job_dir.join("photos/derived");
        let trash_bucket = job_dir.join("photos/_trash").join(trash_bucket_name("r1"));
        std::fs::create_dir_all(&raw).expect("raw dir");
        Setup {
            _tmp: tmp,
            lock,
            raw,
            derived,
            trash_bucket,
        }
    }

    #[test]
    fn test_first_publication_creates_derived() {
        let s = setup();
        let src = s.raw.join("01_overview.jpg");
        std::fs::write(&src, b"first").expect("seed");
        let outcome = publish_slot(
            &s.lock,
            "overview",
            &src,
            &s.derived,
            &s.trash_bucket,
            &mut log(),
        )
        .expect("publish");
        assert_eq!(outcome.derived_path, s.derived.join("overview.jpg"));
        assert!(outcome.archived_path.is_none());
        assert_eq!(std::fs::read(&outcome.derived_path).expect("read"), b"first");
        assert!(!s.trash_bucket.exists(), "no bucket without an archival");
    }

    #[test]
    fn test_superseding_publication_archives_predecessor() {
        let s = setup();
        let first = s.raw.join("01_overview.jpg");
        std::fs::write(&first, b"first").expect("seed");
        publish_slot(&s.lock, "overview", &first, &s.derived, &s.trash_bucket, &mut log())
            .expect("first publish");

        let second = s.raw.join("01_overview.png");
        std::fs::write(&second, b"second").expect("seed");
        let outcome = publish_slot(
            &s.lock,
            "overview",
            &second,
            &s.derived,
            &s.trash_bucket,
            &mut log(),
        )
        .expect("second publish");

        let archived = outcome.archived_path.expect("archived");
        assert_eq!(std::fs::read(&archived).expect("read"), b"first");
        assert_eq!(
            std::fs::read(s.derived.join("overview.png")).expect("read"),
            b"second"
        );
        assert!(
            !s.derived.join("overview.jpg").exists(),
            "one file per slot in derived"
        );
    }

    #[test]
    fn test_trash_collision_appends_counter() {
        let s = setup();
        std::fs::create_dir_all(&s.trash_bucket).expect("bucket");
        std::fs::write(s.trash_bucket.join("overview.jpg"), b"occupied").expect("seed");

        let first = s.raw.join("01_overview.jpg");
        std::fs::write(&first, b"v1").expect("seed");
        publish_slot(&s.lock, "overview", &first, &s.derived, &s.trash_bucket, &mut log())
            .expect("publish v1");
        let second = s.raw.join("01_overview_b.jpg");
        std::fs::write(&second, b"v2").expect("seed");
        publish_slot(&s.lock, "overview", &second, &s.derived, &s.trash_bucket, &mut log())
            .expect("publish v2");

        assert!(s.trash_bucket.join("overview_1.jpg").exists());
        assert_eq!(
            std::fs::read(s.trash_bucket.join("overview_1.jpg")).expect("read"),
            b"v1"
        );
    }

    #[test]
    fn test_archive_failure_preserves_prior_derived() {
        let s = setup();
        let first = s.raw.join("01_overview.jpg");
        std::fs::write(&first, b"keep me").expect("seed");
        publish_slot(&s.lock, "overview", &first, &s.derived, &s.trash_bucket, &mut log())
            .expect("publish v1");

        // A regular file where the bucket directory should be makes the
        // archival rename path fail.
        std::fs::create_dir_all(s.trash_bucket.parent().unwrap()).expect("trash root");
        std::fs::write(&s.trash_bucket, b"not a dir").expect("block bucket");

        let second = s.raw.join("01_overview_b.jpg");
        std::fs::write(&second, b"new").expect("seed");
        let err = publish_slot(
            &s.lock,
            "overview",
            &second,
            &s.derived,
            &s.trash_bucket,
            &mut log(),
        )
        .expect_err("archive must fail");
        assert_eq!(err.code, RejectCode::ArchiveFailed);
        assert_eq!(
            std::fs::read(s.derived.join("overview.jpg")).expect("read"),
            b"keep me",
            "dirty-state prevention keeps the prior file"
        );
        // No stray temp files left behind.
        let leftovers: Vec<_> = std::fs::read_dir(&s.derived)
            .expect("derived dir")
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty(), "temp discarded on failure");
    }

    #[test]
    fn test_bucket_name_shape() {
        let name = trash_bucket_name("8f3a2b1c");
        assert!(name.ends_with("-8f3a2b1c"));
        // 2024-01-15T093000 is 17 chars.
        assert_eq!(name.split('-').count(), 4);
    }
}
