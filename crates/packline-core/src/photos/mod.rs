//! Photo slot engine.
//!
//! Maps raw uploads to declared slots, publishes the chosen file per slot
//! into `derived/`, archives superseded files into run-scoped `_trash/`
//! buckets, grades match confidence, and enforces retention.
//!
//! Planning (`plan_slots`) is read-only and runs before the job-directory
//! lock is taken; publication (`publish_plans`) mutates the directory and
//! requires the lock guard. The split keeps provider calls (the OCR probe
//! feeding the confidence boost) outside the locked window.

pub mod matching;
pub mod publish;
pub mod retention;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;

pub use matching::{match_slots, MatchTier, SlotMatch};
pub use publish::{find_existing_derived, publish_slot, trash_bucket_name};
pub use retention::{purge_all_jobs, purge_job_trash, PurgeReport};

use crate::contract::FieldContract;
use crate::errors::{PolicyReject, RejectCode};
use crate::fsutil::collision_free_path;
use crate::overrides::{validate_reason, OverrideReason};
use crate::runlog::{
    OverrideKind, PhotoAction, PhotoProcessingRecord, RunRecordBuilder,
};
use crate::ssot::JobLockGuard;

/// Planned handling of one slot.
#[derive(Debug, Clone)]
pub enum SlotPlan {
    /// Publish this file into `derived/`.
    Map { slot_key: String, selection: SlotMatch },
    /// Proceed without content; the reason is already quality-checked.
    Override { slot_key: String, reason: OverrideReason },
    /// Optional slot with no content; nothing to do.
    Skip { slot_key: String },
}

impl SlotPlan {
    /// The slot this plan is for.
    #[must_use]
    pub fn slot_key(&self) -> &str {
        match self {
            Self::Map { slot_key, .. }
            | Self::Override { slot_key, .. }
            | Self::Skip { slot_key } => slot_key,
        }
    }
}

/// Plans every declared slot: matching, required-slot policy, override
/// coverage. Read-only; safe before the lock.
///
/// Override entries and skip/override photo-processing records are written
/// here; mapped slots get their records at publication time, when the final
/// paths are known.
///
/// # Errors
///
/// `PHOTO_REQUIRED_MISSING` for an uncovered required slot with overrides
/// disallowed, `PHOTO_OVERRIDE_REQUIRED` when an override could cover the
/// slot but none was supplied, `INVALID_OVERRIDE_REASON` from the reason
/// quality gate.
pub fn plan_slots(
    contract: &FieldContract,
    raw_dir: &Path,
    overrides: &BTreeMap<String, Value>,
    ocr_text: &BTreeMap<String, String>,
    user: &str,
    log: &mut RunRecordBuilder,
) -> Result<Vec<SlotPlan>, PolicyReject> {
    let mut selections = match_slots(contract, raw_dir, ocr_text, log);
    let mut plans = Vec::with_capacity(contract.photos().slots.len());

    for slot in &contract.photos().slots {
        if let Some(selection) = selections.remove(&slot.key) {
            plans.push(SlotPlan::Map {
                slot_key: slot.key.clone(),
                selection,
            });
            continue;
        }

        if !slot.required {
            log.record_photo(PhotoProcessingRecord {
                slot_key: slot.key.clone(),
                action: PhotoAction::Skipped,
                raw_path: None,
                derived_path: None,
                archived_path: None,
                confidence: None,
                matched_by: None,
                ocr_verified: None,
                override_reason: None,
            });
            plans.push(SlotPlan::Skip {
                slot_key: slot.key.clone(),
            });
            continue;
        }

        if !slot.override_allowed {
            log.record_photo(PhotoProcessingRecord {
                slot_key: slot.key.clone(),
                action: PhotoAction::Missing,
                raw_path: None,
                derived_path: None,
                archived_path: None,
                confidence: None,
                matched_by: None,
                ocr_verified: None,
                override_reason: None,
            });
            return Err(PolicyReject::new(RejectCode::PhotoRequiredMissing)
                .with("slot", slot.key.clone())
                .with("basename", slot.basename.clone()));
        }

        let Some(raw_reason) = overrides.get(&slot.key) else {
            log.record_photo(PhotoProcessingRecord {
                slot_key: slot.key.clone(),
                action: PhotoAction::Missing,
                raw_path: None,
                derived_path: None,
                archived_path: None,
                confidence: None,
                matched_by: None,
                ocr_verified: None,
                override_reason: None,
            });
            return Err(PolicyReject::new(RejectCode::PhotoOverrideRequired)
                .with("slot", slot.key.clone())
                .with("basename", slot.basename.clone()));
        };

        let reason = validate_reason(&slot.key, raw_reason, log)?;
        log.record_override(
            &slot.key,
            OverrideKind::Photo,
            reason.code.as_str(),
            &reason.detail,
            user,
        );
        log.record_photo(PhotoProcessingRecord {
            slot_key: slot.key.clone(),
            action: PhotoAction::Override,
            raw_path: None,
            derived_path: None,
            archived_path: None,
            confidence: None,
            matched_by: None,
            ocr_verified: None,
            override_reason: Some(reason.detail.clone()),
        });
        plans.push(SlotPlan::Override {
            slot_key: slot.key.clone(),
            reason,
        });
    }

    Ok(plans)
}

/// Publishes every mapped plan under the job lock. One trash bucket per run;
/// created only when an archival actually happens.
///
/// Returns the published path per slot key.
///
/// # Errors
///
/// `ARCHIVE_FAILED` from the per-slot publication sequence.
pub fn publish_plans(
    lock: &JobLockGuard,
    plans: &[SlotPlan],
    run_id: &str,
    log: &mut RunRecordBuilder,
) -> Result<BTreeMap<String, PathBuf>, PolicyReject> {
    let photos_dir = lock.job_dir().join("photos");
    let derived_dir = photos_dir.join("derived");
    let trash_bucket = photos_dir.join("_trash").join(trash_bucket_name(run_id));

    let mut published = BTreeMap::new();
    for plan in plans {
        let SlotPlan::Map {
            slot_key,
            selection,
        } = plan
        else {
            continue;
        };
        let outcome = publish_slot(
            lock,
            slot_key,
            &selection.path,
            &derived_dir,
            &trash_bucket,
            log,
        )?;
        log.record_photo(PhotoProcessingRecord {
            slot_key: slot_key.clone(),
            action: PhotoAction::Mapped,
            raw_path: Some(selection.path.display().to_string()),
            derived_path: Some(outcome.derived_path.display().to_string()),
            archived_path: outcome
                .archived_path
                .as_ref()
                .map(|p| p.display().to_string()),
            confidence: Some(selection.confidence),
            matched_by: Some(selection.tier.as_str().to_string()),
            ocr_verified: Some(selection.ocr_verified),
            override_reason: None,
        });
        published.insert(slot_key.clone(), outcome.derived_path);
    }
    Ok(published)
}

/// Stores an upload under `photos/raw/`, resolving filename collisions with
/// numeric suffixes, and returns the stored path.
///
/// # Errors
///
/// Propagates I/O failures as `ARCHIVE_FAILED` with context.
pub fn save_upload(job_dir: &Path, filename: &str, bytes: &[u8]) -> Result<PathBuf, PolicyReject> {
    let raw_dir = job_dir.join("photos").join("raw");
    std::fs::create_dir_all(&raw_dir).map_err(|e| {
        PolicyReject::new(RejectCode::ArchiveFailed)
            .with("operation", "mkdir raw")
            .with("error", e.to_string())
    })?;
    let target = collision_free_path(&raw_dir, filename);
    std::fs::write(&target, bytes).map_err(|e| {
        PolicyReject::new(RejectCode::ArchiveFailed)
            .with("operation", "store upload")
            .with("filename", filename)
            .with("error", e.to_string())
    })?;
    Ok(target)
}

/// Current mapping status of every slot, for the operator surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SlotStatus {
    pub slot_key: String,
    pub required: bool,
    pub override_allowed: bool,
    pub has_raw: bool,
    pub has_derived: bool,
    pub derived_path: Option<String>,
}

/// Reports, per declared slot, whether raw candidates and a published file
/// exist. Read-only.
#[must_use]
pub fn slot_status(contract: &FieldContract, job_dir: &Path) -> Vec<SlotStatus> {
    let raw_dir = job_dir.join("photos").join("raw");
    let derived_dir = job_dir.join("photos").join("derived");
    let mut scratch = RunRecordBuilder::new("status".to_string(), String::new());
    let selections = match_slots(contract, &raw_dir, &BTreeMap::new(), &mut scratch);

    contract
        .photos()
        .slots
        .iter()
        .map(|slot| {
            let derived = find_existing_derived(&derived_dir, &slot.key);
            SlotStatus {
                slot_key: slot.key.clone(),
                required: slot.required,
                override_allowed: slot.override_allowed,
                has_raw: selections.contains_key(&slot.key),
                has_derived: derived.is_some(),
                derived_path: derived.map(|p| p.display().to_string()),
            }
        })
        .collect()
}
