//! Run records: one structured JSON document per pipeline attempt.
//!
//! The record accumulates through a [`RunRecordBuilder`] that every stage can
//! append warnings, override applications, and photo processing entries to.
//! Rejects and successes both finish as a persisted record; a run that
//! rejects before the job identity is known records a null `job_id`.
//!
//! Records are append-only on disk: each attempt writes its own
//! `logs/run_<run_id_prefix>.json` atomically, after all `derived/` mutations
//! have committed.

use std::io;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::PolicyReject;
use crate::fingerprint::PACKET_HASH_VERSION;
use crate::fsutil::atomic_write_json;
use crate::ids::run_id_prefix;
use crate::ssot::SCHEMA_VERSION;

// Warning codes. Non-fatal by definition; each accumulates on the current
// record with full context.
pub const WARN_PARSE_ERROR_REFERENCE: &str = "PARSE_ERROR_REFERENCE";
pub const WARN_MISSING_REFERENCE_FIELD: &str = "MISSING_REFERENCE_FIELD";
pub const WARN_PHOTO_LOW_CONFIDENCE: &str = "PHOTO_LOW_CONFIDENCE_MATCH";
pub const WARN_PHOTO_DUPLICATE_AUTO_SELECTED: &str = "PHOTO_DUPLICATE_AUTO_SELECTED";
pub const WARN_PHOTO_AMBIGUOUS_MATCH: &str = "PHOTO_AMBIGUOUS_MATCH";
pub const WARN_FSYNC_FAILED: &str = "FSYNC_FAILED";
pub const WARN_PLACEHOLDER_UNRESOLVED: &str = "PLACEHOLDER_UNRESOLVED";
pub const WARN_OVERRIDE_CODE_REWRITTEN: &str = "OVERRIDE_CODE_REWRITTEN";

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    Success,
    Rejected,
}

/// A non-fatal warning with its mandatory context fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarningRecord {
    pub code: String,
    /// Stage-scoped action identifier, e.g. `photo_select_overview`.
    pub action_id: String,
    pub field_or_slot: String,
    pub original_value: Option<String>,
    pub resolved_value: Option<String>,
    pub message: String,
}

/// What an override applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideKind {
    Field,
    Photo,
}

/// One `OVERRIDE_APPLIED` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideRecord {
    pub timestamp: String,
    pub field_or_slot: String,
    pub kind: OverrideKind,
    pub reason_code: String,
    pub reason_detail: String,
    pub user: String,
}

/// Per-slot outcome of the photo engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhotoAction {
    Mapped,
    Archived,
    Override,
    Missing,
    Skipped,
}

/// Match confidence grade for a mapped slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchConfidence {
    Ambiguous,
    Low,
    Medium,
    High,
}

/// One photo-processing entry, one per slot per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhotoProcessingRecord {
    pub slot_key: String,
    pub action: PhotoAction,
    #[serde(default)]
    pub raw_path: Option<String>,
    #[serde(default)]
    pub derived_path: Option<String>,
    #[serde(default)]
    pub archived_path: Option<String>,
    #[serde(default)]
    pub confidence: Option<MatchConfidence>,
    #[serde(default)]
    pub matched_by: Option<String>,
    #[serde(default)]
    pub ocr_verified: Option<bool>,
    #[serde(default)]
    pub override_reason: Option<String>,
}

/// The persisted run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub job_id: Option<String>,
    pub started_at: String,
    pub finished_at: String,
    pub result: RunResult,
    pub reject_reason: Option<String>,
    pub reject_context: Option<Value>,
    pub packet_hash: Option<String>,
    pub packet_full_hash: Option<String>,
    pub warnings: Vec<WarningRecord>,
    pub overrides: Vec<OverrideRecord>,
    pub photo_processing: Vec<PhotoProcessingRecord>,
    pub definition_version: String,
    pub schema_version: String,
    pub packet_hash_version: String,
}

/// Accumulates a run record as the pipeline advances.
#[derive(Debug)]
pub struct RunRecordBuilder {
    run_id: String,
    job_id: Option<String>,
    started_at: String,
    definition_version: String,
    warnings: Vec<WarningRecord>,
    overrides: Vec<OverrideRecord>,
    photo_processing: Vec<PhotoProcessingRecord>,
    packet_hash: Option<String>,
    packet_full_hash: Option<String>,
}

impl RunRecordBuilder {
    /// Starts a record for a fresh run attempt.
    #[must_use]
    pub fn new(run_id: String, definition_version: String) -> Self {
        Self {
            run_id,
            job_id: None,
            started_at: now_iso(),
            definition_version,
            warnings: Vec::new(),
            overrides: Vec::new(),
            photo_processing: Vec::new(),
            packet_hash: None,
            packet_full_hash: None,
        }
    }

    /// The run id this record is for.
    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Binds the job identity once the SSOT has issued or confirmed it.
    pub fn set_job_id(&mut self, job_id: &str) {
        self.job_id = Some(job_id.to_string());
    }

    /// Records the two packet fingerprints.
    pub fn set_hashes(&mut self, packet_hash: String, packet_full_hash: String) {
        self.packet_hash = Some(packet_hash);
        self.packet_full_hash = Some(packet_full_hash);
    }

    /// Appends a warning with its mandatory context.
    pub fn warn(
        &mut self,
        code: &str,
        action_id: &str,
        field_or_slot: &str,
        message: impl Into<String>,
        original_value: Option<String>,
        resolved_value: Option<String>,
    ) {
        self.warnings.push(WarningRecord {
            code: code.to_string(),
            action_id: action_id.to_string(),
            field_or_slot: field_or_slot.to_string(),
            original_value,
            resolved_value,
            message: message.into(),
        });
    }

    /// Appends an `OVERRIDE_APPLIED` entry.
    pub fn record_override(
        &mut self,
        field_or_slot: &str,
        kind: OverrideKind,
        reason_code: &str,
        reason_detail: &str,
        user: &str,
    ) {
        self.overrides.push(OverrideRecord {
            timestamp: now_iso(),
            field_or_slot: field_or_slot.to_string(),
            kind,
            reason_code: reason_code.to_string(),
            reason_detail: reason_detail.to_string(),
            user: user.to_string(),
        });
    }

    /// Appends a photo-processing entry.
    pub fn record_photo(&mut self, entry: PhotoProcessingRecord) {
        self.photo_processing.push(entry);
    }

    /// Number of warnings recorded so far.
    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.warnings.len()
    }

    /// Photo entries recorded so far.
    #[must_use]
    pub fn photo_entries(&self) -> &[PhotoProcessingRecord] {
        &self.photo_processing
    }

    /// Finishes the record as a success.
    #[must_use]
    pub fn finish_success(self) -> RunRecord {
        self.finish(RunResult::Success, None, None)
    }

    /// Finishes the record as rejected, carrying the reject's code and
    /// context.
    #[must_use]
    pub fn finish_rejected(self, reject: &PolicyReject) -> RunRecord {
        let context = reject.context_value();
        self.finish(
            RunResult::Rejected,
            Some(reject.code.as_str().to_string()),
            Some(context),
        )
    }

    fn finish(
        self,
        result: RunResult,
        reject_reason: Option<String>,
        reject_context: Option<Value>,
    ) -> RunRecord {
        RunRecord {
            run_id: self.run_id,
            job_id: self.job_id,
            started_at: self.started_at,
            finished_at: now_iso(),
            result,
            reject_reason,
            reject_context,
            packet_hash: self.packet_hash,
            packet_full_hash: self.packet_full_hash,
            warnings: self.warnings,
            overrides: self.overrides,
            photo_processing: self.photo_processing,
            definition_version: self.definition_version,
            schema_version: SCHEMA_VERSION.to_string(),
            packet_hash_version: PACKET_HASH_VERSION.to_string(),
        }
    }
}

/// Persists a run record under `logs/`, atomically.
///
/// # Errors
///
/// Propagates I/O failures.
pub fn save_run_record(record: &RunRecord, logs_dir: &Path) -> io::Result<PathBuf> {
    let path = logs_dir.join(format!("run_{}.json", run_id_prefix(&record.run_id)));
    atomic_write_json(&path, record)?;
    Ok(path)
}

/// Run log files under `logs/`, newest first by modification time.
#[must_use]
pub fn list_run_records(logs_dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(logs_dir) else {
        return Vec::new();
    };
    let mut logs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("run_") && n.ends_with(".json"))
        })
        .collect();
    logs.sort_by_key(|p| {
        std::cmp::Reverse(
            p.metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
        )
    });
    logs
}

pub(crate) fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RejectCode;

    fn builder() -> RunRecordBuilder {
        RunRecordBuilder::new("abcdef0123456789".to_string(), "test-1".to_string())
    }

    #[test]
    fn test_success_record_carries_versions() {
        let mut b = builder();
        b.set_job_id("JOB-X");
        b.set_hashes("h1".to_string(), "h2".to_string());
        let record = b.finish_success();
        assert_eq!(record.result, RunResult::Success);
        assert_eq!(record.job_id.as_deref(), Some("JOB-X"));
        assert_eq!(record.packet_hash.as_deref(), Some("h1"));
        assert_eq!(record.definition_version, "test-1");
        assert_eq!(record.packet_hash_version, PACKET_HASH_VERSION);
        assert!(record.reject_reason.is_none());
    }

    #[test]
    fn test_rejected_record_carries_code_and_context() {
        let reject = PolicyReject::new(RejectCode::InvalidData).with("row", 2);
        let record = builder().finish_rejected(&reject);
        assert_eq!(record.result, RunResult::Rejected);
        assert_eq!(record.reject_reason.as_deref(), Some("INVALID_DATA"));
        assert_eq!(record.reject_context.expect("context")["row"], 2);
        assert!(record.job_id.is_none());
    }

    #[test]
    fn test_warning_context_is_mandatory_shape() {
        let mut b = builder();
        b.warn(
            WARN_PARSE_ERROR_REFERENCE,
            "normalize_date",
            "date",
            "unparseable date",
            Some("13/45/2024".to_string()),
            None,
        );
        let record = b.finish_success();
        let w = &record.warnings[0];
        assert_eq!(w.code, WARN_PARSE_ERROR_REFERENCE);
        assert_eq!(w.action_id, "normalize_date");
        assert_eq!(w.field_or_slot, "date");
        assert_eq!(w.original_value.as_deref(), Some("13/45/2024"));
    }

    #[test]
    fn test_save_and_list() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let logs = tmp.path().join("logs");
        let record = builder().finish_success();
        let path = save_run_record(&record, &logs).expect("save");
        assert!(path
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("run_abcdef012345"));
        let listed = list_run_records(&logs);
        assert_eq!(listed.len(), 1);
        let loaded: RunRecord =
            serde_json::from_str(&std::fs::read_to_string(&listed[0]).expect("read"))
                .expect("parse");
        assert_eq!(loaded.run_id, record.run_id);
    }
}
