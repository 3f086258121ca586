//! Reject taxonomy for the pipeline.
//!
//! A policy reject is a *value*, not an exception: every stage returns
//! `Result<_, PolicyReject>` and the pipeline materialises the reject as a
//! rejected run record before control returns to the caller. No stage below
//! the HTTP boundary converts a reject back into a recoverable condition,
//! with two specified exceptions: the override subsystem (which downgrades
//! certain reason-code failures to warnings) and the fsync path of photo
//! publication (degraded durability, not failure).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Reject codes, one per fail-fast condition.
///
/// The wire form (run records, HTTP bodies) is the SCREAMING_SNAKE_CASE
/// string returned by [`RejectCode::as_str`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectCode {
    /// A declared critical field is absent or null after normalization.
    MissingCriticalField,
    /// NaN or an infinity was observed in a numeric field.
    InvalidData,
    /// A critical field failed its type-directed parse.
    ParseErrorCritical,
    /// The result field did not normalise to a declared pass/fail alias.
    ResultInvalidValue,
    /// A required slot has no content and no override is possible.
    PhotoRequiredMissing,
    /// A required slot has no content; an override is possible but absent.
    PhotoOverrideRequired,
    /// The job directory lock could not be acquired in time.
    JobJsonLockTimeout,
    /// Existing `job.json` identity fields disagree with the current packet.
    PacketJobMismatch,
    /// `job.json` exists but cannot be parsed.
    JobJsonCorrupt,
    /// An archival move into `_trash/` failed; prior derived content was kept.
    ArchiveFailed,
    /// An override reason is a banned token or shorter than the minimum.
    InvalidOverrideReason,
    /// An attempt was made to overwrite a session's extraction result.
    IntakeImmutableViolation,
    /// The intake session file exists but cannot be parsed.
    IntakeSessionCorrupt,
    /// A template references a placeholder the contract does not declare.
    TemplateUnknownPlaceholder,
    /// A template file or manifest is missing.
    TemplateNotFound,
    /// Template substitution failed for a reason other than the above.
    RenderFailed,
    /// A field-extraction provider call failed.
    ExtractionFailed,
    /// An OCR provider call failed.
    OcrFailed,
    /// A stage deadline expired; locks were released before returning.
    DeadlineExceeded,
    /// The field contract file failed to load or validate.
    ContractInvalid,
}

impl RejectCode {
    /// Wire-form code string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingCriticalField => "MISSING_CRITICAL_FIELD",
            Self::InvalidData => "INVALID_DATA",
            Self::ParseErrorCritical => "PARSE_ERROR_CRITICAL",
            Self::ResultInvalidValue => "RESULT_INVALID_VALUE",
            Self::PhotoRequiredMissing => "PHOTO_REQUIRED_MISSING",
            Self::PhotoOverrideRequired => "PHOTO_OVERRIDE_REQUIRED",
            Self::JobJsonLockTimeout => "JOB_JSON_LOCK_TIMEOUT",
            Self::PacketJobMismatch => "PACKET_JOB_MISMATCH",
            Self::JobJsonCorrupt => "JOB_JSON_CORRUPT",
            Self::ArchiveFailed => "ARCHIVE_FAILED",
            Self::InvalidOverrideReason => "INVALID_OVERRIDE_REASON",
            Self::IntakeImmutableViolation => "INTAKE_IMMUTABLE_VIOLATION",
            Self::IntakeSessionCorrupt => "INTAKE_SESSION_CORRUPT",
            Self::TemplateUnknownPlaceholder => "TEMPLATE_UNKNOWN_PLACEHOLDER",
            Self::TemplateNotFound => "TEMPLATE_NOT_FOUND",
            Self::RenderFailed => "RENDER_FAILED",
            Self::ExtractionFailed => "EXTRACTION_FAILED",
            Self::OcrFailed => "OCR_FAILED",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::ContractInvalid => "CONTRACT_INVALID",
        }
    }

    /// HTTP status the boundary maps this code to.
    ///
    /// 409 for contention and immutability conflicts, 422 for contract and
    /// validation failures, 404 for missing templates, 500 for internal
    /// failures. This mapping is normative for the HTTP boundary.
    #[must_use]
    pub const fn http_status(self) -> u16 {
        match self {
            Self::JobJsonLockTimeout
            | Self::PacketJobMismatch
            | Self::IntakeImmutableViolation => 409,
            Self::MissingCriticalField
            | Self::InvalidData
            | Self::ParseErrorCritical
            | Self::ResultInvalidValue
            | Self::PhotoRequiredMissing
            | Self::PhotoOverrideRequired
            | Self::InvalidOverrideReason
            | Self::TemplateUnknownPlaceholder
            | Self::ContractInvalid => 422,
            Self::TemplateNotFound => 404,
            Self::DeadlineExceeded => 504,
            Self::JobJsonCorrupt
            | Self::ArchiveFailed
            | Self::IntakeSessionCorrupt
            | Self::RenderFailed
            | Self::ExtractionFailed
            | Self::OcrFailed => 500,
        }
    }
}

impl std::fmt::Display for RejectCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fail-fast policy violation carrying its code and structured context.
///
/// Context entries are free-form key/value pairs that end up verbatim in the
/// run record's `reject_context`. Keys are sorted on serialization so the
/// record is stable.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("[{code}] {}", format_context(.context))]
pub struct PolicyReject {
    /// The taxonomy code.
    pub code: RejectCode,
    /// Structured context for the run record and the operator.
    pub context: BTreeMap<String, Value>,
}

impl PolicyReject {
    /// Creates a reject with an empty context.
    #[must_use]
    pub fn new(code: RejectCode) -> Self {
        Self {
            code,
            context: BTreeMap::new(),
        }
    }

    /// Adds a context entry.
    #[must_use]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    /// Context as a JSON object for the run record.
    #[must_use]
    pub fn context_value(&self) -> Value {
        Value::Object(self.context.clone().into_iter().collect())
    }
}

fn format_context(context: &BTreeMap<String, Value>) -> String {
    context
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_wire_form() {
        assert_eq!(RejectCode::PacketJobMismatch.as_str(), "PACKET_JOB_MISMATCH");
        assert_eq!(
            RejectCode::JobJsonLockTimeout.as_str(),
            "JOB_JSON_LOCK_TIMEOUT"
        );
    }

    #[test]
    fn test_serde_round_trip() {
        let json = serde_json::to_string(&RejectCode::InvalidOverrideReason).expect("serialize");
        assert_eq!(json, "\"INVALID_OVERRIDE_REASON\"");
        let back: RejectCode = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, RejectCode::InvalidOverrideReason);
    }

    #[test]
    fn test_lock_timeout_maps_to_conflict() {
        assert_eq!(RejectCode::JobJsonLockTimeout.http_status(), 409);
        assert_eq!(RejectCode::PacketJobMismatch.http_status(), 409);
    }

    #[test]
    fn test_display_carries_context() {
        let reject = PolicyReject::new(RejectCode::PacketJobMismatch)
            .with("field", "wo_no")
            .with("existing", "WO-001")
            .with("current", "WO-002");
        let msg = reject.to_string();
        assert!(msg.contains("PACKET_JOB_MISMATCH"));
        assert!(msg.contains("wo_no"));
    }

    #[test]
    fn test_context_value_is_object() {
        let reject = PolicyReject::new(RejectCode::InvalidData).with("row", 3);
        let value = reject.context_value();
        assert_eq!(value["row"], 3);
    }
}
