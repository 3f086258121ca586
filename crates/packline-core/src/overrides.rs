//! Override subsystem.
//!
//! An override is an operator-supplied, structured reason permitting the
//! pipeline to proceed despite a missing required field or photo slot. The
//! reason is quality-gated so the escape hatch cannot degrade into a rubber
//! stamp: the detail must be at least ten visible characters and must not be
//! one of the banned filler tokens.
//!
//! Accepted input forms:
//!
//! 1. structured: `{"code": "DEVICE_FAILURE", "detail": "..."}`;
//! 2. legacy string: `"DEVICE_FAILURE: ..."` or `"DEVICE_FAILURE|..."`;
//! 3. bare string: classified as `OTHER` with the whole input as detail.
//!
//! An unrecognised code is accepted but rewritten to `OTHER` with a warning;
//! a banned or under-length detail rejects with `INVALID_OVERRIDE_REASON`.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{PolicyReject, RejectCode};
use crate::runlog::{RunRecordBuilder, WARN_OVERRIDE_CODE_REWRITTEN};

/// Minimum visible characters in an override detail.
pub const MIN_REASON_DETAIL_CHARS: usize = 10;

/// Tokens rejected as override details, compared after trim + lowercase.
/// Includes the common hangul filler strokes.
pub const BANNED_REASON_TOKENS: &[&str] = &[
    "ok", "okay", "n/a", "na", "none", "-", "skip", "pass", "test", ".", "..", "...", "x", "xx",
    "xxx", "ㅇ", "ㅇㅇ", "ㅇㅇㅇ",
];

/// Structured override reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverrideReasonCode {
    MissingPhoto,
    DataUnavailable,
    CustomerRequest,
    DeviceFailure,
    OcrUnreadable,
    FieldNotApplicable,
    Other,
}

impl OverrideReasonCode {
    /// Wire-form code string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingPhoto => "MISSING_PHOTO",
            Self::DataUnavailable => "DATA_UNAVAILABLE",
            Self::CustomerRequest => "CUSTOMER_REQUEST",
            Self::DeviceFailure => "DEVICE_FAILURE",
            Self::OcrUnreadable => "OCR_UNREADABLE",
            Self::FieldNotApplicable => "FIELD_NOT_APPLICABLE",
            Self::Other => "OTHER",
        }
    }

    fn parse(code: &str) -> Option<Self> {
        match code {
            "MISSING_PHOTO" => Some(Self::MissingPhoto),
            "DATA_UNAVAILABLE" => Some(Self::DataUnavailable),
            "CUSTOMER_REQUEST" => Some(Self::CustomerRequest),
            "DEVICE_FAILURE" => Some(Self::DeviceFailure),
            "OCR_UNREADABLE" => Some(Self::OcrUnreadable),
            "FIELD_NOT_APPLICABLE" => Some(Self::FieldNotApplicable),
            "OTHER" => Some(Self::Other),
            _ => None,
        }
    }
}

/// A parsed, quality-checked override reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideReason {
    pub code: OverrideReasonCode,
    /// Detail text, preserved verbatim (post-trim) from the operator input.
    pub detail: String,
}

impl OverrideReason {
    /// Compatibility rendering, `CODE: detail`.
    #[must_use]
    pub fn display_string(&self) -> String {
        format!("{}: {}", self.code.as_str(), self.detail)
    }
}

fn legacy_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([A-Z][A-Z0-9_]*)\s*[:|]\s*(.+)$").expect("legacy reason pattern compiles")
    })
}

/// Parses and validates an override reason for `field_or_slot`.
///
/// `raw` is either a JSON object `{code, detail}` or a JSON string in one of
/// the legacy forms. An unknown code is rewritten to `OTHER` with a warning
/// on the run record.
///
/// # Errors
///
/// `INVALID_OVERRIDE_REASON` when the detail is empty, shorter than
/// [`MIN_REASON_DETAIL_CHARS`] visible characters, or a banned token.
pub fn validate_reason(
    field_or_slot: &str,
    raw: &Value,
    log: &mut RunRecordBuilder,
) -> Result<OverrideReason, PolicyReject> {
    let (declared_code, detail) = match raw {
        Value::Object(map) => {
            let code = map
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("OTHER")
                .trim()
                .to_uppercase();
            let detail = map
                .get("detail")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string();
            (Some(code), detail)
        }
        Value::String(text) => parse_legacy(text),
        _ => (None, String::new()),
    };

    if detail.is_empty() {
        return Err(PolicyReject::new(RejectCode::InvalidOverrideReason)
            .with("field_or_slot", field_or_slot)
            .with("error", "empty detail"));
    }

    if let Some(token) = banned_token(&detail) {
        return Err(PolicyReject::new(RejectCode::InvalidOverrideReason)
            .with("field_or_slot", field_or_slot)
            .with("error", "banned token")
            .with("token", token));
    }

    let visible = detail.chars().filter(|c| !c.is_whitespace()).count();
    if visible < MIN_REASON_DETAIL_CHARS {
        return Err(PolicyReject::new(RejectCode::InvalidOverrideReason)
            .with("field_or_slot", field_or_slot)
            .with("error", "detail below minimum length")
            .with("visible_chars", visible as u64)
            .with("minimum", MIN_REASON_DETAIL_CHARS as u64));
    }

    let code = match declared_code {
        Some(code_str) => match OverrideReasonCode::parse(&code_str) {
            Some(code) => code,
            None => {
                log.warn(
                    WARN_OVERRIDE_CODE_REWRITTEN,
                    &format!("override_{field_or_slot}"),
                    field_or_slot,
                    "unrecognised override reason code rewritten to OTHER",
                    Some(code_str),
                    Some(OverrideReasonCode::Other.as_str().to_string()),
                );
                OverrideReasonCode::Other
            }
        },
        None => OverrideReasonCode::Other,
    };

    Ok(OverrideReason { code, detail })
}

/// Splits a legacy reason string into a declared code and detail.
///
/// `"CODE: detail"` / `"CODE|detail"` yield `(Some(CODE), detail)`; anything
/// else is `(None, whole input)`.
fn parse_legacy(text: &str) -> (Option<String>, String) {
    let trimmed = text.trim();
    if let Some(captures) = legacy_pattern().captures(trimmed) {
        let code = captures[1].to_string();
        let detail = captures[2].trim().to_string();
        // A prefix that is not a known code keeps the whole string as the
        // detail so nothing the operator typed is lost.
        if OverrideReasonCode::parse(&code).is_some() {
            return (Some(code), detail);
        }
        return (Some(code), trimmed.to_string());
    }
    (None, trimmed.to_string())
}

fn banned_token(detail: &str) -> Option<&'static str> {
    let lowered = detail.trim().to_lowercase();
    let collapsed: String = lowered.chars().filter(|c| !c.is_whitespace()).collect();
    BANNED_REASON_TOKENS
        .iter()
        .find(|t| **t == lowered || **t == collapsed)
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> RunRecordBuilder {
        RunRecordBuilder::new("run".to_string(), "test-1".to_string())
    }

    #[test]
    fn test_structured_reason_accepted() {
        let raw = serde_json::json!({
            "code": "DEVICE_FAILURE",
            "detail": "측정 장비 고장으로 촬영 불가"
        });
        let reason = validate_reason("label_serial", &raw, &mut log()).expect("valid");
        assert_eq!(reason.code, OverrideReasonCode::DeviceFailure);
        assert_eq!(reason.detail, "측정 장비 고장으로 촬영 불가");
    }

    #[test]
    fn test_legacy_colon_and_pipe_forms() {
        for text in [
            "MISSING_PHOTO: photo could not be taken on site",
            "MISSING_PHOTO|photo could not be taken on site",
        ] {
            let reason =
                validate_reason("overview", &Value::String(text.to_string()), &mut log())
                    .expect("valid");
            assert_eq!(reason.code, OverrideReasonCode::MissingPhoto);
            assert_eq!(reason.detail, "photo could not be taken on site");
        }
    }

    #[test]
    fn test_bare_string_classifies_as_other() {
        let reason = validate_reason(
            "overview",
            &Value::String("device was out for calibration".to_string()),
            &mut log(),
        )
        .expect("valid");
        assert_eq!(reason.code, OverrideReasonCode::Other);
    }

    #[test]
    fn test_unknown_code_rewritten_with_warning() {
        let raw = serde_json::json!({
            "code": "BECAUSE_I_SAID_SO",
            "detail": "operator confirmed slot is not applicable"
        });
        let mut log = log();
        let reason = validate_reason("defect", &raw, &mut log).expect("valid");
        assert_eq!(reason.code, OverrideReasonCode::Other);
        assert_eq!(log.warning_count(), 1);
    }

    #[test]
    fn test_unknown_legacy_prefix_keeps_full_detail() {
        let reason = validate_reason(
            "defect",
            &Value::String("WEIRD_CODE: rest of the explanation here".to_string()),
            &mut log(),
        )
        .expect("valid");
        assert_eq!(reason.code, OverrideReasonCode::Other);
        assert_eq!(reason.detail, "WEIRD_CODE: rest of the explanation here");
    }

    #[test]
    fn test_banned_tokens_rejected() {
        for token in ["ok", " OK ", "n/a", "-", ".", "xx", "ㅇㅇ", "N / A"] {
            let err = validate_reason("overview", &Value::String(token.to_string()), &mut log())
                .expect_err("banned token must reject");
            assert_eq!(err.code, RejectCode::InvalidOverrideReason, "{token:?}");
        }
    }

    #[test]
    fn test_short_detail_rejected() {
        let err = validate_reason(
            "overview",
            &Value::String("too short".to_string()),
            &mut log(),
        )
        .expect_err("short detail must reject");
        assert_eq!(err.code, RejectCode::InvalidOverrideReason);
    }

    #[test]
    fn test_empty_detail_rejected() {
        let raw = serde_json::json!({"code": "MISSING_PHOTO", "detail": "  "});
        let err = validate_reason("overview", &raw, &mut log()).expect_err("empty must reject");
        assert_eq!(err.code, RejectCode::InvalidOverrideReason);
    }

    #[test]
    fn test_display_string_round_trip() {
        let reason = OverrideReason {
            code: OverrideReasonCode::CustomerRequest,
            detail: "customer waived the defect photo".to_string(),
        };
        let rendered = reason.display_string();
        let parsed = validate_reason("defect", &Value::String(rendered), &mut log()).expect("ok");
        assert_eq!(parsed, reason);
    }
}
