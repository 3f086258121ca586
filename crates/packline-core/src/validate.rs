//! Packet validation against the field contract.
//!
//! Runs after normalization, before any filesystem mutation. Checks, in
//! order:
//!
//! 1. every critical field is present and non-null, or carries a
//!    quality-checked override where the contract allows one;
//! 2. no field value violates its declared type post-normalization (a
//!    violation here means a normalizer defect, and fails fast);
//! 3. measurement cells are canonical decimals.
//!
//! Photo-slot override coverage is enforced by the slot engine during
//! planning; both paths delegate reason quality to [`crate::overrides`].

use std::collections::BTreeMap;

use serde_json::Value;

use crate::contract::{FieldContract, FieldType, Importance};
use crate::errors::{PolicyReject, RejectCode};
use crate::normalize::{canonicalize_decimal, normalize_token};
use crate::overrides::validate_reason;
use crate::packet::NormalizedPacket;
use crate::runlog::{OverrideKind, RunRecordBuilder, WARN_MISSING_REFERENCE_FIELD};

/// Validates a normalized packet.
///
/// `overrides` maps a field key to the operator-supplied reason (structured
/// object or legacy string). Accepted field overrides are recorded on the run
/// record; re-application on a later run records a fresh entry.
///
/// # Errors
///
/// `MISSING_CRITICAL_FIELD` when a critical field is null and not covered by
/// an eligible override, `INVALID_OVERRIDE_REASON` when a supplied reason
/// fails the quality gate, `PARSE_ERROR_CRITICAL` / `INVALID_DATA` when a
/// value does not conform to its declared type.
pub fn validate_packet(
    contract: &FieldContract,
    packet: &NormalizedPacket,
    overrides: &BTreeMap<String, Value>,
    user: &str,
    log: &mut RunRecordBuilder,
) -> Result<(), PolicyReject> {
    for spec in contract.fields() {
        let value = packet.get(&spec.key);

        match value {
            Some(value) => check_type_conformance(&spec.key, spec.field_type, value)?,
            None => match spec.importance {
                Importance::Critical => {
                    handle_missing_critical(spec, overrides, user, log)?;
                }
                Importance::Reference => {
                    log.warn(
                        WARN_MISSING_REFERENCE_FIELD,
                        &format!("validate_{}", spec.key),
                        &spec.key,
                        "reference field is absent",
                        None,
                        None,
                    );
                }
            },
        }
    }

    for (index, row) in packet.measurements.iter().enumerate() {
        let canonical = canonicalize_decimal(&row.measured).map_err(|_| {
            PolicyReject::new(RejectCode::InvalidData)
                .with("field", format!("measurements[{index}].measured"))
                .with("value", row.measured.clone())
        })?;
        if canonical != row.measured {
            return Err(PolicyReject::new(RejectCode::InvalidData)
                .with("field", format!("measurements[{index}].measured"))
                .with("value", row.measured.clone())
                .with("error", "measurement cell is not canonical"));
        }
    }

    Ok(())
}

fn handle_missing_critical(
    spec: &crate::contract::FieldSpec,
    overrides: &BTreeMap<String, Value>,
    user: &str,
    log: &mut RunRecordBuilder,
) -> Result<(), PolicyReject> {
    if spec.override_allowed {
        if let Some(raw_reason) = overrides.get(&spec.key) {
            let reason = validate_reason(&spec.key, raw_reason, log)?;
            log.record_override(
                &spec.key,
                OverrideKind::Field,
                reason.code.as_str(),
                &reason.detail,
                user,
            );
            return Ok(());
        }
    }

    Err(PolicyReject::new(RejectCode::MissingCriticalField)
        .with("field", spec.key.as_str())
        .with("override_allowed", spec.override_allowed))
}

fn check_type_conformance(
    key: &str,
    field_type: FieldType,
    value: &str,
) -> Result<(), PolicyReject> {
    let conforms = match field_type {
        // A canonical token round-trips through token normalization.
        FieldType::Token => normalize_token(value) == value,
        FieldType::FreeText => value.trim() == value,
        FieldType::Number => canonicalize_decimal(value).map(|c| c == value) == Ok(true),
        FieldType::Date => chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok(),
    };
    if conforms {
        Ok(())
    } else {
        Err(PolicyReject::new(RejectCode::ParseErrorCritical)
            .with("field", key)
            .with("value", value)
            .with("error", "value violates declared type after normalization"))
    }
}
