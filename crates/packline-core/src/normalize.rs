//! Type-directed normalization.
//!
//! Pure and idempotent: `normalize(normalize(x)) == normalize(x)` for every
//! canonical output. Per-type rules:
//!
//! - **token**: trim, collapse internal whitespace runs to one space;
//! - **free_text**: trim, preserve internal line breaks;
//! - **number**: canonicalize in the string domain to a fixed-point decimal
//!   with no trailing fraction zeros (`"3.140"` -> `"3.14"`, `"1.0"` -> `"1"`).
//!   NaN and infinities reject with `INVALID_DATA` irrespective of field
//!   importance. No binary floating point is involved at any step;
//! - **date**: accept ISO 8601, the spreadsheet date serial, or the
//!   contract's declared formats; emit an ISO 8601 date string.
//!
//! A parse failure on a critical field rejects with `PARSE_ERROR_CRITICAL`;
//! on a reference field the value becomes null and a `PARSE_ERROR_REFERENCE`
//! warning is recorded.

use chrono::{Days, NaiveDate};
use thiserror::Error;

use crate::contract::{FieldContract, FieldType, Importance};
use crate::errors::{PolicyReject, RejectCode};
use crate::packet::{MeasurementRow, NormalizedPacket, RawPacket};
use crate::runlog::{RunRecordBuilder, WARN_PARSE_ERROR_REFERENCE};

/// Spreadsheet date serials count days from this epoch (day 1 = 1900-01-01,
/// with the historical lotus leap-day offset folded in).
const SERIAL_EPOCH: (i32, u32, u32) = (1899, 12, 30);

/// Highest accepted date serial (9999-12-31).
const MAX_DATE_SERIAL: u64 = 2_958_465;

/// Exponent bound for decimal input; anything larger is not inspection data.
const MAX_DECIMAL_EXPONENT: i32 = 100;

/// Fraction length at or beyond which an input is logged as a probable
/// binary-floating-point artifact. Logged only; never rejected.
const FLOAT_ARTIFACT_FRACTION_LEN: usize = 15;

/// Failure modes of the decimal canonicalizer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecimalError {
    /// NaN or an infinity. Always a hard reject upstream.
    #[error("NaN or infinity is not representable")]
    NanOrInfinite,
    /// Not a decimal number.
    #[error("not a decimal number: {input}")]
    Unparseable {
        /// The offending input.
        input: String,
    },
}

/// Canonicalizes a decimal string: optional sign, fixed-point digits, no
/// exponent, no trailing fraction zeros, `-0` collapsed to `0`.
///
/// # Errors
///
/// [`DecimalError::NanOrInfinite`] for NaN/∞ spellings,
/// [`DecimalError::Unparseable`] otherwise.
pub fn canonicalize_decimal(raw: &str) -> Result<String, DecimalError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DecimalError::Unparseable {
            input: raw.to_string(),
        });
    }

    let lowered = trimmed.to_lowercase();
    let unsigned = lowered.trim_start_matches(['+', '-']);
    if matches!(unsigned, "nan" | "inf" | "infinity" | "∞") {
        return Err(DecimalError::NanOrInfinite);
    }

    let (negative, body) = match trimmed.as_bytes().first() {
        Some(&b'-') => (true, &trimmed[1..]),
        Some(&b'+') => (false, &trimmed[1..]),
        _ => (false, trimmed),
    };

    let (mantissa, exponent) = split_exponent(body, raw)?;
    let (int_part, frac_part) = match mantissa.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(DecimalError::Unparseable {
            input: raw.to_string(),
        });
    }
    if !int_part.bytes().all(|b| b.is_ascii_digit())
        || !frac_part.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(DecimalError::Unparseable {
            input: raw.to_string(),
        });
    }

    if frac_part.len() >= FLOAT_ARTIFACT_FRACTION_LEN {
        tracing::debug!(
            input = raw,
            "numeric input resembles a binary floating point artifact"
        );
    }

    // Shift the decimal point by the exponent entirely in the digit string.
    let digits = format!("{int_part}{frac_part}");
    let point = i64::from(
        i32::try_from(int_part.len()).map_err(|_| DecimalError::Unparseable {
            input: raw.to_string(),
        })?,
    ) + i64::from(exponent);

    let mut whole: String;
    let mut fraction: String;
    if point <= 0 {
        whole = "0".to_string();
        fraction = format!("{}{digits}", "0".repeat(point.unsigned_abs() as usize));
    } else if (point as usize) >= digits.len() {
        whole = format!("{digits}{}", "0".repeat(point as usize - digits.len()));
        fraction = String::new();
    } else {
        whole = digits[..point as usize].to_string();
        fraction = digits[point as usize..].to_string();
    }

    whole = whole.trim_start_matches('0').to_string();
    if whole.is_empty() {
        whole.push('0');
    }
    while fraction.ends_with('0') {
        fraction.pop();
    }

    let is_zero = whole == "0" && fraction.is_empty();
    let sign = if negative && !is_zero { "-" } else { "" };
    if fraction.is_empty() {
        Ok(format!("{sign}{whole}"))
    } else {
        Ok(format!("{sign}{whole}.{fraction}"))
    }
}

fn split_exponent<'a>(body: &'a str, raw: &str) -> Result<(&'a str, i32), DecimalError> {
    let Some(idx) = body.find(['e', 'E']) else {
        return Ok((body, 0));
    };
    let mantissa = &body[..idx];
    let exp_str = &body[idx + 1..];
    let exponent: i32 = exp_str.parse().map_err(|_| DecimalError::Unparseable {
        input: raw.to_string(),
    })?;
    if exponent.abs() > MAX_DECIMAL_EXPONENT {
        return Err(DecimalError::Unparseable {
            input: raw.to_string(),
        });
    }
    Ok((mantissa, exponent))
}

/// Trims and collapses internal whitespace runs to a single space.
#[must_use]
pub fn normalize_token(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trims outer whitespace; internal line breaks survive.
#[must_use]
pub fn normalize_free_text(raw: &str) -> String {
    raw.trim().to_string()
}

/// Parses a date from ISO 8601, a spreadsheet serial, or the declared
/// formats, and emits `YYYY-MM-DD`.
///
/// # Errors
///
/// Returns the raw input when no form matches.
pub fn normalize_date(raw: &str, declared_formats: &[String]) -> Result<String, String> {
    let trimmed = raw.trim();

    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(date.format("%Y-%m-%d").to_string());
    }
    if let Ok(stamp) = chrono::DateTime::parse_from_rfc3339(trimmed) {
        return Ok(stamp.date_naive().format("%Y-%m-%d").to_string());
    }
    if let Some(date) = parse_date_serial(trimmed) {
        return Ok(date.format("%Y-%m-%d").to_string());
    }
    for format in declared_formats {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Ok(date.format("%Y-%m-%d").to_string());
        }
    }
    Err(trimmed.to_string())
}

fn parse_date_serial(text: &str) -> Option<NaiveDate> {
    // Spreadsheets hand serials over as "45306" or "45306.0".
    let integral = text.strip_suffix(".0").unwrap_or(text);
    let serial: u64 = integral.parse().ok()?;
    if serial == 0 || serial > MAX_DATE_SERIAL {
        return None;
    }
    let (y, m, d) = SERIAL_EPOCH;
    NaiveDate::from_ymd_opt(y, m, d)?.checked_add_days(Days::new(serial))
}

/// Normalizes a raw packet against the contract.
///
/// Every declared field appears in the output, null when absent or when a
/// reference field failed to parse. Raw keys are resolved through the alias
/// index; unknown raw keys are dropped with a debug log. The `result` field
/// is additionally canonicalised to `PASS`/`FAIL` through the contract's
/// alias tables.
///
/// # Errors
///
/// `INVALID_DATA` for NaN/∞ anywhere, `PARSE_ERROR_CRITICAL` for a failed
/// parse on a critical field, `RESULT_INVALID_VALUE` when the result field
/// matches neither alias table.
pub fn normalize_packet(
    contract: &FieldContract,
    raw: &RawPacket,
    log: &mut RunRecordBuilder,
) -> Result<NormalizedPacket, PolicyReject> {
    let mut packet = NormalizedPacket::default();

    for spec in contract.fields() {
        let raw_value = lookup_raw(contract, raw, &spec.key);
        let Some(raw_value) = raw_value else {
            packet.fields.insert(spec.key.clone(), None);
            continue;
        };

        let normalized = match spec.field_type {
            FieldType::Token => Some(normalize_token(&raw_value)),
            FieldType::FreeText => Some(normalize_free_text(&raw_value)),
            FieldType::Number => match canonicalize_decimal(&raw_value) {
                Ok(value) => Some(value),
                Err(DecimalError::NanOrInfinite) => {
                    return Err(PolicyReject::new(RejectCode::InvalidData)
                        .with("field", spec.key.clone())
                        .with("value", raw_value));
                }
                Err(DecimalError::Unparseable { .. }) => {
                    handle_parse_failure(spec.key.as_str(), spec.importance, &raw_value, log)?
                }
            },
            FieldType::Date => match normalize_date(&raw_value, contract.date_formats()) {
                Ok(value) => Some(value),
                Err(_) => {
                    handle_parse_failure(spec.key.as_str(), spec.importance, &raw_value, log)?
                }
            },
        };

        // Canonical empty string means the raw value was pure whitespace.
        let normalized = normalized.filter(|v| !v.is_empty());

        let normalized = if spec.key == "result" {
            match normalized {
                Some(value) => Some(normalize_result(contract, &value)?),
                None => None,
            }
        } else {
            normalized
        };

        packet.fields.insert(spec.key.clone(), normalized);
    }

    for (index, row) in raw.measurements.iter().enumerate() {
        let measured = canonicalize_decimal(&row.measured).map_err(|e| {
            let code = match e {
                DecimalError::NanOrInfinite => RejectCode::InvalidData,
                DecimalError::Unparseable { .. } => RejectCode::ParseErrorCritical,
            };
            PolicyReject::new(code)
                .with("field", format!("measurements[{index}].measured"))
                .with("value", row.measured.clone())
        })?;
        packet.measurements.push(MeasurementRow {
            item: normalize_token(&row.item),
            spec: normalize_token(&row.spec),
            measured,
            unit: row.unit.as_deref().map(normalize_token).filter(|u| !u.is_empty()),
            result: row
                .result
                .as_deref()
                .map(normalize_token)
                .filter(|r| !r.is_empty()),
        });
    }

    Ok(packet)
}

fn lookup_raw(contract: &FieldContract, raw: &RawPacket, key: &str) -> Option<String> {
    // Canonical key wins; otherwise the first raw entry whose alias resolves
    // to this field.
    if let Some(value) = raw.fields.get(key) {
        if !value.trim().is_empty() {
            return Some(value.clone());
        }
    }
    for (raw_key, value) in &raw.fields {
        if raw_key == key || value.trim().is_empty() {
            continue;
        }
        match contract.resolve_alias(raw_key) {
            Some(resolved) if resolved == key => return Some(value.clone()),
            Some(_) => {}
            None => {
                tracing::debug!(raw_key, "raw field key matches no declared field or alias");
            }
        }
    }
    None
}

fn handle_parse_failure(
    key: &str,
    importance: Importance,
    raw_value: &str,
    log: &mut RunRecordBuilder,
) -> Result<Option<String>, PolicyReject> {
    match importance {
        Importance::Critical => Err(PolicyReject::new(RejectCode::ParseErrorCritical)
            .with("field", key)
            .with("value", raw_value)),
        Importance::Reference => {
            log.warn(
                WARN_PARSE_ERROR_REFERENCE,
                &format!("normalize_{key}"),
                key,
                "reference field failed to parse; value dropped",
                Some(raw_value.to_string()),
                None,
            );
            Ok(None)
        }
    }
}

fn normalize_result(contract: &FieldContract, value: &str) -> Result<String, PolicyReject> {
    let aliases = contract.result_aliases();
    let upper = value.to_uppercase();
    if aliases
        .result_pass_aliases
        .iter()
        .any(|a| a.to_uppercase() == upper)
    {
        return Ok("PASS".to_string());
    }
    if aliases
        .result_fail_aliases
        .iter()
        .any(|a| a.to_uppercase() == upper)
    {
        return Ok("FAIL".to_string());
    }
    Err(PolicyReject::new(RejectCode::ResultInvalidValue).with("value", value))
}
