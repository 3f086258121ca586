//! Packet fingerprints.
//!
//! Two SHA-256 hashes over the canonical JSON serialization of a normalized
//! packet:
//!
//! - **`packet_hash`**: judgement equality. Covers every declared field
//!   except free-text; two runs with equal `packet_hash` are treated as
//!   equivalent for pass/fail decisions.
//! - **`packet_full_hash`**: change detection and audit. Covers everything.
//!
//! Canonical JSON: keys sorted bytewise, no whitespace, minimal string
//! escaping, numbers only ever present as decimal strings, `null` for absent
//! values. Measurement rows serialize as an array of objects in row-index
//! order. The serialization profile is versioned by
//! [`PACKET_HASH_VERSION`]; hashes across versions are not comparable.

use std::fmt::Write as _;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::contract::FieldContract;
use crate::packet::NormalizedPacket;

/// Version tag of the fingerprint serialization profile.
pub const PACKET_HASH_VERSION: &str = "cjson-sha256-v1";

/// Judgement-equality hash. Free-text fields are excluded per the contract.
#[must_use]
pub fn packet_hash(contract: &FieldContract, packet: &NormalizedPacket) -> String {
    let scoped: std::collections::BTreeSet<&str> =
        contract.hash_scoped_fields().into_iter().collect();
    let Value::Object(full) = packet.to_value() else {
        unreachable!("packet serializes as an object");
    };
    let filtered: Map<String, Value> = full
        .into_iter()
        .filter(|(key, _)| key == "measurements" || scoped.contains(key.as_str()))
        .collect();
    hash_value(&Value::Object(filtered))
}

/// Full-packet hash, free-text included.
#[must_use]
pub fn packet_full_hash(packet: &NormalizedPacket) -> String {
    hash_value(&packet.to_value())
}

fn hash_value(value: &Value) -> String {
    let mut canonical = String::new();
    emit_value(value, &mut canonical);
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Emits a JSON value in canonical form: sorted keys, no whitespace,
/// minimal escaping.
pub(crate) fn emit_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        // Packets carry numbers as decimal strings; a bare JSON number can
        // only come from foreign input and is emitted verbatim.
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        Value::String(s) => emit_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                emit_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                emit_string(key, out);
                out.push(':');
                emit_value(&map[*key], out);
            }
            out.push('}');
        }
    }
}

/// Minimal escaping: only `"`, `\`, and C0 controls are escaped.
fn emit_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if ('\u{0000}'..='\u{001F}').contains(&c) => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::test_support::test_contract;
    use crate::packet::MeasurementRow;

    fn packet() -> NormalizedPacket {
        let mut packet = NormalizedPacket::default();
        for (key, value) in [
            ("wo_no", "WO-001"),
            ("line", "L1"),
            ("part_no", "P-A"),
            ("lot", "LOT-2024-001"),
            ("result", "PASS"),
            ("qty", "10.5"),
        ] {
            packet
                .fields
                .insert(key.to_string(), Some(value.to_string()));
        }
        packet.fields.insert("inspector".to_string(), None);
        packet.fields.insert("date".to_string(), None);
        packet
            .fields
            .insert("remark".to_string(), Some("looks fine".to_string()));
        packet.measurements.push(MeasurementRow {
            item: "width".to_string(),
            spec: "10±0.1".to_string(),
            measured: "10.02".to_string(),
            unit: Some("mm".to_string()),
            result: Some("PASS".to_string()),
        });
        packet
    }

    #[test]
    fn test_hashes_are_hex_sha256() {
        let contract = test_contract();
        let p = packet();
        for hash in [packet_hash(&contract, &p), packet_full_hash(&p)] {
            assert_eq!(hash.len(), 64);
            assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_hashes_stable_across_calls() {
        let contract = test_contract();
        let p = packet();
        assert_eq!(packet_hash(&contract, &p), packet_hash(&contract, &p));
        assert_eq!(packet_full_hash(&p), packet_full_hash(&p));
    }

    #[test]
    fn test_free_text_mutation_leaves_packet_hash_unchanged() {
        let contract = test_contract();
        let base = packet();
        let mut mutated = base.clone();
        mutated
            .fields
            .insert("remark".to_string(), Some("totally different".to_string()));

        assert_eq!(
            packet_hash(&contract, &base),
            packet_hash(&contract, &mutated),
            "free_text must not affect the judgement hash"
        );
        assert_ne!(
            packet_full_hash(&base),
            packet_full_hash(&mutated),
            "free_text must affect the full hash"
        );
    }

    #[test]
    fn test_scoped_field_mutation_changes_both_hashes() {
        let contract = test_contract();
        let base = packet();
        let mut mutated = base.clone();
        mutated
            .fields
            .insert("qty".to_string(), Some("11".to_string()));
        assert_ne!(packet_hash(&contract, &base), packet_hash(&contract, &mutated));
        assert_ne!(packet_full_hash(&base), packet_full_hash(&mutated));
    }

    #[test]
    fn test_measurement_order_is_significant() {
        let contract = test_contract();
        let mut a = packet();
        a.measurements.push(MeasurementRow {
            item: "height".to_string(),
            spec: "5±0.1".to_string(),
            measured: "5.01".to_string(),
            unit: None,
            result: None,
        });
        let mut b = packet();
        let extra = a.measurements[1].clone();
        b.measurements.insert(0, extra);
        assert_ne!(packet_hash(&contract, &a), packet_hash(&contract, &b));
    }

    #[test]
    fn test_canonical_emission_sorts_keys_and_escapes() {
        let value = serde_json::json!({"z": "line\nbreak", "a": null});
        let mut out = String::new();
        emit_value(&value, &mut out);
        assert_eq!(out, r#"{"a":null,"z":"line\nbreak"}"#);
    }
}
