//! Packet data model.
//!
//! A [`RawPacket`] is whatever intake produced: string-valued fields keyed by
//! canonical name or alias, raw measurement rows, and upload descriptors. It
//! exists only between intake and normalization. A [`NormalizedPacket`] holds
//! canonical values (or null) for every declared field and canonical
//! measurement cells; it is the input to validation and fingerprinting.
//!
//! Numeric values are canonical decimal strings end to end. No binary
//! floating point is stored or serialized anywhere in a packet.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One raw measurement row, as extracted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawMeasurementRow {
    pub item: String,
    pub spec: String,
    pub measured: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
}

/// Descriptor for a file uploaded during intake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadDescriptor {
    pub filename: String,
    pub size: u64,
    /// Path relative to the job directory, e.g. `photos/raw/01_overview.jpg`.
    pub path: String,
}

/// Pre-normalization packet. Discarded after the normalizer runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawPacket {
    /// Raw field values, keyed by canonical key or alias.
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub measurements: Vec<RawMeasurementRow>,
    #[serde(default)]
    pub uploads: Vec<UploadDescriptor>,
}

/// One canonical measurement row. `measured` is a canonical decimal string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeasurementRow {
    pub item: String,
    pub spec: String,
    pub measured: String,
    pub unit: Option<String>,
    pub result: Option<String>,
}

/// Post-normalization packet: every declared field present, null when a
/// reference field failed to parse or was absent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NormalizedPacket {
    pub fields: BTreeMap<String, Option<String>>,
    pub measurements: Vec<MeasurementRow>,
}

impl NormalizedPacket {
    /// Canonical value of a field, if present and non-null.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(|v| v.as_deref())
    }

    /// The work-order number, half of the job identity tuple.
    #[must_use]
    pub fn wo_no(&self) -> Option<&str> {
        self.get("wo_no")
    }

    /// The production line, the other half of the job identity tuple.
    #[must_use]
    pub fn line(&self) -> Option<&str> {
        self.get("line")
    }

    /// JSON view used by fingerprinting and rendering. Measurement rows are
    /// emitted in row-index order as objects.
    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        for (key, value) in &self.fields {
            map.insert(
                key.clone(),
                value.clone().map_or(Value::Null, Value::String),
            );
        }
        map.insert(
            "measurements".to_string(),
            Value::Array(self.measurements.iter().map(measurement_value).collect()),
        );
        Value::Object(map)
    }
}

fn measurement_value(row: &MeasurementRow) -> Value {
    let mut map = Map::new();
    map.insert("item".to_string(), Value::String(row.item.clone()));
    map.insert("spec".to_string(), Value::String(row.spec.clone()));
    map.insert("measured".to_string(), Value::String(row.measured.clone()));
    map.insert(
        "unit".to_string(),
        row.unit.clone().map_or(Value::Null, Value::String),
    );
    map.insert(
        "result".to_string(),
        row.result.clone().map_or(Value::Null, Value::String),
    );
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_accessors() {
        let mut packet = NormalizedPacket::default();
        packet
            .fields
            .insert("wo_no".to_string(), Some("WO-001".to_string()));
        packet.fields.insert("line".to_string(), None);
        assert_eq!(packet.wo_no(), Some("WO-001"));
        assert_eq!(packet.line(), None);
    }

    #[test]
    fn test_to_value_nulls_and_rows() {
        let mut packet = NormalizedPacket::default();
        packet.fields.insert("remark".to_string(), None);
        packet.measurements.push(MeasurementRow {
            item: "width".to_string(),
            spec: "10±0.1".to_string(),
            measured: "10.02".to_string(),
            unit: Some("mm".to_string()),
            result: None,
        });
        let value = packet.to_value();
        assert!(value["remark"].is_null());
        assert_eq!(value["measurements"][0]["measured"], "10.02");
        assert!(value["measurements"][0]["result"].is_null());
    }
}
