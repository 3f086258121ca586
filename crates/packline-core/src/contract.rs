//! Field contract loader.
//!
//! Parses the declarative `definition.yaml` that names every field and photo
//! slot the pipeline knows about. The loaded [`FieldContract`] is immutable
//! for the process lifetime and is the sole source of truth for:
//!
//! - field types, importance, aliases, and override policy;
//! - photo slot basenames, required flags, and extension preferences;
//! - which field types are excluded from the judgement-equality hash
//!   (free_text, see [`FieldContract::hash_scoped_fields`]);
//! - the `definition_version` embedded in every run record;
//! - trash retention policy defaults.
//!
//! Alias lookup is case- and whitespace-insensitive. Alias collisions across
//! fields are a load error, not a last-one-wins merge.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{PolicyReject, RejectCode};

/// Closed set of field types. Normalization dispatches on this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Short identifier-like text; internal whitespace runs collapse.
    Token,
    /// Prose; internal line breaks are preserved.
    FreeText,
    /// Decimal number, canonicalised as a fixed-point string.
    Number,
    /// Calendar date, canonicalised as an ISO 8601 date string.
    Date,
}

/// Field importance. Critical fields must survive normalization non-null.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Importance {
    /// Absence or parse failure rejects the run.
    Critical,
    /// Absence or parse failure downgrades to a warning and a null value.
    Reference,
}

/// One declared field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldSpec {
    /// Canonical key, as used in packets, templates, and hashes.
    #[serde(skip)]
    pub key: String,
    /// Type tag driving normalization.
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default = "default_importance")]
    pub importance: Importance,
    /// Alternative spellings accepted from extraction output.
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default = "default_true")]
    pub override_allowed: bool,
    #[serde(default = "default_true")]
    pub override_requires_reason: bool,
}

/// One declared photo slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlotSpec {
    pub key: String,
    /// Filename stem uploads are matched against, e.g. `01_overview`.
    pub basename: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_true")]
    pub override_allowed: bool,
    #[serde(default = "default_true")]
    pub override_requires_reason: bool,
    /// OCR keywords that promote a medium-confidence match to high.
    /// Only slots carrying structured text declare these.
    #[serde(default)]
    pub verify_keywords: Vec<String>,
}

/// Trash retention policy, per job directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetentionSpec {
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    #[serde(default = "default_per_job_mb")]
    pub max_size_per_job_mb: u64,
    /// Per-host ceiling. Reported, not enforced in-pipeline; the operator
    /// owns global eviction.
    #[serde(default = "default_total_gb")]
    pub max_total_size_gb: u64,
    #[serde(default)]
    pub purge_mode: PurgeMode,
    #[serde(default = "default_archive_dir")]
    pub archive_dir: String,
    #[serde(default = "default_min_keep")]
    pub min_keep_count: usize,
}

impl Default for RetentionSpec {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
            max_size_per_job_mb: default_per_job_mb(),
            max_total_size_gb: default_total_gb(),
            purge_mode: PurgeMode::default(),
            archive_dir: default_archive_dir(),
            min_keep_count: default_min_keep(),
        }
    }
}

/// What happens to evicted trash buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PurgeMode {
    /// Remove outright.
    Delete,
    /// Repack as a tar.gz under the archive dir, then remove the bucket.
    #[default]
    Compress,
    /// Hand off to external storage. Reserved; the purger refuses to act.
    External,
}

/// Pass/fail alias table for the result field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResultAliases {
    #[serde(default = "default_pass_aliases")]
    pub result_pass_aliases: Vec<String>,
    #[serde(default = "default_fail_aliases")]
    pub result_fail_aliases: Vec<String>,
}

impl Default for ResultAliases {
    fn default() -> Self {
        Self {
            result_pass_aliases: default_pass_aliases(),
            result_fail_aliases: default_fail_aliases(),
        }
    }
}

/// The photos section of the contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhotoContract {
    #[serde(default = "default_extensions")]
    pub allowed_extensions: Vec<String>,
    /// Extension preference used to break same-tier candidate ties.
    #[serde(default = "default_extensions")]
    pub prefer_order: Vec<String>,
    #[serde(default)]
    pub slots: Vec<SlotSpec>,
    #[serde(default)]
    pub trash_retention: RetentionSpec,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawContract {
    version: String,
    fields: BTreeMap<String, FieldSpec>,
    photos: PhotoContract,
    #[serde(default)]
    validation: ResultAliases,
    #[serde(default)]
    date_formats: Vec<String>,
}

/// The loaded, validated field contract.
#[derive(Debug, Clone)]
pub struct FieldContract {
    version: String,
    fields: Vec<FieldSpec>,
    alias_index: BTreeMap<String, String>,
    photos: PhotoContract,
    result_aliases: ResultAliases,
    date_formats: Vec<String>,
}

impl FieldContract {
    /// Loads and validates a contract file.
    ///
    /// # Errors
    ///
    /// Returns `CONTRACT_INVALID` when the file is missing, malformed, or
    /// carries an alias that resolves to more than one field.
    pub fn load(path: &Path) -> Result<Self, PolicyReject> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            PolicyReject::new(RejectCode::ContractInvalid)
                .with("path", path.display().to_string())
                .with("error", e.to_string())
        })?;
        Self::parse(&text).map_err(|r| r.with("path", path.display().to_string()))
    }

    /// Parses a contract from YAML text.
    ///
    /// # Errors
    ///
    /// Returns `CONTRACT_INVALID` on malformed YAML or alias collisions.
    pub fn parse(text: &str) -> Result<Self, PolicyReject> {
        let raw: RawContract = serde_yaml::from_str(text).map_err(|e| {
            PolicyReject::new(RejectCode::ContractInvalid).with("error", e.to_string())
        })?;

        let mut fields = Vec::with_capacity(raw.fields.len());
        let mut alias_index = BTreeMap::new();
        for (key, mut spec) in raw.fields {
            spec.key = key.clone();
            // The canonical key resolves to itself, so extraction output keyed
            // by canonical name needs no special casing.
            insert_alias(&mut alias_index, &key, &key)?;
            for alias in &spec.aliases {
                insert_alias(&mut alias_index, alias, &key)?;
            }
            fields.push(spec);
        }

        let mut slot_keys = std::collections::BTreeSet::new();
        for slot in &raw.photos.slots {
            if !slot_keys.insert(slot.key.clone()) {
                return Err(PolicyReject::new(RejectCode::ContractInvalid)
                    .with("slot", slot.key.clone())
                    .with("error", "duplicate slot key"));
            }
        }

        Ok(Self {
            version: raw.version,
            fields,
            alias_index,
            photos: raw.photos,
            result_aliases: raw.validation,
            date_formats: raw.date_formats,
        })
    }

    /// The `definition_version` embedded in every run record.
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// All declared fields, in key order.
    #[must_use]
    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    /// Looks up a field by canonical key.
    #[must_use]
    pub fn field(&self, key: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.key == key)
    }

    /// Resolves a raw name (canonical key or alias) to the canonical key.
    /// Matching is case- and whitespace-insensitive.
    #[must_use]
    pub fn resolve_alias(&self, name: &str) -> Option<&str> {
        self.alias_index
            .get(&normalize_alias(name))
            .map(String::as_str)
    }

    /// Field keys in scope of the judgement-equality hash: every critical
    /// field plus reference fields of type token, number, or date. Free-text
    /// is excluded by construction.
    #[must_use]
    pub fn hash_scoped_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.field_type != FieldType::FreeText)
            .map(|f| f.key.as_str())
            .collect()
    }

    /// The photo section.
    #[must_use]
    pub fn photos(&self) -> &PhotoContract {
        &self.photos
    }

    /// Looks up a slot by key.
    #[must_use]
    pub fn slot(&self, key: &str) -> Option<&SlotSpec> {
        self.photos.slots.iter().find(|s| s.key == key)
    }

    /// Pass/fail alias table.
    #[must_use]
    pub fn result_aliases(&self) -> &ResultAliases {
        &self.result_aliases
    }

    /// Declared date formats, tried after ISO 8601 and the date serial.
    #[must_use]
    pub fn date_formats(&self) -> &[String] {
        &self.date_formats
    }

    /// True when a template placeholder name is declared by this contract.
    #[must_use]
    pub fn declares_placeholder(&self, name: &str) -> bool {
        if let Some(slot_key) = name.strip_prefix("photo_") {
            return self.slot(slot_key).is_some();
        }
        self.field(name).is_some()
    }
}

fn insert_alias(
    index: &mut BTreeMap<String, String>,
    alias: &str,
    key: &str,
) -> Result<(), PolicyReject> {
    let normalized = normalize_alias(alias);
    if let Some(existing) = index.get(&normalized) {
        if existing != key {
            return Err(PolicyReject::new(RejectCode::ContractInvalid)
                .with("alias", alias)
                .with("field", key)
                .with("conflicts_with", existing.clone()));
        }
        return Ok(());
    }
    index.insert(normalized, key.to_string());
    Ok(())
}

/// Lowercases and collapses all whitespace so `"WO No"`, `"wo  no"`, and
/// `"wo no"` resolve identically.
fn normalize_alias(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn default_true() -> bool {
    true
}

fn default_importance() -> Importance {
    Importance::Reference
}

fn default_extensions() -> Vec<String> {
    vec![".jpg".to_string(), ".jpeg".to_string(), ".png".to_string()]
}

fn default_retention_days() -> u32 {
    30
}

fn default_per_job_mb() -> u64 {
    100
}

fn default_total_gb() -> u64 {
    10
}

fn default_archive_dir() -> String {
    "_archive".to_string()
}

fn default_min_keep() -> usize {
    3
}

fn default_pass_aliases() -> Vec<String> {
    vec!["PASS".to_string(), "OK".to_string(), "O".to_string()]
}

fn default_fail_aliases() -> Vec<String> {
    vec!["FAIL".to_string(), "NG".to_string(), "X".to_string()]
}


#[cfg(test)]
mod tests {
    use super::test_support::test_contract;
    use super::*;

    #[test]
    fn test_load_and_lookup() {
        let contract = test_contract();
        assert_eq!(contract.version(), "test-1");
        let wo = contract.field("wo_no").expect("wo_no declared");
        assert_eq!(wo.field_type, FieldType::Token);
        assert_eq!(wo.importance, Importance::Critical);
        assert!(!wo.override_allowed);
    }

    #[test]
    fn test_alias_resolution_is_case_and_whitespace_insensitive() {
        let contract = test_contract();
        assert_eq!(contract.resolve_alias("WO"), Some("wo_no"));
        assert_eq!(contract.resolve_alias("  work   ORDER "), Some("wo_no"));
        assert_eq!(contract.resolve_alias("wo_no"), Some("wo_no"));
        assert_eq!(contract.resolve_alias("unknown"), None);
    }

    #[test]
    fn test_alias_collision_rejected_at_load() {
        let yaml = r#"
version: "v"
fields:
  a:
    type: token
    aliases: ["shared"]
  b:
    type: token
    aliases: ["SHARED"]
photos:
  slots: []
"#;
        let err = FieldContract::parse(yaml).expect_err("collision must fail");
        assert_eq!(err.code, RejectCode::ContractInvalid);
    }

    #[test]
    fn test_duplicate_slot_key_rejected() {
        let yaml = r#"
version: "v"
fields:
  a:
    type: token
photos:
  slots:
    - key: overview
      basename: 01_overview
    - key: overview
      basename: 01_overview_b
"#;
        let err = FieldContract::parse(yaml).expect_err("duplicate slot must fail");
        assert_eq!(err.code, RejectCode::ContractInvalid);
    }

    #[test]
    fn test_hash_scope_excludes_free_text() {
        let contract = test_contract();
        let scoped = contract.hash_scoped_fields();
        assert!(scoped.contains(&"wo_no"));
        assert!(scoped.contains(&"qty"));
        assert!(scoped.contains(&"date"));
        assert!(!scoped.contains(&"remark"));
    }

    #[test]
    fn test_declares_placeholder() {
        let contract = test_contract();
        assert!(contract.declares_placeholder("wo_no"));
        assert!(contract.declares_placeholder("photo_overview"));
        assert!(!contract.declares_placeholder("photo_nonexistent"));
        assert!(!contract.declares_placeholder("serial"));
    }

    #[test]
    fn test_retention_defaults() {
        let yaml = r#"
version: "v"
fields:
  a:
    type: token
photos:
  slots: []
"#;
        let contract = FieldContract::parse(yaml).expect("parse");
        let retention = &contract.photos().trash_retention;
        assert_eq!(retention.retention_days, 30);
        assert_eq!(retention.min_keep_count, 3);
        assert_eq!(retention.purge_mode, PurgeMode::Compress);
    }

    #[test]
    fn test_unknown_contract_key_rejected() {
        let yaml = r#"
version: "v"
fields: {}
photos:
  slots: []
surprise: true
"#;
        assert!(FieldContract::parse(yaml).is_err());
    }
}
