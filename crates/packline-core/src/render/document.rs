//! Document report renderer.
//!
//! Substitutes `{{ field_key }}` placeholders and `{{ photo_<slot_key> }}`
//! image anchors in a UTF-8 text template. Placeholder names must be declared
//! by the contract (or be one of the built-ins below); an undeclared name in
//! the template is `TEMPLATE_UNKNOWN_PLACEHOLDER` at load time, before any
//! output is produced.
//!
//! Built-ins: `measurements_table` (a rendered measurement table),
//! `generated_at` and `doc_uuid` (the explicitly volatile metadata the golden
//! harness normalises away).
//!
//! Image anchors resolve to relative links under `assets/`; the actual file
//! copy happens at packaging. A missing or overridden slot resolves to the
//! fallback the template manifest declares for it; a template that anchors a
//! slot without declaring a fallback fails at render time.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::contract::FieldContract;
use crate::errors::{PolicyReject, RejectCode};
use crate::packet::NormalizedPacket;
use crate::runlog::{RunRecordBuilder, WARN_PLACEHOLDER_UNRESOLVED};

/// Placeholder names every template may use regardless of the contract.
const BUILTIN_PLACEHOLDERS: &[&str] = &["measurements_table", "generated_at", "doc_uuid"];

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("placeholder pattern compiles")
    })
}

/// A loaded, contract-checked document template.
#[derive(Debug, Clone)]
pub struct DocumentTemplate {
    body: String,
    /// Fallback text per slot key, for anchors with no published image.
    photo_fallbacks: BTreeMap<String, String>,
}

/// A rendered document plus the image assets it references.
#[derive(Debug, Clone)]
pub struct RenderedDocument {
    pub text: String,
    /// (source path in `derived/`, relative name under `assets/`).
    pub assets: Vec<(PathBuf, String)>,
}

impl DocumentTemplate {
    /// Loads and validates a template body against the contract.
    ///
    /// # Errors
    ///
    /// `TEMPLATE_UNKNOWN_PLACEHOLDER` for a name the contract does not
    /// declare.
    pub fn load(
        body: &str,
        photo_fallbacks: BTreeMap<String, String>,
        contract: &FieldContract,
    ) -> Result<Self, PolicyReject> {
        for captures in placeholder_pattern().captures_iter(body) {
            let name = &captures[1];
            if BUILTIN_PLACEHOLDERS.contains(&name) || contract.declares_placeholder(name) {
                continue;
            }
            return Err(PolicyReject::new(RejectCode::TemplateUnknownPlaceholder)
                .with("placeholder", name));
        }
        Ok(Self {
            body: body.to_string(),
            photo_fallbacks,
        })
    }

    /// Renders the document.
    ///
    /// `photos` maps slot keys to their published `derived/` files. Declared
    /// placeholders with no packet value resolve to the empty string with a
    /// `PLACEHOLDER_UNRESOLVED` warning.
    ///
    /// # Errors
    ///
    /// `RENDER_FAILED` when an image anchor has neither a published file nor
    /// a declared fallback.
    pub fn render(
        &self,
        packet: &NormalizedPacket,
        photos: &BTreeMap<String, PathBuf>,
        generated_at: &str,
        doc_uuid: &str,
        log: &mut RunRecordBuilder,
    ) -> Result<RenderedDocument, PolicyReject> {
        let mut assets = Vec::new();
        let mut failure: Option<PolicyReject> = None;

        let text = placeholder_pattern()
            .replace_all(&self.body, |captures: &regex::Captures<'_>| {
                let name = captures[1].to_string();
                match self.resolve(&name, packet, photos, generated_at, doc_uuid, log) {
                    Ok(Resolution::Text(value)) => value,
                    Ok(Resolution::Image { src, asset_name }) => {
                        let link = format!("![{name}](assets/{asset_name})");
                        assets.push((src, asset_name));
                        link
                    }
                    Err(reject) => {
                        if failure.is_none() {
                            failure = Some(reject);
                        }
                        String::new()
                    }
                }
            })
            .into_owned();

        if let Some(reject) = failure {
            return Err(reject);
        }
        Ok(RenderedDocument { text, assets })
    }

    fn resolve(
        &self,
        name: &str,
        packet: &NormalizedPacket,
        photos: &BTreeMap<String, PathBuf>,
        generated_at: &str,
        doc_uuid: &str,
        log: &mut RunRecordBuilder,
    ) -> Result<Resolution, PolicyReject> {
        if name == "generated_at" {
            return Ok(Resolution::Text(generated_at.to_string()));
        }
        if name == "doc_uuid" {
            return Ok(Resolution::Text(doc_uuid.to_string()));
        }
        if name == "measurements_table" {
            return Ok(Resolution::Text(measurements_table(packet)));
        }
        if let Some(slot_key) = name.strip_prefix("photo_") {
            return self.resolve_photo(slot_key, photos);
        }

        match packet.get(name) {
            Some(value) => Ok(Resolution::Text(value.to_string())),
            None => {
                log.warn(
                    WARN_PLACEHOLDER_UNRESOLVED,
                    "render_document",
                    name,
                    "placeholder has no packet value; rendered empty",
                    None,
                    Some(String::new()),
                );
                Ok(Resolution::Text(String::new()))
            }
        }
    }

    fn resolve_photo(
        &self,
        slot_key: &str,
        photos: &BTreeMap<String, PathBuf>,
    ) -> Result<Resolution, PolicyReject> {
        if let Some(src) = photos.get(slot_key) {
            let extension = src
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("jpg");
            return Ok(Resolution::Image {
                src: src.clone(),
                asset_name: format!("{slot_key}.{extension}"),
            });
        }
        match self.photo_fallbacks.get(slot_key) {
            Some(fallback) => Ok(Resolution::Text(fallback.clone())),
            None => Err(PolicyReject::new(RejectCode::RenderFailed)
                .with("slot", slot_key)
                .with("error", "image anchor has no published file and no declared fallback")),
        }
    }
}

enum Resolution {
    Text(String),
    Image { src: PathBuf, asset_name: String },
}

/// Renders the measurement rows as a text table.
fn measurements_table(packet: &NormalizedPacket) -> String {
    let mut out = String::from("| Item | Spec | Measured | Unit | Result |\n|---|---|---|---|---|\n");
    for row in &packet.measurements {
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            row.item,
            row.spec,
            row.measured,
            row.unit.as_deref().unwrap_or(""),
            row.result.as_deref().unwrap_or(""),
        ));
    }
    out
}

/// Loads a document template from a template directory: `report.md` plus the
/// `document.photo_fallbacks` section of `manifest.yaml`.
///
/// # Errors
///
/// `TEMPLATE_NOT_FOUND` for a missing body file, manifest parse failures as
/// `RENDER_FAILED`, undeclared placeholders as
/// `TEMPLATE_UNKNOWN_PLACEHOLDER`.
pub fn load_document_template(
    template_dir: &Path,
    contract: &FieldContract,
) -> Result<DocumentTemplate, PolicyReject> {
    let body_path = template_dir.join("report.md");
    let body = std::fs::read_to_string(&body_path).map_err(|_| {
        PolicyReject::new(RejectCode::TemplateNotFound)
            .with("path", body_path.display().to_string())
    })?;
    let fallbacks = super::manifest::load_manifest(template_dir)?
        .document
        .map(|d| d.photo_fallbacks)
        .unwrap_or_default();
    DocumentTemplate::load(&body, fallbacks, contract)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::test_support::test_contract;
    use crate::packet::MeasurementRow;

    fn log() -> RunRecordBuilder {
        RunRecordBuilder::new("run".to_string(), "test-1".to_string())
    }

    fn packet() -> NormalizedPacket {
        let mut packet = NormalizedPacket::default();
        for (key, value) in [("wo_no", "WO-001"), ("line", "L1"), ("result", "PASS")] {
            packet
                .fields
                .insert(key.to_string(), Some(value.to_string()));
        }
        packet.fields.insert("inspector".to_string(), None);
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
    fn test_field_substitution() {
        let template = DocumentTemplate::load(
            "Order {{ wo_no }} on {{line}}: {{ result }}",
            BTreeMap::new(),
            &test_contract(),
        )
        .expect("load");
        let rendered = template
            .render(&packet(), &BTreeMap::new(), "TS", "UUID", &mut log())
            .expect("render");
        assert_eq!(rendered.text, "Order WO-001 on L1: PASS");
    }

    #[test]
    fn test_unknown_placeholder_rejects_at_load() {
        let err = DocumentTemplate::load(
            "Value: {{ serial_number }}",
            BTreeMap::new(),
            &test_contract(),
        )
        .expect_err("undeclared placeholder");
        assert_eq!(err.code, RejectCode::TemplateUnknownPlaceholder);
        assert_eq!(err.context["placeholder"], "serial_number");
    }

    #[test]
    fn test_unresolved_placeholder_warns_and_renders_empty() {
        let template = DocumentTemplate::load(
            "Inspector: [{{ inspector }}]",
            BTreeMap::new(),
            &test_contract(),
        )
        .expect("load");
        let mut log = log();
        let rendered = template
            .render(&packet(), &BTreeMap::new(), "TS", "UUID", &mut log)
            .expect("render");
        assert_eq!(rendered.text, "Inspector: []");
        let record = log.finish_success();
        assert_eq!(record.warnings[0].code, WARN_PLACEHOLDER_UNRESOLVED);
    }

    #[test]
    fn test_photo_anchor_links_asset() {
        let template = DocumentTemplate::load(
            "{{ photo_overview }}",
            BTreeMap::new(),
            &test_contract(),
        )
        .expect("load");
        let mut photos = BTreeMap::new();
        photos.insert(
            "overview".to_string(),
            PathBuf::from("/job/photos/derived/overview.jpg"),
        );
        let rendered = template
            .render(&packet(), &photos, "TS", "UUID", &mut log())
            .expect("render");
        assert_eq!(rendered.text, "![photo_overview](assets/overview.jpg)");
        assert_eq!(rendered.assets.len(), 1);
        assert_eq!(rendered.assets[0].1, "overview.jpg");
    }

    #[test]
    fn test_missing_photo_uses_declared_fallback() {
        let mut fallbacks = BTreeMap::new();
        fallbacks.insert("overview".to_string(), "(photo waived)".to_string());
        let template =
            DocumentTemplate::load("{{ photo_overview }}", fallbacks, &test_contract())
                .expect("load");
        let rendered = template
            .render(&packet(), &BTreeMap::new(), "TS", "UUID", &mut log())
            .expect("render");
        assert_eq!(rendered.text, "(photo waived)");
    }

    #[test]
    fn test_missing_photo_without_fallback_fails() {
        let template = DocumentTemplate::load(
            "{{ photo_overview }}",
            BTreeMap::new(),
            &test_contract(),
        )
        .expect("load");
        let err = template
            .render(&packet(), &BTreeMap::new(), "TS", "UUID", &mut log())
            .expect_err("no fallback declared");
        assert_eq!(err.code, RejectCode::RenderFailed);
    }

    #[test]
    fn test_measurements_table_and_volatiles() {
        let template = DocumentTemplate::load(
            "{{ generated_at }} {{ doc_uuid }}\n{{ measurements_table }}",
            BTreeMap::new(),
            &test_contract(),
        )
        .expect("load");
        let rendered = template
            .render(&packet(), &BTreeMap::new(), "2024-01-15T00:00:00Z", "u-1", &mut log())
            .expect("render");
        assert!(rendered.text.starts_with("2024-01-15T00:00:00Z u-1"));
        assert!(rendered.text.contains("| width | 10±0.1 | 10.02 | mm | PASS |"));
    }

    #[test]
    fn test_rendering_is_deterministic_given_volatiles() {
        let template = DocumentTemplate::load(
            "{{ wo_no }} {{ measurements_table }}",
            BTreeMap::new(),
            &test_contract(),
        )
        .expect("load");
        let a = template
            .render(&packet(), &BTreeMap::new(), "TS", "UUID", &mut log())
            .expect("render");
        let b = template
            .render(&packet(), &BTreeMap::new(), "TS", "UUID", &mut log())
            .expect("render");
        assert_eq!(a.text, b.text);
    }
}
