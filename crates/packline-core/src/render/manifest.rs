//! Template manifest: one `manifest.yaml` per template directory, with a
//! section per artefact.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{PolicyReject, RejectCode};

/// Document-report section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DocumentManifest {
    /// Fallback text per slot key for image anchors with no published file.
    /// Template authors must declare the fallback explicitly; there is no
    /// implicit blank.
    #[serde(default)]
    pub photo_fallbacks: BTreeMap<String, String>,
}

/// Header-driven measurement block configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MeasurementsManifest {
    /// 1-based row index of the header row in the grid.
    pub header_row: usize,
    /// Measurement field -> header label, matched case-insensitively so the
    /// template may reorder columns freely.
    pub columns: BTreeMap<String, String>,
}

/// Measurement-workbook section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkbookManifest {
    /// Field -> named cell address (preferred form).
    #[serde(default)]
    pub named_ranges: BTreeMap<String, String>,
    /// Field -> direct cell address (legacy form).
    #[serde(default)]
    pub cell_addresses: BTreeMap<String, String>,
    #[serde(default)]
    pub measurements: Option<MeasurementsManifest>,
}

/// The whole template manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateManifest {
    #[serde(default)]
    pub document: Option<DocumentManifest>,
    #[serde(default)]
    pub workbook: Option<WorkbookManifest>,
}

/// Loads `manifest.yaml` from a template directory. A missing file is an
/// empty manifest; a malformed one is an error.
///
/// # Errors
///
/// `RENDER_FAILED` with parse context.
pub fn load_manifest(template_dir: &Path) -> Result<TemplateManifest, PolicyReject> {
    let path = template_dir.join("manifest.yaml");
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(TemplateManifest::default());
        }
        Err(e) => {
            return Err(PolicyReject::new(RejectCode::RenderFailed)
                .with("path", path.display().to_string())
                .with("error", e.to_string()));
        }
    };
    serde_yaml::from_str(&text).map_err(|e| {
        PolicyReject::new(RejectCode::RenderFailed)
            .with("path", path.display().to_string())
            .with("error", e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_manifest_is_empty() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let manifest = load_manifest(tmp.path()).expect("empty manifest");
        assert!(manifest.document.is_none());
        assert!(manifest.workbook.is_none());
    }

    #[test]
    fn test_full_manifest_parses() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            tmp.path().join("manifest.yaml"),
            r#"
document:
  photo_fallbacks:
    overview: "(no image)"
workbook:
  named_ranges:
    wo_no: B2
  measurements:
    header_row: 4
    columns:
      item: Item
      measured: Measured
"#,
        )
        .expect("write");
        let manifest = load_manifest(tmp.path()).expect("parse");
        let workbook = manifest.workbook.expect("workbook");
        assert_eq!(workbook.named_ranges["wo_no"], "B2");
        assert_eq!(workbook.measurements.expect("measurements").header_row, 4);
        assert_eq!(
            manifest.document.expect("document").photo_fallbacks["overview"],
            "(no image)"
        );
    }

    #[test]
    fn test_unknown_manifest_key_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        std::fs::write(tmp.path().join("manifest.yaml"), "mystery: 1\n").expect("write");
        assert!(load_manifest(tmp.path()).is_err());
    }
}
