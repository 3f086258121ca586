//! Renderer: materialises the report document and the measurement workbook
//! from a validated packet, the derived photo set, and a template directory.
//!
//! Rendering is deterministic except for explicitly volatile metadata (the
//! generation timestamp and the per-artefact UUID), which the golden harness
//! normalises away ([`golden::normalize_volatile`]). The renderer runs under
//! the job-directory lock; [`render_artifacts`] takes the guard by
//! reference, so a second concurrent render on the same job directory either
//! waits at lock acquisition or rejects with `JOB_JSON_LOCK_TIMEOUT`.

pub mod document;
pub mod golden;
pub mod manifest;
pub mod workbook;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use document::{load_document_template, DocumentTemplate, RenderedDocument};
pub use golden::normalize_volatile;
pub use manifest::{load_manifest, TemplateManifest};
pub use workbook::{load_workbook_template, WorkbookTemplate};

use crate::errors::PolicyReject;
use crate::packet::NormalizedPacket;
use crate::runlog::{now_iso, RunRecordBuilder};
use crate::ssot::JobLockGuard;

/// Both rendered artefacts, ready for packaging.
#[derive(Debug, Clone)]
pub struct RenderedArtifacts {
    pub document: RenderedDocument,
    pub workbook_csv: String,
}

/// Renders the document and the workbook under the job lock.
///
/// # Errors
///
/// Template loading and substitution failures; see [`document`] and
/// [`workbook`].
pub fn render_artifacts(
    _lock: &JobLockGuard,
    template_dir: &Path,
    contract: &crate::contract::FieldContract,
    packet: &NormalizedPacket,
    photos: &BTreeMap<String, PathBuf>,
    log: &mut RunRecordBuilder,
) -> Result<RenderedArtifacts, PolicyReject> {
    let generated_at = now_iso();
    let doc_uuid = uuid::Uuid::new_v4().to_string();

    let document_template = load_document_template(template_dir, contract)?;
    let document = document_template.render(packet, photos, &generated_at, &doc_uuid, log)?;

    let workbook_template = load_workbook_template(template_dir, contract)?;
    let workbook_csv = workbook_template.render(packet, &generated_at)?;

    Ok(RenderedArtifacts {
        document,
        workbook_csv,
    })
}
