//! Delivery packaging.
//!
//! Writes rendered artefacts into `<job_dir>/deliverables/` under stable
//! names, copies referenced image assets under `deliverables/assets/`, and
//! records a download manifest (name, size, relative path). Bundling is on
//! demand only; individual files stay addressable by name.

use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::errors::{PolicyReject, RejectCode};
use crate::fsutil::atomic_write_bytes;
use crate::fsutil::atomic_write_json;
use crate::render::RenderedArtifacts;
use crate::runlog::now_iso;
use crate::ssot::JobLockGuard;

/// Stable artefact names.
pub const DOCUMENT_FILENAME: &str = "report.md";
pub const WORKBOOK_FILENAME: &str = "measurements.csv";
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// One downloadable deliverable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverableEntry {
    pub name: String,
    pub size: u64,
    /// Path relative to the job directory.
    pub relative_path: String,
}

/// The download manifest for one run's deliverables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryManifest {
    pub job_id: String,
    pub run_id: String,
    pub generated_at: String,
    pub entries: Vec<DeliverableEntry>,
}

/// Writes the deliverables and the manifest. Runs under the job lock.
///
/// # Errors
///
/// I/O failures surface as `RENDER_FAILED` with path context.
pub fn package(
    lock: &JobLockGuard,
    artifacts: &RenderedArtifacts,
    job_id: &str,
    run_id: &str,
) -> Result<DeliveryManifest, PolicyReject> {
    let job_dir = lock.job_dir();
    let deliverables = job_dir.join("deliverables");

    let mut entries = Vec::new();

    let document_path = deliverables.join(DOCUMENT_FILENAME);
    atomic_write_bytes(&document_path, artifacts.document.text.as_bytes())
        .map_err(|e| io_reject(&document_path, &e))?;
    entries.push(entry(job_dir, &document_path)?);

    let workbook_path = deliverables.join(WORKBOOK_FILENAME);
    atomic_write_bytes(&workbook_path, artifacts.workbook_csv.as_bytes())
        .map_err(|e| io_reject(&workbook_path, &e))?;
    entries.push(entry(job_dir, &workbook_path)?);

    for (src, asset_name) in &artifacts.document.assets {
        let asset_path = deliverables.join("assets").join(asset_name);
        if let Some(parent) = asset_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_reject(&asset_path, &e))?;
        }
        std::fs::copy(src, &asset_path).map_err(|e| io_reject(&asset_path, &e))?;
        entries.push(entry(job_dir, &asset_path)?);
    }

    let manifest = DeliveryManifest {
        job_id: job_id.to_string(),
        run_id: run_id.to_string(),
        generated_at: now_iso(),
        entries,
    };
    let manifest_path = deliverables.join(MANIFEST_FILENAME);
    atomic_write_json(&manifest_path, &manifest).map_err(|e| io_reject(&manifest_path, &e))?;

    Ok(manifest)
}

/// Loads the manifest of the most recent packaging, if any.
///
/// # Errors
///
/// `RENDER_FAILED` when the manifest exists but does not parse.
pub fn load_manifest(job_dir: &Path) -> Result<Option<DeliveryManifest>, PolicyReject> {
    let path = job_dir.join("deliverables").join(MANIFEST_FILENAME);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_reject(&path, &e)),
    };
    serde_json::from_str(&text).map(Some).map_err(|e| {
        PolicyReject::new(RejectCode::RenderFailed)
            .with("path", path.display().to_string())
            .with("error", e.to_string())
    })
}

/// Builds the on-demand bundle: a tar.gz of every manifest entry. Returns
/// the bundle path.
///
/// # Errors
///
/// `RENDER_FAILED` when there is no manifest or the archive cannot be
/// written.
pub fn bundle(job_dir: &Path, run_id: &str) -> Result<PathBuf, PolicyReject> {
    let manifest = load_manifest(job_dir)?.ok_or_else(|| {
        PolicyReject::new(RejectCode::RenderFailed)
            .with("job_dir", job_dir.display().to_string())
            .with("error", "no deliverables to bundle")
    })?;

    let bundle_path = job_dir
        .join("deliverables")
        .join(format!("bundle_{run_id}.tar.gz"));
    let file = std::fs::File::create(&bundle_path).map_err(|e| io_reject(&bundle_path, &e))?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for entry in &manifest.entries {
        let source = job_dir.join(&entry.relative_path);
        builder
            .append_path_with_name(&source, &entry.relative_path)
            .map_err(|e| io_reject(&source, &e))?;
    }
    let encoder = builder.into_inner().map_err(|e| io_reject(&bundle_path, &e))?;
    encoder
        .finish()
        .and_then(|f| f.sync_all())
        .map_err(|e| io_reject(&bundle_path, &e))?;
    Ok(bundle_path)
}

fn entry(job_dir: &Path, path: &Path) -> Result<DeliverableEntry, PolicyReject> {
    let size = std::fs::metadata(path)
        .map_err(|e| io_reject(path, &e))?
        .len();
    let relative_path = path
        .strip_prefix(job_dir)
        .unwrap_or(path)
        .to_string_lossy()
        .into_owned();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(DeliverableEntry {
        name,
        size,
        relative_path,
    })
}

fn io_reject(path: &Path, error: &std::io::Error) -> PolicyReject {
    PolicyReject::new(RejectCode::RenderFailed)
        .with("path", path.display().to_string())
        .with("error", error.to_string())
}
