//! Shared server state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use packline_core::config::PipelineConfig;
use packline_core::contract::FieldContract;
use packline_core::errors::{PolicyReject, RejectCode};
use packline_core::providers::{ExtractFields, RunOcr};

/// Process-wide immutable state shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub contract: Arc<FieldContract>,
    pub config: Arc<PipelineConfig>,
    pub jobs_root: PathBuf,
    pub template_dir: PathBuf,
    pub extractor: Option<Arc<dyn ExtractFields + Send + Sync>>,
    pub ocr: Option<Arc<dyn RunOcr + Send + Sync>>,
}

impl AppState {
    /// Resolves a job directory from a path segment, refusing anything that
    /// could escape the jobs root.
    ///
    /// # Errors
    ///
    /// `CONTRACT_INVALID` for a malformed job name.
    pub fn job_dir(&self, job: &str) -> Result<PathBuf, PolicyReject> {
        let valid = !job.is_empty()
            && job.len() <= 128
            && job
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !job.starts_with('.');
        if !valid {
            return Err(PolicyReject::new(RejectCode::ContractInvalid)
                .with("job", job)
                .with("error", "job names are restricted to [A-Za-z0-9._-]"));
        }
        Ok(self.jobs_root.join(job))
    }

    /// Resolves a deliverable by name inside a job directory. Names come
    /// from the manifest, so only plain filenames are accepted.
    ///
    /// # Errors
    ///
    /// `CONTRACT_INVALID` for names with path separators.
    pub fn deliverable_path(&self, job_dir: &Path, name: &str) -> Result<PathBuf, PolicyReject> {
        if name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(PolicyReject::new(RejectCode::ContractInvalid)
                .with("name", name)
                .with("error", "deliverable names are plain filenames"));
        }
        Ok(job_dir.join("deliverables").join(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> AppState {
        let contract = FieldContract::parse(
            "version: \"v\"\nfields:\n  wo_no:\n    type: token\nphotos:\n  slots: []\n",
        )
        .expect("contract");
        AppState {
            contract: Arc::new(contract),
            config: Arc::new(PipelineConfig::default()),
            jobs_root: PathBuf::from("/jobs"),
            template_dir: PathBuf::from("/templates/base"),
            extractor: None,
            ocr: None,
        }
    }

    #[test]
    fn test_job_dir_accepts_plain_names() {
        let state = state();
        assert_eq!(
            state.job_dir("wo-001-l1").expect("valid"),
            PathBuf::from("/jobs/wo-001-l1")
        );
    }

    #[test]
    fn test_job_dir_rejects_traversal() {
        let state = state();
        for bad in ["../etc", "a/b", "", ".hidden", "a\\b"] {
            assert!(state.job_dir(bad).is_err(), "{bad:?} must be rejected");
        }
    }

    #[test]
    fn test_deliverable_path_rejects_separators() {
        let state = state();
        let job_dir = PathBuf::from("/jobs/x");
        assert!(state.deliverable_path(&job_dir, "report.md").is_ok());
        assert!(state.deliverable_path(&job_dir, "../job.json").is_err());
        assert!(state.deliverable_path(&job_dir, "a/b.md").is_err());
    }
}
