//! The ingest-to-delivery stage machine.
//!
//! One run is a sequential pass: normalize -> validate -> fingerprint ->
//! OCR probe -> photo plan -> lock acquire -> job identity -> photo publish ->
//! render -> package -> record. External calls (the OCR probe) happen before
//! the lock is taken; everything that mutates the job directory happens
//! inside the locked window; the run record is written last, after all
//! `derived/` mutations have committed, and is written for rejects too:
//! every reject surfaces as a rejected record before `run` returns.
//!
//! Each stage checks the request deadline. On expiry the pipeline aborts
//! with `DEADLINE_EXCEEDED` after releasing held locks, like any other
//! reject.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use serde_json::Value;

use crate::config::PipelineConfig;
use crate::contract::FieldContract;
use crate::deliver::{self, DeliveryManifest};
use crate::errors::{PolicyReject, RejectCode};
use crate::fingerprint::{packet_full_hash, packet_hash};
use crate::ids::generate_run_id;
use crate::normalize::normalize_packet;
use crate::packet::RawPacket;
use crate::photos;
use crate::providers::RunOcr;
use crate::render::render_artifacts;
use crate::runlog::{save_run_record, RunRecord, RunRecordBuilder};
use crate::ssot::{acquire_job_lock, ensure_identity};
use crate::validate::validate_packet;

/// One pipeline invocation.
#[derive(Debug)]
pub struct RunRequest {
    pub job_dir: PathBuf,
    pub raw: RawPacket,
    /// Override reasons keyed by field or slot.
    pub overrides: BTreeMap<String, Value>,
    /// The acting user, recorded on override applications.
    pub user: String,
    /// Template directory holding `report.md`, `workbook.csv`,
    /// `manifest.yaml`.
    pub template_dir: PathBuf,
    /// Absolute deadline for the whole run.
    pub deadline: Option<Instant>,
}

/// The outcome of a run: the persisted record, its path, and (on success)
/// the delivery manifest.
#[derive(Debug)]
pub struct RunReport {
    pub record: RunRecord,
    pub record_path: Option<PathBuf>,
    pub deliverables: Option<DeliveryManifest>,
}

impl RunReport {
    /// True when the run succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.record.result == crate::runlog::RunResult::Success
    }
}

/// The pipeline, bound to a loaded contract and configuration.
#[derive(Debug, Clone, Copy)]
pub struct Pipeline<'a> {
    contract: &'a FieldContract,
    config: &'a PipelineConfig,
}

impl<'a> Pipeline<'a> {
    /// Binds a pipeline to its immutable per-process state.
    #[must_use]
    pub const fn new(contract: &'a FieldContract, config: &'a PipelineConfig) -> Self {
        Self { contract, config }
    }

    /// Runs the stage machine once. Never panics on policy violations; the
    /// reject lands in the returned (and persisted) run record.
    pub fn run(&self, request: &RunRequest, ocr: Option<&dyn RunOcr>) -> RunReport {
        let run_id = generate_run_id();
        let mut log = RunRecordBuilder::new(run_id, self.contract.version().to_string());

        match self.execute(request, ocr, &mut log) {
            Ok(manifest) => {
                let record = log.finish_success();
                let record_path = self.persist_record(&record, &request.job_dir);
                RunReport {
                    record,
                    record_path,
                    deliverables: Some(manifest),
                }
            }
            Err(reject) => {
                tracing::warn!(code = %reject.code, "pipeline run rejected");
                let record = log.finish_rejected(&reject);
                let record_path = self.persist_record(&record, &request.job_dir);
                RunReport {
                    record,
                    record_path,
                    deliverables: None,
                }
            }
        }
    }

    fn execute(
        &self,
        request: &RunRequest,
        ocr: Option<&dyn RunOcr>,
        log: &mut RunRecordBuilder,
    ) -> Result<DeliveryManifest, PolicyReject> {
        let deadline = Deadline(request.deadline);

        deadline.check("normalize")?;
        let packet = normalize_packet(self.contract, &request.raw, log)?;

        deadline.check("validate")?;
        validate_packet(self.contract, &packet, &request.overrides, &request.user, log)?;

        deadline.check("fingerprint")?;
        log.set_hashes(
            packet_hash(self.contract, &packet),
            packet_full_hash(&packet),
        );

        // Provider calls stay outside the locked window.
        deadline.check("ocr_probe")?;
        let raw_dir = request.job_dir.join("photos").join("raw");
        let ocr_text = self.probe_label_slots(&raw_dir, ocr);

        deadline.check("photo_plan")?;
        let plans = photos::plan_slots(
            self.contract,
            &raw_dir,
            &request.overrides,
            &ocr_text,
            &request.user,
            log,
        )?;

        deadline.check("acquire_lock")?;
        let lock = acquire_job_lock(&request.job_dir, &self.config.lock)?;

        let identity = ensure_identity(&lock, &packet)?;
        log.set_job_id(&identity.job_id);

        deadline.check("photo_publish")?;
        let run_id = log.run_id().to_string();
        let published = photos::publish_plans(&lock, &plans, &run_id, log)?;

        deadline.check("render")?;
        let artifacts = render_artifacts(
            &lock,
            &request.template_dir,
            self.contract,
            &packet,
            &published,
            log,
        )?;

        deadline.check("package")?;
        let manifest = deliver::package(&lock, &artifacts, &identity.job_id, &run_id)?;

        if self.config.generate_pdf {
            tracing::warn!("generate_pdf is set but no converter is configured; skipped");
        }

        drop(lock);
        Ok(manifest)
    }

    /// OCR probe for slots that declare verify keywords: every raw file that
    /// could match such a slot is read once, results keyed by filename.
    /// Probe failures degrade to a debug log; grading falls back to the
    /// filename tier.
    fn probe_label_slots(
        &self,
        raw_dir: &Path,
        ocr: Option<&dyn RunOcr>,
    ) -> BTreeMap<String, String> {
        let mut texts = BTreeMap::new();
        let Some(ocr) = ocr else {
            return texts;
        };
        let keyword_slots: Vec<_> = self
            .contract
            .photos()
            .slots
            .iter()
            .filter(|s| !s.verify_keywords.is_empty())
            .collect();
        if keyword_slots.is_empty() {
            return texts;
        }
        let Ok(entries) = std::fs::read_dir(raw_dir) else {
            return texts;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let stem = stem.to_lowercase();
            let relevant = keyword_slots.iter().any(|slot| {
                stem.starts_with(&slot.basename.to_lowercase())
                    || stem.starts_with(&slot.key.to_lowercase())
            });
            if !relevant {
                continue;
            }
            let filename = entry.file_name().to_string_lossy().into_owned();
            match ocr.run_ocr(&path) {
                Ok(record) => {
                    if let Some(text) = record.text {
                        texts.insert(filename, text);
                    }
                }
                Err(e) => {
                    tracing::debug!(file = %filename, error = %e, "OCR probe failed; filename tier kept");
                }
            }
        }
        texts
    }

    fn persist_record(&self, record: &RunRecord, job_dir: &Path) -> Option<PathBuf> {
        let logs_dir = job_dir.join("logs");
        match save_run_record(record, &logs_dir) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!(error = %e, "run record could not be persisted");
                None
            }
        }
    }
}

struct Deadline(Option<Instant>);

impl Deadline {
    fn check(&self, stage: &str) -> Result<(), PolicyReject> {
        match self.0 {
            Some(deadline) if Instant::now() >= deadline => {
                Err(PolicyReject::new(RejectCode::DeadlineExceeded).with("stage", stage))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::test_support::test_contract;
    use crate::runlog::RunResult;

    fn write_templates(dir: &Path) {
        std::fs::create_dir_all(dir).expect("template dir");
        std::fs::write(
            dir.join("report.md"),
            "# Inspection {{ wo_no }}\n{{ photo_overview }}\n{{ measurements_table }}\n",
        )
        .expect("report template");
        std::fs::write(dir.join("workbook.csv"), "WO No,\nItem,Spec,Measured,Unit,Result\n")
            .expect("workbook template");
        std::fs::write(
            dir.join("manifest.yaml"),
            r#"
document:
  photo_fallbacks:
    overview: "(no overview photo)"
workbook:
  named_ranges:
    wo_no: B1
  measurements:
    header_row: 2
    columns:
      item: Item
      spec: Spec
      measured: Measured
      unit: Unit
      result: Result
"#,
        )
        .expect("manifest");
    }

    fn base_request(root: &Path) -> RunRequest {
        let job_dir = root.join("jobs/wo-001-l1");
        let raw_dir = job_dir.join("photos/raw");
        std::fs::create_dir_all(&raw_dir).expect("raw dir");
        std::fs::write(raw_dir.join("01_overview.jpg"), b"img-a").expect("seed");
        std::fs::write(raw_dir.join("02_label_serial.jpg"), b"img-b").expect("seed");

        let template_dir = root.join("templates/base");
        write_templates(&template_dir);

        let mut raw = RawPacket::default();
        for (key, value) in [
            ("wo_no", "WO-001"),
            ("line", "L1"),
            ("part_no", "P-A"),
            ("lot", "LOT-2024-001"),
            ("result", "PASS"),
        ] {
            raw.fields.insert(key.to_string(), value.to_string());
        }

        RunRequest {
            job_dir,
            raw,
            overrides: BTreeMap::new(),
            user: "tester".to_string(),
            template_dir,
            deadline: None,
        }
    }

    #[test]
    fn test_happy_path_end_to_end() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let contract = test_contract();
        let config = PipelineConfig::default();
        let pipeline = Pipeline::new(&contract, &config);
        let request = base_request(tmp.path());

        let report = pipeline.run(&request, None);
        assert!(report.is_success(), "reject: {:?}", report.record.reject_reason);
        assert!(request.job_dir.join("job.json").exists());
        assert!(request.job_dir.join("photos/derived/overview.jpg").exists());
        assert!(request
            .job_dir
            .join("photos/derived/label_serial.jpg")
            .exists());
        assert!(request.job_dir.join("deliverables/report.md").exists());
        assert!(request.job_dir.join("deliverables/measurements.csv").exists());
        assert!(report.record_path.expect("record path").exists());
        assert!(report.record.packet_hash.is_some());
    }

    #[test]
    fn test_reject_still_writes_record_and_no_job_json() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let contract = test_contract();
        let config = PipelineConfig::default();
        let pipeline = Pipeline::new(&contract, &config);
        let mut request = base_request(tmp.path());
        request
            .raw
            .fields
            .insert("qty".to_string(), "NaN".to_string());

        let report = pipeline.run(&request, None);
        assert_eq!(report.record.result, RunResult::Rejected);
        assert_eq!(report.record.reject_reason.as_deref(), Some("INVALID_DATA"));
        assert!(
            !request.job_dir.join("job.json").exists(),
            "reject before identity must not mint job.json"
        );
        assert!(report.record_path.expect("record path").exists());
        assert!(!request.job_dir.join(crate::ssot::LOCK_DIR_NAME).exists());
    }

    #[test]
    fn test_deadline_in_the_past_rejects() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let contract = test_contract();
        let config = PipelineConfig::default();
        let pipeline = Pipeline::new(&contract, &config);
        let mut request = base_request(tmp.path());
        request.deadline = Some(Instant::now() - std::time::Duration::from_millis(1));

        let report = pipeline.run(&request, None);
        assert_eq!(
            report.record.reject_reason.as_deref(),
            Some("DEADLINE_EXCEEDED")
        );
        assert!(!request.job_dir.join(crate::ssot::LOCK_DIR_NAME).exists());
    }
}
