//! Intake session store: `inputs/intake_session.json`.
//!
//! Append-only. Each mutation rewrites the whole canonical representation by
//! atomic replace; message originals are never edited, user corrections are
//! recorded alongside rather than over the extraction output, and a second
//! attempt to record an extraction result is `INTAKE_IMMUTABLE_VIOLATION`.
//!
//! Writers for the same session are serialised by an in-process mutex
//! registry keyed by the session path. Cross-process writers are expected to
//! route through one host process per job directory.
//!
//! # Provenance
//!
//! The session keeps, for audit, everything needed to attribute an
//! extraction: provider identity, requested vs served model, call
//! parameters, the provider request id, prompt template id + version, the
//! user variables separately from the template (so user content can be
//! redacted without losing the template identity), the rendered prompt, the
//! prompt hash, and the raw response subject to the configured
//! [`RawStorageLevel`] and size cap.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{PolicyReject, RejectCode};
use crate::fsutil::{atomic_write_json, collision_free_path, sha256_hex};
use crate::packet::{RawMeasurementRow, RawPacket, UploadDescriptor};
use crate::runlog::now_iso;

/// Session schema version.
pub const INTAKE_SCHEMA_VERSION: &str = "1.0";

/// How much raw provider payload the session retains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawStorageLevel {
    /// Neither raw response nor hash.
    None,
    /// Hash only.
    Minimal,
    /// Raw response (possibly truncated) plus hash.
    Full,
}

/// One chat message, immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakeMessage {
    pub role: String,
    pub content: String,
    pub timestamp: String,
    #[serde(default)]
    pub attachments: Vec<UploadDescriptor>,
}

/// One OCR probe result, keyed by filename in the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrRecord {
    pub success: bool,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
    pub model_requested: String,
    pub model_used: String,
    #[serde(default)]
    pub fallback_triggered: bool,
    pub processed_at: String,
    #[serde(default)]
    pub error_message: Option<String>,
}

/// LLM call parameters that affect reproducibility.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CallParams {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

/// Prompt identity, template and user content kept apart.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PromptRecord {
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub template_version: Option<String>,
    #[serde(default)]
    pub user_variables: BTreeMap<String, String>,
    #[serde(default)]
    pub rendered_prompt: Option<String>,
    #[serde(default)]
    pub prompt_hash: Option<String>,
}

/// Raw response retention, shaped by the storage level.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawResponseRecord {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub hash: Option<String>,
}

impl RawResponseRecord {
    /// Builds the retained form of a raw response under `level` and
    /// `max_raw_bytes`. The hash always covers the untruncated payload.
    #[must_use]
    pub fn retain(raw: &str, level: RawStorageLevel, max_raw_bytes: usize) -> Self {
        match level {
            RawStorageLevel::None => Self::default(),
            RawStorageLevel::Minimal => Self {
                text: None,
                truncated: false,
                hash: Some(sha256_hex(raw.as_bytes())),
            },
            RawStorageLevel::Full => {
                let truncated = raw.len() > max_raw_bytes;
                let text = if truncated {
                    let mut cut = max_raw_bytes;
                    while cut > 0 && !raw.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    raw[..cut].to_string()
                } else {
                    raw.to_string()
                };
                Self {
                    text: Some(text),
                    truncated,
                    hash: Some(sha256_hex(raw.as_bytes())),
                }
            }
        }
    }
}

/// Full provenance of one extraction call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionProvenance {
    pub provider: String,
    pub model_requested: String,
    pub model_served: String,
    #[serde(default)]
    pub params: CallParams,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(default)]
    pub prompt: PromptRecord,
    #[serde(default)]
    pub response: RawResponseRecord,
}

/// The structured output of one extraction call, plus its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub fields: BTreeMap<String, String>,
    #[serde(default)]
    pub measurements: Vec<RawMeasurementRow>,
    #[serde(default)]
    pub missing_fields: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub provenance: ExtractionProvenance,
    pub extracted_at: String,
}

/// A user correction, recorded next to (never over) the extraction output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCorrection {
    pub field: String,
    pub original: Option<String>,
    pub corrected: String,
    pub corrected_at: String,
    pub corrected_by: String,
}

/// The whole session document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeSession {
    pub schema_version: String,
    pub session_id: String,
    pub created_at: String,
    #[serde(default)]
    pub messages: Vec<IntakeMessage>,
    #[serde(default)]
    pub ocr_results: BTreeMap<String, OcrRecord>,
    #[serde(default)]
    pub extraction: Option<ExtractionRecord>,
    #[serde(default)]
    pub corrections: Vec<UserCorrection>,
    /// Operator-supplied override reasons, keyed by field or slot.
    #[serde(default)]
    pub overrides: BTreeMap<String, Value>,
}

/// Store for one job directory's intake session.
#[derive(Debug, Clone)]
pub struct IntakeStore {
    job_dir: PathBuf,
}

impl IntakeStore {
    /// Creates a store rooted at a job directory.
    #[must_use]
    pub fn new(job_dir: &Path) -> Self {
        Self {
            job_dir: job_dir.to_path_buf(),
        }
    }

    /// Path of the session document.
    #[must_use]
    pub fn session_path(&self) -> PathBuf {
        self.job_dir.join("inputs").join("intake_session.json")
    }

    fn uploads_dir(&self) -> PathBuf {
        self.job_dir.join("inputs").join("uploads")
    }

    /// Loads the session, creating it on first access.
    ///
    /// # Errors
    ///
    /// `INTAKE_SESSION_CORRUPT` when the file exists but does not parse or
    /// lacks its schema version.
    pub fn load_or_create(&self) -> Result<IntakeSession, PolicyReject> {
        let mutex = self.session_mutex();
        let _serial = mutex.lock().expect("session mutex poisoned");
        self.load_or_create_locked()
    }

    fn load_or_create_locked(&self) -> Result<IntakeSession, PolicyReject> {
        let path = self.session_path();
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                let session: IntakeSession = serde_json::from_str(&text).map_err(|e| {
                    PolicyReject::new(RejectCode::IntakeSessionCorrupt)
                        .with("path", path.display().to_string())
                        .with("error", e.to_string())
                })?;
                if session.schema_version.is_empty() {
                    return Err(PolicyReject::new(RejectCode::IntakeSessionCorrupt)
                        .with("path", path.display().to_string())
                        .with("error", "schema_version missing"));
                }
                Ok(session)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let session = IntakeSession {
                    schema_version: INTAKE_SCHEMA_VERSION.to_string(),
                    session_id: uuid::Uuid::new_v4().to_string(),
                    created_at: now_iso(),
                    messages: Vec::new(),
                    ocr_results: BTreeMap::new(),
                    extraction: None,
                    corrections: Vec::new(),
                    overrides: BTreeMap::new(),
                };
                self.persist(&session)?;
                Ok(session)
            }
            Err(e) => Err(PolicyReject::new(RejectCode::IntakeSessionCorrupt)
                .with("path", path.display().to_string())
                .with("error", e.to_string())),
        }
    }

    /// Appends a message, storing attachments under `inputs/uploads/` with
    /// collision-free names.
    ///
    /// # Errors
    ///
    /// Session corruption or attachment I/O failures.
    pub fn append_message(
        &self,
        role: &str,
        content: &str,
        attachments: &[(String, Vec<u8>)],
    ) -> Result<IntakeMessage, PolicyReject> {
        let mutex = self.session_mutex();
        let _serial = mutex.lock().expect("session mutex poisoned");
        let mut session = self.load_or_create_locked()?;

        let mut stored = Vec::with_capacity(attachments.len());
        for (filename, bytes) in attachments {
            let descriptor = self.store_upload(filename, bytes)?;
            stored.push(descriptor);
        }

        let message = IntakeMessage {
            role: role.to_string(),
            content: content.to_string(),
            timestamp: now_iso(),
            attachments: stored,
        };
        session.messages.push(message.clone());
        self.persist(&session)?;
        Ok(message)
    }

    /// Records an OCR result for a file (append-only by filename key).
    ///
    /// # Errors
    ///
    /// Session corruption or persistence failures.
    pub fn record_ocr(&self, filename: &str, record: OcrRecord) -> Result<(), PolicyReject> {
        let mutex = self.session_mutex();
        let _serial = mutex.lock().expect("session mutex poisoned");
        let mut session = self.load_or_create_locked()?;
        session.ocr_results.insert(filename.to_string(), record);
        self.persist(&session)
    }

    /// Records the extraction result. Exactly once per session.
    ///
    /// # Errors
    ///
    /// `INTAKE_IMMUTABLE_VIOLATION` when a result is already recorded.
    pub fn record_extraction(&self, record: ExtractionRecord) -> Result<(), PolicyReject> {
        let mutex = self.session_mutex();
        let _serial = mutex.lock().expect("session mutex poisoned");
        let mut session = self.load_or_create_locked()?;
        if session.extraction.is_some() {
            return Err(PolicyReject::new(RejectCode::IntakeImmutableViolation)
                .with("session_id", session.session_id)
                .with("error", "extraction result already recorded"));
        }
        session.extraction = Some(record);
        self.persist(&session)
    }

    /// Records a user correction next to the extraction output.
    ///
    /// # Errors
    ///
    /// Session corruption or persistence failures.
    pub fn record_correction(
        &self,
        field: &str,
        original: Option<String>,
        corrected: &str,
        user: &str,
    ) -> Result<(), PolicyReject> {
        let mutex = self.session_mutex();
        let _serial = mutex.lock().expect("session mutex poisoned");
        let mut session = self.load_or_create_locked()?;
        session.corrections.push(UserCorrection {
            field: field.to_string(),
            original,
            corrected: corrected.to_string(),
            corrected_at: now_iso(),
            corrected_by: user.to_string(),
        });
        self.persist(&session)
    }

    /// Stores an operator override reason for a field or slot.
    ///
    /// # Errors
    ///
    /// Session corruption or persistence failures.
    pub fn set_override(&self, field_or_slot: &str, reason: Value) -> Result<(), PolicyReject> {
        let mutex = self.session_mutex();
        let _serial = mutex.lock().expect("session mutex poisoned");
        let mut session = self.load_or_create_locked()?;
        session.overrides.insert(field_or_slot.to_string(), reason);
        self.persist(&session)
    }

    /// Final field values: extraction output with corrections applied, last
    /// correction per field winning.
    ///
    /// # Errors
    ///
    /// Session corruption.
    pub fn final_fields(&self) -> Result<BTreeMap<String, String>, PolicyReject> {
        let session = self.load_or_create()?;
        let mut fields = session
            .extraction
            .as_ref()
            .map(|e| e.fields.clone())
            .unwrap_or_default();
        for correction in &session.corrections {
            fields.insert(correction.field.clone(), correction.corrected.clone());
        }
        Ok(fields)
    }

    /// Builds the raw packet the pipeline consumes from this session.
    ///
    /// # Errors
    ///
    /// Session corruption.
    pub fn raw_packet(&self) -> Result<RawPacket, PolicyReject> {
        let session = self.load_or_create()?;
        let fields = self.final_fields()?;
        let measurements = session
            .extraction
            .as_ref()
            .map(|e| e.measurements.clone())
            .unwrap_or_default();
        let uploads = session
            .messages
            .iter()
            .flat_map(|m| m.attachments.iter().cloned())
            .collect();
        Ok(RawPacket {
            fields,
            measurements,
            uploads,
        })
    }

    fn store_upload(&self, filename: &str, bytes: &[u8]) -> Result<UploadDescriptor, PolicyReject> {
        let uploads = self.uploads_dir();
        std::fs::create_dir_all(&uploads).map_err(|e| self.io_reject(&uploads, &e))?;
        let target = collision_free_path(&uploads, filename);
        std::fs::write(&target, bytes).map_err(|e| self.io_reject(&target, &e))?;
        let relative = target
            .strip_prefix(&self.job_dir)
            .unwrap_or(&target)
            .to_string_lossy()
            .into_owned();
        Ok(UploadDescriptor {
            filename: filename.to_string(),
            size: bytes.len() as u64,
            path: relative,
        })
    }

    fn persist(&self, session: &IntakeSession) -> Result<(), PolicyReject> {
        let path = self.session_path();
        atomic_write_json(&path, session).map_err(|e| self.io_reject(&path, &e))
    }

    fn io_reject(&self, path: &Path, error: &std::io::Error) -> PolicyReject {
        PolicyReject::new(RejectCode::IntakeSessionCorrupt)
            .with("path", path.display().to_string())
            .with("error", error.to_string())
    }

    /// Per-session write mutex, from a process-wide registry keyed by the
    /// session path.
    fn session_mutex(&self) -> Arc<Mutex<()>> {
        static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
        let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));
        let mut map = registry.lock().expect("session registry poisoned");
        map.entry(self.session_path()).or_default().clone()
    }
}
