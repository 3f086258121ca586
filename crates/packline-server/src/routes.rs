//! Route handlers.

use std::collections::BTreeMap;

use axum::body::Bytes;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use packline_core::deliver;
use packline_core::errors::PolicyReject;
use packline_core::intake::IntakeStore;
use packline_core::photos;
use packline_core::pipeline::{Pipeline, RunRequest};
use packline_core::providers::ExtractionRequest;
use packline_core::runlog::RunResult;

use crate::state::AppState;

/// Builds the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/jobs/:job/fields", post(submit_fields))
        .route("/api/jobs/:job/uploads/:filename", put(upload_photo))
        .route("/api/jobs/:job/extract", post(run_extraction))
        .route("/api/jobs/:job/generate", post(generate))
        .route("/api/jobs/:job/status", get(job_status))
        .route("/api/jobs/:job/deliverables", get(list_deliverables))
        .route(
            "/api/jobs/:job/deliverables/:name",
            get(download_deliverable),
        )
        .with_state(state)
}

/// A reject rendered at the boundary: status from the taxonomy, body with
/// code and context.
struct ApiReject(PolicyReject);

impl IntoResponse for ApiReject {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.code.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "code": self.0.code.as_str(),
            "context": self.0.context_value(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<PolicyReject> for ApiReject {
    fn from(reject: PolicyReject) -> Self {
        Self(reject)
    }
}

#[derive(Debug, Deserialize)]
struct SubmitFieldsBody {
    fields: BTreeMap<String, String>,
    #[serde(default)]
    overrides: BTreeMap<String, Value>,
    #[serde(default = "default_user")]
    user: String,
}

fn default_user() -> String {
    "operator".to_string()
}

#[derive(Debug, Serialize)]
struct SubmitFieldsResponse {
    final_fields: BTreeMap<String, String>,
}

/// Submits (corrected) field values and override reasons for a session.
async fn submit_fields(
    State(state): State<AppState>,
    UrlPath(job): UrlPath<String>,
    Json(body): Json<SubmitFieldsBody>,
) -> Result<Json<SubmitFieldsResponse>, ApiReject> {
    let job_dir = state.job_dir(&job)?;
    let store = IntakeStore::new(&job_dir);
    let previous = store.final_fields()?;
    for (field, value) in &body.fields {
        store.record_correction(field, previous.get(field).cloned(), value, &body.user)?;
    }
    for (key, reason) in body.overrides {
        store.set_override(&key, reason)?;
    }
    Ok(Json(SubmitFieldsResponse {
        final_fields: store.final_fields()?,
    }))
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    stored_path: String,
    inferred_slot: Option<String>,
}

/// Stores an upload under `photos/raw/` and reports the inferred slot.
async fn upload_photo(
    State(state): State<AppState>,
    UrlPath((job, filename)): UrlPath<(String, String)>,
    body: Bytes,
) -> Result<Json<UploadResponse>, ApiReject> {
    let job_dir = state.job_dir(&job)?;
    if filename.contains(['/', '\\']) {
        return Err(PolicyReject::new(packline_core::RejectCode::ContractInvalid)
            .with("filename", filename)
            .with("error", "filenames are plain names")
            .into());
    }
    let stored = photos::save_upload(&job_dir, &filename, &body)?;

    let store = IntakeStore::new(&job_dir);
    store.append_message(
        "user",
        &format!("uploaded {filename}"),
        &[(filename.clone(), body.to_vec())],
    )?;

    // Report the slot whose current selection is this very file, if any.
    let raw_dir = job_dir.join("photos").join("raw");
    let mut scratch =
        packline_core::runlog::RunRecordBuilder::new("infer".to_string(), String::new());
    let selections =
        photos::match_slots(&state.contract, &raw_dir, &BTreeMap::new(), &mut scratch);
    let inferred_slot = selections
        .into_iter()
        .find(|(_, selection)| selection.path == stored)
        .map(|(slot_key, _)| slot_key);

    Ok(Json(UploadResponse {
        stored_path: stored.display().to_string(),
        inferred_slot,
    }))
}

/// Runs field extraction through the configured provider and records the
/// result in the session (write-once).
async fn run_extraction(
    State(state): State<AppState>,
    UrlPath(job): UrlPath<String>,
) -> Result<Json<Value>, ApiReject> {
    let job_dir = state.job_dir(&job)?;
    let Some(extractor) = state.extractor.clone() else {
        return Err(PolicyReject::new(packline_core::RejectCode::ExtractionFailed)
            .with("error", "no extraction provider configured")
            .into());
    };

    let store = IntakeStore::new(&job_dir);
    let session = store.load_or_create()?;
    let conversation = session
        .messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");

    let contract = state.contract.clone();
    let config = state.config.clone();
    let record = tokio::task::spawn_blocking(move || {
        let request = ExtractionRequest {
            conversation,
            user_variables: BTreeMap::new(),
            contract: &contract,
            storage_level: config.raw_storage_level,
            max_raw_bytes: config.max_raw_bytes,
        };
        extractor.extract(&request)
    })
    .await
    .map_err(|e| {
        PolicyReject::new(packline_core::RejectCode::ExtractionFailed)
            .with("error", e.to_string())
    })?
    .map_err(|e| {
        PolicyReject::new(packline_core::RejectCode::ExtractionFailed)
            .with("error", e.to_string())
    })?;

    store.record_extraction(record.clone())?;
    Ok(Json(serde_json::json!({
        "fields": record.fields,
        "missing_fields": record.missing_fields,
        "warnings": record.warnings,
    })))
}

#[derive(Debug, Deserialize)]
struct GenerateBody {
    #[serde(default)]
    overrides: BTreeMap<String, Value>,
    #[serde(default = "default_user")]
    user: String,
}

impl Default for GenerateBody {
    fn default() -> Self {
        Self {
            overrides: BTreeMap::new(),
            user: default_user(),
        }
    }
}

/// Runs the pipeline for a job and returns the run record plus the
/// deliverable manifest.
async fn generate(
    State(state): State<AppState>,
    UrlPath(job): UrlPath<String>,
    body: Option<Json<GenerateBody>>,
) -> Result<Response, ApiReject> {
    let Json(body) = body.unwrap_or_default();
    let job_dir = state.job_dir(&job)?;

    let store = IntakeStore::new(&job_dir);
    let session = store.load_or_create()?;
    let raw = store.raw_packet()?;
    let mut overrides = session.overrides.clone();
    overrides.extend(body.overrides);

    let contract = state.contract.clone();
    let config = state.config.clone();
    let template_dir = state.template_dir.clone();
    let ocr = state.ocr.clone();
    let user = body.user;

    let report = tokio::task::spawn_blocking(move || {
        let pipeline = Pipeline::new(&contract, &config);
        let request = RunRequest {
            job_dir,
            raw,
            overrides,
            user,
            template_dir,
            deadline: None,
        };
        let ocr_ref = ocr
            .as_deref()
            .map(|o| o as &dyn packline_core::providers::RunOcr);
        pipeline.run(&request, ocr_ref)
    })
    .await
    .map_err(|e| {
        PolicyReject::new(packline_core::RejectCode::RenderFailed).with("error", e.to_string())
    })?;

    if report.record.result == RunResult::Rejected {
        let code = report
            .record
            .reject_reason
            .as_deref()
            .unwrap_or("RENDER_FAILED");
        let status = StatusCode::from_u16(reject_status(code))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "result": "rejected",
            "reject_reason": code,
            "reject_context": report.record.reject_context,
            "run_id": report.record.run_id,
        });
        return Ok((status, Json(body)).into_response());
    }

    Ok(Json(serde_json::json!({
        "result": "success",
        "run_id": report.record.run_id,
        "job_id": report.record.job_id,
        "packet_hash": report.record.packet_hash,
        "warnings": report.record.warnings,
        "deliverables": report.deliverables,
    }))
    .into_response())
}

/// Status: slot mapping state for the job.
async fn job_status(
    State(state): State<AppState>,
    UrlPath(job): UrlPath<String>,
) -> Result<Json<Value>, ApiReject> {
    let job_dir = state.job_dir(&job)?;
    let slots = photos::slot_status(&state.contract, &job_dir);
    Ok(Json(serde_json::json!({
        "job": job,
        "slots": slots,
        "has_job_json": job_dir.join("job.json").exists(),
    })))
}

/// Lists the current deliverables manifest.
async fn list_deliverables(
    State(state): State<AppState>,
    UrlPath(job): UrlPath<String>,
) -> Result<Response, ApiReject> {
    let job_dir = state.job_dir(&job)?;
    match deliver::load_manifest(&job_dir)? {
        Some(manifest) => Ok(Json(manifest).into_response()),
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

/// Downloads one deliverable by manifest name.
async fn download_deliverable(
    State(state): State<AppState>,
    UrlPath((job, name)): UrlPath<(String, String)>,
) -> Result<Response, ApiReject> {
    let job_dir = state.job_dir(&job)?;
    let path = state.deliverable_path(&job_dir, &name)?;
    match std::fs::read(&path) {
        Ok(bytes) => {
            let content_type = match path.extension().and_then(|e| e.to_str()) {
                Some("md") => "text/markdown; charset=utf-8",
                Some("csv") => "text/csv; charset=utf-8",
                Some("json") => "application/json",
                Some("jpg" | "jpeg") => "image/jpeg",
                Some("png") => "image/png",
                Some("gz") => "application/gzip",
                _ => "application/octet-stream",
            };
            Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Ok(StatusCode::NOT_FOUND.into_response())
        }
        Err(e) => Err(PolicyReject::new(packline_core::RejectCode::RenderFailed)
            .with("path", path.display().to_string())
            .with("error", e.to_string())
            .into()),
    }
}

fn reject_status(code: &str) -> u16 {
    use packline_core::RejectCode;
    // Round-trip through the taxonomy where possible.
    serde_json::from_value::<RejectCode>(serde_json::Value::String(code.to_string()))
        .map_or(500, |c| c.http_status())
}
