//! HTTP boundary tests: status mapping and the upload->generate->download
//! flow.

use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use tower::util::ServiceExt;

use packline_core::config::PipelineConfig;
use packline_core::contract::FieldContract;
use packline_server::{router, AppState};

const CONTRACT_YAML: &str = r#"
version: "api-1"
fields:
  wo_no:
    type: token
    importance: critical
    override_allowed: false
  line:
    type: token
    importance: critical
    override_allowed: false
  result:
    type: token
    importance: critical
photos:
  allowed_extensions: [".jpg"]
  prefer_order: [".jpg"]
  slots:
    - key: overview
      basename: 01_overview
      required: true
      override_allowed: false
"#;

fn write_templates(dir: &Path) {
    std::fs::create_dir_all(dir).expect("template dir");
    std::fs::write(dir.join("report.md"), "{{ wo_no }} {{ photo_overview }}\n")
        .expect("report template");
    std::fs::write(dir.join("workbook.csv"), "WO,\n").expect("workbook template");
    std::fs::write(
        dir.join("manifest.yaml"),
        "workbook:\n  named_ranges:\n    wo_no: B1\n",
    )
    .expect("manifest");
}

fn state(root: &Path) -> AppState {
    let template_dir = root.join("templates/base");
    write_templates(&template_dir);
    AppState {
        contract: Arc::new(FieldContract::parse(CONTRACT_YAML).expect("contract")),
        config: Arc::new(PipelineConfig::default()),
        jobs_root: root.join("jobs"),
        template_dir,
        extractor: None,
        ocr: None,
    }
}

async fn send(app: axum::Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = app.oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, value)
}

#[tokio::test]
async fn test_upload_then_generate_then_download() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let state = state(tmp.path());
    let app = router(state);

    let (status, body) = send(
        app.clone(),
        Request::builder()
            .method("PUT")
            .uri("/api/jobs/wo-001/uploads/01_overview.jpg")
            .body(Body::from("jpeg-bytes"))
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["inferred_slot"], "overview");

    let (status, _) = send(
        app.clone(),
        Request::builder()
            .method("POST")
            .uri("/api/jobs/wo-001/fields")
            .header("content-type", "application/json")
            .body(Body::from(
                r#"{"fields": {"wo_no": "WO-001", "line": "L1", "result": "PASS"}}"#,
            ))
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        app.clone(),
        Request::builder()
            .method("POST")
            .uri("/api/jobs/wo-001/generate")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "generate failed: {body}");
    assert_eq!(body["result"], "success");

    let (status, body) = send(
        app.clone(),
        Request::builder()
            .uri("/api/jobs/wo-001/deliverables")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["entries"].as_array().expect("entries").len() >= 2);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/jobs/wo-001/deliverables/report.md")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_validation_reject_maps_to_422() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let app = router(state(tmp.path()));

    // No fields submitted and no photo uploaded: first failure is the
    // missing critical field.
    let (status, body) = send(
        app,
        Request::builder()
            .method("POST")
            .uri("/api/jobs/wo-002/generate")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["reject_reason"], "MISSING_CRITICAL_FIELD");
}

#[tokio::test]
async fn test_job_name_traversal_rejected() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let app = router(state(tmp.path()));
    let (status, _) = send(
        app,
        Request::builder()
            .uri("/api/jobs/..%2F..%2Fetc/status")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_extract_without_provider_is_500() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let app = router(state(tmp.path()));
    let (status, body) = send(
        app,
        Request::builder()
            .method("POST")
            .uri("/api/jobs/wo-003/extract")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "EXTRACTION_FAILED");
}
