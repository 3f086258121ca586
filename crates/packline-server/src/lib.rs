//! HTTP boundary for the packline pipeline.
//!
//! A thin, synchronous request/response surface over the core: submit
//! fields, upload photos (stored under `raw/` with slot inference), run
//! field extraction, generate deliverables, list and download them. The
//! transport shape is not normative; the reject-code -> HTTP status mapping
//! is, and lives in `packline_core::errors::RejectCode::http_status` (409
//! for lock and identity conflicts, 422 for validation-class rejects).
//!
//! Provider adapters are injected; a deployment without a configured
//! extractor serves everything except `/extract`.

pub mod routes;
pub mod state;

pub use routes::router;
pub use state::AppState;
