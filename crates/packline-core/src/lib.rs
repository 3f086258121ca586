//! # packline-core
//!
//! Ingest-to-delivery pipeline for manufacturing inspection jobs: free-form
//! inputs (spreadsheet cells, chat, uploaded photos) become deterministic
//! customer-facing artefacts (a report document and a measurement workbook).
//!
//! The core guarantees:
//!
//! - a single immutable identity per job directory, protected against
//!   concurrent writers ([`ssot`]);
//! - content-addressed fingerprints over each run's normalized input
//!   ([`fingerprint`]);
//! - slot-based photo curation with auditable archival ([`photos`]);
//! - fail-fast validation with a rate-limited, quality-gated override escape
//!   hatch ([`validate`], [`overrides`]);
//! - at-most-one concurrent render per job with atomic artefact publication
//!   ([`render`], [`deliver`]);
//! - one structured run record per attempt, rejects included ([`runlog`]).
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::path::{Path, PathBuf};
//!
//! use packline_core::config::PipelineConfig;
//! use packline_core::contract::FieldContract;
//! use packline_core::packet::RawPacket;
//! use packline_core::pipeline::{Pipeline, RunRequest};
//!
//! let contract = FieldContract::load(Path::new("definition.yaml")).unwrap();
//! let config = PipelineConfig::default();
//! let pipeline = Pipeline::new(&contract, &config);
//!
//! let mut raw = RawPacket::default();
//! raw.fields.insert("wo_no".into(), "WO-001".into());
//! raw.fields.insert("line".into(), "L1".into());
//!
//! let report = pipeline.run(
//!     &RunRequest {
//!         job_dir: PathBuf::from("jobs/wo-001-l1"),
//!         raw,
//!         overrides: BTreeMap::new(),
//!         user: "operator".into(),
//!         template_dir: PathBuf::from("templates/base"),
//!         deadline: None,
//!     },
//!     None,
//! );
//! println!("{:?}", report.record.result);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod contract;
pub mod deliver;
pub mod errors;
pub mod fingerprint;
pub mod fsutil;
pub mod ids;
pub mod intake;
pub mod normalize;
pub mod overrides;
pub mod packet;
pub mod photos;
pub mod pipeline;
pub mod providers;
pub mod render;
pub mod runlog;
pub mod ssot;
pub mod validate;

pub use config::PipelineConfig;
pub use contract::FieldContract;
pub use errors::{PolicyReject, RejectCode};
pub use packet::{NormalizedPacket, RawPacket};
pub use pipeline::{Pipeline, RunReport, RunRequest};
pub use runlog::{RunRecord, RunResult};
