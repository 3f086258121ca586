//! `packline generate`: run the pipeline for one job directory.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde_json::Value;

use packline_core::deliver;
use packline_core::packet::RawPacket;
use packline_core::pipeline::{Pipeline, RunRequest};
use packline_core::runlog::RunResult;

use super::load_environment;

#[allow(clippy::too_many_arguments)]
pub fn run(
    definition: &Path,
    config_path: &Path,
    job_dir: &Path,
    packet_path: &Path,
    overrides_path: Option<&Path>,
    template_dir: &Path,
    user: &str,
    bundle: bool,
) -> Result<()> {
    let (contract, config) = load_environment(definition, config_path)?;

    let raw: RawPacket = serde_json::from_str(
        &std::fs::read_to_string(packet_path)
            .with_context(|| format!("reading packet {}", packet_path.display()))?,
    )
    .context("parsing packet JSON")?;

    let overrides: BTreeMap<String, Value> = match overrides_path {
        Some(path) => serde_json::from_str(
            &std::fs::read_to_string(path)
                .with_context(|| format!("reading overrides {}", path.display()))?,
        )
        .context("parsing overrides JSON")?,
        None => BTreeMap::new(),
    };

    let pipeline = Pipeline::new(&contract, &config);
    let report = pipeline.run(
        &RunRequest {
            job_dir: job_dir.to_path_buf(),
            raw,
            overrides,
            user: user.to_string(),
            template_dir: template_dir.to_path_buf(),
            deadline: None,
        },
        None,
    );

    match report.record.result {
        RunResult::Success => {
            println!("run {} succeeded", report.record.run_id);
            if let Some(manifest) = &report.deliverables {
                for entry in &manifest.entries {
                    println!("  {} ({} bytes)  {}", entry.name, entry.size, entry.relative_path);
                }
            }
            for warning in &report.record.warnings {
                println!("  warning {}: {}", warning.code, warning.message);
            }
            if bundle {
                let path = deliver::bundle(job_dir, &report.record.run_id)
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
                println!("  bundle  {}", path.display());
            }
            Ok(())
        }
        RunResult::Rejected => {
            let reason = report.record.reject_reason.as_deref().unwrap_or("UNKNOWN");
            eprintln!("run {} rejected: {reason}", report.record.run_id);
            if let Some(context) = &report.record.reject_context {
                eprintln!("  context: {context}");
            }
            anyhow::bail!("pipeline rejected with {reason}")
        }
    }
}
