//! `packline status`: slot mapping state and the latest run record.

use std::path::Path;

use anyhow::Result;

use packline_core::contract::FieldContract;
use packline_core::photos::slot_status;
use packline_core::runlog::{list_run_records, RunRecord};
use packline_core::ssot::load_identity;

pub fn run(definition: &Path, job_dir: &Path) -> Result<()> {
    let contract = FieldContract::load(definition).map_err(|e| anyhow::anyhow!("{e}"))?;

    match load_identity(job_dir).map_err(|e| anyhow::anyhow!("{e}"))? {
        Some(identity) => println!(
            "job {}  (wo_no={}, line={}, created {})",
            identity.job_id, identity.wo_no, identity.line, identity.created_at
        ),
        None => println!("no job.json yet"),
    }

    println!("slots:");
    for slot in slot_status(&contract, job_dir) {
        let state = match (slot.has_derived, slot.has_raw) {
            (true, _) => "published",
            (false, true) => "raw only",
            (false, false) if slot.required => "MISSING (required)",
            (false, false) => "empty",
        };
        println!(
            "  {:<16} {:<18} required={} override_allowed={}",
            slot.slot_key, state, slot.required, slot.override_allowed
        );
    }

    let logs = list_run_records(&job_dir.join("logs"));
    if let Some(latest) = logs.first() {
        let record: RunRecord = serde_json::from_str(&std::fs::read_to_string(latest)?)?;
        println!(
            "latest run {}: {:?} ({} warnings, {} overrides)",
            record.run_id,
            record.result,
            record.warnings.len(),
            record.overrides.len()
        );
        if let Some(reason) = record.reject_reason {
            println!("  reject: {reason}");
        }
    } else {
        println!("no runs recorded");
    }
    Ok(())
}
