//! CLI subcommands.

pub mod generate;
pub mod purge;
pub mod status;

use std::path::Path;

use anyhow::Result;
use packline_core::config::PipelineConfig;
use packline_core::contract::FieldContract;

/// Loads the contract and configuration shared by every subcommand.
pub fn load_environment(definition: &Path, config: &Path) -> Result<(FieldContract, PipelineConfig)> {
    let contract = FieldContract::load(definition).map_err(|e| anyhow::anyhow!("{e}"))?;
    let config = if config.exists() {
        PipelineConfig::load(config).map_err(|e| anyhow::anyhow!("{e}"))?
    } else {
        PipelineConfig::default()
    };
    Ok((contract, config))
}
