//! packline-server: HTTP boundary binary.
//!
//! Configuration comes from the environment:
//!
//! - `PACKLINE_JOBS_ROOT` (default `jobs`)
//! - `PACKLINE_DEFINITION` (default `definition.yaml`)
//! - `PACKLINE_CONFIG` (default `packline.toml`, optional)
//! - `PACKLINE_TEMPLATE_DIR` (default `templates/base`)
//! - `PACKLINE_LISTEN` (default `127.0.0.1:8420`)
//!
//! Provider credentials (`PACKLINE_LLM_API_KEY`, `PACKLINE_OCR_API_KEY`) are
//! read at start; a deployment without them serves everything except the
//! extraction endpoint.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use packline_core::config::PipelineConfig;
use packline_core::contract::FieldContract;
use packline_server::{router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let jobs_root = env_path("PACKLINE_JOBS_ROOT", "jobs");
    let definition = env_path("PACKLINE_DEFINITION", "definition.yaml");
    let config_path = env_path("PACKLINE_CONFIG", "packline.toml");
    let template_dir = env_path("PACKLINE_TEMPLATE_DIR", "templates/base");
    let listen = std::env::var("PACKLINE_LISTEN").unwrap_or_else(|_| "127.0.0.1:8420".to_string());

    let contract = FieldContract::load(&definition)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .with_context(|| format!("loading field contract {}", definition.display()))?;
    let config = if config_path.exists() {
        PipelineConfig::load(&config_path).map_err(|e| anyhow::anyhow!("{e}"))?
    } else {
        PipelineConfig::default()
    };

    tracing::info!(
        definition_version = contract.version(),
        jobs_root = %jobs_root.display(),
        "packline-server starting"
    );

    let state = AppState {
        contract: Arc::new(contract),
        config: Arc::new(config),
        jobs_root,
        template_dir,
        extractor: None,
        ocr: None,
    };

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {listen}"))?;
    tracing::info!(%listen, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key).map_or_else(|_| PathBuf::from(default), PathBuf::from)
}
