//! packline: operator CLI for the inspection pipeline.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

mod commands;

/// packline: inspection report pipeline
#[derive(Parser, Debug)]
#[command(name = "packline")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the field contract file
    #[arg(long, default_value = "definition.yaml")]
    definition: PathBuf,

    /// Path to the pipeline configuration file (optional)
    #[arg(long, default_value = "packline.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline for one job directory
    Generate {
        /// Job directory (created if absent)
        job_dir: PathBuf,

        /// JSON file holding the raw packet (fields, measurements)
        #[arg(long)]
        packet: PathBuf,

        /// JSON file holding override reasons keyed by field or slot
        #[arg(long)]
        overrides: Option<PathBuf>,

        /// Template directory
        #[arg(long, default_value = "templates/base")]
        template_dir: PathBuf,

        /// Acting user recorded on override applications
        #[arg(long, default_value = "operator")]
        user: String,

        /// Also build the deliverables bundle
        #[arg(long)]
        bundle: bool,
    },

    /// Purge `_trash/` archives per the retention policy
    PurgeTrash {
        /// Jobs root directory
        #[arg(long, default_value = "jobs")]
        jobs_root: PathBuf,

        /// Only this job directory name
        #[arg(long)]
        job: Option<String>,

        /// Actually delete/compress (default: dry run)
        #[arg(long)]
        execute: bool,
    },

    /// Show slot mapping status and the latest run for a job directory
    Status {
        /// Job directory
        job_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match cli.command {
        Commands::Generate {
            job_dir,
            packet,
            overrides,
            template_dir,
            user,
            bundle,
        } => commands::generate::run(
            &cli.definition,
            &cli.config,
            &job_dir,
            &packet,
            overrides.as_deref(),
            &template_dir,
            &user,
            bundle,
        ),
        Commands::PurgeTrash {
            jobs_root,
            job,
            execute,
        } => commands::purge::run(&cli.definition, &jobs_root, job.as_deref(), execute),
        Commands::Status { job_dir } => commands::status::run(&cli.definition, &job_dir),
    }
}
