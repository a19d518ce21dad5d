//! Match server binary entry point.
//!
//! Reads one JSON request per line from stdin and writes one JSON response per
//! line to stdout. Logs go to stderr.
//!
//! ```bash
//! echo '{"projectType":"specific","text":"robot learning"}' | match_server --db supervisors.db
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use supervisor_match::{
    config::{EncoderSpec, PipelineConfig},
    embedding::engine::EmbeddingEngine,
    server::MatchService,
    storage::{sqlite::SqliteStorage, SupervisorStorage},
};
use tokio::io::{stdin, stdout, BufReader};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Serve supervisor matching over newline-delimited JSON on stdio
#[derive(Parser, Debug)]
#[command(name = "match_server", version, about = "Serve supervisor matching over stdio")]
struct ServerArgs {
    /// Database file path
    #[arg(long, env = "SUPERVISOR_DB", value_name = "PATH", default_value = "supervisors.db")]
    db: PathBuf,

    /// Pipeline configuration used at ingestion (for encoder locations)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding one sub-directory of ONNX files per encoder
    #[arg(long, value_name = "DIR")]
    models_root: Option<PathBuf>,

    /// Logging verbosity level
    #[arg(long, default_value = "info", value_name = "LEVEL")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)))
        .init();

    if !args.db.exists() {
        anyhow::bail!(
            "Database file not found: {}\nPlease run the ingestion binary first.",
            args.db.display()
        );
    }
    let storage = SqliteStorage::open(args.db.to_string_lossy().to_string())
        .await
        .context("Failed to open storage")?;
    let stored = storage
        .get_config()
        .await
        .context("Failed to read embedding configuration")?
        .context("Database has no embedding configuration; run ingestion first")?;

    let config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => PipelineConfig::default(),
    };
    let models_root = args.models_root.clone().unwrap_or_else(|| {
        if args.config.is_none() && !config.models_root.exists() {
            dirs::cache_dir()
                .map(|cache| cache.join("supervisor-match").join("models"))
                .unwrap_or_else(|| config.models_root.clone())
        } else {
            config.models_root.clone()
        }
    });
    let spec = config
        .encoders
        .iter()
        .find(|spec| spec.kind == stored.primary_model)
        .cloned()
        .unwrap_or_else(|| EncoderSpec::for_kind(stored.primary_model, &models_root));
    let engine = EmbeddingEngine::from_specs(&[spec], stored.primary_model)
        .context("Failed to load the query encoder")?;

    let service = MatchService::from_storage(&storage, Arc::new(engine))
        .await
        .context("Failed to initialize match service")?;

    info!("Match server ready on stdio");
    let answered = service
        .serve(BufReader::new(stdin()), stdout())
        .await
        .context("stdio transport failed")?;
    info!(answered, "Input closed, shutting down");

    Ok(())
}
