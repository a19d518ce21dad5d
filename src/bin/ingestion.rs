//! Ingestion pipeline binary entry point.
//!
//! Pulls researchers and research outputs from the institutional registry (or a
//! previously saved snapshot file), builds every representation variant, discovers
//! topics and writes the serving snapshot.
//!
//! # Examples
//!
//! Initialize a new database from the live registry:
//! ```bash
//! PURE_BASE_URL=https://pure.example.org/ws/api PURE_API_KEY=... \
//!   ingestion --mode init-new --db supervisors.db
//! ```
//!
//! Rebuild from a saved registry snapshot:
//! ```bash
//! ingestion --snapshot registry.json --config pipeline.toml
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use supervisor_match::{
    config::PipelineConfig,
    embedding::engine::EmbeddingEngine,
    ingestion::IngestionPipeline,
    labeling::{openai::OpenAiLabeler, LabelGenerator, OfflineLabeler},
    provider::{
        json::{JsonFileSource, RegistrySnapshot},
        pure::PureClient,
        RegistrySource,
    },
    storage::{sqlite::SqliteStorage, SupervisorStorage},
};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Operation mode for the ingestion pipeline
#[derive(Debug, Clone, ValueEnum)]
enum Mode {
    /// Connect to an existing database and validate its embedding config (default)
    Connect,
    /// Initialize a new database with a fresh schema
    InitNew,
}

/// Ingestion pipeline CLI for building the supervisor snapshot
#[derive(Parser, Debug)]
#[command(
    name = "ingestion",
    version,
    about = "Build the supervisor matching snapshot",
    long_about = "Acquire eligible supervisors and their research outputs, embed them with every \
                  configured representation variant, discover research topics and persist the result.

EXAMPLES:
  Initialize a new database from the registry:
    PURE_BASE_URL=... PURE_API_KEY=... ingestion --mode init-new

  Rebuild from a saved registry snapshot with a custom configuration:
    ingestion --snapshot registry.json --config pipeline.toml

  Capture the registry for later offline runs:
    ingestion --mode init-new --save-snapshot registry.json"
)]
struct IngestionArgs {
    /// Database file path
    #[arg(long, value_name = "PATH", default_value = "supervisors.db")]
    db: String,

    /// Operation mode: connect to existing DB or initialize new DB
    #[arg(long, value_enum, default_value = "connect")]
    mode: Mode,

    /// Pipeline configuration (TOML); defaults apply when omitted
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Read registry records from a JSON snapshot instead of the live API
    #[arg(long, value_name = "FILE", conflicts_with = "save_snapshot")]
    snapshot: Option<PathBuf>,

    /// Write the fetched registry records to a JSON snapshot before processing
    #[arg(long, value_name = "FILE")]
    save_snapshot: Option<PathBuf>,

    /// Registry API base URL
    #[arg(long, env = "PURE_BASE_URL", value_name = "URL")]
    registry_url: Option<String>,

    /// Registry API key
    #[arg(long, env = "PURE_API_KEY", value_name = "KEY", hide_env_values = true)]
    registry_key: Option<String>,

    /// API key for topic label generation; labels fall back to keywords without it
    #[arg(long, env = "OPENAI_API_KEY", value_name = "KEY", hide_env_values = true)]
    openai_key: Option<String>,

    /// Base URL of the chat-completions API
    #[arg(long, env = "OPENAI_BASE_URL", value_name = "URL")]
    openai_base_url: Option<String>,

    /// Label generation model
    #[arg(long, value_name = "MODEL")]
    label_model: Option<String>,

    /// Directory holding one sub-directory of ONNX files per encoder
    #[arg(long, value_name = "DIR")]
    models_root: Option<PathBuf>,

    /// Researchers per upsert batch (overrides the configuration)
    #[arg(long, value_name = "N")]
    batch_size: Option<usize>,

    /// Logging verbosity level
    #[arg(long, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging subsystem with the specified level
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    Ok(())
}

/// Load the pipeline configuration and apply command-line overrides
fn load_config(args: &IngestionArgs) -> Result<PipelineConfig> {
    let mut config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => PipelineConfig::default(),
    };

    if let Some(root) = &args.models_root {
        config.models_root = root.clone();
    } else if args.config.is_none() && !config.models_root.exists() {
        if let Some(cache) = dirs::cache_dir() {
            config.models_root = cache.join("supervisor-match").join("models");
            debug!("Using cached models directory: {:?}", config.models_root);
        }
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    config.validate().context("Invalid pipeline configuration")?;
    Ok(config)
}

/// Load every encoder the configured variants need
fn create_engine(config: &PipelineConfig) -> Result<Arc<EmbeddingEngine>> {
    let specs = config.encoder_specs().context("Invalid encoder configuration")?;
    for spec in &specs {
        info!("Loading {} encoder from {:?}", spec.kind, spec.model_dir);
    }
    let engine = EmbeddingEngine::from_specs(&specs, config.primary_model)
        .context("Failed to load encoders")?;
    info!(
        models = ?engine.models().collect::<Vec<_>>(),
        primary = %engine.primary(),
        "Encoders loaded"
    );
    Ok(Arc::new(engine))
}

/// Choose the topic label generator
fn create_labeler(args: &IngestionArgs) -> Result<Box<dyn LabelGenerator>> {
    match args.openai_key.as_deref().filter(|k| !k.trim().is_empty()) {
        Some(key) => {
            let base_url = args
                .openai_base_url
                .as_deref()
                .unwrap_or(supervisor_match::labeling::openai::DEFAULT_BASE_URL);
            let labeler = OpenAiLabeler::new(base_url, key, args.label_model.clone())
                .context("Failed to create label generator")?;
            info!("Topic labels generated via {}", labeler.name());
            Ok(Box::new(labeler))
        }
        None => {
            warn!("OPENAI_API_KEY not set; topics are labeled from their keywords only");
            Ok(Box::new(OfflineLabeler))
        }
    }
}

/// Choose the registry source
async fn create_source(args: &IngestionArgs) -> Result<Box<dyn RegistrySource>> {
    if let Some(path) = &args.snapshot {
        if !path.exists() {
            anyhow::bail!("Snapshot file not found: {:?}", path);
        }
        info!("Reading registry snapshot {:?}", path);
        return Ok(Box::new(JsonFileSource::new(path.clone())));
    }

    let base_url = args
        .registry_url
        .as_deref()
        .context("Registry URL required: set PURE_BASE_URL or pass --registry-url (or use --snapshot)")?;
    let api_key = args
        .registry_key
        .as_deref()
        .context("Registry API key required: set PURE_API_KEY or pass --registry-key")?;
    let client = PureClient::new(base_url, api_key).context("Failed to create registry client")?;

    match &args.save_snapshot {
        Some(path) => {
            info!("Capturing registry into {:?}", path);
            let snapshot = RegistrySnapshot::capture(&client)
                .await
                .context("Failed to fetch registry records")?;
            snapshot
                .save(path)
                .await
                .with_context(|| format!("Failed to write snapshot {:?}", path))?;
            Ok(Box::new(JsonFileSource::new(path.clone())))
        }
        None => Ok(Box::new(client)),
    }
}

/// Create storage instance
fn create_storage(db_path: &str) -> Result<SqliteStorage> {
    debug!("Creating SQLite storage at: {}", db_path);

    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory: {:?}", parent))?;
            info!("Created database directory: {:?}", parent);
        }
    }

    Ok(SqliteStorage::new(db_path.to_string()))
}

/// Create a progress bar for representation building
fn create_progress_bar() -> ProgressBar {
    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} researchers")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("##-"),
    );
    pb
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = IngestionArgs::parse();

    init_logging(&args.log_level).context("Failed to initialize logging")?;

    info!("Starting supervisor ingestion pipeline");
    debug!("CLI arguments: {:?}", args);

    let start_time = Instant::now();

    let config = load_config(&args)?;
    let engine = create_engine(&config)?;
    let labeler = create_labeler(&args)?;
    info!("Database path: {}", args.db);

    let pipeline = match args.mode {
        Mode::Connect => {
            info!("Connecting to existing database with config validation");
            if !Path::new(&args.db).exists() {
                anyhow::bail!(
                    "Database file not found: {}\nUse --mode init-new to create a new database.",
                    args.db
                );
            }
            let storage = SqliteStorage::open(args.db.clone())
                .await
                .context("Failed to open database")?;
            IngestionPipeline::connect(engine, storage, labeler, config)
                .await
                .context("Failed to connect to existing database. Use --mode init-new to create a new database.")?
        }
        Mode::InitNew => {
            info!("Initializing new database");
            let storage = create_storage(&args.db)?;
            IngestionPipeline::initialize_new(engine, storage, labeler, config)
                .await
                .context("Failed to initialize new database")?
        }
    };

    let progress = create_progress_bar();
    let bar = progress.clone();
    let mut pipeline = pipeline.with_progress(Box::new(move |done, total| {
        bar.set_length(total as u64);
        bar.set_position(done as u64);
    }));

    let source = create_source(&args).await?;
    info!("Acquiring from {}", source.name());

    let stats = pipeline
        .run(source.as_ref())
        .await
        .context("Ingestion failed")?;
    progress.finish_and_clear();

    let stored = pipeline
        .storage()
        .count_researchers()
        .await
        .context("Failed to count stored supervisors")?;

    let elapsed = start_time.elapsed();
    println!("\n╔════════════════════════════════════════╗");
    println!("║      Ingestion Completed               ║");
    println!("╠════════════════════════════════════════╣");
    println!("║ Supervisors acquired: {:>16} ║", stats.acquired);
    println!("║ Persisted:            {:>16} ║", stats.persisted);
    println!("║ Failed batches:       {:>16} ║", stats.failed_batches);
    println!("║ Topics:               {:>16} ║", stats.topics);
    println!("║ Topic associations:   {:>16} ║", stats.supervisor_topics);
    println!("║ Dropped associations: {:>16} ║", stats.dropped_rows);
    println!("║ Truncated inputs:     {:>16} ║", stats.truncated_inputs);
    println!("║ Supervisors stored:   {:>16} ║", stored);
    println!("║ Elapsed time:         {:>13.2?} ║", elapsed);
    println!("╚════════════════════════════════════════╝");

    if stats.failed_batches > 0 {
        warn!(
            "{} batches failed to persist - check logs for details",
            stats.failed_batches
        );
    }

    info!("Ingestion pipeline completed successfully");

    Ok(())
}
