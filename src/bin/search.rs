//! Search binary entry point.
//!
//! Command-line interface over a built supervisor snapshot. Supports free-text
//! (specific) and topic-based (general) matching, a topic listing, and an
//! interactive REPL, with table or JSON output.
//!
//! # Examples
//!
//! Specific project:
//! ```bash
//! search --db supervisors.db --query "graph neural networks for molecules"
//! ```
//!
//! General project over two catalog topics:
//! ```bash
//! search --db supervisors.db --topics 3,7 --format json
//! ```
//!
//! Interactive mode:
//! ```bash
//! search --db supervisors.db --interactive
//! ```

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, ContentArrangement, Table};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use supervisor_match::{
    config::{EncoderSpec, PipelineConfig},
    embedding::engine::EmbeddingEngine,
    models::Topic,
    query::{BruteForceMatcher, Snapshot, Suggestion, SupervisorMatcher},
    storage::{sqlite::SqliteStorage, SupervisorStorage},
};
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Output format for match results
#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    /// Human-friendly table
    Table,
    /// Machine-readable JSON format
    Json,
}

/// Search binary CLI for matching projects to supervisors
#[derive(Parser, Debug)]
#[command(
    name = "search",
    version,
    about = "Match project descriptions or topics to supervisors",
    long_about = "Query the supervisor snapshot. A free-text query ranks supervisors by semantic \
                  similarity; a topic list ranks them by accumulated topic affinity.

EXAMPLES:
  Specific project:
    search --db supervisors.db --query \"reinforcement learning for robot grasping\"

  General project:
    search --db supervisors.db --topics 3,7

  List the topic catalog:
    search --db supervisors.db --list-topics

  Interactive mode:
    search --db supervisors.db --interactive"
)]
struct Args {
    /// Database file path
    #[arg(long, value_name = "PATH", default_value = "supervisors.db")]
    db: PathBuf,

    /// Project description (specific matching)
    #[arg(long, value_name = "TEXT", conflicts_with_all = ["interactive", "topics"])]
    query: Option<String>,

    /// Comma-separated topic ids (general matching)
    #[arg(long, value_name = "IDS", value_delimiter = ',', conflicts_with = "interactive")]
    topics: Option<Vec<i32>>,

    /// Print the topic catalog and exit
    #[arg(long)]
    list_topics: bool,

    /// Number of supervisors to return
    #[arg(long, value_name = "N", default_value = "5")]
    top_k: usize,

    /// Output format
    #[arg(long, value_enum, default_value = "table")]
    format: OutputFormat,

    /// Enable interactive REPL mode
    #[arg(long, short = 'i')]
    interactive: bool,

    /// Pipeline configuration used at ingestion (for encoder locations)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Directory holding one sub-directory of ONNX files per encoder
    #[arg(long, value_name = "DIR")]
    models_root: Option<PathBuf>,

    /// Logging verbosity level
    #[arg(long, default_value = "warn", value_name = "LEVEL")]
    log_level: String,
}

/// Setup logging with the specified level
fn setup_logging(log_level: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();
}

/// Everything the REPL needs besides the matcher
struct Catalog {
    topics: Vec<Topic>,
    names: HashMap<String, String>,
}

/// Locate the encoder that produced the stored vectors
fn encoder_spec(args: &Args, primary: supervisor_match::models::ModelKind) -> Result<EncoderSpec> {
    let config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => PipelineConfig::default(),
    };
    let models_root = match &args.models_root {
        Some(root) => root.clone(),
        None if args.config.is_none() && !config.models_root.exists() => dirs::cache_dir()
            .map(|cache| cache.join("supervisor-match").join("models"))
            .unwrap_or_else(|| config.models_root.clone()),
        None => config.models_root.clone(),
    };
    Ok(config
        .encoders
        .iter()
        .find(|spec| spec.kind == primary)
        .cloned()
        .unwrap_or_else(|| EncoderSpec::for_kind(primary, &models_root)))
}

/// Execute a specific (free-text) match
async fn execute_specific(matcher: &dyn SupervisorMatcher, text: &str, top_k: usize) -> Result<Vec<Suggestion>> {
    debug!("Executing specific match for: {}", text);
    matcher
        .match_specific(text, top_k)
        .await
        .with_context(|| format!("Failed to match project: '{}'", text))
}

/// Execute a general (topic) match
async fn execute_general(matcher: &dyn SupervisorMatcher, topic_ids: &[i32], top_k: usize) -> Result<Vec<Suggestion>> {
    debug!("Executing general match for topics: {:?}", topic_ids);
    matcher
        .match_general(topic_ids, top_k)
        .await
        .with_context(|| format!("Failed to match topics: {:?}", topic_ids))
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        format!("{}...", text.chars().take(max - 3).collect::<String>())
    } else {
        text.to_string()
    }
}

/// Format results as a pretty table
fn format_results_table(results: &[Suggestion], names: &HashMap<String, String>, general: bool) -> String {
    if results.is_empty() {
        return "No supervisors found.".to_string();
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);

    table.set_header(vec![
        Cell::new("Rank").add_attribute(Attribute::Bold),
        Cell::new("Supervisor").add_attribute(Attribute::Bold),
        Cell::new(if general { "Affinity" } else { "Similarity" }).add_attribute(Attribute::Bold),
        Cell::new("Top paper").add_attribute(Attribute::Bold),
    ]);

    for (idx, result) in results.iter().enumerate() {
        let name = names
            .get(&result.supervisor_id)
            .cloned()
            .unwrap_or_else(|| result.supervisor_id.clone());
        let paper = result
            .top_paper
            .as_ref()
            .map(|p| truncate(&p.title, 60))
            .unwrap_or_else(|| "-".to_string());
        let score = Cell::new(format!("{:.4}", result.similarity));
        let score = if idx == 0 { score.fg(Color::Green) } else { score };

        table.add_row(vec![
            Cell::new(idx + 1),
            Cell::new(truncate(&name, 40)),
            score,
            Cell::new(paper),
        ]);
    }

    table.to_string()
}

/// Format the topic catalog as a table
fn format_topics_table(topics: &[Topic]) -> String {
    if topics.is_empty() {
        return "The snapshot has no topics.".to_string();
    }
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Id").add_attribute(Attribute::Bold),
        Cell::new("Label").add_attribute(Attribute::Bold),
        Cell::new("Keywords").add_attribute(Attribute::Bold),
    ]);
    for topic in topics {
        table.add_row(vec![
            Cell::new(topic.topic_id),
            Cell::new(&topic.label),
            Cell::new(truncate(&topic.keywords.join(", "), 70)),
        ]);
    }
    table.to_string()
}

/// Print results in the selected format
fn print_results(
    results: &[Suggestion],
    catalog: &Catalog,
    format: &OutputFormat,
    general: bool,
    elapsed: std::time::Duration,
) -> Result<()> {
    match format {
        OutputFormat::Table => {
            println!("{}", format_results_table(results, &catalog.names, general));
            println!(
                "\nFound {} supervisors in {:.2}s",
                results.len(),
                elapsed.as_secs_f64()
            );
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&serde_json::json!({ "results": results }))
                .context("Failed to serialize results to JSON")?;
            println!("{}", json);
        }
    }
    Ok(())
}

fn print_help() {
    println!("Commands:");
    println!("  <description>   - Match a specific project description");
    println!("  /general ID...  - Match by topic ids");
    println!("  /topics         - List the topic catalog");
    println!("  /top N          - Set number of results to N");
    println!("  /format table   - Use table output format");
    println!("  /format json    - Use JSON output format");
    println!("  /help           - Show this help");
    println!("  Ctrl+D or Ctrl+C - Exit");
}

/// Run interactive REPL mode
async fn run_interactive(
    matcher: &dyn SupervisorMatcher,
    catalog: &Catalog,
    mut top_k: usize,
    mut format: OutputFormat,
) -> Result<()> {
    println!("Interactive Supervisor Matching");
    print_help();
    println!();

    let mut rl = DefaultEditor::new().context("Failed to create readline editor")?;

    loop {
        match rl.readline("Match> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                rl.add_history_entry(line).ok();

                if line.starts_with('/') {
                    let parts: Vec<&str> = line.split_whitespace().collect();
                    match parts[0] {
                        "/help" => print_help(),
                        "/topics" => println!("{}", format_topics_table(&catalog.topics)),
                        "/top" => match parts.get(1).map(|n| n.parse::<usize>()) {
                            Some(Ok(n)) if n > 0 => {
                                top_k = n;
                                println!("Set top-k to {}", top_k);
                            }
                            _ => eprintln!("Usage: /top N (positive integer)"),
                        },
                        "/format" => match parts.get(1).copied() {
                            Some("table") => {
                                format = OutputFormat::Table;
                                println!("Set output format to table");
                            }
                            Some("json") => {
                                format = OutputFormat::Json;
                                println!("Set output format to JSON");
                            }
                            _ => eprintln!("Usage: /format [table|json]"),
                        },
                        "/general" => {
                            let ids: Result<Vec<i32>, _> = parts[1..]
                                .iter()
                                .flat_map(|p| p.split(','))
                                .filter(|p| !p.is_empty())
                                .map(str::parse::<i32>)
                                .collect();
                            match ids {
                                Ok(ids) if !ids.is_empty() => {
                                    let start = Instant::now();
                                    match execute_general(matcher, &ids, top_k).await {
                                        Ok(results) => {
                                            print_results(&results, catalog, &format, true, start.elapsed())?
                                        }
                                        Err(e) => eprintln!("Match failed: {:#}", e),
                                    }
                                }
                                _ => eprintln!("Usage: /general ID [ID...]"),
                            }
                        }
                        _ => eprintln!("Unknown command: {}. Type /help for available commands.", parts[0]),
                    }
                } else {
                    let start = Instant::now();
                    match execute_specific(matcher, line, top_k).await {
                        Ok(results) => print_results(&results, catalog, &format, false, start.elapsed())?,
                        Err(e) => eprintln!("Match failed: {:#}", e),
                    }
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                error!("Error reading input: {}", err);
                break;
            }
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(&args.log_level);

    if !args.interactive && !args.list_topics && args.query.is_none() && args.topics.is_none() {
        anyhow::bail!(
            "One of --query, --topics, --list-topics or --interactive must be specified.\n\
             Use --help for usage information."
        );
    }
    if args.top_k == 0 {
        anyhow::bail!("--top-k must be positive");
    }

    if !args.db.exists() {
        anyhow::bail!(
            "Database file not found: {}\n\
             Please run the ingestion binary first to create the database.",
            args.db.display()
        );
    }

    info!("Loading database from: {}", args.db.display());
    let storage = SqliteStorage::open(args.db.to_string_lossy().to_string())
        .await
        .context("Failed to open storage")?;

    let config = storage
        .get_config()
        .await
        .context("Failed to retrieve embedding configuration from database")?
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Database has no embedding configuration.\n\
                 Please run the ingestion binary with --mode init-new first."
            )
        })?;
    info!(
        "Snapshot built with {} (dimension: {}), serving variant {}",
        config.primary_model, config.dimension, config.serving_variant
    );

    let snapshot = Snapshot::load(&storage)
        .await
        .context("Failed to load snapshot")?;
    if snapshot.researchers.is_empty() {
        anyhow::bail!(
            "Database is empty (0 supervisors found).\n\
             Please run the ingestion binary to build the snapshot first."
        );
    }

    let catalog = Catalog {
        topics: snapshot.topics.clone(),
        names: snapshot
            .researchers
            .iter()
            .filter_map(|r| r.name.clone().map(|name| (r.uuid.clone(), name)))
            .collect(),
    };

    if args.list_topics {
        println!("{}", format_topics_table(&catalog.topics));
        return Ok(());
    }

    let spec = encoder_spec(&args, config.primary_model)?;
    let engine = EmbeddingEngine::from_specs(&[spec], config.primary_model)
        .context("Failed to load the query encoder")?;
    let dimension = engine.dimension(config.primary_model)?;
    if dimension != config.dimension {
        anyhow::bail!(
            "Dimension mismatch: expected {} from database config, but encoder returns {}",
            config.dimension,
            dimension
        );
    }

    let matcher = BruteForceMatcher::new(Arc::new(engine), snapshot, config.serving_variant);

    if args.interactive {
        return run_interactive(&matcher, &catalog, args.top_k, args.format).await;
    }

    let start = Instant::now();
    let (results, general) = match (&args.query, &args.topics) {
        (Some(query), _) => (execute_specific(&matcher, query, args.top_k).await?, false),
        (None, Some(topics)) => (execute_general(&matcher, topics, args.top_k).await?, true),
        (None, None) => anyhow::bail!("Nothing to match"),
    };
    print_results(&results, &catalog, &args.format, general, start.elapsed())
}
