//! Evaluation binary entry point.
//!
//! Computes the mean reciprocal rank of every stored representation variant (and
//! optionally the TF-IDF baseline) over a labeled proposal set.
//!
//! ```bash
//! evaluate --db supervisors.db --proposals data/proposals.jsonl --tfidf
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, CellAlignment, ContentArrangement, Table};
use serde::Serialize;
use std::fs::File;
use std::path::PathBuf;
use std::time::Instant;
use supervisor_match::{
    config::PipelineConfig,
    embedding::engine::EmbeddingEngine,
    evaluation::{load_proposals, EvaluationReport, Evaluator},
    models::RepresentationVariant,
    query::Snapshot,
    storage::{sqlite::SqliteStorage, SupervisorStorage},
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "evaluate",
    version,
    about = "Evaluate supervisor ranking quality against labeled proposals"
)]
struct EvalCli {
    /// Database file path
    #[arg(long, value_name = "PATH", default_value = "supervisors.db")]
    db: PathBuf,

    /// JSONL file of `{"supervisor_id": ..., "text": ...}` proposals
    #[arg(long, env = "SUPERVISOR_EVAL_DATA", default_value = "data/proposals.jsonl")]
    proposals: PathBuf,

    /// Variants to evaluate; defaults to every variant in the snapshot
    #[arg(long, value_delimiter = ',', value_name = "NAMES")]
    variants: Vec<String>,

    /// Also evaluate the lexical TF-IDF baseline
    #[arg(long)]
    tfidf: bool,

    /// Optional JSON report output path
    #[arg(long, env = "SUPERVISOR_EVAL_REPORT")]
    report_json: Option<PathBuf>,

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

#[derive(Debug, Serialize)]
struct EvalReport {
    proposals: usize,
    candidates: usize,
    elapsed_ms: u128,
    reports: Vec<EvaluationReport>,
}

fn setup_logging(log_level: &str) {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .init();
}

fn render_summary(report: &EvalReport) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Variant").add_attribute(Attribute::Bold),
        Cell::new("MRR").add_attribute(Attribute::Bold),
        Cell::new("Hit@1").add_attribute(Attribute::Bold),
        Cell::new("Evaluated").add_attribute(Attribute::Bold),
        Cell::new("Skipped").add_attribute(Attribute::Bold),
    ]);

    let mut ordered: Vec<&EvaluationReport> = report.reports.iter().collect();
    ordered.sort_by(|a, b| b.mrr.total_cmp(&a.mrr));
    for entry in ordered {
        let hits = entry.positions.iter().filter(|p| **p == Some(1)).count();
        table.add_row(vec![
            Cell::new(&entry.variant),
            Cell::new(format!("{:.4}", entry.mrr)).set_alignment(CellAlignment::Right),
            Cell::new(hits).set_alignment(CellAlignment::Right),
            Cell::new(entry.evaluated).set_alignment(CellAlignment::Right),
            Cell::new(entry.skipped).set_alignment(CellAlignment::Right),
        ]);
    }

    println!("{}", table);
    println!(
        "{} proposals against {} supervisors in {:.2}s",
        report.proposals,
        report.candidates,
        report.elapsed_ms as f64 / 1000.0
    );
}

fn write_report(report: &EvalReport, path: &PathBuf) -> Result<()> {
    let file = File::create(path).with_context(|| format!("failed to create {:?}", path))?;
    serde_json::to_writer_pretty(file, report).context("failed to write JSON report")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = EvalCli::parse();
    setup_logging(&cli.log_level);

    let start = Instant::now();
    let proposals = load_proposals(&cli.proposals)
        .with_context(|| format!("failed to read proposals from {:?}", cli.proposals))?;
    if proposals.is_empty() {
        anyhow::bail!("no proposals in {:?}", cli.proposals);
    }

    if !cli.db.exists() {
        anyhow::bail!(
            "Database file not found: {}\nPlease run the ingestion binary first.",
            cli.db.display()
        );
    }
    let storage = SqliteStorage::open(cli.db.to_string_lossy().to_string())
        .await
        .context("Failed to open storage")?;
    let stored = storage
        .get_config()
        .await
        .context("Failed to read embedding configuration")?
        .context("Database has no embedding configuration; run ingestion first")?;
    let snapshot = Snapshot::load(&storage).await.context("Failed to load snapshot")?;
    info!(
        proposals = proposals.len(),
        candidates = snapshot.researchers.len(),
        "Loaded evaluation data"
    );

    let names = if cli.variants.is_empty() {
        stored.variants.clone()
    } else {
        cli.variants.clone()
    };
    let variants = names
        .iter()
        .map(|name| {
            if !stored.variants.contains(name) {
                warn!(variant = %name, "Variant not present in the snapshot; every query will rank nothing");
            }
            name.parse::<RepresentationVariant>()
                .map_err(|e| anyhow::anyhow!("invalid variant '{}': {}", name, e))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path))?,
        None => PipelineConfig::default(),
    };
    if let Some(root) = &cli.models_root {
        config.models_root = root.clone();
    } else if cli.config.is_none() && !config.models_root.exists() {
        if let Some(cache) = dirs::cache_dir() {
            config.models_root = cache.join("supervisor-match").join("models");
        }
    }
    config.primary_model = stored.primary_model;
    config.variants = names;
    let specs = config.encoder_specs().context("Invalid encoder configuration")?;
    let engine = EmbeddingEngine::from_specs(&specs, stored.primary_model).context("Failed to load encoders")?;

    let mut evaluator = Evaluator::new(&engine, &snapshot.researchers);
    let mut reports = Vec::with_capacity(variants.len() + 1);
    for variant in &variants {
        let report = evaluator
            .evaluate(&proposals, variant)
            .await
            .with_context(|| format!("failed to evaluate {}", variant.name()))?;
        reports.push(report);
    }
    if cli.tfidf {
        reports.push(evaluator.evaluate_tfidf(&proposals));
    }

    let report = EvalReport {
        proposals: proposals.len(),
        candidates: snapshot.researchers.len(),
        elapsed_ms: start.elapsed().as_millis(),
        reports,
    };
    render_summary(&report);
    if let Some(path) = &cli.report_json {
        write_report(&report, path)?;
        println!("wrote JSON report to {:?}", path);
    }

    Ok(())
}
