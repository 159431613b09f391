//! # Docgraph CLI (`dgx`)
//!
//! The `dgx` binary drives the document knowledge-extraction pipeline:
//! database initialization, document processing, and inspection of
//! extracted concepts and recorded costs.
//!
//! ## Usage
//!
//! ```bash
//! dgx --config ./config/dgx.toml <command>
//! ```
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dgx init` | Create the SQLite database and run schema migrations |
//! | `dgx process <file>` | Run the full extraction pipeline on a PDF |
//! | `dgx concepts <document-id>` | List a document's extracted concepts |
//! | `dgx costs` | Show recorded external-service spend per service |

mod budget;
mod cache;
mod classify;
mod config;
mod db;
mod error;
mod extractor;
mod migrate;
mod parser;
mod pipeline;
mod progress;
mod relate;
mod retry;
mod services;
mod store;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::budget::SharedBudget;
use crate::config::load_config;
use crate::pipeline::Pipeline;
use crate::progress::ProgressMode;
use crate::services::http::{HttpCompletionService, HttpEmbeddingService, HttpOcrService};

/// Docgraph CLI — turn documents into concept graphs.
#[derive(Parser)]
#[command(
    name = "dgx",
    about = "Docgraph — a document knowledge-extraction pipeline",
    version,
    long_about = "Docgraph converts uploaded PDFs into structured, deduplicated graphs of \
    domain concepts and relationships, with provenance and confidence scores, while \
    respecting external-service rate and cost budgets."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/dgx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Creates the SQLite database file and all required tables. Idempotent.
    Init,

    /// Run the extraction pipeline on a document.
    ///
    /// Checks the content-addressed cache first; on a miss, classifies,
    /// parses, extracts, deduplicates, and detects relationships, then
    /// persists and caches the result. Always prints a result summary,
    /// partial or complete.
    Process {
        /// Path to the PDF to process.
        file: PathBuf,

        /// Progress reporting: auto (TTY), human, json, or off.
        #[arg(long, default_value = "auto")]
        progress: String,
    },

    /// List extracted concepts for a document.
    Concepts {
        /// Document UUID (printed by `dgx process`).
        document_id: String,

        /// Include superseded (merged) concepts.
        #[arg(long)]
        all: bool,
    },

    /// Show recorded external-service costs.
    Costs,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            let pool = db::connect(&config.db.path).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("initialized {}", config.db.path.display());
        }
        Commands::Process { file, progress } => {
            let bytes = std::fs::read(&file)?;
            let pool = db::connect(&config.db.path).await?;
            migrate::run_migrations(&pool).await?;

            let budget = SharedBudget::new(&config.budget);
            let pipeline = Pipeline::new(
                pool.clone(),
                budget,
                std::sync::Arc::new(HttpCompletionService::new(&config.services.completion)),
                std::sync::Arc::new(HttpEmbeddingService::new(&config.services.embedding)),
                std::sync::Arc::new(HttpOcrService::new(&config.services.ocr)),
                config.clone(),
            );

            let mode = match progress.as_str() {
                "human" => ProgressMode::Human,
                "json" => ProgressMode::Json,
                "off" => ProgressMode::Off,
                _ => ProgressMode::default_for_tty(),
            };
            let reporter = mode.reporter();

            let result = pipeline
                .process(&bytes, CancellationToken::new(), reporter.as_ref())
                .await?;

            println!("document: {}", result.document_id);
            println!("  stage reached: {}", result.stage_reached.as_str());
            println!("  parse method: {}", result.metrics.parse_method);
            println!("  cache hit: {}", result.metrics.cache_hit);
            println!("  chunks: {}", result.metrics.chunk_count);
            println!(
                "  concepts: {} ({} merged)",
                result.concepts.iter().filter(|c| c.is_canonical()).count(),
                result.metrics.duplicates_merged
            );
            println!("  relationships: {}", result.relationships.len());
            println!("  cost: ${:.4}", result.metrics.total_cost);
            println!("  duration: {}ms", result.metrics.duration_ms);
            for warning in &result.warnings {
                println!("  warning: {}", warning);
            }
            pool.close().await;
        }
        Commands::Concepts { document_id, all } => {
            let pool = db::connect(&config.db.path).await?;
            let concepts = store::concepts_for_document(&pool, &document_id).await?;
            for concept in concepts
                .iter()
                .filter(|c| all || c.is_canonical())
            {
                let marker = if concept.is_canonical() { "" } else { " (merged)" };
                println!(
                    "{:.2}  p{}  {}{}",
                    concept.confidence, concept.page_number, concept.term, marker
                );
                if !concept.definition.is_empty() {
                    println!("      {}", concept.definition);
                }
            }
            pool.close().await;
        }
        Commands::Costs => {
            let pool = db::connect(&config.db.path).await?;
            let summary = store::cost_summary(&pool).await?;
            if summary.is_empty() {
                println!("no recorded costs");
            }
            for (service, calls, total) in summary {
                println!("{}  {} calls  ${:.4}", service, calls, total);
            }
            pool.close().await;
        }
    }

    Ok(())
}
