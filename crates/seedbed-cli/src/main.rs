//! seedbed - referentially consistent seed data
//!
//! # Usage
//!
//! ```bash
//! # Show what can be reached from a table, with row counts
//! seedbed -c seedbed.yaml tree public.invoices --counts
//!
//! # Print an execution model following one cascade edge
//! seedbed -c seedbed.yaml tree invoices --select invoice_details_invoices_fk --model
//!
//! # Run an extraction request
//! seedbed -c seedbed.yaml download invoices.json
//!
//! # Load datasets over static and base
//! seedbed -c seedbed.yaml load smoke nightly
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fmt::Write as _;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use seedbed::graph::{expand, Dependency, EdgeKind};
use seedbed::prelude::*;

const DEFAULT_COUNT_CAP: &str = "10000";

#[derive(Parser)]
#[command(name = "seedbed")]
#[command(version, about = "Extract and load referentially consistent seed data")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "seedbed.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the dependency tree of a table
    Tree {
        /// Root table, `table`, `schema.table` or `catalog.schema.table`
        table: String,
        /// Annotate nodes with row counts, counted up to CAP
        #[arg(long, value_name = "CAP", num_args = 0..=1, default_missing_value = DEFAULT_COUNT_CAP)]
        counts: Option<u64>,
        /// Select the edge with this constraint name (repeatable)
        #[arg(long = "select", value_name = "CONSTRAINT")]
        selections: Vec<String>,
        /// Print the execution model of the selected edges as JSON
        #[arg(long, conflicts_with = "json")]
        model: bool,
        /// Print the whole tree as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run an extraction request
    Download {
        /// Request file (JSON)
        request: PathBuf,
    },
    /// Load datasets, in order, over the static and base layers
    Load {
        /// Dataset names
        #[arg(required = true)]
        datasets: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let settings = SeedbedConfig::from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;
    let db = Database::connect(
        &settings.connection_config(),
        settings.connect_retries,
        settings.connect_backoff(),
    )
    .await
    .context("Failed to connect to database")?;

    let outcome = match cli.command {
        Commands::Tree {
            table,
            counts,
            selections,
            model,
            json,
        } => show_tree(&db, &table, counts, &selections, model, json).await,
        Commands::Download { request } => download(&db, &settings, request).await,
        Commands::Load { datasets } => load(&db, &settings, &datasets).await,
    };

    db.close().await.context("Failed to close connection")?;
    outcome
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();
}

async fn show_tree(
    db: &Database,
    table: &str,
    counts: Option<u64>,
    selections: &[String],
    model: bool,
    json: bool,
) -> Result<()> {
    let root = db.resolve_table_name(table)?;
    let mut tree = expand(db, &root, counts)
        .await
        .with_context(|| format!("Failed to expand {}", root))?;
    for constraint in selections {
        if !tree.select(constraint) {
            bail!("{} is not reachable from {}", constraint, root);
        }
    }

    if model {
        println!("{}", serde_json::to_string_pretty(&tree.to_execution_model())?);
    } else if json {
        println!("{}", serde_json::to_string_pretty(&tree)?);
    } else {
        print!("{}", render_tree(&tree));
    }
    Ok(())
}

async fn download(db: &Database, settings: &SeedbedConfig, path: PathBuf) -> Result<()> {
    let request = ExtractionRequest::from_file(&path)?;
    info!(request = %path.display(), table = %request.table, "starting extraction");
    let dataset = request.dataset.clone();
    let mode = request.mode;

    let report = Downloader::new(db)
        .execute(request, settings)
        .await
        .with_context(|| format!("Extraction {} failed", path.display()))?;

    println!(
        "{:?} into '{}': {} rows from {} tables in {:.2?}",
        mode,
        dataset,
        report.total_rows(),
        report.rows.len(),
        report.elapsed
    );
    for (table, rows) in &report.rows {
        let skipped = report.skipped.get(table).copied().unwrap_or_default();
        println!("  {:<48} {:>8} rows {:>8} skipped", table.to_string(), rows, skipped);
    }
    Ok(())
}

async fn load(db: &Database, settings: &SeedbedConfig, datasets: &[String]) -> Result<()> {
    let report = Populator::new(db, settings.load_config())
        .load(datasets)
        .await
        .with_context(|| format!("Loading {} failed", datasets.join(", ")))?;

    println!(
        "Loaded {} rows into {} tables in {:.2?}",
        report.rows, report.tables, report.elapsed
    );
    for (table, rows) in &report.per_table {
        println!("  {:<48} {:>8} rows", table.to_string(), rows);
    }
    Ok(())
}

/// Indented text view: `[x]` marks selected edges, `->` points at a parent
/// table, `<-` at a child table.
fn render_tree(tree: &Dependency) -> String {
    let mut out = String::new();
    render_node(tree, 0, &mut out);
    out
}

fn render_node(node: &Dependency, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    let count = node
        .row_count
        .map(|n| format!(" ({} rows)", n))
        .unwrap_or_default();
    match (&node.constraint, node.kind) {
        (Some(constraint), Some(kind)) => {
            let mark = if node.selected { "x" } else { " " };
            let arrow = match kind {
                EdgeKind::Lookup => "->",
                EdgeKind::Cascade => "<-",
            };
            let _ = writeln!(
                out,
                "{}[{}] {} {} via {}{}",
                indent, mark, arrow, node.table, constraint, count
            );
        }
        _ => {
            let _ = writeln!(out, "{}{}{}", indent, node.table, count);
        }
    }
    for child in &node.dependencies {
        render_node(child, depth + 1, out);
    }
}
