//! Extraction entry point.
//!
//! An [`ExtractionRequest`] names a root table, the execution model to follow
//! and optionally the key tuples to start from. The [`Downloader`] builds the
//! plan, drains it and always closes it.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Instant;
use tracing::info;

use seedbed_rdbc::schema::Table;
use seedbed_rdbc::types::Value;
use seedbed_rdbc::{Database, TableName};

use crate::config::{ExecutionMode, PlanConfig, SeedbedConfig};
use crate::error::{Error, Result};
use crate::plan::ExecutionPlan;
pub use crate::plan::ExtractionReport;
use crate::selection::TableExecutionModel;

/// Extraction request, as read from a JSON file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    /// Root table, `table`, `schema.table` or `catalog.schema.table`
    pub table: String,
    /// Dataset to write to
    pub dataset: String,
    /// `COUNT` for a dry run, `SAVE` to write files
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Stop after this many rows over all tables
    #[serde(default)]
    pub row_cap: Option<u64>,
    /// Edges to follow from the root
    #[serde(default)]
    pub model: TableExecutionModel,
    /// Root columns the keys are given for; empty reads the whole root table
    #[serde(default)]
    pub filter_columns: Vec<String>,
    /// Key tuples, one value per filter column
    #[serde(default)]
    pub keys: Vec<Vec<serde_json::Value>>,
}

impl ExtractionRequest {
    /// Read a request from a JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read request {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&content)
            .map_err(|e| Error::config(format!("invalid request {}: {}", path.display(), e)))
    }
}

/// Key columns of the root table and the typed tuples to fetch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyFilter {
    /// Root key columns
    pub columns: Vec<String>,
    /// Tuples, one value per column
    pub keys: Vec<Vec<Value>>,
}

impl KeyFilter {
    /// Read the whole root table
    pub fn unfiltered() -> Self {
        Self::default()
    }

    /// Filter on `columns` with already typed `keys`
    pub fn new(columns: Vec<String>, keys: Vec<Vec<Value>>) -> Self {
        Self { columns, keys }
    }

    /// Bind JSON key tuples through the column types of `table`
    pub fn bind(
        table: &Table,
        columns: &[String],
        raw: &[Vec<serde_json::Value>],
    ) -> Result<Self> {
        let mut binders = Vec::with_capacity(columns.len());
        for name in columns {
            let column = table.column(name).ok_or_else(|| {
                Error::Database(seedbed_rdbc::Error::ColumnNotFound {
                    table: table.name.to_string(),
                    column: name.clone(),
                })
            })?;
            binders.push(column);
        }

        let mut keys = Vec::with_capacity(raw.len());
        for tuple in raw {
            if tuple.len() != binders.len() {
                return Err(Error::config(format!(
                    "key tuple {:?} does not match filter columns {:?}",
                    tuple, columns
                )));
            }
            let mut key = Vec::with_capacity(tuple.len());
            for (column, value) in binders.iter().zip(tuple) {
                let text = json_text(value);
                key.push(match column.column_type {
                    Some(binder) => binder.bind(&text)?,
                    None => Value::String(text),
                });
            }
            keys.push(key);
        }

        Ok(Self {
            columns: columns.to_vec(),
            keys,
        })
    }
}

fn json_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Runs extractions against one database
pub struct Downloader<'a> {
    db: &'a Database,
}

impl<'a> Downloader<'a> {
    /// Downloader reading through `db`
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Run a request with the limits of `settings`
    pub async fn execute(
        &self,
        request: ExtractionRequest,
        settings: &SeedbedConfig,
    ) -> Result<ExtractionReport> {
        let config = settings.plan_config(&request.dataset, request.mode, request.row_cap)?;
        let root = self.db.resolve_table_name(&request.table)?;
        let table = self
            .db
            .find_table(&root)
            .await?
            .ok_or_else(|| Error::TableNotFound(root.to_string()))?;
        let filter = KeyFilter::bind(&table, &request.filter_columns, &request.keys)?;
        self.download(config, &root, request.model, filter).await
    }

    /// Extract `root` and everything `model` reaches from it.
    ///
    /// The plan is closed on every exit path; a drain error wins over a close
    /// error.
    pub async fn download(
        &self,
        config: PlanConfig,
        root: &TableName,
        model: TableExecutionModel,
        filter: KeyFilter,
    ) -> Result<ExtractionReport> {
        let started = Instant::now();
        let mode = config.mode;
        let mut plan = ExecutionPlan::build(self.db, config, root, model, &filter.columns).await?;

        let drained = plan.run(filter.keys).await;
        let closed = plan.close();
        drained?;
        closed?;

        let report = plan.report(started.elapsed());
        info!(
            root = %root,
            mode = ?mode,
            tables = report.rows.len(),
            rows = report.total_rows(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "extraction complete"
        );
        Ok(report)
    }
}
