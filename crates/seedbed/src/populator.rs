//! Referential load engine.
//!
//! [`Populator::load`] merges the requested datasets over the `static` and
//! `base` layers, relaxes every foreign key touching the affected tables,
//! replaces their rows with the file contents and restores the constraints.
//! Restoration runs on every exit path once relaxation has started.

use chrono::{Local, NaiveDateTime};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use seedbed_rdbc::schema::{ColumnType, Table};
use seedbed_rdbc::types::Value;
use seedbed_rdbc::{Database, TableName};

use crate::config::LoadConfig;
use crate::dataset::{parse_header, DataFile, DatasetRepository};
use crate::datefn;
use crate::error::{Error, Result};
use crate::strategy::{strategy_for, suppressed_foreign_keys, PreparationStrategy};

/// Outcome of one load
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadReport {
    /// Tables loaded
    pub tables: usize,
    /// Rows inserted over all tables
    pub rows: u64,
    /// Rows inserted per table
    pub per_table: BTreeMap<TableName, u64>,
    /// Wall time of the load
    pub elapsed: Duration,
}

/// A header cell resolved against the target table
#[derive(Debug, Clone)]
struct LoadColumn {
    position: usize,
    name: String,
    binder: ColumnType,
}

/// Loads datasets into one database
pub struct Populator<'a> {
    db: &'a Database,
    config: LoadConfig,
    repository: DatasetRepository,
}

impl<'a> Populator<'a> {
    /// Populator writing through `db`
    pub fn new(db: &'a Database, config: LoadConfig) -> Self {
        let repository = DatasetRepository::new(config.datasets_root.clone());
        Self {
            db,
            config,
            repository,
        }
    }

    /// Load `datasets` (in order, over `static` and `base`) into the database.
    ///
    /// Missing datasets and unknown tables fail before any statement runs.
    pub async fn load(&self, datasets: &[String]) -> Result<LoadReport> {
        let started = Instant::now();
        let files = self.repository.resolve(datasets)?;

        let mut targets = Vec::with_capacity(files.len());
        for file in files {
            let table = self
                .db
                .find_table(&file.table)
                .await?
                .ok_or_else(|| Error::TableNotFound(file.table.to_string()))?;
            targets.push((table, file));
        }

        let names: Vec<TableName> = targets.iter().map(|(t, _)| t.name.clone()).collect();
        let foreign_keys = suppressed_foreign_keys(self.db, &names).await?;
        let mut strategy = strategy_for(
            self.config.strategy,
            names,
            foreign_keys,
            self.config.validate_constraints,
        );
        info!(
            datasets = ?datasets,
            tables = targets.len(),
            strategy = strategy.name(),
            "loading datasets"
        );

        let outcome = self.relax_and_insert(strategy.as_mut(), &targets).await;
        let restored = strategy.after_inserts(self.db).await;

        let per_table = match (outcome, restored) {
            (Ok(per_table), Ok(())) => per_table,
            (Err(e), Ok(())) => return Err(e),
            (Ok(_), Err(restore)) => return Err(restore),
            (Err(e), Err(restore)) => {
                warn!(error = %restore, "constraint restoration failed after load error");
                return Err(e);
            }
        };

        let report = LoadReport {
            tables: per_table.len(),
            rows: per_table.values().sum(),
            per_table,
            elapsed: started.elapsed(),
        };
        info!(
            tables = report.tables,
            rows = report.rows,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "load complete"
        );
        Ok(report)
    }

    async fn relax_and_insert(
        &self,
        strategy: &mut dyn PreparationStrategy,
        targets: &[(Arc<Table>, DataFile)],
    ) -> Result<BTreeMap<TableName, u64>> {
        strategy.before_inserts(self.db).await?;

        let now = Local::now().naive_local();
        let mut per_table = BTreeMap::new();
        for (table, file) in targets {
            let rows = self.insert_file(table, &file.path, now).await?;
            debug!(table = %table.name, layer = %file.dataset, rows, "inserted");
            per_table.insert(table.name.clone(), rows);
        }
        Ok(per_table)
    }

    async fn insert_file(&self, table: &Table, path: &Path, now: NaiveDateTime) -> Result<u64> {
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
        let columns = loadable_columns(table, reader.headers()?);
        if columns.is_empty() {
            warn!(table = %table.name, file = %path.display(), "no loadable columns");
            return Ok(0);
        }

        let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        let mut inserter = self
            .db
            .create_inserter(table, &names, self.config.insert_batch_size)
            .await?;

        let mut failure = None;
        for record in reader.records() {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    failure = Some(Error::from(e));
                    break;
                }
            };
            let line = record.position().map_or(0, |p| p.line());
            let row = columns
                .iter()
                .map(|column| {
                    let cell = record.get(column.position).unwrap_or_default();
                    bind_cell(column.binder, cell, now).map_err(|e| Error::Binding {
                        table: table.name.to_string(),
                        column: column.name.clone(),
                        line,
                        message: e.to_string(),
                    })
                })
                .collect::<Result<Vec<Value>>>();
            let added = match row {
                Ok(row) => inserter.add(row).await.map_err(Error::from),
                Err(e) => Err(e),
            };
            if let Err(e) = added {
                failure = Some(e);
                break;
            }
        }

        let closed = inserter.close().await;
        if let Some(e) = failure {
            return Err(e);
        }
        Ok(closed?)
    }
}

/// Resolve header cells to table columns. Unknown and untyped columns are
/// skipped with a warning.
fn loadable_columns(table: &Table, headers: &csv::StringRecord) -> Vec<LoadColumn> {
    let mut columns = Vec::new();
    for (position, header) in headers.iter().enumerate() {
        let name = parse_header(header).0;
        let Some(column) = table.column(name) else {
            warn!(table = %table.name, column = %name, "column not in table, skipped");
            continue;
        };
        let Some(binder) = column.column_type else {
            warn!(
                table = %table.name,
                column = %column.name,
                type_name = %column.type_name,
                "column type cannot be loaded, skipped"
            );
            continue;
        };
        columns.push(LoadColumn {
            position,
            name: column.name.clone(),
            binder,
        });
    }
    columns
}

/// Bind one cell, evaluating `{{ ... }}` date expressions against `now`
fn bind_cell(binder: ColumnType, cell: &str, now: NaiveDateTime) -> Result<Value> {
    if datefn::is_expression(cell) {
        let at = datefn::evaluate_at(cell, now)?;
        return Ok(binder.bind_datetime(at)?);
    }
    Ok(binder.bind(cell)?)
}
