//! Table fetcher: one prepared, batched query per table.
//!
//! A fetcher without key columns reads the whole table. With key columns it
//! prepares a disjunction of `batch_size` conjunctive clauses,
//! `(k1 = ? AND k2 = ?) OR ...`, where `batch_size` is the parameter budget
//! divided by the key width. Key sets of any size are sent in batches of that
//! shape; the last partial batch is padded by repeating its final key.

use std::sync::Arc;
use tracing::debug;

use seedbed_rdbc::connection::PreparedStatement;
use seedbed_rdbc::schema::{Column, Table};
use seedbed_rdbc::security::validate_predicate;
use seedbed_rdbc::types::{Row, Value};
use seedbed_rdbc::Database;

use crate::error::{Error, Result};

/// Batched query over one table
pub struct TableFetcher {
    table: Arc<Table>,
    key_columns: Vec<String>,
    batch_size: usize,
    statement: Box<dyn PreparedStatement>,
}

impl std::fmt::Debug for TableFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableFetcher")
            .field("table", &self.table.name)
            .field("key_columns", &self.key_columns)
            .field("batch_size", &self.batch_size)
            .field("sql", &self.statement.sql())
            .finish()
    }
}

impl TableFetcher {
    /// Prepare the fetch statement.
    ///
    /// `key_columns` empty means an unfiltered read. `predicates` are extra
    /// row filters ANDed into the statement.
    pub async fn new(
        db: &Database,
        table: Arc<Table>,
        key_columns: &[String],
        predicates: &[String],
        parameter_budget: usize,
    ) -> Result<Self> {
        let mut resolved = Vec::with_capacity(key_columns.len());
        for key in key_columns {
            let column = table.column(key).ok_or_else(|| {
                Error::Database(seedbed_rdbc::Error::ColumnNotFound {
                    table: table.name.to_string(),
                    column: key.clone(),
                })
            })?;
            resolved.push(column.name.clone());
        }
        for predicate in predicates {
            validate_predicate(predicate)?;
        }

        let batch_size = if resolved.is_empty() {
            0
        } else {
            (parameter_budget / resolved.len()).max(1)
        };

        let dialect = db.dialect();
        let mut conditions = Vec::new();
        if !resolved.is_empty() {
            let keys: Vec<&str> = resolved.iter().map(String::as_str).collect();
            conditions.push(dialect.key_filter(&keys, batch_size));
        }
        conditions.extend(predicates.iter().cloned());
        let where_clause = match conditions.len() {
            0 => None,
            1 => conditions.pop(),
            _ => Some(
                conditions
                    .iter()
                    .map(|c| format!("({})", c))
                    .collect::<Vec<_>>()
                    .join(" AND "),
            ),
        };

        let columns: Vec<&str> = table.columns.iter().map(|c| c.name.as_str()).collect();
        let sql = dialect.build_select(&table.name, &columns, where_clause.as_deref());
        let statement = db.connection().prepare(&sql).await?;
        debug!(table = %table.name, batch_size, "prepared fetch");

        Ok(Self {
            table,
            key_columns: resolved,
            batch_size,
            statement,
        })
    }

    /// Table being fetched
    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    /// Columns of every fetched row, in row order
    pub fn selected_columns(&self) -> &[Column] {
        &self.table.columns
    }

    /// Key columns this fetcher filters on
    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    /// Key tuples per statement execution, 0 for an unfiltered fetch
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Whether this fetcher reads the whole table
    pub fn is_unfiltered(&self) -> bool {
        self.key_columns.is_empty()
    }

    /// Run the fetch, passing each row to `on_row` until it returns `false`.
    ///
    /// An unfiltered fetcher ignores `keys`. A filtered fetcher with no keys
    /// does nothing. Returns false when `on_row` stopped the fetch.
    pub async fn execute<F>(&self, keys: &[Vec<Value>], mut on_row: F) -> Result<bool>
    where
        F: FnMut(Row) -> Result<bool> + Send,
    {
        if self.is_unfiltered() {
            return self.run(&[], &mut on_row).await;
        }

        for batch in keys.chunks(self.batch_size) {
            let mut params = Vec::with_capacity(self.batch_size * self.key_columns.len());
            for key in batch {
                if key.len() != self.key_columns.len() {
                    return Err(Error::config(format!(
                        "key tuple of width {} for {} key column(s) of {}",
                        key.len(),
                        self.key_columns.len(),
                        self.table.name
                    )));
                }
                params.extend(key.iter().cloned());
            }
            if let Some(last) = batch.last() {
                for _ in batch.len()..self.batch_size {
                    params.extend(last.iter().cloned());
                }
            }

            if !self.run(&params, &mut on_row).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn run<F>(&self, params: &[Value], on_row: &mut F) -> Result<bool>
    where
        F: FnMut(Row) -> Result<bool> + Send,
    {
        let mut stream = self.statement.query_stream(params).await?;
        while let Some(row) = stream.next().await? {
            if !on_row(row)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
