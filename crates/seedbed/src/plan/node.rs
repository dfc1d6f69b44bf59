//! Execution node: the extraction unit for one table.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use seedbed_rdbc::schema::{Column, Table};
use seedbed_rdbc::types::{Row, Value};
use seedbed_rdbc::{Database, TableName};

use crate::config::{ExecutionMode, PlanConfig};
use crate::context::ExecutionContext;
use crate::dataset::table_path;
use crate::error::Result;
use crate::fetcher::TableFetcher;
use crate::layers::PrimaryKeyLayers;
use crate::output::TableWriter;

/// Edge from a node to a consumer of its rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLink {
    /// Index of the consuming node in the plan
    pub target: usize,
    /// Positions of the target's key columns in this node's rows
    pub projection: Vec<usize>,
    /// Constraint the edge follows
    pub constraint: String,
}

/// Key tuples produced by a flush, addressed to consuming nodes
pub type Dispatch = Vec<(usize, Vec<Value>)>;

/// Per-table extraction unit.
///
/// Owns the fetcher, the output writer, the keys waiting to be fetched and
/// the links to consuming nodes. Every key is fetched at most once.
#[derive(Debug)]
pub struct ExecutionNode {
    fetcher: TableFetcher,
    writer: Option<TableWriter>,
    layers: PrimaryKeyLayers,
    pk_positions: Vec<usize>,
    pending: Vec<Vec<Value>>,
    requested: HashSet<Vec<Value>>,
    full_scan: bool,
    children: Vec<NodeLink>,
    rows: u64,
    skipped: u64,
    fetched: bool,
    interrupted: bool,
}

impl ExecutionNode {
    /// Prepare a node for `table`, filtered on `key_columns`
    pub async fn new(
        db: &Database,
        table: Arc<Table>,
        key_columns: &[String],
        predicates: &[String],
        config: &PlanConfig,
    ) -> Result<Self> {
        let fetcher = TableFetcher::new(
            db,
            Arc::clone(&table),
            key_columns,
            predicates,
            config.parameter_budget,
        )
        .await?;

        let layers = PrimaryKeyLayers::read(&config.datasets_root, &config.dataset, &table)?;
        let pk_positions = table
            .primary_key_columns()
            .iter()
            .filter_map(|pk| table.column_index(pk))
            .collect();

        let writer = match config.mode {
            ExecutionMode::Save => Some(TableWriter::new(
                table_path(&config.datasets_root, &config.dataset, &table.name),
                table.name.clone(),
                &table.columns,
                config.max_cell_length,
            )),
            ExecutionMode::Count => None,
        };

        Ok(Self {
            fetcher,
            writer,
            layers,
            pk_positions,
            pending: Vec::new(),
            requested: HashSet::new(),
            full_scan: false,
            children: Vec::new(),
            rows: 0,
            skipped: 0,
            fetched: false,
            interrupted: false,
        })
    }

    /// Table of this node
    pub fn table_name(&self) -> &TableName {
        &self.fetcher.table().name
    }

    /// Columns of the captured rows
    pub fn selected_columns(&self) -> &[Column] {
        self.fetcher.selected_columns()
    }

    /// Positions of `columns` among the selected columns
    pub fn positions_of(&self, columns: &[String]) -> Option<Vec<usize>> {
        let table = self.fetcher.table();
        columns.iter().map(|c| table.column_index(c)).collect()
    }

    /// Consumers of this node's rows
    pub fn children(&self) -> &[NodeLink] {
        &self.children
    }

    pub(crate) fn add_child(&mut self, link: NodeLink) {
        self.children.push(link);
    }

    /// Rows captured (written, or counted in a dry run)
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// Rows left out because their key was already captured
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Whether a flush would do anything
    pub fn has_pending(&self) -> bool {
        self.full_scan || !self.pending.is_empty()
    }

    /// Queue the initial fetch: the given keys, or the whole table for an
    /// unfiltered node.
    pub fn seed(&mut self, keys: Vec<Vec<Value>>) {
        if self.fetcher.is_unfiltered() {
            self.full_scan = true;
        } else {
            for key in keys {
                self.offer(key);
            }
        }
    }

    /// Queue a key unless it was requested before or has a NULL part.
    /// Returns whether the key was queued.
    pub fn offer(&mut self, key: Vec<Value>) -> bool {
        if key.iter().any(Value::is_null) || self.requested.contains(&key) {
            return false;
        }
        self.requested.insert(key.clone());
        self.pending.push(key);
        true
    }

    /// Fetch every queued key, capturing rows and collecting the keys they
    /// pass to consuming nodes. Returns `None` when nothing was queued.
    pub async fn flush(&mut self, ctx: &ExecutionContext) -> Result<Option<Dispatch>> {
        if !self.has_pending() {
            return Ok(None);
        }
        let keys = std::mem::take(&mut self.pending);
        self.full_scan = false;

        let Self {
            fetcher,
            writer,
            layers,
            pk_positions,
            children,
            rows,
            skipped,
            fetched,
            interrupted,
            ..
        } = self;

        let mut dispatched = Dispatch::new();
        let mut on_row = |row: Row| -> Result<bool> {
            if !ctx.keep_running() {
                return Ok(false);
            }

            for link in children.iter() {
                dispatched.push((link.target, row.project(&link.projection)));
            }

            if !pk_positions.is_empty() {
                let key = pk_positions
                    .iter()
                    .map(|&i| row.get(i).map(Value::to_cell).unwrap_or_default())
                    .collect();
                if !layers.record(key) {
                    *skipped += 1;
                    return Ok(true);
                }
            }

            ctx.record_row();
            *rows += 1;
            if let Some(writer) = writer.as_mut() {
                writer.write(&row)?;
            }
            Ok(ctx.keep_running())
        };

        if fetcher.execute(&keys, &mut on_row).await? {
            *fetched = true;
        } else {
            *interrupted = true;
        }
        debug!(
            table = %fetcher.table().name,
            keys = keys.len(),
            rows = *rows,
            dispatched = dispatched.len(),
            "flushed"
        );
        Ok(Some(dispatched))
    }

    /// Whether every requested key was fetched to the end
    pub fn is_complete(&self) -> bool {
        self.fetched && !self.interrupted && !self.has_pending()
    }

    /// Finish the output file. The empty marker is written when asked and
    /// the node was fully fetched without capturing a row; a node the row
    /// cap never reached gets no file.
    pub fn close(&mut self, create_empty_file: bool) -> Result<()> {
        let empty = self.rows == 0 && self.is_complete();
        if let Some(writer) = self.writer.as_mut() {
            if create_empty_file && empty {
                writer.write_empty_marker()?;
            }
            writer.close()?;
        }
        Ok(())
    }
}
