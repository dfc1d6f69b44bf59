//! Execution plan: builds one node per table and drains them to a fix-point.
//!
//! Building follows the execution model edge by edge. Owned foreign keys
//! named in the model add a lookup node for the parent table, keys elsewhere
//! referencing the table add a cascade node for the child table. A table is
//! built at most once per plan; a second edge into it is consumed from the
//! model and dropped.
//!
//! Draining flushes every node in build order, routing the keys each flush
//! produces to the consuming nodes, until a pass does no work or the row cap
//! is reached.

mod node;

pub use node::{Dispatch, ExecutionNode, NodeLink};

use futures::future::{BoxFuture, FutureExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use seedbed_rdbc::schema::Table;
use seedbed_rdbc::types::Value;
use seedbed_rdbc::{Database, TableName};

use crate::config::PlanConfig;
use crate::context::ExecutionContext;
use crate::error::{Error, Result};
use crate::selection::TableExecutionModel;

/// Outcome of one extraction
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionReport {
    /// Rows captured per table, tables without rows omitted
    pub rows: BTreeMap<TableName, u64>,
    /// Rows left out per table because their key was already captured
    pub skipped: BTreeMap<TableName, u64>,
    /// Wall time of the extraction
    pub elapsed: Duration,
}

impl ExtractionReport {
    /// Rows captured over all tables
    pub fn total_rows(&self) -> u64 {
        self.rows.values().sum()
    }

    /// Rows captured for one table
    pub fn rows_for(&self, table: &str) -> u64 {
        self.rows
            .iter()
            .filter(|(name, _)| name.table == table)
            .map(|(_, rows)| *rows)
            .sum()
    }
}

/// Node graph of one extraction call
#[derive(Debug)]
pub struct ExecutionPlan {
    config: PlanConfig,
    context: ExecutionContext,
    nodes: Vec<ExecutionNode>,
    processed: HashSet<TableName>,
}

impl ExecutionPlan {
    /// Build the plan rooted at `root`, filtered on `key_columns` (empty for a
    /// full-table root).
    ///
    /// Fails with [`Error::UnknownConstraints`] when the model names an edge
    /// the live schema does not have.
    pub async fn build(
        db: &Database,
        config: PlanConfig,
        root: &TableName,
        model: TableExecutionModel,
        key_columns: &[String],
    ) -> Result<Self> {
        let mut plan = Self {
            context: ExecutionContext::new(config.row_cap),
            config,
            nodes: Vec::new(),
            processed: HashSet::new(),
        };

        let table = db
            .find_table(root)
            .await?
            .ok_or_else(|| Error::TableNotFound(root.to_string()))?;
        plan.build_node(db, table, key_columns.to_vec(), model).await?;

        info!(
            root = %root,
            tables = plan.nodes.len(),
            dataset = %plan.config.dataset,
            mode = ?plan.config.mode,
            "built execution plan"
        );
        Ok(plan)
    }

    fn build_node<'a>(
        &'a mut self,
        db: &'a Database,
        table: Arc<Table>,
        key_columns: Vec<String>,
        mut model: TableExecutionModel,
    ) -> BoxFuture<'a, Result<usize>> {
        async move {
            let node = ExecutionNode::new(
                db,
                Arc::clone(&table),
                &key_columns,
                &model.queries,
                &self.config,
            )
            .await?;
            let index = self.nodes.len();
            self.nodes.push(node);
            self.processed.insert(table.name.clone());

            let mut owned = table.foreign_keys.clone();
            owned.sort_by(|a, b| a.name.cmp(&b.name));
            for fk in owned {
                let Some(nested) = model.remove_by_constraint_name(&fk.name) else {
                    continue;
                };
                if self.processed.contains(&fk.parent_table) {
                    debug!(
                        constraint = %fk.name,
                        table = %fk.parent_table,
                        "table already planned, edge dropped"
                    );
                    continue;
                }
                let parent = db.table(&fk.parent_table).await?;
                let target = self
                    .build_node(db, parent, fk.parent_columns.clone(), nested)
                    .await?;
                self.link(index, target, &fk.child_columns, fk.name)?;
            }

            let mut referencing = db.related_foreign_keys(&table.name).await?;
            referencing.sort_by(|a, b| a.name.cmp(&b.name));
            for fk in referencing {
                let Some(nested) = model.remove_by_constraint_name(&fk.name) else {
                    continue;
                };
                if self.processed.contains(&fk.child_table) {
                    debug!(
                        constraint = %fk.name,
                        table = %fk.child_table,
                        "table already planned, edge dropped"
                    );
                    continue;
                }
                let child = db.table(&fk.child_table).await?;
                let target = self
                    .build_node(db, child, fk.child_columns.clone(), nested)
                    .await?;
                self.link(index, target, &fk.parent_columns, fk.name)?;
            }

            if !model.is_consumed() {
                return Err(Error::UnknownConstraints {
                    table: table.name.to_string(),
                    constraints: model.remaining_constraints(),
                });
            }
            Ok(index)
        }
        .boxed()
    }

    fn link(
        &mut self,
        source: usize,
        target: usize,
        columns: &[String],
        constraint: String,
    ) -> Result<()> {
        let node = &mut self.nodes[source];
        let projection = node.positions_of(columns).ok_or_else(|| {
            Error::Database(seedbed_rdbc::Error::ColumnNotFound {
                table: node.table_name().to_string(),
                column: columns.join(", "),
            })
        })?;
        node.add_child(NodeLink {
            target,
            projection,
            constraint,
        });
        Ok(())
    }

    /// Seed the root with `initial_keys` and flush until nothing is pending
    /// or the row cap is reached.
    pub async fn run(&mut self, initial_keys: Vec<Vec<Value>>) -> Result<()> {
        let Some(root) = self.nodes.first_mut() else {
            return Ok(());
        };
        root.seed(initial_keys);

        let mut passes = 0u32;
        'drain: loop {
            let mut worked = false;
            for index in 0..self.nodes.len() {
                if !self.context.keep_running() {
                    debug!(rows = self.context.rows(), "row cap reached");
                    break 'drain;
                }
                let Some(dispatched) = self.nodes[index].flush(&self.context).await? else {
                    continue;
                };
                worked = true;
                for (target, key) in dispatched {
                    self.nodes[target].offer(key);
                }
            }
            passes += 1;
            if !worked {
                break;
            }
        }

        debug!(passes, rows = self.context.rows(), "drained execution plan");
        Ok(())
    }

    /// Release every node's output, even when an earlier one fails. Returns
    /// the first error.
    pub fn close(&mut self) -> Result<()> {
        let mut first_error = None;
        for node in &mut self.nodes {
            if let Err(e) = node.close(self.config.create_empty_files) {
                warn!(table = %node.table_name(), error = %e, "failed to close output");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Row counts of this plan
    pub fn report(&self, elapsed: Duration) -> ExtractionReport {
        let mut report = ExtractionReport {
            elapsed,
            ..Default::default()
        };
        for node in &self.nodes {
            if node.rows() > 0 {
                report.rows.insert(node.table_name().clone(), node.rows());
            }
            if node.skipped() > 0 {
                report.skipped.insert(node.table_name().clone(), node.skipped());
            }
        }
        report
    }

    /// Tables in build order
    pub fn tables(&self) -> Vec<&TableName> {
        self.nodes.iter().map(ExecutionNode::table_name).collect()
    }

    /// Nodes in build order
    pub fn nodes(&self) -> &[ExecutionNode] {
        &self.nodes
    }

    /// Plan-wide row accounting
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }
}
