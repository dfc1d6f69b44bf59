//! Dependency graph model.
//!
//! [`expand`] walks a table's foreign keys in both directions: owned keys lead
//! to parent tables (lookup edges), keys elsewhere that reference the table
//! lead to child tables (cascade edges). The result is a pickable tree that a
//! caller prunes and converts into a [`TableExecutionModel`].
//!
//! Each constraint is expanded at most once per walk. This also terminates
//! cyclic schemas; a constraint reached again through another path shows up
//! only where it was first seen.

use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

use seedbed_rdbc::{Database, ForeignKey, TableName};

use crate::error::Result;
use crate::selection::TableExecutionModel;

/// Direction of a dependency edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    /// Owned foreign key, toward the parent table
    Lookup,
    /// Foreign key of another table, toward the child table
    Cascade,
}

/// One node of a dependency tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Table reached by this node
    pub table: TableName,
    /// Edge that reached it, `None` at the root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraint: Option<String>,
    /// Direction of that edge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<EdgeKind>,
    /// Expanded edges from this table
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Whether the caller wants this edge followed
    pub selected: bool,
    /// Lookup edges are needed for referential consistency
    pub mandatory: bool,
    /// Row count of the table, capped, when requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
}

impl Dependency {
    fn root(table: TableName) -> Self {
        Self {
            table,
            constraint: None,
            kind: None,
            dependencies: Vec::new(),
            selected: true,
            mandatory: true,
            row_count: None,
        }
    }

    fn edge(table: TableName, fk: &ForeignKey, kind: EdgeKind) -> Self {
        let mandatory = kind == EdgeKind::Lookup;
        Self {
            table,
            constraint: Some(fk.name.clone()),
            kind: Some(kind),
            dependencies: Vec::new(),
            selected: mandatory,
            mandatory,
            row_count: None,
        }
    }

    /// Mark the node reached through `constraint`, and every node on the path
    /// to it, as selected. Returns false when no node uses that constraint.
    pub fn select(&mut self, constraint: &str) -> bool {
        if self.constraint.as_deref() == Some(constraint) {
            self.selected = true;
            return true;
        }
        for child in &mut self.dependencies {
            if child.select(constraint) {
                self.selected = true;
                return true;
            }
        }
        false
    }

    /// Number of nodes in the tree
    pub fn len(&self) -> usize {
        1 + self.dependencies.iter().map(Dependency::len).sum::<usize>()
    }

    /// Whether the tree is only its root
    pub fn is_empty(&self) -> bool {
        self.dependencies.is_empty()
    }

    /// Selection model following every selected edge
    pub fn to_execution_model(&self) -> TableExecutionModel {
        TableExecutionModel {
            constraint_name: self.constraint.clone(),
            queries: Vec::new(),
            nested: self
                .dependencies
                .iter()
                .filter(|d| d.selected)
                .map(Dependency::to_execution_model)
                .collect(),
        }
    }
}

/// Expand `root` into its dependency tree.
///
/// With `count_cap`, every node carries the table's row count, counted up to
/// the cap.
pub async fn expand(db: &Database, root: &TableName, count_cap: Option<u64>) -> Result<Dependency> {
    let mut seen = HashSet::new();
    let mut tree = Dependency::root(root.clone());
    expand_into(db, &mut tree, &mut seen, count_cap).await?;
    debug!(table = %root, nodes = tree.len(), "expanded dependency tree");
    Ok(tree)
}

fn expand_into<'a>(
    db: &'a Database,
    node: &'a mut Dependency,
    seen: &'a mut HashSet<String>,
    count_cap: Option<u64>,
) -> BoxFuture<'a, Result<()>> {
    async move {
        let table = db.table(&node.table).await?;
        if count_cap.is_some() {
            node.row_count = Some(db.row_count(&node.table, count_cap).await?);
        }

        let mut owned = table.foreign_keys.clone();
        owned.sort_by(|a, b| a.name.cmp(&b.name));
        for fk in &owned {
            if seen.insert(fk.name.clone()) {
                let mut child = Dependency::edge(fk.parent_table.clone(), fk, EdgeKind::Lookup);
                expand_into(db, &mut child, seen, count_cap).await?;
                node.dependencies.push(child);
            }
        }

        let mut referencing = db.related_foreign_keys(&node.table).await?;
        referencing.sort_by(|a, b| a.name.cmp(&b.name));
        for fk in &referencing {
            if seen.insert(fk.name.clone()) {
                let mut child = Dependency::edge(fk.child_table.clone(), fk, EdgeKind::Cascade);
                expand_into(db, &mut child, seen, count_cap).await?;
                node.dependencies.push(child);
            }
        }
        Ok(())
    }
    .boxed()
}
