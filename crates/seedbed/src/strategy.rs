//! Preparation strategies: relax referential integrity around a bulk load.
//!
//! Both strategies suppress the same set of foreign keys: every key owned by
//! an affected table plus every key elsewhere that references one. They differ
//! only in how: [`DisableStrategy`] switches enforcement off in place,
//! [`DropStrategy`] drops the constraints and recreates them afterwards.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

use seedbed_rdbc::{Database, ForeignKey, TableName};

use crate::config::StrategyKind;
use crate::error::{Error, Result};

/// Before/after bracket around the inserts of one load
#[async_trait]
pub trait PreparationStrategy: Send + Sync {
    /// Strategy name for logs
    fn name(&self) -> &'static str;

    /// Foreign keys this strategy suppresses
    fn foreign_keys(&self) -> &[ForeignKey];

    /// Relax the constraints and empty the affected tables
    async fn before_inserts(&mut self, db: &Database) -> Result<()>;

    /// Restore the constraints. Must be called even when inserts failed.
    async fn after_inserts(&mut self, db: &Database) -> Result<()>;
}

/// Keys among `candidates` with an endpoint in `affected`, deduplicated and
/// ordered by owning table and name.
pub fn suppression_closure(
    affected: &BTreeSet<TableName>,
    candidates: impl IntoIterator<Item = ForeignKey>,
) -> Vec<ForeignKey> {
    let mut closure = BTreeMap::new();
    for fk in candidates {
        if affected.contains(&fk.child_table) || affected.contains(&fk.parent_table) {
            closure
                .entry((fk.child_table.clone(), fk.name.clone()))
                .or_insert(fk);
        }
    }
    closure.into_values().collect()
}

/// Foreign keys to suppress when loading `tables`: owned keys of each table
/// and keys elsewhere referencing it.
pub async fn suppressed_foreign_keys(
    db: &Database,
    tables: &[TableName],
) -> Result<Vec<ForeignKey>> {
    let affected: BTreeSet<TableName> = tables.iter().cloned().collect();
    let mut candidates = Vec::new();
    for name in tables {
        let table = db.table(name).await?;
        candidates.extend(table.foreign_keys.iter().cloned());
        candidates.extend(db.related_foreign_keys(name).await?);
    }
    Ok(suppression_closure(&affected, candidates))
}

/// Build the configured strategy over `tables`
pub fn strategy_for(
    kind: StrategyKind,
    tables: Vec<TableName>,
    foreign_keys: Vec<ForeignKey>,
    validate: bool,
) -> Box<dyn PreparationStrategy> {
    match kind {
        StrategyKind::Disable => Box::new(DisableStrategy::new(tables, foreign_keys, validate)),
        StrategyKind::Drop => Box::new(DropStrategy::new(tables, foreign_keys)),
    }
}

async fn delete_all(db: &Database, tables: &[TableName]) -> Result<()> {
    for table in tables {
        db.delete_rows(table).await?;
    }
    Ok(())
}

/// Switch enforcement off in place and back on afterwards
#[derive(Debug)]
pub struct DisableStrategy {
    tables: Vec<TableName>,
    foreign_keys: Vec<ForeignKey>,
    validate: bool,
}

impl DisableStrategy {
    /// Strategy over `tables`; `validate` re-checks existing rows on enable
    pub fn new(tables: Vec<TableName>, foreign_keys: Vec<ForeignKey>, validate: bool) -> Self {
        Self {
            tables,
            foreign_keys,
            validate,
        }
    }
}

#[async_trait]
impl PreparationStrategy for DisableStrategy {
    fn name(&self) -> &'static str {
        "disable"
    }

    fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    async fn before_inserts(&mut self, db: &Database) -> Result<()> {
        info!(
            constraints = self.foreign_keys.len(),
            tables = self.tables.len(),
            "disabling constraints"
        );
        db.disable_foreign_keys(&self.foreign_keys).await?;
        delete_all(db, &self.tables).await
    }

    async fn after_inserts(&mut self, db: &Database) -> Result<()> {
        db.enable_foreign_keys(&self.foreign_keys, self.validate)
            .await
            .map_err(|e| Error::Restore(e.to_string()))?;
        info!(constraints = self.foreign_keys.len(), "enabled constraints");
        Ok(())
    }
}

/// Drop the constraints and recreate them from their captured definitions
#[derive(Debug)]
pub struct DropStrategy {
    tables: Vec<TableName>,
    foreign_keys: Vec<ForeignKey>,
    dropped: Vec<ForeignKey>,
}

impl DropStrategy {
    /// Strategy over `tables`
    pub fn new(tables: Vec<TableName>, foreign_keys: Vec<ForeignKey>) -> Self {
        Self {
            tables,
            foreign_keys,
            dropped: Vec::new(),
        }
    }
}

#[async_trait]
impl PreparationStrategy for DropStrategy {
    fn name(&self) -> &'static str {
        "drop"
    }

    fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    async fn before_inserts(&mut self, db: &Database) -> Result<()> {
        info!(
            constraints = self.foreign_keys.len(),
            tables = self.tables.len(),
            "dropping constraints"
        );
        for fk in &self.foreign_keys {
            db.drop_foreign_key(fk).await?;
            self.dropped.push(fk.clone());
        }
        delete_all(db, &self.tables).await
    }

    async fn after_inserts(&mut self, db: &Database) -> Result<()> {
        let mut failed = Vec::new();
        for fk in std::mem::take(&mut self.dropped) {
            if let Err(e) = db.create_foreign_key(&fk).await {
                warn!(
                    constraint = %fk.name,
                    table = %fk.child_table,
                    error = %e,
                    "failed to recreate constraint"
                );
                failed.push(format!("{}: {}", fk.name, e));
            }
        }
        if !failed.is_empty() {
            return Err(Error::Restore(failed.join("; ")));
        }
        info!(constraints = self.foreign_keys.len(), "recreated constraints");
        Ok(())
    }
}
