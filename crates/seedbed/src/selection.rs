//! Execution selection model: the caller's chosen subset of a dependency tree.
//!
//! Nested models are addressed purely by constraint name and consumed as the
//! plan walks the live schema. Anything left unconsumed names a constraint the
//! table does not have.

use serde::{Deserialize, Serialize};

/// One node of a selection tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableExecutionModel {
    /// Edge this model follows, `None` at the root
    #[serde(default, rename = "constraint", skip_serializing_if = "Option::is_none")]
    pub constraint_name: Option<String>,

    /// Extra row predicates ANDed into this table's fetch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub queries: Vec<String>,

    /// Edges to follow from this table
    #[serde(default, rename = "constraints", skip_serializing_if = "Vec::is_empty")]
    pub nested: Vec<TableExecutionModel>,
}

impl TableExecutionModel {
    /// A root model following the given edges
    pub fn root(nested: Vec<TableExecutionModel>) -> Self {
        Self {
            constraint_name: None,
            queries: Vec::new(),
            nested,
        }
    }

    /// A model following `constraint` and then `nested`
    pub fn edge(constraint: impl Into<String>, nested: Vec<TableExecutionModel>) -> Self {
        Self {
            constraint_name: Some(constraint.into()),
            queries: Vec::new(),
            nested,
        }
    }

    /// Remove and return the nested model for `constraint`
    pub fn remove_by_constraint_name(&mut self, constraint: &str) -> Option<TableExecutionModel> {
        let position = self
            .nested
            .iter()
            .position(|m| m.constraint_name.as_deref() == Some(constraint))?;
        Some(self.nested.remove(position))
    }

    /// Whether every nested model has been consumed
    pub fn is_consumed(&self) -> bool {
        self.nested.is_empty()
    }

    /// Constraint names still waiting to be consumed
    pub fn remaining_constraints(&self) -> Vec<String> {
        self.nested
            .iter()
            .map(|m| m.constraint_name.clone().unwrap_or_else(|| "<unnamed>".into()))
            .collect()
    }
}
