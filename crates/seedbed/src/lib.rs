//! # seedbed
//!
//! Referentially consistent seed data for database-backed test environments.
//!
//! Two subsystems share one dependency model:
//!
//! - **Selective extraction**: walk a table's foreign keys toward parents
//!   (lookup edges) and dependents (cascade edges), fetch matching rows in
//!   batched multi-key queries and write them to per-table files, skipping
//!   rows already captured in the `static` and `base` layers.
//! - **Referential loading**: merge layered datasets, relax every foreign key
//!   touching the affected tables, replace their rows and restore the
//!   constraints.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use seedbed::prelude::*;
//!
//! let settings = SeedbedConfig::from_file(Path::new("seedbed.yaml"))?;
//! let db = Database::connect(
//!     &settings.connection_config(),
//!     settings.connect_retries,
//!     settings.connect_backoff(),
//! )
//! .await?;
//!
//! let request = ExtractionRequest::from_file(Path::new("invoices.json"))?;
//! let report = Downloader::new(&db).execute(request, &settings).await?;
//!
//! let loaded = Populator::new(&db, settings.load_config())
//!     .load(&["smoke".to_string()])
//!     .await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod context;
pub mod dataset;
pub mod datefn;
pub mod download;
pub mod error;
pub mod fetcher;
pub mod graph;
pub mod layers;
pub mod output;
pub mod plan;
pub mod populator;
pub mod selection;
pub mod strategy;

pub use seedbed_rdbc;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{
        ExecutionMode, LoadConfig, PlanConfig, SeedbedConfig, SensitiveString, StrategyKind,
    };
    pub use crate::dataset::{DataFile, DatasetRepository};
    pub use crate::download::{Downloader, ExtractionRequest, KeyFilter};
    pub use crate::error::{Error, Result};
    pub use crate::graph::{expand, Dependency, EdgeKind};
    pub use crate::plan::{ExecutionPlan, ExtractionReport};
    pub use crate::populator::{LoadReport, Populator};
    pub use crate::selection::TableExecutionModel;
    pub use crate::strategy::{strategy_for, PreparationStrategy};

    pub use seedbed_rdbc::{Database, ForeignKey, Table, TableName, Value};
}

pub use config::{ExecutionMode, PlanConfig, SeedbedConfig};
pub use download::{Downloader, ExtractionRequest, KeyFilter};
pub use error::{Error, Result};
pub use plan::{ExecutionPlan, ExtractionReport};
pub use populator::{LoadReport, Populator};
pub use selection::TableExecutionModel;
