//! Primary keys already captured in lower layers and in the active file.
//!
//! Keys are compared in their textual cell form, which is how they appear in
//! dataset files and what [`Value::to_cell`](seedbed_rdbc::Value::to_cell)
//! produces for fetched rows.

use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, warn};

use seedbed_rdbc::schema::Table;

use crate::dataset::{lower_layers, parse_header, table_path};
use crate::error::Result;

/// Textual primary-key tuple
pub type KeyCells = Vec<String>;

/// Primary keys a capture must not emit again
#[derive(Debug, Default)]
pub struct PrimaryKeyLayers {
    lower: HashSet<KeyCells>,
    active: HashSet<KeyCells>,
    enabled: bool,
}

impl PrimaryKeyLayers {
    /// Read the keys of `table` from the layers below `dataset` and from the
    /// dataset's own file. A table without a primary key gets a disabled set.
    pub fn read(root: &Path, dataset: &str, table: &Table) -> Result<Self> {
        let pk = table.primary_key_columns();
        if pk.is_empty() {
            debug!(table = %table.name, "no primary key, keeping every row");
            return Ok(Self::default());
        }

        let mut lower = HashSet::new();
        for layer in lower_layers(dataset) {
            lower.extend(read_keys(&table_path(root, layer, &table.name), pk)?);
        }
        let active = read_keys(&table_path(root, dataset, &table.name), pk)?;
        debug!(
            table = %table.name,
            lower = lower.len(),
            active = active.len(),
            "loaded captured keys"
        );

        Ok(Self {
            lower,
            active,
            enabled: true,
        })
    }

    /// Whether rows are deduplicated at all
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the key already lives in a lower layer
    pub fn in_lower_layer(&self, key: &[String]) -> bool {
        self.lower.contains(key)
    }

    /// Whether the key was captured anywhere
    pub fn contains(&self, key: &[String]) -> bool {
        self.lower.contains(key) || self.active.contains(key)
    }

    /// Record a key about to be written. Returns false when it was already
    /// captured, in which case the row must not be written.
    pub fn record(&mut self, key: KeyCells) -> bool {
        if !self.enabled {
            return true;
        }
        if self.lower.contains(&key) {
            return false;
        }
        self.active.insert(key)
    }
}

/// Primary-key tuples of a dataset file; empty when the file does not exist.
pub fn read_keys(path: &Path, pk: &[String]) -> Result<HashSet<KeyCells>> {
    let mut keys = HashSet::new();
    if !path.is_file() {
        return Ok(keys);
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let headers = reader.headers()?.clone();

    let mut positions = Vec::with_capacity(pk.len());
    for column in pk {
        match headers
            .iter()
            .position(|h| parse_header(h).0.eq_ignore_ascii_case(column))
        {
            Some(p) => positions.push(p),
            None => {
                warn!(
                    file = %path.display(),
                    column = %column,
                    "primary key column missing from header, keys not deduplicated"
                );
                return Ok(keys);
            }
        }
    }

    for record in reader.records() {
        let record = record?;
        keys.insert(
            positions
                .iter()
                .map(|&p| record.get(p).unwrap_or_default().to_string())
                .collect(),
        );
    }
    Ok(keys)
}
