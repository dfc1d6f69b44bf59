//! Dataset layout on disk.
//!
//! `<root>/<dataset>/<catalog>/<schema>/<table>.csv`, one directory per
//! dataset. The `static` and `base` layers sit below every named dataset:
//! loads merge `static`, then `base`, then the requested datasets, later
//! layers replacing earlier ones file by file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use seedbed_rdbc::TableName;

use crate::error::{Error, Result};

/// Fixed reference rows, always reloaded
pub const STATIC_LAYER: &str = "static";

/// Common baseline shared by every scenario
pub const BASE_LAYER: &str = "base";

/// Extension of dataset table files
pub const FILE_EXTENSION: &str = "csv";

/// Header suffix marking a base64-encoded binary column
pub const BINARY_SUFFIX: &str = "*b64";

/// Split a header cell into its column name and whether it is binary
pub fn parse_header(cell: &str) -> (&str, bool) {
    match cell.strip_suffix(BINARY_SUFFIX) {
        Some(name) => (name, true),
        None => (cell, false),
    }
}

/// Header cell for a column
pub fn header_cell(column: &str, binary: bool) -> String {
    if binary {
        format!("{}{}", column, BINARY_SUFFIX)
    } else {
        column.to_string()
    }
}

/// Layers whose keys a capture into `dataset` must not repeat
pub fn lower_layers(dataset: &str) -> &'static [&'static str] {
    match dataset {
        STATIC_LAYER => &[],
        BASE_LAYER => &[STATIC_LAYER],
        _ => &[STATIC_LAYER, BASE_LAYER],
    }
}

/// One table file of a dataset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFile {
    /// Table the file holds rows for
    pub table: TableName,
    /// Location of the file
    pub path: PathBuf,
    /// Dataset (layer) the file comes from
    pub dataset: String,
}

/// Read access to the datasets root
#[derive(Debug, Clone)]
pub struct DatasetRepository {
    root: PathBuf,
}

impl DatasetRepository {
    /// Repository over `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Datasets root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of a dataset
    pub fn dataset_dir(&self, dataset: &str) -> PathBuf {
        self.root.join(dataset)
    }

    /// Whether a dataset directory exists
    pub fn exists(&self, dataset: &str) -> bool {
        self.dataset_dir(dataset).is_dir()
    }

    /// File holding `table` in `dataset`
    pub fn table_path(&self, dataset: &str, table: &TableName) -> PathBuf {
        table_path(&self.root, dataset, table)
    }

    /// Every table file of one dataset, ordered by table
    pub fn files(&self, dataset: &str) -> Result<Vec<DataFile>> {
        let dir = self.dataset_dir(dataset);
        if !dir.is_dir() {
            return Err(Error::DatasetNotFound {
                name: dataset.to_string(),
                root: self.root.clone(),
            });
        }

        let mut files = Vec::new();
        for catalog in subdirectories(&dir)? {
            for schema in subdirectories(&catalog)? {
                for entry in std::fs::read_dir(&schema)? {
                    let path = entry?.path();
                    if !path.is_file()
                        || path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION)
                    {
                        continue;
                    }
                    let (Some(c), Some(s), Some(t)) =
                        (file_name(&catalog), file_name(&schema), file_stem(&path))
                    else {
                        continue;
                    };
                    files.push(DataFile {
                        table: TableName::new(c, s, t),
                        path,
                        dataset: dataset.to_string(),
                    });
                }
            }
        }
        files.sort_by(|a, b| a.table.cmp(&b.table));
        Ok(files)
    }

    /// Merge the files of `static`, `base` and the requested datasets.
    ///
    /// `static` and `base` are optional; every requested dataset must exist.
    /// Later layers replace earlier files for the same table.
    pub fn resolve(&self, datasets: &[String]) -> Result<Vec<DataFile>> {
        let mut layers: Vec<&str> = Vec::new();
        for layer in [STATIC_LAYER, BASE_LAYER] {
            if self.exists(layer) {
                layers.push(layer);
            }
        }
        for name in datasets {
            crate::config::validate_dataset_name(name)?;
            if !self.exists(name) {
                return Err(Error::DatasetNotFound {
                    name: name.clone(),
                    root: self.root.clone(),
                });
            }
            if !layers.contains(&name.as_str()) {
                layers.push(name);
            }
        }

        let mut merged: BTreeMap<TableName, DataFile> = BTreeMap::new();
        for layer in layers {
            for file in self.files(layer)? {
                if let Some(replaced) = merged.insert(file.table.clone(), file) {
                    debug!(table = %replaced.table, layer = %replaced.dataset, "file overridden");
                }
            }
        }
        Ok(merged.into_values().collect())
    }
}

/// File holding `table` in `dataset` under `root`
pub fn table_path(root: &Path, dataset: &str, table: &TableName) -> PathBuf {
    root.join(dataset)
        .join(&table.catalog)
        .join(&table.schema)
        .join(format!("{}.{}", table.table, FILE_EXTENSION))
}

fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()?.to_str().map(str::to_string)
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem()?.to_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(root: &Path, dataset: &str, table: &str) -> PathBuf {
        let path = table_path(root, dataset, &TableName::new("shop", "public", table));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "id\n").unwrap();
        path
    }

    #[test]
    fn test_header_cells() {
        assert_eq!(parse_header("photo*b64"), ("photo", true));
        assert_eq!(parse_header("name"), ("name", false));
        assert_eq!(header_cell("photo", true), "photo*b64");
    }

    #[test]
    fn test_lower_layers() {
        assert!(lower_layers("static").is_empty());
        assert_eq!(lower_layers("base"), &["static"]);
        assert_eq!(lower_layers("smoke"), &["static", "base"]);
    }

    #[test]
    fn test_resolve_layers_override_by_file() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "static", "countries");
        touch(dir.path(), "static", "customers");
        touch(dir.path(), "base", "customers");
        let smoke = touch(dir.path(), "smoke", "customers");
        touch(dir.path(), "smoke", "invoices");

        let repo = DatasetRepository::new(dir.path());
        let files = repo.resolve(&["smoke".to_string()]).unwrap();
        let tables: Vec<&str> = files.iter().map(|f| f.table.table.as_str()).collect();
        assert_eq!(tables, vec!["countries", "customers", "invoices"]);

        let customers = files.iter().find(|f| f.table.table == "customers").unwrap();
        assert_eq!(customers.path, smoke);
        assert_eq!(customers.dataset, "smoke");
    }

    #[test]
    fn test_resolve_missing_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let repo = DatasetRepository::new(dir.path());
        let err = repo.resolve(&["nope".to_string()]).unwrap_err();
        assert!(matches!(err, Error::DatasetNotFound { .. }));

        // static and base are optional
        touch(dir.path(), "smoke", "invoices");
        assert_eq!(repo.resolve(&["smoke".to_string()]).unwrap().len(), 1);
    }

    #[test]
    fn test_non_csv_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let csv = touch(dir.path(), "smoke", "invoices");
        std::fs::write(csv.with_extension("txt"), "notes").unwrap();

        let files = DatasetRepository::new(dir.path()).files("smoke").unwrap();
        assert_eq!(files.len(), 1);
    }
}
