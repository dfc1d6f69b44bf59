//! Configuration types for seedbed
//!
//! `SeedbedConfig` is the process-level configuration, loaded from YAML with
//! `${VAR}` / `${VAR:-default}` expansion. Per-call settings are derived from
//! it as [`PlanConfig`] (extraction) and [`LoadConfig`] (loading).

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use validator::{Validate, ValidationError};

use crate::error::{Error, Result};
use seedbed_rdbc::connection::ConnectionConfig;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Statement-size budget: bound parameters per key-filter statement.
/// Stays under SQL Server's 2100 parameter limit.
pub const DEFAULT_PARAMETER_BUDGET: usize = 2000;

/// Rows per insert flush
pub const DEFAULT_INSERT_BATCH_SIZE: usize = 100;

/// Cells longer than this are written empty
pub const DEFAULT_MAX_CELL_LENGTH: usize = 32_000;

/// A string that never shows up in logs or config dumps.
///
/// `Debug` and `Display` print `[REDACTED]`; serialization writes
/// `***REDACTED***`. Use [`SensitiveString::expose_secret`] to read it.
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    /// Create a new sensitive string from any string-like value
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    /// Expose the secret value.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

/// How foreign keys are neutralized around a load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Disable constraints in place, re-enable afterwards
    #[default]
    Disable,
    /// Drop constraints, recreate them from their captured definitions
    Drop,
}

/// Extraction mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionMode {
    /// Dry run: count rows, write nothing
    Count,
    /// Write captured rows to the dataset
    #[default]
    Save,
}

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SeedbedConfig {
    /// Database URL (`postgres://..` or `sqlserver://..`)
    #[validate(custom(function = "validate_connection_url"))]
    pub connection_url: SensitiveString,

    /// Directory holding one sub-directory per dataset layer
    #[serde(default = "default_datasets_root")]
    pub datasets_root: PathBuf,

    /// Constraint preparation strategy for loads
    #[serde(default)]
    pub strategy: StrategyKind,

    /// Re-validate existing rows when re-enabling constraints
    #[serde(default = "default_true")]
    pub validate_constraints: bool,

    /// Write header-only files for visited tables without rows
    #[serde(default)]
    pub create_empty_files: bool,

    /// Bound parameters per key-filter statement
    #[serde(default = "default_parameter_budget")]
    #[validate(range(min = 1, max = 65_535))]
    pub parameter_budget: usize,

    /// Rows per insert flush
    #[serde(default = "default_insert_batch_size")]
    #[validate(range(min = 1, max = 100_000))]
    pub insert_batch_size: usize,

    /// Longest cell written on extraction
    #[serde(default = "default_max_cell_length")]
    #[validate(range(min = 16))]
    pub max_cell_length: usize,

    /// Extra attempts at initial connection
    #[serde(default = "default_connect_retries")]
    #[validate(range(max = 100))]
    pub connect_retries: u32,

    /// Fixed delay between connection attempts
    #[serde(default = "default_connect_backoff_ms")]
    #[validate(range(max = 600_000))]
    pub connect_backoff_ms: u64,

    /// Timeout of a single connection attempt
    #[serde(default = "default_connect_timeout_ms")]
    #[validate(range(min = 100, max = 600_000))]
    pub connect_timeout_ms: u64,
}

fn validate_connection_url(url: &SensitiveString) -> std::result::Result<(), ValidationError> {
    let scheme = url.expose_secret().split("://").next().unwrap_or_default();
    match scheme {
        "postgres" | "postgresql" | "sqlserver" | "mssql" => Ok(()),
        _ => Err(ValidationError::new("connection_url")
            .with_message("expected a postgres:// or sqlserver:// URL".into())),
    }
}

fn default_datasets_root() -> PathBuf {
    PathBuf::from("./datasets")
}

fn default_true() -> bool {
    true
}

fn default_parameter_budget() -> usize {
    DEFAULT_PARAMETER_BUDGET
}

fn default_insert_batch_size() -> usize {
    DEFAULT_INSERT_BATCH_SIZE
}

fn default_max_cell_length() -> usize {
    DEFAULT_MAX_CELL_LENGTH
}

fn default_connect_retries() -> u32 {
    5
}

fn default_connect_backoff_ms() -> u64 {
    2_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl SeedbedConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| Error::config(format!("failed to parse config: {}", e)))?;
        config
            .validate()
            .map_err(|e| Error::config(format!("config validation failed: {}", e)))?;
        Ok(config)
    }

    /// Connection settings for the configured database
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new(self.connection_url.expose_secret())
            .with_connect_timeout(self.connect_timeout_ms)
    }

    /// Delay between connection attempts
    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    /// Extraction settings for one download into `dataset`
    pub fn plan_config(
        &self,
        dataset: &str,
        mode: ExecutionMode,
        row_cap: Option<u64>,
    ) -> Result<PlanConfig> {
        let mut plan = PlanConfig::new(&self.datasets_root, dataset, mode, row_cap)?;
        plan.parameter_budget = self.parameter_budget;
        plan.max_cell_length = self.max_cell_length;
        plan.create_empty_files = self.create_empty_files;
        Ok(plan)
    }

    /// Load settings
    pub fn load_config(&self) -> LoadConfig {
        LoadConfig {
            datasets_root: self.datasets_root.clone(),
            strategy: self.strategy,
            validate_constraints: self.validate_constraints,
            insert_batch_size: self.insert_batch_size,
        }
    }
}

/// Expand environment variables in the format ${VAR} or ${VAR:-default}
pub fn expand_env_vars(content: &str) -> String {
    ENV_VAR_REGEX
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());

            std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
        })
        .to_string()
}

/// Reject dataset names that would escape the datasets root
pub fn validate_dataset_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::config(format!("invalid dataset name '{}'", name)));
    }
    if name.contains(['/', '\\']) || name.chars().any(char::is_control) {
        return Err(Error::config(format!(
            "dataset name '{}' must be a single path segment",
            name.escape_debug()
        )));
    }
    Ok(())
}

/// Settings for one extraction plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanConfig {
    /// Directory holding the dataset layers
    pub datasets_root: PathBuf,
    /// Dataset the plan writes to
    pub dataset: String,
    /// Count only, or write files
    pub mode: ExecutionMode,
    /// Stop after this many captured rows
    pub row_cap: Option<u64>,
    /// Bound parameters per key-filter statement
    pub parameter_budget: usize,
    /// Longest cell written
    pub max_cell_length: usize,
    /// Write header-only files for visited tables without rows
    pub create_empty_files: bool,
}

impl PlanConfig {
    /// Validated plan settings with default limits
    pub fn new(
        datasets_root: impl Into<PathBuf>,
        dataset: &str,
        mode: ExecutionMode,
        row_cap: Option<u64>,
    ) -> Result<Self> {
        validate_dataset_name(dataset)?;
        Ok(Self {
            datasets_root: datasets_root.into(),
            dataset: dataset.to_string(),
            mode,
            row_cap,
            parameter_budget: DEFAULT_PARAMETER_BUDGET,
            max_cell_length: DEFAULT_MAX_CELL_LENGTH,
            create_empty_files: false,
        })
    }

    /// Directory of the dataset being written
    pub fn dataset_dir(&self) -> PathBuf {
        self.datasets_root.join(&self.dataset)
    }
}

/// Settings for loads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadConfig {
    /// Directory holding the dataset layers
    pub datasets_root: PathBuf,
    /// Constraint preparation strategy
    pub strategy: StrategyKind,
    /// Re-validate rows when re-enabling constraints
    pub validate_constraints: bool,
    /// Rows per insert flush
    pub insert_batch_size: usize,
}

impl LoadConfig {
    /// Load settings with defaults for everything but the root
    pub fn new(datasets_root: impl Into<PathBuf>) -> Self {
        Self {
            datasets_root: datasets_root.into(),
            strategy: StrategyKind::default(),
            validate_constraints: true,
            insert_batch_size: DEFAULT_INSERT_BATCH_SIZE,
        }
    }
}
