//! Schema model and discovery for seedbed-rdbc
//!
//! Provides:
//! - Table identity (`TableName`) and foreign-key edges (`ForeignKey`)
//! - Table, column, index and primary-key metadata
//! - `ColumnType`: the closed set of cell binders used to turn dataset text into values
//! - `SchemaProvider`: read-only schema discovery, implemented per backend

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::types::{Value, DATETIME_FORMAT, DATE_FORMAT, TIME_FORMAT};

/// Fully qualified table identity: `(catalog, schema, table)`.
///
/// Equality and hashing cover all three parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableName {
    /// Catalog (database) name
    pub catalog: String,
    /// Schema name
    pub schema: String,
    /// Table name
    pub table: String,
}

impl TableName {
    /// Create a table name from its three parts
    pub fn new(
        catalog: impl Into<String>,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            catalog: catalog.into(),
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Parse `catalog.schema.table`, `schema.table` or `table`, filling the
    /// missing leading parts from the given defaults.
    pub fn parse_with_defaults(name: &str, catalog: &str, schema: &str) -> Result<Self> {
        let parts: Vec<&str> = name.split('.').map(str::trim).collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(Error::config(format!("invalid table name '{}'", name)));
        }
        match parts.as_slice() {
            [table] => Ok(Self::new(catalog, schema, *table)),
            [s, table] => Ok(Self::new(catalog, *s, *table)),
            [c, s, table] => Ok(Self::new(*c, *s, *table)),
            _ => Err(Error::config(format!("invalid table name '{}'", name))),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.catalog, self.schema, self.table)
    }
}

/// Foreign key referential action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ForeignKeyAction {
    /// No action (default)
    #[default]
    NoAction,
    /// Restrict deletion
    Restrict,
    /// Cascade delete/update
    Cascade,
    /// Set to NULL
    SetNull,
    /// Set to default value
    SetDefault,
}

impl ForeignKeyAction {
    /// Convert to SQL string
    pub fn to_sql(&self) -> &'static str {
        match self {
            Self::NoAction => "NO ACTION",
            Self::Restrict => "RESTRICT",
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
        }
    }

    /// Parse a referential rule as reported by a catalog.
    ///
    /// Accepts the standard spelling (`SET NULL`), the SQL Server spelling
    /// (`SET_NULL`) and the single-letter `pg_constraint` codes.
    pub fn parse(rule: &str) -> Self {
        match rule.trim().to_uppercase().replace('_', " ").as_str() {
            "CASCADE" | "C" => Self::Cascade,
            "RESTRICT" | "R" => Self::Restrict,
            "SET NULL" | "N" => Self::SetNull,
            "SET DEFAULT" | "D" => Self::SetDefault,
            _ => Self::NoAction,
        }
    }
}

/// A foreign-key edge: `child_table(child_columns)` references
/// `parent_table(parent_columns)`. Column lists are ordered and of equal length.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Constraint name
    pub name: String,
    /// Referenced table
    pub parent_table: TableName,
    /// Referenced columns
    pub parent_columns: Vec<String>,
    /// Owning (referencing) table
    pub child_table: TableName,
    /// Referencing columns
    pub child_columns: Vec<String>,
    /// ON DELETE action
    #[serde(default)]
    pub on_delete: ForeignKeyAction,
    /// ON UPDATE action
    #[serde(default)]
    pub on_update: ForeignKeyAction,
}

impl ForeignKey {
    /// Whether either endpoint of this edge is `table`
    pub fn touches(&self, table: &TableName) -> bool {
        &self.parent_table == table || &self.child_table == table
    }
}

/// Closed set of column binders.
///
/// Each variant knows how to bind a textual cell into a typed [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// BOOLEAN, BIT
    Boolean,
    /// SMALLINT, TINYINT
    SmallInt,
    /// INTEGER
    Integer,
    /// BIGINT
    BigInt,
    /// REAL
    Real,
    /// DOUBLE PRECISION, FLOAT
    Double,
    /// NUMERIC, DECIMAL, MONEY
    Decimal,
    /// CHAR, VARCHAR, TEXT and their national variants
    Text,
    /// BYTEA, BINARY, VARBINARY, IMAGE
    Binary,
    /// DATE
    Date,
    /// TIME
    Time,
    /// TIMESTAMP, DATETIME, DATETIME2, SMALLDATETIME
    Timestamp,
    /// TIMESTAMPTZ, DATETIMEOFFSET
    TimestampTz,
    /// UUID, UNIQUEIDENTIFIER
    Uuid,
    /// JSON, JSONB
    Json,
}

impl ColumnType {
    /// Map a vendor type name to a binder. Unknown types return `None`
    /// and are treated as non-loadable.
    pub fn from_sql_type(type_name: &str) -> Option<Self> {
        let lower = type_name.trim().to_lowercase();
        let base = lower.split('(').next().unwrap_or_default().trim();
        let ty = match base {
            "boolean" | "bool" | "bit" => Self::Boolean,
            "smallint" | "int2" | "tinyint" | "smallserial" => Self::SmallInt,
            "integer" | "int" | "int4" | "serial" => Self::Integer,
            "bigint" | "int8" | "bigserial" => Self::BigInt,
            "real" | "float4" => Self::Real,
            "double precision" | "float8" | "float" => Self::Double,
            "numeric" | "decimal" | "money" | "smallmoney" => Self::Decimal,
            "character varying" | "varchar" | "character" | "char" | "bpchar" | "text"
            | "nvarchar" | "nchar" | "ntext" | "name" | "citext" | "xml" | "sysname" => Self::Text,
            "bytea" | "binary" | "varbinary" | "image" | "rowversion" => Self::Binary,
            "date" => Self::Date,
            "time" | "time without time zone" => Self::Time,
            "timestamp" | "timestamp without time zone" | "datetime" | "datetime2"
            | "smalldatetime" => Self::Timestamp,
            "timestamptz" | "timestamp with time zone" | "datetimeoffset" => Self::TimestampTz,
            "uuid" | "uniqueidentifier" => Self::Uuid,
            "json" | "jsonb" => Self::Json,
            _ => return None,
        };
        Some(ty)
    }

    /// Whether cells of this type are base64 encoded in dataset files
    #[inline]
    pub fn is_binary(self) -> bool {
        matches!(self, Self::Binary)
    }

    /// Bind a textual cell. An empty cell binds to NULL.
    pub fn bind(self, text: &str) -> Result<Value> {
        if text.is_empty() {
            return Ok(Value::Null);
        }
        let bad = |e: &dyn fmt::Display| {
            Error::type_conversion(format!("cannot bind '{}' as {:?}: {}", text, self, e))
        };
        let value = match self {
            Self::Boolean => match text.trim().to_lowercase().as_str() {
                "true" | "t" | "1" | "yes" | "y" => Value::Bool(true),
                "false" | "f" | "0" | "no" | "n" => Value::Bool(false),
                _ => return Err(bad(&"not a boolean")),
            },
            Self::SmallInt => Value::Int16(text.trim().parse().map_err(|e| bad(&e))?),
            Self::Integer => Value::Int32(text.trim().parse().map_err(|e| bad(&e))?),
            Self::BigInt => Value::Int64(text.trim().parse().map_err(|e| bad(&e))?),
            Self::Real => Value::Float32(text.trim().parse().map_err(|e| bad(&e))?),
            Self::Double => Value::Float64(text.trim().parse().map_err(|e| bad(&e))?),
            Self::Decimal => Value::Decimal(Decimal::from_str(text.trim()).map_err(|e| bad(&e))?),
            Self::Text => Value::String(text.to_string()),
            Self::Binary => Value::Bytes(BASE64.decode(text.trim()).map_err(|e| bad(&e))?),
            Self::Date => Value::Date(
                NaiveDate::parse_from_str(text.trim(), DATE_FORMAT).map_err(|e| bad(&e))?,
            ),
            Self::Time => Value::Time(
                NaiveTime::parse_from_str(text.trim(), TIME_FORMAT).map_err(|e| bad(&e))?,
            ),
            Self::Timestamp => Value::DateTime(parse_timestamp(text.trim()).ok_or_else(|| {
                bad(&"expected yyyy-mm-dd hh:mm:ss[.fff]")
            })?),
            Self::TimestampTz => match DateTime::parse_from_rfc3339(text.trim()) {
                Ok(dt) => Value::DateTimeTz(dt.with_timezone(&Utc)),
                Err(_) => {
                    let naive = parse_timestamp(text.trim())
                        .ok_or_else(|| bad(&"expected an RFC 3339 timestamp"))?;
                    Value::DateTimeTz(Utc.from_utc_datetime(&naive))
                }
            },
            Self::Uuid => Value::Uuid(Uuid::parse_str(text.trim()).map_err(|e| bad(&e))?),
            Self::Json => Value::Json(serde_json::from_str(text).map_err(|e| bad(&e))?),
        };
        Ok(value)
    }

    /// Bind a local wall-clock timestamp (the result of a date expression)
    pub fn bind_datetime(self, at: NaiveDateTime) -> Result<Value> {
        match self {
            Self::Date => Ok(Value::Date(at.date())),
            Self::Time => Ok(Value::Time(at.time())),
            Self::Timestamp => Ok(Value::DateTime(at)),
            Self::TimestampTz => Local
                .from_local_datetime(&at)
                .earliest()
                .map(|dt| Value::DateTimeTz(dt.with_timezone(&Utc)))
                .ok_or_else(|| Error::type_conversion(format!("nonexistent local time {}", at))),
            Self::Text => Ok(Value::String(at.format(DATETIME_FORMAT).to_string())),
            other => Err(Error::type_conversion(format!(
                "date expression cannot be bound as {:?}",
                other
            ))),
        }
    }
}

fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, DATETIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(text, DATE_FORMAT)
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

/// Column metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Vendor type name as reported by the catalog
    pub type_name: String,
    /// Binder, `None` for types that cannot be loaded from text
    pub column_type: Option<ColumnType>,
    /// Whether the column accepts NULL
    pub nullable: bool,
    /// Identity / serial column
    pub auto_increment: bool,
}

impl Column {
    /// Create a column, resolving its binder from the type name
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        let type_name = type_name.into();
        Self {
            name: name.into(),
            column_type: ColumnType::from_sql_type(&type_name),
            type_name,
            nullable: true,
            auto_increment: false,
        }
    }

    /// Mark as NOT NULL
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Mark as identity / autoincrement
    pub fn identity(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Whether values of this column are base64 encoded in files
    pub fn is_binary(&self) -> bool {
        self.column_type.is_some_and(ColumnType::is_binary)
    }
}

/// Primary key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryKey {
    /// Constraint name
    pub name: Option<String>,
    /// Key columns in key order
    pub columns: Vec<String>,
}

/// Index metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Index {
    /// Index name
    pub name: String,
    /// Column names (in order)
    pub columns: Vec<String>,
    /// Whether the index is unique
    pub unique: bool,
}

/// Table metadata. `foreign_keys` lists only edges owned by this table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    /// Table identity
    pub name: TableName,
    /// Columns in ordinal order
    pub columns: Vec<Column>,
    /// Indexes
    #[serde(default)]
    pub indexes: Vec<Index>,
    /// Primary key, if declared
    pub primary_key: Option<PrimaryKey>,
    /// Foreign keys where this table is the child
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

impl Table {
    /// Create an empty table definition
    pub fn new(name: TableName) -> Self {
        Self {
            name,
            columns: Vec::new(),
            indexes: Vec::new(),
            primary_key: None,
            foreign_keys: Vec::new(),
        }
    }

    /// Get column by name (case-insensitive)
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Position of a column (case-insensitive)
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Primary key column names, empty when the table has no primary key
    pub fn primary_key_columns(&self) -> &[String] {
        self.primary_key
            .as_ref()
            .map(|pk| pk.columns.as_slice())
            .unwrap_or_default()
    }

    /// Identity column, if any
    pub fn identity_column(&self) -> Option<&Column> {
        self.columns.iter().find(|c| c.auto_increment)
    }

    /// Owned foreign key by constraint name
    pub fn foreign_key(&self, name: &str) -> Option<&ForeignKey> {
        self.foreign_keys.iter().find(|fk| fk.name == name)
    }
}

/// Schema provider for read-only schema discovery
#[async_trait]
pub trait SchemaProvider: Send + Sync {
    /// The connection's current `(catalog, schema)`
    async fn current_namespace(&self) -> Result<(String, String)>;

    /// Table metadata including primary key, indexes and owned foreign keys
    async fn get_table(&self, name: &TableName) -> Result<Option<Table>>;

    /// Foreign keys owned by other tables that reference `name`
    async fn related_foreign_keys(&self, name: &TableName) -> Result<Vec<ForeignKey>>;

    /// Check if a table exists
    async fn table_exists(&self, name: &TableName) -> Result<bool> {
        Ok(self.get_table(name).await?.is_some())
    }
}
