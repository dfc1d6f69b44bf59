//! Backend-neutral session traits
//!
//! A [`Connection`] is one session against the target database. Extraction
//! reads through [`PreparedStatement::query_stream`] so large key batches are
//! not buffered twice; loading drives [`PreparedStatement::execute_batch`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Result;
use crate::types::{Row, Value};

/// One database session
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run a statement and collect its rows
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Run DDL or DML; returns the affected row count where the backend reports one
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Compile `sql` once for many parameter sets
    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>>;

    /// First row of a query, if any
    async fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// Cheap liveness check
    async fn is_valid(&self) -> bool;

    /// End the session; later calls fail with a connection error
    async fn close(&self) -> Result<()>;
}

/// Statement compiled by [`Connection::prepare`]
#[async_trait]
pub trait PreparedStatement: Send + Sync {
    /// Run once with `params`
    async fn execute(&self, params: &[Value]) -> Result<u64>;

    /// Run once per parameter set; stops at the first failure
    async fn execute_batch(&self, batch: &[Vec<Value>]) -> Result<u64> {
        let mut total = 0;
        for params in batch {
            total += self.execute(params).await?;
        }
        Ok(total)
    }

    /// Rows produced for `params`, pulled one at a time
    async fn query_stream(&self, params: &[Value]) -> Result<Box<dyn RowStream>>;

    /// Rows produced for `params`, collected
    async fn query(&self, params: &[Value]) -> Result<Vec<Row>> {
        let mut stream = self.query_stream(params).await?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }

    /// Statement text, for diagnostics
    fn sql(&self) -> &str;
}

/// Pull-based result cursor
pub trait RowStream: Send {
    /// `Ok(None)` once the result is exhausted
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Row>>> + Send + '_>>;
}

/// Row stream over an already materialized result
pub struct VecRowStream {
    rows: std::vec::IntoIter<Row>,
}

impl VecRowStream {
    /// Wrap materialized rows
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: rows.into_iter(),
        }
    }
}

impl RowStream for VecRowStream {
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Row>>> + Send + '_>> {
        Box::pin(async move { Ok(self.rows.next()) })
    }
}

/// Where and how to open a session
///
/// `Debug` masks the URL password.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// `postgres://` or `sqlserver://` URL, credentials included
    pub url: String,
    /// Budget for one connect attempt
    pub connect_timeout_ms: u64,
    /// Reported to the server so seeding sessions are recognizable
    pub application_name: Option<String>,
    /// Backend-specific switches, e.g. `trust_cert` for SQL Server
    pub properties: HashMap<String, String>,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("url", &redact_url(&self.url))
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("application_name", &self.application_name)
            .field("properties", &self.properties)
            .finish()
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            connect_timeout_ms: 10_000,
            application_name: Some("seedbed".into()),
            properties: HashMap::new(),
        }
    }
}

impl ConnectionConfig {
    /// Defaults for everything but the URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    #[allow(missing_docs)]
    pub fn with_connect_timeout(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    #[allow(missing_docs)]
    pub fn with_application_name(mut self, name: impl Into<String>) -> Self {
        self.application_name = Some(name.into());
        self
    }

    #[allow(missing_docs)]
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Backend selected by the URL scheme
    pub fn database_type(&self) -> DatabaseType {
        match self.url.split("://").next().unwrap_or_default() {
            "postgres" | "postgresql" => DatabaseType::PostgreSQL,
            "sqlserver" | "mssql" => DatabaseType::SqlServer,
            _ => DatabaseType::Unknown,
        }
    }
}

/// Replace the password of a connection URL for logging
pub fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "***".to_string(),
    }
}

/// Opens sessions for one backend
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// One connect attempt
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>>;

    /// Backend this factory talks to
    fn database_type(&self) -> DatabaseType;
}

/// Open a connection, retrying retriable failures with a fixed backoff.
///
/// A cold-starting database refuses connections for a while; only the
/// initial acquisition is retried. Non-retriable errors return immediately.
pub async fn connect_with_retry(
    factory: &dyn ConnectionFactory,
    config: &ConnectionConfig,
    attempts: u32,
    backoff: Duration,
) -> Result<Box<dyn Connection>> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match factory.connect(config).await {
            Ok(conn) => {
                debug!(attempt, database = %factory.database_type(), "connected");
                return Ok(conn);
            }
            Err(e) if e.is_retriable() && attempt < attempts => {
                warn!(
                    attempt,
                    attempts,
                    error = %e,
                    "connection failed, retrying in {:?}",
                    backoff
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Supported backends, picked from the URL scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum DatabaseType {
    PostgreSQL,
    SqlServer,
    /// Scheme not recognized; treated as PostgreSQL-compatible SQL
    Unknown,
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::SqlServer => "SQL Server",
            Self::Unknown => "Unknown",
        })
    }
}
