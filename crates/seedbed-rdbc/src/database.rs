//! The `Database` capability: one connection, its dialect and its schema view.
//!
//! Everything the extraction planner and the load engine need from a backend
//! goes through this type: table metadata (cached per instance), identifier
//! quoting, constraint relaxation, row deletion, capped row counts and the
//! batched [`Inserter`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::{
    connect_with_retry, redact_url, Connection, ConnectionConfig, ConnectionFactory, DatabaseType,
    PreparedStatement,
};
use crate::dialect::{dialect_for, SqlDialect};
use crate::error::{Error, Result};
use crate::schema::{ForeignKey, SchemaProvider, Table, TableName};
use crate::types::Value;

/// Default number of rows sent per insert flush
pub const DEFAULT_INSERT_BATCH: usize = 100;

/// A connected database together with its dialect and schema provider
pub struct Database {
    conn: Arc<dyn Connection>,
    dialect: Box<dyn SqlDialect>,
    schema: Arc<dyn SchemaProvider>,
    catalog: String,
    default_schema: String,
    tables: Mutex<HashMap<TableName, Option<Arc<Table>>>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("dialect", &self.dialect.name())
            .field("catalog", &self.catalog)
            .field("schema", &self.default_schema)
            .finish()
    }
}

impl Database {
    /// Connect using the backend selected by the URL scheme.
    ///
    /// Retriable connection failures are retried `retries` times with a fixed
    /// `backoff`; nothing is retried once the connection is up.
    pub async fn connect(config: &ConnectionConfig, retries: u32, backoff: Duration) -> Result<Self> {
        let database_type = config.database_type();
        let factory: Box<dyn ConnectionFactory> = match database_type {
            #[cfg(feature = "postgres")]
            DatabaseType::PostgreSQL => Box::new(crate::postgres::PgConnectionFactory),
            #[cfg(feature = "sqlserver")]
            DatabaseType::SqlServer => Box::new(crate::sqlserver::SqlServerConnectionFactory),
            other => {
                return Err(Error::config(format!(
                    "no backend available for '{}' ({})",
                    redact_url(&config.url),
                    other
                )))
            }
        };

        let conn: Arc<dyn Connection> =
            Arc::from(connect_with_retry(factory.as_ref(), config, retries + 1, backoff).await?);

        let schema: Arc<dyn SchemaProvider> = match database_type {
            #[cfg(feature = "postgres")]
            DatabaseType::PostgreSQL => {
                Arc::new(crate::postgres::PgSchemaProvider::new(Arc::clone(&conn)))
            }
            #[cfg(feature = "sqlserver")]
            DatabaseType::SqlServer => {
                Arc::new(crate::sqlserver::SqlServerSchemaProvider::new(Arc::clone(&conn)))
            }
            other => return Err(Error::unsupported(format!("schema discovery for {}", other))),
        };

        let db = Self::from_parts(conn, dialect_for(database_type), schema).await?;
        info!(
            url = %redact_url(&config.url),
            catalog = %db.catalog,
            schema = %db.default_schema,
            "connected to {}",
            db.dialect.name()
        );
        Ok(db)
    }

    /// Assemble a database from an open connection, a dialect and a schema
    /// provider. Reads the connection's current catalog and schema.
    pub async fn from_parts(
        conn: Arc<dyn Connection>,
        dialect: Box<dyn SqlDialect>,
        schema: Arc<dyn SchemaProvider>,
    ) -> Result<Self> {
        let (catalog, default_schema) = schema.current_namespace().await?;
        Ok(Self {
            conn,
            dialect,
            schema,
            catalog,
            default_schema,
            tables: Mutex::new(HashMap::new()),
        })
    }

    /// The underlying connection
    pub fn connection(&self) -> Arc<dyn Connection> {
        Arc::clone(&self.conn)
    }

    /// The SQL dialect of this backend
    pub fn dialect(&self) -> &dyn SqlDialect {
        self.dialect.as_ref()
    }

    /// The connection's current schema
    pub fn default_schema(&self) -> &str {
        &self.default_schema
    }

    /// Resolve `catalog.schema.table`, `schema.table` or `table` against the
    /// connection's current catalog and schema.
    pub fn resolve_table_name(&self, name: &str) -> Result<TableName> {
        TableName::parse_with_defaults(name, &self.catalog, &self.default_schema)
    }

    /// Table metadata, `None` when the table does not exist
    pub async fn find_table(&self, name: &TableName) -> Result<Option<Arc<Table>>> {
        let mut cache = self.tables.lock().await;
        if let Some(cached) = cache.get(name) {
            return Ok(cached.clone());
        }
        let table = self.schema.get_table(name).await?.map(Arc::new);
        cache.insert(name.clone(), table.clone());
        Ok(table)
    }

    /// Table metadata, failing when the table does not exist
    pub async fn table(&self, name: &TableName) -> Result<Arc<Table>> {
        self.find_table(name)
            .await?
            .ok_or_else(|| Error::table_not_found(name))
    }

    /// Metadata for several tables, in the given order
    pub async fn tables<'a>(
        &self,
        names: impl IntoIterator<Item = &'a TableName>,
    ) -> Result<Vec<Arc<Table>>> {
        let mut tables = Vec::new();
        for name in names {
            tables.push(self.table(name).await?);
        }
        Ok(tables)
    }

    /// Foreign keys owned by other tables that reference `name`
    pub async fn related_foreign_keys(&self, name: &TableName) -> Result<Vec<ForeignKey>> {
        self.schema.related_foreign_keys(name).await
    }

    /// Quote a single identifier
    pub fn quote_identifier(&self, name: &str) -> String {
        self.dialect.quote_identifier(name)
    }

    /// Quote a table name
    pub fn quote_table(&self, name: &TableName) -> String {
        self.dialect.quote_table(name)
    }

    /// Quote and comma-join identifiers
    pub fn quote_list(&self, names: &[String]) -> String {
        self.dialect.quote_list(names)
    }

    /// Drop a foreign key constraint
    pub async fn drop_foreign_key(&self, fk: &ForeignKey) -> Result<()> {
        let sql = self.dialect.drop_foreign_key_sql(fk);
        debug!(constraint = %fk.name, "{}", sql);
        self.conn.execute(&sql, &[]).await?;
        Ok(())
    }

    /// Recreate a foreign key constraint from its captured definition
    pub async fn create_foreign_key(&self, fk: &ForeignKey) -> Result<()> {
        let sql = self.dialect.create_foreign_key_sql(fk);
        debug!(constraint = %fk.name, "{}", sql);
        self.conn.execute(&sql, &[]).await?;
        Ok(())
    }

    /// Stop enforcing the given foreign keys in place.
    ///
    /// Statements shared by several keys (PostgreSQL disables triggers per
    /// table) are issued once.
    pub async fn disable_foreign_keys(&self, fks: &[ForeignKey]) -> Result<()> {
        let statements = fks
            .iter()
            .flat_map(|fk| self.dialect.disable_foreign_key_sql(fk))
            .collect();
        self.run_unique(statements).await
    }

    /// Resume enforcing the given foreign keys, re-validating existing rows
    /// when `validate` is set and the backend supports it.
    pub async fn enable_foreign_keys(&self, fks: &[ForeignKey], validate: bool) -> Result<()> {
        let statements = fks
            .iter()
            .flat_map(|fk| self.dialect.enable_foreign_key_sql(fk, validate))
            .collect();
        self.run_unique(statements).await
    }

    async fn run_unique(&self, statements: Vec<String>) -> Result<()> {
        let mut seen = HashSet::new();
        for sql in statements {
            if seen.insert(sql.clone()) {
                debug!("{}", sql);
                self.conn.execute(&sql, &[]).await?;
            }
        }
        Ok(())
    }

    /// Delete every row of a table, returning the affected count
    pub async fn delete_rows(&self, name: &TableName) -> Result<u64> {
        let sql = self.dialect.delete_all_sql(name);
        let deleted = self.conn.execute(&sql, &[]).await?;
        debug!(table = %name, rows = deleted, "deleted rows");
        Ok(deleted)
    }

    /// Number of rows in a table, stopping at `cap` when given
    pub async fn row_count(&self, name: &TableName, cap: Option<u64>) -> Result<u64> {
        let sql = self.dialect.row_count_sql(name, cap);
        let row = self
            .conn
            .query_one(&sql, &[])
            .await?
            .ok_or_else(|| Error::query_with_sql("row count returned no row", &sql))?;
        let count = row
            .get(0)
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::type_conversion("row count is not an integer"))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Open a batched insert over `columns` of `table`.
    ///
    /// Every column must exist on the table. Identity handling is switched on
    /// for the lifetime of the inserter when an identity column is included.
    pub async fn create_inserter(
        &self,
        table: &Table,
        columns: &[String],
        batch_size: usize,
    ) -> Result<Inserter> {
        for column in columns {
            if table.column(column).is_none() {
                return Err(Error::ColumnNotFound {
                    table: table.name.to_string(),
                    column: column.clone(),
                });
            }
        }

        let identity = table
            .identity_column()
            .filter(|c| columns.iter().any(|h| h.eq_ignore_ascii_case(&c.name)))
            .map(|c| c.name.clone());

        let refs: Vec<&str> = columns.iter().map(String::as_str).collect();
        let sql = self
            .dialect
            .insert_sql(&table.name, &refs, identity.is_some());

        let mut identity_off = None;
        let mut resync = None;
        if let Some(column) = &identity {
            if let Some(on) = self.dialect.identity_insert_sql(&table.name, true) {
                debug!(table = %table.name, "{}", on);
                self.conn.execute(&on, &[]).await?;
            }
            identity_off = self.dialect.identity_insert_sql(&table.name, false);
            resync = self.dialect.identity_resync_sql(&table.name, column);
        }

        let statement = match self.conn.prepare(&sql).await {
            Ok(statement) => statement,
            Err(e) => {
                if let Some(off) = &identity_off {
                    if let Err(restore) = self.conn.execute(off, &[]).await {
                        warn!(
                            table = %table.name,
                            error = %restore,
                            "could not switch identity insert off after failed prepare"
                        );
                    }
                }
                return Err(e);
            }
        };

        Ok(Inserter {
            conn: Arc::clone(&self.conn),
            statement,
            table: table.name.clone(),
            identity_off,
            resync,
            pending: Vec::with_capacity(batch_size.max(1)),
            batch_size: batch_size.max(1),
            inserted: 0,
        })
    }

    /// Close the connection
    pub async fn close(&self) -> Result<()> {
        self.conn.close().await
    }
}

/// Batched insert handle for one table.
///
/// Rows are buffered and sent every `batch_size` rows; [`Inserter::close`]
/// sends the remainder and restores identity handling.
pub struct Inserter {
    conn: Arc<dyn Connection>,
    statement: Box<dyn PreparedStatement>,
    table: TableName,
    identity_off: Option<String>,
    resync: Option<String>,
    pending: Vec<Vec<Value>>,
    batch_size: usize,
    inserted: u64,
}

impl Inserter {
    /// Queue one row, flushing when the batch is full
    pub async fn add(&mut self, row: Vec<Value>) -> Result<()> {
        self.pending.push(row);
        if self.pending.len() >= self.batch_size {
            self.flush().await?;
        }
        Ok(())
    }

    /// Send the queued rows
    pub async fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(&mut self.pending);
        self.statement.execute_batch(&batch).await?;
        self.inserted += batch.len() as u64;
        debug!(table = %self.table, rows = batch.len(), "flushed insert batch");
        Ok(())
    }

    /// Flush, then restore identity handling. Identity handling is restored
    /// even when the final flush fails; the flush error wins.
    pub async fn close(mut self) -> Result<u64> {
        let flushed = self.flush().await;

        let mut restored = Ok(());
        if let Some(off) = &self.identity_off {
            if let Err(e) = self.conn.execute(off, &[]).await {
                restored = Err(e);
            }
        }
        if flushed.is_ok() && restored.is_ok() {
            if let Some(resync) = &self.resync {
                // setval is a query on PostgreSQL
                restored = self.conn.query(resync, &[]).await.map(|_| ());
            }
        }

        flushed?;
        restored?;
        Ok(self.inserted)
    }
}
