//! PostgreSQL backend on `tokio-postgres`
//!
//! Prepared statements stream through `query_raw`, so a fetch batch never
//! sits in memory twice. Catalog reads go through `information_schema` and
//! `pg_catalog`; foreign keys are grouped per constraint name with their
//! column pairs kept in key order.

use async_trait::async_trait;
use bytes::BytesMut;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::error::SqlState;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tracing::{debug, error};

use crate::connection::{
    Connection, ConnectionConfig, ConnectionFactory, DatabaseType, PreparedStatement, RowStream,
};
use crate::error::{Error, Result};
use crate::schema::{
    Column, ForeignKey, ForeignKeyAction, Index, PrimaryKey, SchemaProvider, Table, TableName,
};
use crate::types::{Row, Value};

type BoxError = Box<dyn std::error::Error + Sync + Send>;

/// Parameter adapter binding a [`Value`] to whatever type the server
/// inferred for the placeholder. Integers widen or narrow to the target
/// integer type so key tuples taken from one column can filter another.
#[derive(Debug)]
struct PgParam<'a>(&'a Value);

fn int_to_sql(n: i64, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
    match *ty {
        Type::INT2 => i16::try_from(n)?.to_sql_checked(ty, out),
        Type::INT4 => i32::try_from(n)?.to_sql_checked(ty, out),
        Type::NUMERIC => rust_decimal::Decimal::from(n).to_sql_checked(ty, out),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR => n.to_string().to_sql_checked(ty, out),
        _ => n.to_sql_checked(ty, out),
    }
}

impl ToSql for PgParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        match self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => b.to_sql_checked(ty, out),
            Value::Int16(n) => int_to_sql(i64::from(*n), ty, out),
            Value::Int32(n) => int_to_sql(i64::from(*n), ty, out),
            Value::Int64(n) => int_to_sql(*n, ty, out),
            Value::Float32(n) => match *ty {
                Type::FLOAT8 => f64::from(*n).to_sql_checked(ty, out),
                _ => n.to_sql_checked(ty, out),
            },
            Value::Float64(n) => n.to_sql_checked(ty, out),
            Value::Decimal(d) => d.to_sql_checked(ty, out),
            Value::String(s) => s.as_str().to_sql_checked(ty, out),
            Value::Bytes(b) => b.as_slice().to_sql_checked(ty, out),
            Value::Date(d) => d.to_sql_checked(ty, out),
            Value::Time(t) => t.to_sql_checked(ty, out),
            Value::DateTime(dt) => dt.to_sql_checked(ty, out),
            Value::DateTimeTz(dt) => dt.to_sql_checked(ty, out),
            Value::Uuid(u) => u.to_sql_checked(ty, out),
            Value::Json(j) => j.to_sql_checked(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn pg_params(params: &[Value]) -> Vec<PgParam<'_>> {
    params.iter().map(PgParam).collect()
}

fn param_refs<'a>(params: &'a [PgParam<'a>]) -> Vec<&'a (dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

/// Convert a tokio-postgres row to a seedbed Row
fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Row {
    let columns: Vec<String> = pg_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let values: Vec<Value> = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect();

    Row::new(columns, values)
}

fn get<'a, T>(row: &'a tokio_postgres::Row, idx: usize) -> Option<T>
where
    T: tokio_postgres::types::FromSql<'a>,
{
    row.try_get::<_, Option<T>>(idx).ok().flatten()
}

/// Convert a PostgreSQL value to a seedbed Value
fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Value {
    let value = match *pg_type {
        Type::BOOL => get::<bool>(row, idx).map(Value::Bool),
        Type::INT2 => get::<i16>(row, idx).map(Value::Int16),
        Type::INT4 => get::<i32>(row, idx).map(Value::Int32),
        Type::INT8 => get::<i64>(row, idx).map(Value::Int64),
        Type::FLOAT4 => get::<f32>(row, idx).map(Value::Float32),
        Type::FLOAT8 => get::<f64>(row, idx).map(Value::Float64),
        Type::NUMERIC => get::<rust_decimal::Decimal>(row, idx).map(Value::Decimal),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME => {
            get::<String>(row, idx).map(Value::String)
        }
        Type::BYTEA => get::<Vec<u8>>(row, idx).map(Value::Bytes),
        Type::DATE => get::<chrono::NaiveDate>(row, idx).map(Value::Date),
        Type::TIME => get::<chrono::NaiveTime>(row, idx).map(Value::Time),
        Type::TIMESTAMP => get::<chrono::NaiveDateTime>(row, idx).map(Value::DateTime),
        Type::TIMESTAMPTZ => {
            get::<chrono::DateTime<chrono::Utc>>(row, idx).map(Value::DateTimeTz)
        }
        Type::UUID => get::<uuid::Uuid>(row, idx).map(Value::Uuid),
        Type::JSON | Type::JSONB => get::<serde_json::Value>(row, idx).map(Value::Json),
        _ => get::<String>(row, idx).map(Value::String),
    };
    value.unwrap_or(Value::Null)
}

fn query_error(e: tokio_postgres::Error, sql: &str) -> Error {
    if e.is_closed() {
        return Error::connection_with_source("connection closed", e);
    }
    let message = match e.as_db_error() {
        Some(db) => format!("{} ({})", db.message(), db.code().code()),
        None => e.to_string(),
    };
    Error::query_with_source(message, sql, e)
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    client: Arc<tokio_postgres::Client>,
    closed: AtomicBool,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client: Arc::new(client),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the underlying client
    pub fn client(&self) -> &tokio_postgres::Client {
        &self.client
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.ensure_open()?;
        let pg = pg_params(params);
        let pg_rows = self
            .client
            .query(sql, &param_refs(&pg))
            .await
            .map_err(|e| query_error(e, sql))?;

        Ok(pg_rows.iter().map(pg_row_to_row).collect())
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;
        let pg = pg_params(params);
        self.client
            .execute(sql, &param_refs(&pg))
            .await
            .map_err(|e| query_error(e, sql))
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        self.ensure_open()?;
        let statement = self
            .client
            .prepare(sql)
            .await
            .map_err(|e| query_error(e, sql))?;

        Ok(Box::new(PgPreparedStatement {
            client: Arc::clone(&self.client),
            statement,
            sql: sql.to_string(),
        }))
    }


    async fn is_valid(&self) -> bool {
        if self.closed.load(Ordering::Relaxed) {
            return false;
        }
        self.client.simple_query("SELECT 1").await.is_ok()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Row stream over a server-side portal
struct PgRowStream {
    inner: Pin<Box<tokio_postgres::RowStream>>,
    sql: String,
}

impl RowStream for PgRowStream {
    fn next(&mut self) -> Pin<Box<dyn Future<Output = Result<Option<Row>>> + Send + '_>> {
        Box::pin(async move {
            match self.inner.next().await {
                Some(Ok(row)) => Ok(Some(pg_row_to_row(&row))),
                Some(Err(e)) => Err(query_error(e, &self.sql)),
                None => Ok(None),
            }
        })
    }
}

/// PostgreSQL prepared statement
pub struct PgPreparedStatement {
    client: Arc<tokio_postgres::Client>,
    statement: tokio_postgres::Statement,
    sql: String,
}

#[async_trait]
impl PreparedStatement for PgPreparedStatement {
    async fn execute(&self, params: &[Value]) -> Result<u64> {
        let pg = pg_params(params);
        self.client
            .execute(&self.statement, &param_refs(&pg))
            .await
            .map_err(|e| query_error(e, &self.sql))
    }

    async fn query_stream(&self, params: &[Value]) -> Result<Box<dyn RowStream>> {
        let pg = pg_params(params);
        let stream = self
            .client
            .query_raw(&self.statement, param_refs(&pg))
            .await
            .map_err(|e| query_error(e, &self.sql))?;

        Ok(Box::new(PgRowStream {
            inner: Box::pin(stream),
            sql: self.sql.clone(),
        }))
    }

    fn sql(&self) -> &str {
        &self.sql
    }
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

fn connect_error(e: tokio_postgres::Error) -> Error {
    match e.code() {
        Some(code)
            if *code == SqlState::INVALID_PASSWORD
                || *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION =>
        {
            Error::Authentication {
                message: e.to_string(),
            }
        }
        Some(code) if *code == SqlState::INVALID_CATALOG_NAME => Error::config(e.to_string()),
        _ => Error::connection_with_source("failed to connect", e),
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let mut pg_config: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e| Error::config(format!("invalid PostgreSQL URL: {}", e)))?;
        pg_config.connect_timeout(Duration::from_millis(config.connect_timeout_ms));
        if let Some(name) = &config.application_name {
            pg_config.application_name(name);
        }

        let (client, connection) = pg_config
            .connect(tokio_postgres::NoTls)
            .await
            .map_err(connect_error)?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!("PostgreSQL connection error: {}", e);
            }
        });

        Ok(Box::new(PgConnection::new(client)))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }
}

const COLUMNS_SQL: &str = r#"SELECT
    c.column_name,
    c.data_type,
    c.is_nullable = 'YES' AS nullable,
    (c.is_identity = 'YES' OR COALESCE(c.column_default, '') LIKE 'nextval(%') AS auto_increment
FROM information_schema.columns c
WHERE c.table_schema = $1 AND c.table_name = $2
ORDER BY c.ordinal_position"#;

const PRIMARY_KEY_SQL: &str = r#"SELECT con.conname AS name, a.attname AS column_name
FROM pg_constraint con
JOIN pg_class cl ON cl.oid = con.conrelid
JOIN pg_namespace n ON n.oid = cl.relnamespace
CROSS JOIN LATERAL unnest(con.conkey) WITH ORDINALITY AS k(attnum, ord)
JOIN pg_attribute a ON a.attrelid = con.conrelid AND a.attnum = k.attnum
WHERE con.contype = 'p' AND n.nspname = $1 AND cl.relname = $2
ORDER BY k.ord"#;

const INDEXES_SQL: &str = r#"SELECT
    i.relname AS index_name,
    a.attname AS column_name,
    ix.indisunique AS is_unique
FROM pg_class t
JOIN pg_namespace n ON t.relnamespace = n.oid
JOIN pg_index ix ON t.oid = ix.indrelid
JOIN pg_class i ON ix.indexrelid = i.oid
CROSS JOIN LATERAL unnest(ix.indkey) WITH ORDINALITY AS k(attnum, ord)
JOIN pg_attribute a ON a.attrelid = t.oid AND a.attnum = k.attnum
WHERE n.nspname = $1 AND t.relname = $2
ORDER BY i.relname, k.ord"#;

const FOREIGN_KEYS_SQL: &str = r#"SELECT
    con.conname AS name,
    cn.nspname AS child_schema,
    cl.relname AS child_table,
    pn.nspname AS parent_schema,
    pl.relname AS parent_table,
    ca.attname AS child_column,
    pa.attname AS parent_column,
    con.confdeltype::text AS on_delete,
    con.confupdtype::text AS on_update
FROM pg_constraint con
JOIN pg_class cl ON cl.oid = con.conrelid
JOIN pg_namespace cn ON cn.oid = cl.relnamespace
JOIN pg_class pl ON pl.oid = con.confrelid
JOIN pg_namespace pn ON pn.oid = pl.relnamespace
CROSS JOIN LATERAL unnest(con.conkey, con.confkey) WITH ORDINALITY AS k(child_attnum, parent_attnum, ord)
JOIN pg_attribute ca ON ca.attrelid = con.conrelid AND ca.attnum = k.child_attnum
JOIN pg_attribute pa ON pa.attrelid = con.confrelid AND pa.attnum = k.parent_attnum
WHERE con.contype = 'f' AND "#;

fn text(row: &Row, column: &str) -> String {
    row.get_by_name(column)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// PostgreSQL schema provider
pub struct PgSchemaProvider {
    conn: Arc<dyn Connection>,
}

impl PgSchemaProvider {
    /// Create a new schema provider
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self { conn }
    }

    fn table_params(name: &TableName) -> [Value; 2] {
        [
            Value::String(name.schema.clone()),
            Value::String(name.table.clone()),
        ]
    }

    async fn foreign_keys_where(&self, filter: &str, name: &TableName) -> Result<Vec<ForeignKey>> {
        let sql = format!("{}{}\nORDER BY con.conname, k.ord", FOREIGN_KEYS_SQL, filter);
        let rows = self.conn.query(&sql, &Self::table_params(name)).await?;

        // BTreeMap keeps constraint order stable
        let mut fks: BTreeMap<(String, String, String), ForeignKey> = BTreeMap::new();
        for row in &rows {
            let constraint = text(row, "name");
            let child_schema = text(row, "child_schema");
            let child_table = text(row, "child_table");
            let entry = fks
                .entry((child_schema.clone(), child_table.clone(), constraint.clone()))
                .or_insert_with(|| ForeignKey {
                    name: constraint,
                    parent_table: TableName::new(
                        name.catalog.clone(),
                        text(row, "parent_schema"),
                        text(row, "parent_table"),
                    ),
                    parent_columns: Vec::new(),
                    child_table: TableName::new(name.catalog.clone(), child_schema, child_table),
                    child_columns: Vec::new(),
                    on_delete: ForeignKeyAction::parse(&text(row, "on_delete")),
                    on_update: ForeignKeyAction::parse(&text(row, "on_update")),
                });
            entry.child_columns.push(text(row, "child_column"));
            entry.parent_columns.push(text(row, "parent_column"));
        }

        Ok(fks.into_values().collect())
    }
}

#[async_trait]
impl SchemaProvider for PgSchemaProvider {
    async fn current_namespace(&self) -> Result<(String, String)> {
        let row = self
            .conn
            .query_one(
                "SELECT current_database()::text AS catalog, current_schema()::text AS schema",
                &[],
            )
            .await?
            .ok_or_else(|| Error::schema("current_database() returned no row"))?;
        Ok((text(&row, "catalog"), text(&row, "schema")))
    }

    async fn get_table(&self, name: &TableName) -> Result<Option<Table>> {
        let params = Self::table_params(name);
        let rows = self.conn.query(COLUMNS_SQL, &params).await?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut table = Table::new(name.clone());
        for row in &rows {
            let mut column = Column::new(text(row, "column_name"), text(row, "data_type"));
            column.nullable = row
                .get_by_name("nullable")
                .and_then(|v| v.as_bool())
                .unwrap_or(true);
            column.auto_increment = row
                .get_by_name("auto_increment")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            table.columns.push(column);
        }

        let pk_rows = self.conn.query(PRIMARY_KEY_SQL, &params).await?;
        if let Some(first) = pk_rows.first() {
            table.primary_key = Some(PrimaryKey {
                name: Some(text(first, "name")),
                columns: pk_rows.iter().map(|r| text(r, "column_name")).collect(),
            });
        }

        let index_rows = self.conn.query(INDEXES_SQL, &params).await?;
        for row in &index_rows {
            let index_name = text(row, "index_name");
            let column = text(row, "column_name");
            match table.indexes.iter_mut().find(|i| i.name == index_name) {
                Some(index) => index.columns.push(column),
                None => table.indexes.push(Index {
                    name: index_name,
                    columns: vec![column],
                    unique: row
                        .get_by_name("is_unique")
                        .and_then(|v| v.as_bool())
                        .unwrap_or(false),
                }),
            }
        }

        table.foreign_keys = self
            .foreign_keys_where("cn.nspname = $1 AND cl.relname = $2", name)
            .await?;

        debug!(
            table = %name,
            columns = table.columns.len(),
            foreign_keys = table.foreign_keys.len(),
            "loaded table metadata"
        );
        Ok(Some(table))
    }

    async fn related_foreign_keys(&self, name: &TableName) -> Result<Vec<ForeignKey>> {
        self.foreign_keys_where("pn.nspname = $1 AND pl.relname = $2", name)
            .await
    }
}
