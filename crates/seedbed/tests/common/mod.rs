//! In-memory backend for seedbed tests
//!
//! Implements the connection and schema traits over tables held in memory and
//! interprets the PostgreSQL statements seedbed emits: column selects with
//! multi-key filters, capped counts, deletes, inserts and the ALTER TABLE /
//! setval statements of constraint handling (recorded, otherwise no-ops).

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, LazyLock};

use seedbed::config::{ExecutionMode, PlanConfig};
use seedbed_rdbc::connection::{Connection, PreparedStatement, RowStream, VecRowStream};
use seedbed_rdbc::dialect::PostgresDialect;
use seedbed_rdbc::schema::{Column, ColumnType, PrimaryKey, SchemaProvider, Table};
use seedbed_rdbc::types::{Row, Value};
use seedbed_rdbc::{Database, Error, ForeignKey, Result, TableName};

pub const CATALOG: &str = "shop";
pub const SCHEMA: &str = "public";

static TABLE_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:FROM|INTO|TABLE) "([^"]+)"\."([^"]+)""#).expect("table ref regex")
});

static KEY_GROUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(([^()]*)\)").expect("key group regex"));

static KEY_TERM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^"([^"]+)" = \$(\d+)$"#).expect("key term regex"));

static LIMIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"LIMIT (\d+)").expect("limit regex"));

#[derive(Debug)]
struct MemTable {
    meta: Table,
    rows: Vec<Vec<Value>>,
}

#[derive(Debug, Default)]
struct State {
    tables: BTreeMap<String, MemTable>,
    statements: Vec<String>,
    selects: usize,
    fail_on: Option<String>,
}

/// Shared in-memory database
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table with its rows, values in column order
    pub fn with_table(self, meta: Table, rows: Vec<Vec<Value>>) -> Self {
        self.state
            .lock()
            .tables
            .insert(meta.name.table.clone(), MemTable { meta, rows });
        self
    }

    /// Fail every statement containing `fragment`
    pub fn fail_on(&self, fragment: impl Into<String>) {
        self.state.lock().fail_on = Some(fragment.into());
    }

    pub fn clear_failure(&self) {
        self.state.lock().fail_on = None;
    }

    /// Non-SELECT statements run so far
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    pub fn clear_statements(&self) {
        self.state.lock().statements.clear();
    }

    /// Number of SELECT executions
    pub fn select_count(&self) -> usize {
        self.state.lock().selects
    }

    pub fn rows(&self, table: &str) -> Vec<Vec<Value>> {
        self.state
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    pub fn set_rows(&self, table: &str, rows: Vec<Vec<Value>>) {
        if let Some(t) = self.state.lock().tables.get_mut(table) {
            t.rows = rows;
        }
    }

    /// Database over this backend with the PostgreSQL dialect
    pub async fn database(&self) -> Database {
        Database::from_parts(
            Arc::new(self.clone()),
            Box::new(PostgresDialect),
            Arc::new(self.clone()),
        )
        .await
        .unwrap()
    }

    fn check_failure(&self, sql: &str) -> Result<()> {
        match &self.state.lock().fail_on {
            Some(fragment) if sql.contains(fragment.as_str()) => {
                Err(Error::query_with_sql("injected failure", sql))
            }
            _ => Ok(()),
        }
    }

    fn run_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.check_failure(sql)?;
        if sql.starts_with("SELECT COUNT(*)") {
            return self.count(sql).map(|n| {
                vec![Row::new(vec!["n".into()], vec![Value::Int64(n as i64)])]
            });
        }
        if sql.starts_with("SELECT setval") {
            self.state.lock().statements.push(sql.to_string());
            return Ok(vec![Row::new(vec!["setval".into()], vec![Value::Int64(1)])]);
        }
        if sql.starts_with("SELECT ") {
            return self.select(sql, params);
        }
        Err(Error::query_with_sql("unsupported query", sql))
    }

    fn run_execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.check_failure(sql)?;
        let mut state = self.state.lock();
        state.statements.push(sql.to_string());

        if sql.starts_with("ALTER TABLE") {
            return Ok(0);
        }
        let key = table_key(sql)?;
        let table = state
            .tables
            .get_mut(&key)
            .ok_or_else(|| Error::table_not_found(&key))?;

        if sql.starts_with("DELETE FROM") {
            let deleted = table.rows.len() as u64;
            table.rows.clear();
            return Ok(deleted);
        }
        if sql.starts_with("INSERT INTO") {
            let row = insert_row(&table.meta, sql, params)?;
            let pk: Vec<usize> = table
                .meta
                .primary_key_columns()
                .iter()
                .filter_map(|c| table.meta.column_index(c))
                .collect();
            if !pk.is_empty()
                && table
                    .rows
                    .iter()
                    .any(|existing| pk.iter().all(|&i| existing[i] == row[i]))
            {
                return Err(Error::query_with_sql("duplicate key value", sql));
            }
            table.rows.push(row);
            return Ok(1);
        }
        Err(Error::query_with_sql("unsupported statement", sql))
    }

    fn count(&self, sql: &str) -> Result<u64> {
        let key = table_key(sql)?;
        let state = self.state.lock();
        let table = state
            .tables
            .get(&key)
            .ok_or_else(|| Error::table_not_found(&key))?;
        let n = table.rows.len() as u64;
        Ok(match LIMIT.captures(sql) {
            Some(caps) => n.min(caps[1].parse().unwrap_or(u64::MAX)),
            None => n,
        })
    }

    fn select(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let key = table_key(sql)?;
        let mut state = self.state.lock();
        state.selects += 1;
        let table = state
            .tables
            .get(&key)
            .ok_or_else(|| Error::table_not_found(&key))?;

        let from = sql.find(" FROM ").unwrap_or(sql.len());
        let names: Vec<String> = sql["SELECT ".len()..from]
            .split(", ")
            .map(|c| c.trim().trim_matches('"').to_string())
            .collect();
        let positions: Vec<usize> = names
            .iter()
            .map(|n| {
                table.meta.column_index(n).ok_or_else(|| Error::ColumnNotFound {
                    table: key.clone(),
                    column: n.clone(),
                })
            })
            .collect::<Result<_>>()?;

        let groups = match sql.find(" WHERE ") {
            Some(at) => Some(key_groups(&sql[at..])?),
            None => None,
        };

        let rows = table
            .rows
            .iter()
            .filter(|row| match &groups {
                None => true,
                Some(groups) => groups.iter().any(|terms| {
                    terms.iter().all(|(column, param)| {
                        let Some(index) = table.meta.column_index(column) else {
                            return false;
                        };
                        let value = &row[index];
                        !value.is_null()
                            && params
                                .get(param - 1)
                                .is_some_and(|p| p.to_cell() == value.to_cell())
                    })
                }),
            })
            .map(|row| {
                Row::new(
                    names.clone(),
                    positions.iter().map(|&i| row[i].clone()).collect(),
                )
            })
            .collect();
        Ok(rows)
    }
}

fn table_key(sql: &str) -> Result<String> {
    let caps = TABLE_REF
        .captures(sql)
        .ok_or_else(|| Error::query_with_sql("no table in statement", sql))?;
    if &caps[1] != SCHEMA {
        return Err(Error::table_not_found(format!("{}.{}", &caps[1], &caps[2])));
    }
    Ok(caps[2].to_string())
}

fn key_groups(where_clause: &str) -> Result<Vec<Vec<(String, usize)>>> {
    let mut groups = Vec::new();
    for caps in KEY_GROUP.captures_iter(where_clause) {
        let inner = &caps[1];
        if !inner.contains('$') {
            continue;
        }
        let mut terms = Vec::new();
        for term in inner.split(" AND ") {
            let parsed = KEY_TERM
                .captures(term.trim())
                .ok_or_else(|| Error::query(format!("unsupported key term '{}'", term)))?;
            let index: usize = parsed[2]
                .parse()
                .map_err(|_| Error::query("bad placeholder"))?;
            terms.push((parsed[1].to_string(), index));
        }
        groups.push(terms);
    }
    Ok(groups)
}

fn insert_row(meta: &Table, sql: &str, params: &[Value]) -> Result<Vec<Value>> {
    let start = TABLE_REF
        .find(sql)
        .map(|m| m.end())
        .ok_or_else(|| Error::query_with_sql("no table in insert", sql))?;
    let rest = &sql[start..];
    let (open, close) = match (rest.find('('), rest.find(')')) {
        (Some(open), Some(close)) => (open, close),
        _ => return Err(Error::query_with_sql("no column list", sql)),
    };
    let columns: Vec<String> = rest[open + 1..close]
        .split(", ")
        .map(|c| c.trim().trim_matches('"').to_string())
        .collect();
    if columns.len() != params.len() {
        return Err(Error::query_with_sql("parameter count mismatch", sql));
    }
    let mut row = vec![Value::Null; meta.columns.len()];
    for (column, value) in columns.iter().zip(params) {
        let index = meta.column_index(column).ok_or_else(|| Error::ColumnNotFound {
            table: meta.name.to_string(),
            column: column.clone(),
        })?;
        row[index] = value.clone();
    }
    Ok(row)
}

#[async_trait]
impl Connection for MemoryBackend {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.run_query(sql, params)
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.run_execute(sql, params)
    }

    async fn prepare(&self, sql: &str) -> Result<Box<dyn PreparedStatement>> {
        self.check_failure(sql)?;
        Ok(Box::new(MemoryStatement {
            backend: self.clone(),
            sql: sql.to_string(),
        }))
    }


    async fn is_valid(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MemoryStatement {
    backend: MemoryBackend,
    sql: String,
}

#[async_trait]
impl PreparedStatement for MemoryStatement {
    async fn execute(&self, params: &[Value]) -> Result<u64> {
        self.backend.run_execute(&self.sql, params)
    }

    async fn query_stream(&self, params: &[Value]) -> Result<Box<dyn RowStream>> {
        let rows = self.backend.run_query(&self.sql, params)?;
        Ok(Box::new(VecRowStream::new(rows)))
    }

    fn sql(&self) -> &str {
        &self.sql
    }
}

#[async_trait]
impl SchemaProvider for MemoryBackend {
    async fn current_namespace(&self) -> Result<(String, String)> {
        Ok((CATALOG.to_string(), SCHEMA.to_string()))
    }

    async fn get_table(&self, name: &TableName) -> Result<Option<Table>> {
        if name.catalog != CATALOG || name.schema != SCHEMA {
            return Ok(None);
        }
        Ok(self
            .state
            .lock()
            .tables
            .get(&name.table)
            .map(|t| t.meta.clone()))
    }

    async fn related_foreign_keys(&self, name: &TableName) -> Result<Vec<ForeignKey>> {
        Ok(self
            .state
            .lock()
            .tables
            .values()
            .flat_map(|t| t.meta.foreign_keys.iter())
            .filter(|fk| &fk.parent_table == name)
            .cloned()
            .collect())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

pub fn name(table: &str) -> TableName {
    TableName::new(CATALOG, SCHEMA, table)
}

pub fn fk(constraint: &str, child: &str, child_column: &str, parent: &str) -> ForeignKey {
    ForeignKey {
        name: constraint.to_string(),
        parent_table: name(parent),
        parent_columns: vec!["id".to_string()],
        child_table: name(child),
        child_columns: vec![child_column.to_string()],
        on_delete: Default::default(),
        on_update: Default::default(),
    }
}

pub fn table(table: &str, columns: Vec<Column>, foreign_keys: Vec<ForeignKey>) -> Table {
    let mut meta = Table::new(name(table));
    meta.columns = columns;
    meta.primary_key = Some(PrimaryKey {
        name: Some(format!("{}_pkey", table)),
        columns: vec!["id".to_string()],
    });
    meta.foreign_keys = foreign_keys;
    meta
}

pub fn int(n: i32) -> Value {
    Value::Int32(n)
}

pub fn text(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn decimal(s: &str) -> Value {
    ColumnType::Decimal.bind(s).unwrap()
}

pub fn timestamp(s: &str) -> Value {
    ColumnType::Timestamp.bind(s).unwrap()
}

/// Invoicing schema:
///
/// - 3 customers, 4 products
/// - 4 invoices referencing customers 1 and 2
/// - 7 invoice details referencing products 1 to 3
/// - 1 payment referencing invoice 1 and customer 1
/// - 2 employees, the second managed by the first
pub fn shop() -> MemoryBackend {
    MemoryBackend::new()
        .with_table(
            table(
                "customers",
                vec![Column::new("id", "int4").not_null(), Column::new("name", "text")],
                vec![],
            ),
            vec![
                vec![int(1), text("Acme")],
                vec![int(2), text("Globex")],
                vec![int(3), text("Initech")],
            ],
        )
        .with_table(
            table(
                "products",
                vec![
                    Column::new("id", "int4").not_null(),
                    Column::new("name", "text"),
                    Column::new("price", "numeric(10,2)"),
                ],
                vec![],
            ),
            vec![
                vec![int(1), text("Anvil"), decimal("12.50")],
                vec![int(2), text("Rocket"), decimal("99.00")],
                vec![int(3), text("Magnet"), decimal("3.25")],
                vec![int(4), text("Spring"), decimal("0.75")],
            ],
        )
        .with_table(
            table(
                "invoices",
                vec![
                    Column::new("id", "int4").not_null().identity(),
                    Column::new("customer_id", "int4").not_null(),
                    Column::new("number", "varchar(20)"),
                    Column::new("issued_at", "timestamp"),
                ],
                vec![fk("invoices_customers_fk", "invoices", "customer_id", "customers")],
            ),
            vec![
                vec![int(1), int(1), text("INV-1"), timestamp("2024-01-05 10:00:00")],
                vec![int(2), int(1), text("INV-2"), timestamp("2024-01-06 11:30:00")],
                vec![int(3), int(2), text("INV-3"), timestamp("2024-02-01 09:15:00")],
                vec![int(4), int(2), text("INV-4"), Value::Null],
            ],
        )
        .with_table(
            table(
                "invoice_details",
                vec![
                    Column::new("id", "int4").not_null(),
                    Column::new("invoice_id", "int4").not_null(),
                    Column::new("product_id", "int4").not_null(),
                    Column::new("quantity", "int4"),
                ],
                vec![
                    fk(
                        "invoice_details_invoices_fk",
                        "invoice_details",
                        "invoice_id",
                        "invoices",
                    ),
                    fk(
                        "invoice_details_products_fk",
                        "invoice_details",
                        "product_id",
                        "products",
                    ),
                ],
            ),
            vec![
                vec![int(1), int(1), int(1), int(2)],
                vec![int(2), int(1), int(2), int(1)],
                vec![int(3), int(2), int(1), int(5)],
                vec![int(4), int(2), int(3), int(1)],
                vec![int(5), int(3), int(2), int(2)],
                vec![int(6), int(4), int(3), int(1)],
                vec![int(7), int(4), int(1), int(3)],
            ],
        )
        .with_table(
            table(
                "payments",
                vec![
                    Column::new("id", "int4").not_null(),
                    Column::new("invoice_id", "int4"),
                    Column::new("customer_id", "int4"),
                    Column::new("amount", "numeric(10,2)"),
                ],
                vec![
                    fk("payments_customers_fk", "payments", "customer_id", "customers"),
                    fk("payments_invoices_fk", "payments", "invoice_id", "invoices"),
                ],
            ),
            vec![vec![int(1), int(1), int(1), decimal("37.50")]],
        )
        .with_table(
            table(
                "employees",
                vec![
                    Column::new("id", "int4").not_null(),
                    Column::new("manager_id", "int4"),
                    Column::new("name", "text"),
                ],
                vec![fk("employees_manager_fk", "employees", "manager_id", "employees")],
            ),
            vec![
                vec![int(1), Value::Null, text("Ada")],
                vec![int(2), int(1), text("Bob")],
            ],
        )
}

pub fn plan_config(
    root: &Path,
    dataset: &str,
    mode: ExecutionMode,
    cap: Option<u64>,
) -> PlanConfig {
    PlanConfig::new(root, dataset, mode, cap).unwrap()
}

/// Write a dataset file
pub fn write_dataset_file(root: &Path, dataset: &str, table: &str, content: &str) {
    let path = seedbed::dataset::table_path(root, dataset, &name(table));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

/// Read a dataset file, `None` when it does not exist
pub fn read_dataset_file(root: &Path, dataset: &str, table: &str) -> Option<String> {
    let path = seedbed::dataset::table_path(root, dataset, &name(table));
    std::fs::read_to_string(path).ok()
}
