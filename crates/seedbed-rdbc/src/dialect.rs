//! Vendor SQL text
//!
//! Everything seedbed sends that differs between backends is produced here:
//! quoting, placeholders, the multi-key fetch filter, capped counts, inserts
//! that keep explicit identity values, and the statements that switch
//! foreign keys off and back on.

use crate::connection::DatabaseType;
use crate::schema::{ForeignKey, ForeignKeyAction, TableName};
use crate::security::escape_string_literal;
use sea_query::{Alias, Expr, IntoIden, PostgresQueryBuilder, Query, TableRef};

/// SQL dialect for vendor-specific SQL generation
pub trait SqlDialect: Send + Sync {
    /// Get the dialect name
    fn name(&self) -> &'static str;

    /// Backend this dialect targets
    fn database_type(&self) -> DatabaseType;

    /// Quote an identifier (table, column name)
    fn quote_identifier(&self, name: &str) -> String;

    /// Quote a fully qualified table name
    fn quote_table(&self, table: &TableName) -> String;

    /// Get the placeholder for a parameter (1-based)
    fn placeholder(&self, index: usize) -> String;

    /// Build `SELECT <columns> FROM <table> [WHERE <where_clause>]`
    fn build_select(&self, table: &TableName, columns: &[&str], where_clause: Option<&str>)
        -> String;

    /// Disjunction of `tuples` conjunctive clauses over `columns`, with
    /// placeholders numbered from 1 in tuple-major order:
    /// `(a = $1 AND b = $2) OR (a = $3 AND b = $4)`.
    fn key_filter(&self, columns: &[&str], tuples: usize) -> String {
        let quoted: Vec<String> = columns.iter().map(|c| self.quote_identifier(c)).collect();
        let mut index = 0;
        let mut clauses = Vec::with_capacity(tuples);
        for _ in 0..tuples {
            let terms: Vec<String> = quoted
                .iter()
                .map(|col| {
                    index += 1;
                    format!("{} = {}", col, self.placeholder(index))
                })
                .collect();
            clauses.push(format!("({})", terms.join(" AND ")));
        }
        clauses.join(" OR ")
    }

    /// Count rows, stopping at `cap` when given. The count is the first column.
    fn row_count_sql(&self, table: &TableName, cap: Option<u64>) -> String;

    /// Remove every row of a table
    fn delete_all_sql(&self, table: &TableName) -> String {
        format!("DELETE FROM {}", self.quote_table(table))
    }

    /// Parameterized single-row insert. `identity` is set when an identity
    /// column is among `columns`.
    fn insert_sql(&self, table: &TableName, columns: &[&str], identity: bool) -> String;

    /// Statement toggling explicit identity inserts, if the dialect needs one
    fn identity_insert_sql(&self, table: &TableName, enable: bool) -> Option<String>;

    /// Statement realigning an identity generator after explicit inserts
    fn identity_resync_sql(&self, table: &TableName, column: &str) -> Option<String>;

    /// Statements that stop enforcing a foreign key in place
    fn disable_foreign_key_sql(&self, fk: &ForeignKey) -> Vec<String>;

    /// Statements that resume enforcing a foreign key, optionally re-validating rows
    fn enable_foreign_key_sql(&self, fk: &ForeignKey, validate: bool) -> Vec<String>;

    /// Drop a foreign key constraint
    fn drop_foreign_key_sql(&self, fk: &ForeignKey) -> String {
        format!(
            "ALTER TABLE {} DROP CONSTRAINT {}",
            self.quote_table(&fk.child_table),
            self.quote_identifier(&fk.name)
        )
    }

    /// Recreate a foreign key constraint from its captured definition
    fn create_foreign_key_sql(&self, fk: &ForeignKey) -> String {
        format!(
            "ALTER TABLE {} ADD CONSTRAINT {} FOREIGN KEY ({}) REFERENCES {} ({}) ON DELETE {} ON UPDATE {}",
            self.quote_table(&fk.child_table),
            self.quote_identifier(&fk.name),
            self.quote_list(&fk.child_columns),
            self.quote_table(&fk.parent_table),
            self.quote_list(&fk.parent_columns),
            self.referential_action(fk.on_delete),
            self.referential_action(fk.on_update),
        )
    }

    /// Spelling of a referential action
    fn referential_action(&self, action: ForeignKeyAction) -> &'static str {
        action.to_sql()
    }

    /// Quote and comma-join a column list
    fn quote_list(&self, names: &[String]) -> String {
        names
            .iter()
            .map(|n| self.quote_identifier(n))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// ===========================================================================
// PostgreSQL
// ===========================================================================

/// PostgreSQL dialect
///
/// Tables are addressed as `schema.table`; the catalog is the connected
/// database and is not part of statement text.
#[derive(Debug, Clone, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    fn table_literal(&self, table: &TableName) -> String {
        escape_string_literal(&self.quote_table(table))
    }

    fn endpoint_triggers(&self, fk: &ForeignKey, verb: &str) -> Vec<String> {
        let mut sql = vec![format!(
            "ALTER TABLE {} {} TRIGGER ALL",
            self.quote_table(&fk.child_table),
            verb
        )];
        if fk.parent_table != fk.child_table {
            sql.push(format!(
                "ALTER TABLE {} {} TRIGGER ALL",
                self.quote_table(&fk.parent_table),
                verb
            ));
        }
        sql
    }
}

impl SqlDialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "PostgreSQL"
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn quote_table(&self, table: &TableName) -> String {
        format!(
            "{}.{}",
            self.quote_identifier(&table.schema),
            self.quote_identifier(&table.table)
        )
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn build_select(
        &self,
        table: &TableName,
        columns: &[&str],
        where_clause: Option<&str>,
    ) -> String {
        let tbl = TableRef::SchemaTable(
            Alias::new(table.schema.as_str()).into_iden(),
            Alias::new(table.table.as_str()).into_iden(),
        );

        let mut stmt = Query::select();
        stmt.from(tbl);
        for col in columns {
            stmt.column(Alias::new(*col));
        }
        if let Some(w) = where_clause {
            stmt.and_where(Expr::cust(w));
        }

        stmt.to_string(PostgresQueryBuilder)
    }

    fn row_count_sql(&self, table: &TableName, cap: Option<u64>) -> String {
        match cap {
            Some(cap) => format!(
                "SELECT COUNT(*) AS n FROM (SELECT 1 FROM {} LIMIT {}) AS capped",
                self.quote_table(table),
                cap
            ),
            None => format!("SELECT COUNT(*) AS n FROM {}", self.quote_table(table)),
        }
    }

    fn insert_sql(&self, table: &TableName, columns: &[&str], identity: bool) -> String {
        let cols: Vec<String> = columns.iter().map(|c| self.quote_identifier(c)).collect();
        let params: Vec<String> = (1..=columns.len()).map(|i| self.placeholder(i)).collect();
        format!(
            "INSERT INTO {} ({}){} VALUES ({})",
            self.quote_table(table),
            cols.join(", "),
            if identity {
                " OVERRIDING SYSTEM VALUE"
            } else {
                ""
            },
            params.join(", ")
        )
    }

    fn identity_insert_sql(&self, _table: &TableName, _enable: bool) -> Option<String> {
        None
    }

    fn identity_resync_sql(&self, table: &TableName, column: &str) -> Option<String> {
        Some(format!(
            "SELECT setval(pg_get_serial_sequence('{}', '{}'), COALESCE((SELECT MAX({}) FROM {}), 0) + 1, false)",
            self.table_literal(table),
            escape_string_literal(column),
            self.quote_identifier(column),
            self.quote_table(table),
        ))
    }

    // PostgreSQL cannot suspend a single constraint; foreign keys are enforced
    // by system triggers on both endpoint tables, so those are switched off.
    fn disable_foreign_key_sql(&self, fk: &ForeignKey) -> Vec<String> {
        self.endpoint_triggers(fk, "DISABLE")
    }

    fn enable_foreign_key_sql(&self, fk: &ForeignKey, _validate: bool) -> Vec<String> {
        self.endpoint_triggers(fk, "ENABLE")
    }
}

// ===========================================================================
// SQL Server (hand-written, sea-query has no T-SQL backend)
// ===========================================================================

/// SQL Server dialect
#[derive(Debug, Clone, Default)]
pub struct SqlServerDialect;

impl SqlDialect for SqlServerDialect {
    fn name(&self) -> &'static str {
        "SQL Server"
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::SqlServer
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("[{}]", name.replace(']', "]]"))
    }

    fn quote_table(&self, table: &TableName) -> String {
        format!(
            "{}.{}.{}",
            self.quote_identifier(&table.catalog),
            self.quote_identifier(&table.schema),
            self.quote_identifier(&table.table)
        )
    }

    fn placeholder(&self, index: usize) -> String {
        format!("@P{}", index)
    }

    fn build_select(
        &self,
        table: &TableName,
        columns: &[&str],
        where_clause: Option<&str>,
    ) -> String {
        let cols = if columns.is_empty() {
            "*".to_string()
        } else {
            columns
                .iter()
                .map(|c| self.quote_identifier(c))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut sql = format!("SELECT {} FROM {}", cols, self.quote_table(table));
        if let Some(w) = where_clause {
            sql.push_str(" WHERE ");
            sql.push_str(w);
        }
        sql
    }

    fn row_count_sql(&self, table: &TableName, cap: Option<u64>) -> String {
        match cap {
            Some(cap) => format!(
                "SELECT COUNT(*) AS n FROM (SELECT TOP ({}) 1 AS one FROM {}) AS capped",
                cap,
                self.quote_table(table)
            ),
            None => format!("SELECT COUNT(*) AS n FROM {}", self.quote_table(table)),
        }
    }

    fn insert_sql(&self, table: &TableName, columns: &[&str], _identity: bool) -> String {
        let cols: Vec<String> = columns.iter().map(|c| self.quote_identifier(c)).collect();
        let params: Vec<String> = (1..=columns.len()).map(|i| self.placeholder(i)).collect();
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.quote_table(table),
            cols.join(", "),
            params.join(", ")
        )
    }

    fn identity_insert_sql(&self, table: &TableName, enable: bool) -> Option<String> {
        Some(format!(
            "SET IDENTITY_INSERT {} {}",
            self.quote_table(table),
            if enable { "ON" } else { "OFF" }
        ))
    }

    fn identity_resync_sql(&self, _table: &TableName, _column: &str) -> Option<String> {
        // explicit identity values already advance the seed
        None
    }

    fn disable_foreign_key_sql(&self, fk: &ForeignKey) -> Vec<String> {
        vec![format!(
            "ALTER TABLE {} NOCHECK CONSTRAINT {}",
            self.quote_table(&fk.child_table),
            self.quote_identifier(&fk.name)
        )]
    }

    fn enable_foreign_key_sql(&self, fk: &ForeignKey, validate: bool) -> Vec<String> {
        vec![format!(
            "ALTER TABLE {} {}CHECK CONSTRAINT {}",
            self.quote_table(&fk.child_table),
            if validate { "WITH CHECK " } else { "" },
            self.quote_identifier(&fk.name)
        )]
    }

    fn referential_action(&self, action: ForeignKeyAction) -> &'static str {
        match action {
            // not supported by SQL Server
            ForeignKeyAction::Restrict => "NO ACTION",
            other => other.to_sql(),
        }
    }
}

/// Get a dialect for a backend
pub fn dialect_for(database: DatabaseType) -> Box<dyn SqlDialect> {
    match database {
        DatabaseType::SqlServer => Box::new(SqlServerDialect),
        DatabaseType::PostgreSQL | DatabaseType::Unknown => Box::new(PostgresDialect),
    }
}
