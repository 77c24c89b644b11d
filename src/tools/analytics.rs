//! Analytical database tools
//!
//! An in-memory SQLite database the model loads local CSV/JSON files into and
//! queries with SQL. CSV parsing goes through the `csv` virtual table module;
//! column types are inferred from the data so numeric comparisons behave.

use super::{contained_path, Tool, ToolResult};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, InterruptHandle};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Rows returned by `run_query` before the output is truncated
const MAX_QUERY_ROWS: usize = 200;

/// Quote an identifier for SQLite
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Table name derived from a file path: the stem with non-word characters
/// replaced, e.g. `data/Sales 2024.csv` -> `sales_2024`
pub fn table_name_from_path(path: &str) -> String {
    let stem = Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    if name.is_empty() {
        "data".to_string()
    } else {
        name
    }
}

/// Narrowest SQLite type that holds every value seen in a column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Unknown,
    Integer,
    Real,
    Text,
}

impl ColumnKind {
    fn widen_with_text(self, value: &str) -> Self {
        if value.is_empty() {
            return self;
        }
        let seen = if value.parse::<i64>().is_ok() {
            ColumnKind::Integer
        } else if value.parse::<f64>().is_ok() {
            ColumnKind::Real
        } else {
            ColumnKind::Text
        };
        self.widen(seen)
    }

    fn widen_with_json(self, value: &Value) -> Self {
        let seen = match value {
            Value::Null => return self,
            Value::Bool(_) => ColumnKind::Integer,
            Value::Number(n) if n.is_i64() => ColumnKind::Integer,
            Value::Number(_) => ColumnKind::Real,
            _ => ColumnKind::Text,
        };
        self.widen(seen)
    }

    fn widen(self, other: Self) -> Self {
        use ColumnKind::*;
        match (self, other) {
            (Unknown, k) | (k, Unknown) => k,
            (Text, _) | (_, Text) => Text,
            (Real, _) | (_, Real) => Real,
            (Integer, Integer) => Integer,
        }
    }

    fn sql_type(self) -> &'static str {
        match self {
            ColumnKind::Integer => "INTEGER",
            ColumnKind::Real => "REAL",
            ColumnKind::Text | ColumnKind::Unknown => "TEXT",
        }
    }
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn format_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => String::new(),
        ValueRef::Integer(i) => i.to_string(),
        ValueRef::Real(f) => f.to_string(),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned(),
        ValueRef::Blob(b) => format!("<{} bytes>", b.len()),
    }
}

const CALL_PENDING: u8 = 0;
const CALL_RUNNING: u8 = 1;
const CALL_DONE: u8 = 2;
const CALL_ABANDONED: u8 = 3;

/// Interrupts the connection when the caller stops waiting on a running call
struct AbandonGuard {
    state: Arc<AtomicU8>,
    interrupt: Arc<InterruptHandle>,
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if self.state.swap(CALL_ABANDONED, Ordering::SeqCst) == CALL_RUNNING {
            tracing::debug!("Interrupting abandoned analytics query");
            self.interrupt.interrupt();
        }
    }
}

/// Shared handle to the analytical database
///
/// SQLite work runs on the blocking pool. Dropping the returned future
/// (e.g. on a tool timeout) interrupts the statement it started.
#[derive(Clone)]
pub struct AnalyticsDb {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    base_dir: PathBuf,
}

impl AnalyticsDb {
    /// Fresh in-memory database; relative file paths resolve against `base_dir`
    pub fn in_memory(base_dir: PathBuf) -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open analytics database")?;
        rusqlite::vtab::csvtab::load_module(&conn).context("Failed to load CSV module")?;
        let interrupt = Arc::new(conn.get_interrupt_handle());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            interrupt,
            base_dir,
        })
    }

    /// Run `f` against the connection on the blocking pool
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(CALL_PENDING));
        let _guard = AbandonGuard {
            state: Arc::clone(&state),
            interrupt: Arc::clone(&self.interrupt),
        };
        let conn = Arc::clone(&self.conn);

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            // Only the caller still waiting may start a statement
            if state
                .compare_exchange(CALL_PENDING, CALL_RUNNING, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                bail!("Query cancelled before it started");
            }
            let result = f(&mut conn);
            let _ = state.compare_exchange(
                CALL_RUNNING,
                CALL_DONE,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            result
        })
        .await?
    }

    /// Load a local CSV or JSON file into `table`, replacing any existing table
    ///
    /// Returns the number of rows loaded.
    pub async fn create_table_from_path(&self, path: &str, table: &str) -> Result<usize> {
        let Some(full_path) = contained_path(&self.base_dir, path) else {
            bail!("Path is outside the working directory: {}", path);
        };
        if !full_path.is_file() {
            bail!("File not found: {}", path);
        }

        let extension = full_path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let table = table.to_string();
        match extension.as_str() {
            "csv" => self.call(move |conn| load_csv(conn, &full_path, &table)).await,
            "json" => self.call(move |conn| load_json(conn, &full_path, &table)).await,
            other => bail!("Unsupported file type '.{}': expected .csv or .json", other),
        }
    }

    pub async fn show_tables(&self) -> Result<Vec<String>> {
        self.call(|conn| {
            let mut stmt =
                conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
        .await
    }

    /// Column names and types of a table
    pub async fn describe_table(&self, table: &str) -> Result<Vec<(String, String)>> {
        let table = table.to_string();
        self.call(move |conn| {
            let mut stmt =
                conn.prepare(&format!("PRAGMA main.table_info({})", quote_ident(&table)))?;
            let columns = stmt
                .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            if columns.is_empty() {
                bail!("Table not found: {}", table);
            }
            Ok(columns)
        })
        .await
    }

    /// Run one SQL statement; query results come back as CSV-style text
    pub async fn run_query(&self, sql: &str) -> Result<String> {
        let sql = sql.trim().trim_end_matches(';').to_string();
        self.call(move |conn| query_to_text(conn, &sql)).await
    }
}

fn load_csv(conn: &mut Connection, path: &Path, table: &str) -> Result<usize> {
    let staging = "temp.csv_import";

    conn.execute_batch(&format!(
        "DROP TABLE IF EXISTS {staging};
         CREATE VIRTUAL TABLE {staging} USING csv(filename={}, header=yes);",
        quote_literal(&path.to_string_lossy())
    ))
    .with_context(|| format!("Failed to read CSV {}", path.display()))?;

    let result = (|| -> Result<usize> {
        let mut stmt = conn.prepare(&format!("SELECT * FROM {staging}"))?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut kinds = vec![ColumnKind::Unknown; columns.len()];

        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            for (i, kind) in kinds.iter_mut().enumerate() {
                let value: Option<String> = row.get(i)?;
                *kind = kind.widen_with_text(value.as_deref().unwrap_or_default());
            }
        }
        drop(rows);
        drop(stmt);

        let definitions: Vec<String> = columns
            .iter()
            .zip(&kinds)
            .map(|(c, k)| format!("{} {}", quote_ident(c), k.sql_type()))
            .collect();
        let selects: Vec<String> = columns
            .iter()
            .map(|c| format!("NULLIF({}, '')", quote_ident(c)))
            .collect();

        let table = quote_ident(table);
        conn.execute_batch(&format!(
            "DROP TABLE IF EXISTS main.{table};
             CREATE TABLE main.{table} ({});
             INSERT INTO main.{table} SELECT {} FROM {staging};",
            definitions.join(", "),
            selects.join(", ")
        ))?;

        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM main.{table}"), [], |r| r.get(0))?;
        Ok(count as usize)
    })();

    conn.execute_batch(&format!("DROP TABLE IF EXISTS {staging};"))?;
    result
}

fn load_json(conn: &mut Connection, path: &Path, table: &str) -> Result<usize> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;

    // Either a JSON array of objects or newline-delimited objects
    let records: Vec<serde_json::Map<String, Value>> = match serde_json::from_str(&text) {
        Ok(Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        Ok(Value::Object(map)) => vec![map],
        Ok(_) => bail!("JSON file must hold an object or an array of objects"),
        Err(_) => text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str)
            .collect::<std::result::Result<_, _>>()
            .context("Invalid JSON")?,
    };

    let mut columns: Vec<String> = Vec::new();
    for record in &records {
        for key in record.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }
    if columns.is_empty() {
        bail!("JSON file has no records to load");
    }

    let kinds: Vec<ColumnKind> = columns
        .iter()
        .map(|c| {
            records.iter().fold(ColumnKind::Unknown, |kind, r| {
                r.get(c).map_or(kind, |v| kind.widen_with_json(v))
            })
        })
        .collect();

    let tx = conn.transaction()?;
    let quoted = quote_ident(table);
    let definitions: Vec<String> = columns
        .iter()
        .zip(&kinds)
        .map(|(c, k)| format!("{} {}", quote_ident(c), k.sql_type()))
        .collect();
    tx.execute_batch(&format!(
        "DROP TABLE IF EXISTS main.{quoted};
         CREATE TABLE main.{quoted} ({});",
        definitions.join(", ")
    ))?;

    {
        let placeholders = vec!["?"; columns.len()].join(", ");
        let mut insert = tx.prepare(&format!("INSERT INTO main.{quoted} VALUES ({placeholders})"))?;
        for record in &records {
            let values: Vec<SqlValue> = columns
                .iter()
                .map(|c| record.get(c).map_or(SqlValue::Null, json_to_sql))
                .collect();
            insert.execute(rusqlite::params_from_iter(values))?;
        }
    }
    tx.commit()?;

    Ok(records.len())
}

fn query_to_text(conn: &mut Connection, sql: &str) -> Result<String> {
    let mut stmt = conn.prepare(sql)?;

    if stmt.column_count() == 0 {
        let changed = stmt.execute([])?;
        return Ok(format!("OK ({} rows affected)", changed));
    }

    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let width = columns.len();
    let mut lines = vec![columns.join(",")];
    let mut truncated = false;

    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        if lines.len() > MAX_QUERY_ROWS {
            truncated = true;
            break;
        }
        let cells: Vec<String> = (0..width)
            .map(|i| row.get_ref(i).map(format_value))
            .collect::<Result<_, _>>()?;
        lines.push(cells.join(","));
    }

    if truncated {
        lines.push(format!("... (truncated at {} rows)", MAX_QUERY_ROWS));
    }
    Ok(lines.join("\n"))
}

/// Tool that loads a local CSV or JSON file into a table
pub struct CreateTableFromPathTool {
    db: AnalyticsDb,
}

impl CreateTableFromPathTool {
    pub fn new(db: AnalyticsDb) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Tool for CreateTableFromPathTool {
    fn name(&self) -> &str {
        "create_table_from_path"
    }

    fn description(&self) -> &str {
        "Creates a table from a local .csv or .json file. Returns the table name."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Path of the file to load, relative to the working directory"
                },
                "table": {
                    "type": "string",
                    "description": "Optional table name (defaults to the file name without extension)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, params: Value) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Params {
            path: String,
            table: Option<String>,
        }

        let params: Params = serde_json::from_value(params)?;
        let table = params
            .table
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| table_name_from_path(&params.path));

        match self.db.create_table_from_path(&params.path, &table).await {
            Ok(rows) => {
                tracing::info!(table = %table, rows, "Created table from {}", params.path);
                Ok(ToolResult::success(table))
            }
            Err(e) => Ok(ToolResult::error(format!("Error creating table: {:#}", e))),
        }
    }
}

pub struct ShowTablesTool {
    db: AnalyticsDb,
}

impl ShowTablesTool {
    pub fn new(db: AnalyticsDb) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Tool for ShowTablesTool {
    fn name(&self) -> &str {
        "show_tables"
    }

    fn description(&self) -> &str {
        "Lists the tables in the database."
    }

    fn parameters(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    async fn execute(&self, _params: Value) -> Result<ToolResult> {
        let tables = self.db.show_tables().await?;
        if tables.is_empty() {
            return Ok(ToolResult::success("No tables found"));
        }
        Ok(ToolResult::success(tables.join("\n")))
    }
}

pub struct DescribeTableTool {
    db: AnalyticsDb,
}

impl DescribeTableTool {
    pub fn new(db: AnalyticsDb) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Tool for DescribeTableTool {
    fn name(&self) -> &str {
        "describe_table"
    }

    fn description(&self) -> &str {
        "Describes a table: its columns and their types."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "table": {"type": "string", "description": "Table to describe"}
            },
            "required": ["table"]
        })
    }

    async fn execute(&self, params: Value) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Params {
            table: String,
        }

        let params: Params = serde_json::from_value(params)?;
        match self.db.describe_table(&params.table).await {
            Ok(columns) => {
                let mut out = format!("{}\ncolumn,type", params.table);
                for (name, ty) in columns {
                    out.push_str(&format!("\n{},{}", name, ty));
                }
                Ok(ToolResult::success(out))
            }
            Err(e) => Ok(ToolResult::error(e.to_string())),
        }
    }
}

pub struct RunQueryTool {
    db: AnalyticsDb,
}

impl RunQueryTool {
    pub fn new(db: AnalyticsDb) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Tool for RunQueryTool {
    fn name(&self) -> &str {
        "run_query"
    }

    fn description(&self) -> &str {
        "Runs a SQL query and returns the result. Quote column names that contain spaces or special characters with double quotes."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "SQL query to run"}
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value) -> Result<ToolResult> {
        #[derive(Deserialize)]
        struct Params {
            query: String,
        }

        let params: Params = serde_json::from_value(params)?;
        tracing::debug!(query = %params.query, "Running query");
        match self.db.run_query(&params.query).await {
            Ok(output) => Ok(ToolResult::success(output)),
            Err(e) => Ok(ToolResult::error(format!("Error running query: {}", e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolRegistry;
    use pretty_assertions::assert_eq;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn db_with_sales() -> (TempDir, AnalyticsDb) {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("Sales 2024.csv"),
            "region,\"unit price\",qty\nnorth,2.5,4\nsouth,1,10\nnorth,3,\n",
        )
        .unwrap();
        let db = AnalyticsDb::in_memory(dir.path().to_path_buf()).unwrap();
        (dir, db)
    }

    #[test]
    fn test_table_name_from_path() {
        assert_eq!(table_name_from_path("data/Sales 2024.csv"), "sales_2024");
        assert_eq!(table_name_from_path("orders.json"), "orders");
    }

    #[tokio::test]
    async fn test_csv_load_infers_column_types() {
        let (_dir, db) = db_with_sales();
        let rows = db.create_table_from_path("Sales 2024.csv", "sales").await.unwrap();
        assert_eq!(rows, 3);

        let columns = db.describe_table("sales").await.unwrap();
        assert_eq!(
            columns,
            vec![
                ("region".to_string(), "TEXT".to_string()),
                ("unit price".to_string(), "REAL".to_string()),
                ("qty".to_string(), "INTEGER".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_query_with_quoted_column() {
        let (_dir, db) = db_with_sales();
        db.create_table_from_path("Sales 2024.csv", "sales").await.unwrap();

        let out = db
            .run_query(
                "SELECT region, SUM(\"unit price\" * qty) AS revenue FROM sales \
                 WHERE qty > 3 GROUP BY region ORDER BY region;",
            )
            .await
            .unwrap();
        assert_eq!(out, "region,revenue\nnorth,10\nsouth,10");
    }

    #[tokio::test]
    async fn test_json_array_load() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("people.json"),
            r#"[{"name":"ada","age":36},{"name":"alan","age":41,"tags":["x"]}]"#,
        )
        .unwrap();
        let db = AnalyticsDb::in_memory(dir.path().to_path_buf()).unwrap();

        assert_eq!(db.create_table_from_path("people.json", "people").await.unwrap(), 2);
        assert_eq!(db.show_tables().await.unwrap(), vec!["people"]);
        let out = db
            .run_query("SELECT name, tags FROM people WHERE age > 40")
            .await
            .unwrap();
        assert_eq!(out, "name,tags\nalan,[\"x\"]");
    }

    #[tokio::test]
    async fn test_unsupported_extension_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hi").unwrap();
        let db = AnalyticsDb::in_memory(dir.path().to_path_buf()).unwrap();
        let err = db.create_table_from_path("notes.txt", "notes").await.unwrap_err();
        assert!(err.to_string().contains("Unsupported file type"));
    }

    #[tokio::test]
    async fn test_files_outside_working_dir_rejected() {
        let outer = TempDir::new().unwrap();
        let base = outer.path().join("work");
        std::fs::create_dir(&base).unwrap();
        std::fs::write(outer.path().join("secret.csv"), "a,b\n1,2\n").unwrap();
        let db = AnalyticsDb::in_memory(base).unwrap();

        let absolute = outer.path().join("secret.csv");
        for path in ["../secret.csv", absolute.to_str().unwrap()] {
            let err = db.create_table_from_path(path, "secret").await.unwrap_err();
            assert!(err.to_string().contains("outside the working directory"), "{}", path);
        }
        assert!(db.show_tables().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tools_report_errors_as_results() {
        let (_dir, db) = db_with_sales();
        let query = RunQueryTool::new(db.clone());
        let result = query
            .execute(json!({"query": "SELECT * FROM missing"}))
            .await
            .unwrap();
        assert!(!result.success);

        let create = CreateTableFromPathTool::new(db.clone());
        let result = create
            .execute(json!({"path": "Sales 2024.csv"}))
            .await
            .unwrap();
        assert_eq!(result, ToolResult::success("sales_2024"));

        let show = ShowTablesTool::new(db);
        let result = show.execute(json!({})).await.unwrap();
        assert_eq!(result.output, "sales_2024");
    }

    #[tokio::test]
    async fn test_statements_without_rows() {
        let (_dir, db) = db_with_sales();
        db.create_table_from_path("Sales 2024.csv", "sales").await.unwrap();
        let out = db
            .run_query("DELETE FROM sales WHERE region = 'south'")
            .await
            .unwrap();
        assert_eq!(out, "OK (1 rows affected)");
    }

    #[tokio::test]
    async fn test_large_results_stop_at_row_cap() {
        let (_dir, db) = db_with_sales();
        let out = db
            .run_query(
                "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) \
                 SELECT x FROM c",
            )
            .await
            .unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), MAX_QUERY_ROWS + 2);
        assert_eq!(lines[MAX_QUERY_ROWS], "200");
        assert_eq!(lines[MAX_QUERY_ROWS + 1], "... (truncated at 200 rows)");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_query_interrupted_on_timeout() {
        let (dir, db) = db_with_sales();
        let mut registry = ToolRegistry::new(dir.path().to_path_buf());
        registry.register(Arc::new(RunQueryTool::new(db.clone())));
        registry.set_tool_timeout_secs(1);

        let started = Instant::now();
        let result = registry
            .execute(
                "run_query",
                json!({"query": "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c \
                          WHERE x < 1000000000) SELECT count(*) FROM c"}),
            )
            .await;
        assert!(!result.success);
        assert!(result.output.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));

        // The interrupted statement releases the connection
        let out = tokio::time::timeout(Duration::from_secs(5), db.run_query("SELECT 1 AS one"))
            .await
            .expect("connection still held by the slow query")
            .unwrap();
        assert_eq!(out, "one\n1");
    }
}
