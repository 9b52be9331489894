//! Query Store - read-only SQLite access
//!
//! Every request opens its own connection with `SQLITE_OPEN_READ_ONLY` and
//! `query_only` set, so nothing that reaches this module can change the data
//! even if it slipped past the guard. Statements run on a blocking worker
//! under a wall-clock limit; when the limit fires the connection is
//! interrupted.

use crate::error::{PipelineError, Result};
use crate::schema::{descriptor, LiveSchema, PARTICIPANTS, PROJECTS};
use chrono::NaiveDate;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub type Row = HashMap<String, Value>;

/// Column names in select order plus one map per row.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl QueryRows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// No rows, or a single row of NULLs as an aggregate over nothing returns.
    pub fn is_effectively_empty(&self) -> bool {
        match self.rows.as_slice() {
            [] => true,
            [only] => !only.is_empty() && only.values().all(Value::is_null),
            _ => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    path: PathBuf,
    timeout: Duration,
}

impl SqliteStore {
    pub fn new(path: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_read_only(&self) -> Result<Connection> {
        if !self.path.is_file() {
            return Err(PipelineError::Execution(format!(
                "Database not found at {}. Run the loader first.",
                self.path.display()
            )));
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&self.path, flags).map_err(|e| {
            PipelineError::Execution(format!("Failed to open {}: {}", self.path.display(), e))
        })?;
        conn.execute_batch("PRAGMA query_only = ON;")?;
        conn.busy_timeout(self.timeout)?;
        Ok(conn)
    }

    /// Runs an accepted statement.
    pub async fn execute(&self, sql: &str) -> Result<QueryRows> {
        self.run(sql.to_string(), Vec::new()).await
    }

    async fn run(&self, sql: String, params: Vec<SqlValue>) -> Result<QueryRows> {
        let conn = self.open_read_only()?;
        let interrupt = conn.get_interrupt_handle();

        debug!("Executing: {}", sql);
        let worker = tokio::task::spawn_blocking(move || query_rows(&conn, &sql, &params));

        match tokio::time::timeout(self.timeout, worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(PipelineError::Execution(format!("Query worker failed: {}", e))),
            Err(_) => {
                interrupt.interrupt();
                warn!("Query interrupted after {:?}", self.timeout);
                Err(PipelineError::Execution(format!(
                    "Query exceeded the {}s time limit and was cancelled",
                    self.timeout.as_secs_f32()
                )))
            }
        }
    }

    /// Tables and columns actually present in the database file.
    pub fn introspect(&self) -> Result<LiveSchema> {
        let conn = self.open_read_only()?;

        let tables: Vec<String> = {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type IN ('table', 'view') \
                 AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )?;
            let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
            names.collect::<rusqlite::Result<_>>()?
        };

        let mut live = LiveSchema::new();
        for table in &tables {
            let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
            let columns = stmt
                .query_map([table], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            live.insert_table(table, columns);
        }

        info!("Introspected {} tables from {}", tables.len(), self.path.display());
        Ok(live)
    }

    /// Non-null values of a described column.
    pub async fn column_values(&self, table: &str, column: &str) -> Result<Vec<String>> {
        let spec = descriptor().column(table, column).ok_or_else(|| {
            PipelineError::Execution(format!("{}.{} is not a described column", table, column))
        })?;
        let table = descriptor()
            .table(table)
            .map(|t| t.name)
            .unwrap_or(PROJECTS);

        // identifiers come from the static descriptor, never from the caller
        let sql = format!(
            "SELECT {col} FROM {table} WHERE {col} IS NOT NULL AND TRIM({col}) != ''",
            col = spec.name,
            table = table
        );
        let result = self.run(sql, Vec::new()).await?;

        Ok(result
            .rows
            .iter()
            .filter_map(|row| row.get(spec.name).and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    /// Countries ranked by number of participant organisations.
    pub async fn top_countries(&self, limit: usize) -> Result<Vec<(String, i64)>> {
        let sql = format!(
            "SELECT country_territory, COUNT(*) AS participant_count FROM {} \
             WHERE country_territory IS NOT NULL \
             GROUP BY country_territory ORDER BY participant_count DESC, country_territory LIMIT ?1",
            PARTICIPANTS
        );
        let result = self.run(sql, vec![SqlValue::Integer(limit as i64)]).await?;

        Ok(result
            .rows
            .iter()
            .filter_map(|row| {
                let country = row.get("country_territory")?.as_str()?.to_string();
                let count = row.get("participant_count")?.as_i64()?;
                Some((country, count))
            })
            .collect())
    }

    /// Earliest project start and latest project end.
    pub async fn date_bounds(&self) -> Result<Option<(NaiveDate, NaiveDate)>> {
        let sql = format!(
            "SELECT MIN(project_start_date) AS first_start, MAX(project_end_date) AS last_end FROM {}",
            PROJECTS
        );
        let result = self.run(sql, Vec::new()).await?;

        let parse = |key: &str| -> Option<NaiveDate> {
            let raw = result.rows.first()?.get(key)?.as_str()?;
            NaiveDate::parse_from_str(raw.get(..10).unwrap_or(raw), "%Y-%m-%d").ok()
        };

        Ok(parse("first_start").zip(parse("last_end")))
    }
}

fn query_rows(conn: &Connection, sql: &str, params: &[SqlValue]) -> Result<QueryRows> {
    let mut stmt = conn.prepare(sql)?;
    if !stmt.readonly() {
        return Err(PipelineError::Execution(
            "Refusing to run a statement that writes".to_string(),
        ));
    }

    let columns = unique_names(stmt.column_names());
    let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;

    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = HashMap::with_capacity(columns.len());
        for (i, name) in columns.iter().enumerate() {
            record.insert(name.clone(), to_json(row.get_ref(i)?));
        }
        out.push(record);
    }

    Ok(QueryRows { columns, rows: out })
}

/// `SELECT p.city, pt.city` yields `city` and `city_2`. A suffixed name
/// never collides with a column already emitted.
fn unique_names(names: Vec<&str>) -> Vec<String> {
    let mut taken: HashSet<String> = HashSet::with_capacity(names.len());
    names
        .into_iter()
        .map(|name| {
            let mut candidate = name.to_string();
            let mut suffix = 1;
            while taken.contains(&candidate) {
                suffix += 1;
                candidate = format!("{}_{}", name, suffix);
            }
            taken.insert(candidate.clone());
            candidate
        })
        .collect()
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<{} bytes>", bytes.len())),
    }
}
