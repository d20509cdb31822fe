//! Tabular source contracts, query/alias catalogs and header-driven row mapping.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::postgres::types::{PgInterval, PgMoney};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::{BigDecimal, JsonValue};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tpdm-source";

/// Cell text the source emits for SQL NULL.
pub const NULL_MARKER: &str = "[null]";

/// Query result: first row is the header row, remaining rows are data.
pub type Table = Vec<Vec<String>>;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("column `{column}` has unsupported type {type_name}; cast it to text in the query")]
    UnsupportedColumn { column: String, type_name: String },
    #[error("reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: expected `field=alias[,alias...]`")]
    MalformedAlias { path: PathBuf, line: usize },
    #[error("no query named `{0}` in the sql directory")]
    MissingQuery(String),
    #[error("no column map named `{0}` in the column map directory")]
    MissingColumnMap(String),
    #[error("no fixture result registered for query `{sql}` with params {params:?}")]
    UnknownFixture { sql: String, params: Vec<String> },
}

#[async_trait]
pub trait TabularSource: Send + Sync {
    /// Run `sql` with positional text parameters. Every cell is rendered as text,
    /// NULL as [`NULL_MARKER`].
    async fn query(&self, sql: &str, params: &[&str]) -> Result<Table, SourceError>;
}

/// Postgres-backed source.
#[derive(Debug, Clone)]
pub struct PgTabularSource {
    pool: PgPool,
}

impl PgTabularSource {
    pub async fn connect(database_url: &str) -> Result<Self, SourceError> {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl TabularSource for PgTabularSource {
    async fn query(&self, sql: &str, params: &[&str]) -> Result<Table, SourceError> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(param.to_string());
        }
        let rows = query.fetch_all(&self.pool).await?;

        let headers = rows
            .first()
            .map(|row| {
                row.columns()
                    .iter()
                    .map(|c| c.name().to_string())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let mut table = Vec::with_capacity(rows.len() + 1);
        table.push(headers);
        for row in &rows {
            let mut cells = Vec::with_capacity(row.len());
            for idx in 0..row.len() {
                cells.push(cell_text(row, idx)?);
            }
            table.push(cells);
        }
        debug!(rows = rows.len(), params = params.len(), "source query complete");
        Ok(table)
    }
}

/// Decoding used for a Postgres column, chosen by its type name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Money,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Interval,
    Uuid,
    Json,
    Text,
}

impl CellKind {
    pub fn from_type_name(type_name: &str) -> Self {
        match type_name {
            "BOOL" => CellKind::Bool,
            "INT2" => CellKind::Int2,
            "INT4" => CellKind::Int4,
            "INT8" => CellKind::Int8,
            "FLOAT4" => CellKind::Float4,
            "FLOAT8" => CellKind::Float8,
            "NUMERIC" => CellKind::Numeric,
            "MONEY" => CellKind::Money,
            "DATE" => CellKind::Date,
            "TIME" => CellKind::Time,
            "TIMESTAMP" => CellKind::Timestamp,
            "TIMESTAMPTZ" => CellKind::TimestampTz,
            "INTERVAL" => CellKind::Interval,
            "UUID" => CellKind::Uuid,
            "JSON" | "JSONB" => CellKind::Json,
            _ => CellKind::Text,
        }
    }
}

/// Postgres-style rendering, e.g. `1 year 2 mons 3 days 04:05:06.5`.
pub fn format_interval(interval: &PgInterval) -> String {
    let mut parts = Vec::new();
    let years = interval.months / 12;
    let months = interval.months % 12;
    if years != 0 {
        parts.push(format!("{years} year{}", if years.abs() == 1 { "" } else { "s" }));
    }
    if months != 0 {
        parts.push(format!("{months} mon{}", if months.abs() == 1 { "" } else { "s" }));
    }
    if interval.days != 0 {
        let days = interval.days;
        parts.push(format!("{days} day{}", if days.abs() == 1 { "" } else { "s" }));
    }
    if interval.microseconds != 0 || parts.is_empty() {
        let sign = if interval.microseconds < 0 { "-" } else { "" };
        let micros = interval.microseconds.unsigned_abs();
        let secs = micros / 1_000_000;
        let frac = micros % 1_000_000;
        let mut clock = format!("{sign}{:02}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60);
        if frac != 0 {
            let digits = format!("{frac:06}");
            clock.push('.');
            clock.push_str(digits.trim_end_matches('0'));
        }
        parts.push(clock);
    }
    parts.join(" ")
}

fn cell_text(row: &PgRow, idx: usize) -> Result<String, SourceError> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(NULL_MARKER.to_string());
    }
    let type_name = raw.type_info().name().to_string();

    let text = match CellKind::from_type_name(&type_name) {
        CellKind::Bool => row.try_get::<bool, _>(idx)?.to_string(),
        CellKind::Int2 => row.try_get::<i16, _>(idx)?.to_string(),
        CellKind::Int4 => row.try_get::<i32, _>(idx)?.to_string(),
        CellKind::Int8 => row.try_get::<i64, _>(idx)?.to_string(),
        CellKind::Float4 => row.try_get::<f32, _>(idx)?.to_string(),
        CellKind::Float8 => row.try_get::<f64, _>(idx)?.to_string(),
        CellKind::Numeric => row.try_get::<BigDecimal, _>(idx)?.to_string(),
        CellKind::Money => row.try_get::<PgMoney, _>(idx)?.to_bigdecimal(2).to_string(),
        CellKind::Date => row.try_get::<NaiveDate, _>(idx)?.format("%Y-%m-%d").to_string(),
        CellKind::Time => row.try_get::<NaiveTime, _>(idx)?.to_string(),
        CellKind::Timestamp => row.try_get::<NaiveDateTime, _>(idx)?.to_string(),
        CellKind::TimestampTz => row.try_get::<DateTime<Utc>, _>(idx)?.to_rfc3339(),
        CellKind::Interval => format_interval(&row.try_get::<PgInterval, _>(idx)?),
        CellKind::Uuid => row.try_get::<Uuid, _>(idx)?.to_string(),
        CellKind::Json => row.try_get::<JsonValue, _>(idx)?.to_string(),
        CellKind::Text => row
            .try_get::<String, _>(idx)
            .map_err(|_| SourceError::UnsupportedColumn {
                column: row.columns()[idx].name().to_string(),
                type_name: type_name.clone(),
            })?,
    };
    Ok(text)
}

/// In-memory source keyed by exact sql text and parameters.
#[derive(Debug, Clone, Default)]
pub struct FixtureTabularSource {
    results: HashMap<(String, Vec<String>), Table>,
}

impl FixtureTabularSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, sql: &str, params: &[&str], table: Table) -> Self {
        let key = (
            sql.to_string(),
            params.iter().map(|p| p.to_string()).collect(),
        );
        self.results.insert(key, table);
        self
    }
}

#[async_trait]
impl TabularSource for FixtureTabularSource {
    async fn query(&self, sql: &str, params: &[&str]) -> Result<Table, SourceError> {
        let params: Vec<String> = params.iter().map(|p| p.to_string()).collect();
        self.results
            .get(&(sql.to_string(), params.clone()))
            .cloned()
            .ok_or_else(|| SourceError::UnknownFixture {
                sql: sql.to_string(),
                params,
            })
    }
}

/// Logical field name -> accepted header aliases (stored lowercase).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnAliases {
    fields: BTreeMap<String, BTreeSet<String>>,
}

impl ColumnAliases {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, field: &str, aliases: &[&str]) -> Self {
        let entry = self.fields.entry(field.to_string()).or_default();
        entry.extend(aliases.iter().map(|a| a.trim().to_lowercase()));
        self
    }

    /// Parse `field=alias[,alias...]` lines. Blank lines and `#`/`!` comments are skipped.
    pub fn parse(text: &str, origin: &Path) -> Result<Self, SourceError> {
        let mut aliases = Self::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
                continue;
            }
            let Some((field, value)) = line.split_once('=') else {
                return Err(SourceError::MalformedAlias {
                    path: origin.to_path_buf(),
                    line: idx + 1,
                });
            };
            let field = field.trim();
            if field.is_empty() {
                return Err(SourceError::MalformedAlias {
                    path: origin.to_path_buf(),
                    line: idx + 1,
                });
            }
            let entry = aliases.fields.entry(field.to_string()).or_default();
            entry.extend(
                value
                    .split(',')
                    .map(|a| a.trim().to_lowercase())
                    .filter(|a| !a.is_empty()),
            );
        }
        Ok(aliases)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| SourceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    fn matches(&self, field: &str, header_lower: &str) -> bool {
        self.fields
            .get(field)
            .is_some_and(|set| set.contains(header_lower))
    }
}

/// Logical field -> column position, computed once from the header row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnIndex {
    positions: BTreeMap<String, usize>,
}

impl ColumnIndex {
    /// The first header matching a field's alias set (case-insensitively) claims it.
    pub fn resolve(headers: &[String], aliases: &ColumnAliases) -> Self {
        let mut positions = BTreeMap::new();
        for (idx, header) in headers.iter().enumerate() {
            let lower = header.trim().to_lowercase();
            for field in aliases.fields() {
                if !positions.contains_key(field) && aliases.matches(field, &lower) {
                    positions.insert(field.to_string(), idx);
                }
            }
        }
        Self { positions }
    }

    pub fn position(&self, field: &str) -> Option<usize> {
        self.positions.get(field).copied()
    }
}

/// One data row viewed through its logical field names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappedRow {
    values: BTreeMap<String, String>,
}

impl MappedRow {
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            values: pairs
                .into_iter()
                .filter(|(_, v)| *v != NULL_MARKER)
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Absent when the column was not mapped, the row is short, or the cell is NULL.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.values.get(field).map(String::as_str)
    }

    pub fn owned(&self, field: &str) -> Option<String> {
        self.get(field).map(str::to_string)
    }
}

/// Split a table into mapped data rows. An empty table yields no rows.
pub fn map_table(table: &Table, aliases: &ColumnAliases) -> Vec<MappedRow> {
    let Some((headers, rows)) = table.split_first() else {
        return Vec::new();
    };
    let index = ColumnIndex::resolve(headers, aliases);
    rows.iter()
        .map(|row| {
            let values = aliases
                .fields()
                .filter_map(|field| {
                    let cell = row.get(index.position(field)?)?;
                    (cell != NULL_MARKER).then(|| (field.to_string(), cell.clone()))
                })
                .collect();
            MappedRow { values }
        })
        .collect()
}

/// Named SQL statements plus the column map for each.
#[derive(Debug, Clone, Default)]
pub struct QueryCatalog {
    queries: BTreeMap<String, String>,
    column_maps: BTreeMap<String, ColumnAliases>,
}

impl QueryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query(mut self, name: &str, sql: &str, aliases: ColumnAliases) -> Self {
        self.queries.insert(name.to_string(), sql.to_string());
        self.column_maps.insert(name.to_string(), aliases);
        self
    }

    /// Every `.sql` file in `sql_dir` is a query named after its stem, kept verbatim;
    /// every `.properties` file in `columnmap_dir` is the alias map for the query of
    /// the same name. Other files are ignored.
    pub fn load(sql_dir: impl AsRef<Path>, columnmap_dir: impl AsRef<Path>) -> Result<Self, SourceError> {
        let mut catalog = Self::new();
        for (name, path) in named_files(sql_dir.as_ref(), "sql")? {
            let text = fs::read_to_string(&path).map_err(|source| SourceError::Io {
                path: path.clone(),
                source,
            })?;
            catalog.queries.insert(name, text.trim().to_string());
        }
        for (name, path) in named_files(columnmap_dir.as_ref(), "properties")? {
            catalog.column_maps.insert(name, ColumnAliases::load(&path)?);
        }
        debug!(
            queries = catalog.queries.len(),
            column_maps = catalog.column_maps.len(),
            "query catalog loaded"
        );
        Ok(catalog)
    }

    pub fn query(&self, name: &str) -> Result<&str, SourceError> {
        self.queries
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| SourceError::MissingQuery(name.to_string()))
    }

    pub fn aliases(&self, name: &str) -> Result<&ColumnAliases, SourceError> {
        self.column_maps
            .get(name)
            .ok_or_else(|| SourceError::MissingColumnMap(name.to_string()))
    }
}

fn named_files(dir: &Path, extension: &str) -> Result<Vec<(String, PathBuf)>, SourceError> {
    let io_err = |source| SourceError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().to_string();
        if file_name.starts_with('.') {
            continue;
        }
        match file_name.rsplit_once('.') {
            Some((stem, ext)) if ext == extension && !stem.is_empty() => {
                files.push((stem.to_string(), path));
            }
            _ => debug!(path = %path.display(), "skipping file without .{extension} extension"),
        }
    }
    files.sort();
    Ok(files)
}
