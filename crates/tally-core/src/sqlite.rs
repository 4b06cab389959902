//! `SQLite`-backed document store.
//!
//! All kinds share one table keyed by `(kind, key)` with the document body
//! stored as JSON text. Filters and ordering go through `json_extract`, and
//! each commit runs inside a single SQL transaction.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, ErrorCode, params, params_from_iter};
use serde_json::Value as JsonValue;

use crate::document::{Direction, Document, Kind, Query, Value};
use crate::error::{Error, Result};
use crate::store::{DocumentStore, Mutation, StoreLimits, Transaction, decode_row};

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS documents (
    kind TEXT NOT NULL,
    key  TEXT NOT NULL,
    body TEXT NOT NULL,
    PRIMARY KEY (kind, key)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS documents_create_date
    ON documents (kind, json_extract(body, '$.createDate'));
";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Document store persisted in a `SQLite` database.
#[derive(Debug, Clone)]
pub struct SqliteDocumentStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
    limits: StoreLimits,
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::Internal {
        message: "sqlite connection lock poisoned".into(),
    }
}

fn sql_err(context: &str, err: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        if matches!(
            failure.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        ) {
            return Error::TransactionConflict {
                message: format!("{context}: {err}"),
            };
        }
    }
    Error::storage_with_source(context.to_string(), err)
}

fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Str(s) => SqlValue::Text(s.clone()),
        Value::Int(i) => SqlValue::Integer(*i),
        Value::Time(t) => SqlValue::Integer(t.timestamp_millis()),
    }
}

fn to_sql_int(value: usize) -> Result<SqlValue> {
    i64::try_from(value)
        .map(SqlValue::Integer)
        .map_err(|_| Error::InvalidInput(format!("{value} does not fit a SQL integer")))
}

impl SqliteDocumentStore {
    /// Opens (or creates) a database file.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| sql_err("open database", e))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .map_err(|e| sql_err("enable WAL", e))?;
        Self::initialize(conn, Some(path.to_path_buf()))
    }

    /// Creates an in-memory database (tests).
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| sql_err("open database", e))?;
        Self::initialize(conn, None)
    }

    fn initialize(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|e| sql_err("set busy timeout", e))?;
        conn.execute_batch(SCHEMA_SQL)
            .map_err(|e| sql_err("create schema", e))?;
        tracing::debug!(path = ?path, "sqlite document store ready");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
            limits: StoreLimits::default(),
        })
    }

    /// Overrides the per-call limits.
    #[must_use]
    pub const fn with_limits(mut self, limits: StoreLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Returns the database path, or `None` for in-memory stores.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(poison_err)?;
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::Internal {
            message: format!("sqlite task failed: {e}"),
        })?
    }
}

/// Renders a query as SQL plus positional parameters.
fn build_select(query: &Query, limit: usize) -> Result<(String, Vec<SqlValue>)> {
    let mut sql = String::from("SELECT key, body FROM documents WHERE kind = ?1");
    let mut params = vec![SqlValue::Text(query.kind.as_str().to_string())];

    if let Some(filter) = &query.filter {
        for clause in filter.clauses() {
            params.push(to_sql(&clause.value));
            sql.push_str(&format!(
                " AND json_extract(body, '$.{}') {} ?{}",
                clause.field,
                clause.op.as_sql(),
                params.len()
            ));
        }
    }

    sql.push_str(" ORDER BY ");
    for order in &query.order {
        let direction = match order.direction {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        };
        sql.push_str(&format!(
            "json_extract(body, '$.{}') {direction}, ",
            order.field
        ));
    }
    sql.push_str("key ASC");

    params.push(to_sql_int(limit)?);
    sql.push_str(&format!(" LIMIT ?{}", params.len()));
    params.push(to_sql_int(query.offset)?);
    sql.push_str(&format!(" OFFSET ?{}", params.len()));

    Ok((sql, params))
}

fn parse_body(kind: Kind, key: &str, body: &str) -> Option<Document> {
    match serde_json::from_str::<JsonValue>(body) {
        Ok(value) => decode_row(kind, key, value),
        Err(e) => {
            tracing::warn!(kind = %kind, key = %key, error = %e, "skipping unparseable document body");
            None
        }
    }
}

#[async_trait]
impl DocumentStore for SqliteDocumentStore {
    fn limits(&self) -> StoreLimits {
        self.limits
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        query.validate()?;
        let limit = self.limits.check_query(query)?;
        let (sql, params) = build_select(query, limit)?;
        let kind = query.kind;

        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&sql).map_err(|e| sql_err("prepare query", e))?;
                let rows = stmt
                    .query_map(params_from_iter(params), |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })
                    .map_err(|e| sql_err("run query", e))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| sql_err("read query rows", e))?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(key, body)| parse_body(kind, &key, &body))
            .collect())
    }

    async fn get_by_keys(&self, kind: Kind, keys: &[String]) -> Result<Vec<Document>> {
        self.limits.check_fetch("get_by_keys", keys.len())?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = (0..keys.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT key, body FROM documents WHERE kind = ?1 AND key IN ({placeholders})");
        let mut params = Vec::with_capacity(keys.len() + 1);
        params.push(SqlValue::Text(kind.as_str().to_string()));
        params.extend(keys.iter().cloned().map(SqlValue::Text));

        let rows = self
            .with_conn(move |conn| {
                let mut stmt = conn.prepare(&sql).map_err(|e| sql_err("prepare lookup", e))?;
                let rows = stmt
                    .query_map(params_from_iter(params), |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })
                    .map_err(|e| sql_err("run lookup", e))?
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|e| sql_err("read lookup rows", e))?;
                Ok(rows)
            })
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(key, body)| parse_body(kind, &key, &body))
            .collect())
    }

    async fn commit(&self, tx: Transaction) -> Result<()> {
        self.limits.check_commit(&tx)?;
        let tx_id = tx.id();

        let mut staged = Vec::with_capacity(tx.len());
        for mutation in tx.into_mutations() {
            match mutation {
                Mutation::Save(doc) => {
                    let body = serde_json::to_string(&doc.to_json()?)?;
                    staged.push((doc.kind(), doc.key().to_string(), Some(body)));
                }
                Mutation::Delete(key) => staged.push((key.kind, key.key, None)),
            }
        }
        let count = staged.len();

        self.with_conn(move |conn| {
            let sql_tx = conn
                .transaction()
                .map_err(|e| sql_err("begin transaction", e))?;
            for (kind, key, body) in &staged {
                match body {
                    Some(body) => sql_tx.execute(
                        "INSERT OR REPLACE INTO documents (kind, key, body) VALUES (?1, ?2, ?3)",
                        params![kind.as_str(), key, body],
                    ),
                    None => sql_tx.execute(
                        "DELETE FROM documents WHERE kind = ?1 AND key = ?2",
                        params![kind.as_str(), key],
                    ),
                }
                .map_err(|e| sql_err("apply mutation", e))?;
            }
            sql_tx.commit().map_err(|e| sql_err("commit", e))
        })
        .await?;

        tracing::trace!(tx = %tx_id, mutations = count, "committed");
        Ok(())
    }
}
