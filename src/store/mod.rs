//! Record store facade over SQLite
//!
//! Owns the database: schema creation, typed row structs, and the indexed
//! queries the matching engine and session fabric rely on. Components receive
//! an `Arc<Store>` at construction instead of reaching for a global handle.
//!
//! Writes are single statements; WAL mode plus a busy timeout make them safe
//! to issue from concurrent connection tasks.

use std::path::Path;

use anyhow::{Context, Result};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::params;

mod config_rows;
mod records;
mod sessions;

pub use config_rows::MatchingRuleRow;
pub use records::{CandidateQuery, NewRecording, RecordedPair, RecordedRequest, RecordedResponse, StatusFilter};
pub use sessions::{SessionRow, UserRow};

use crate::util::now_rfc3339;

/// One per-request statistics row. Absent dimensions are empty strings,
/// never null.
#[derive(Debug, Clone, Default)]
pub struct StatsRow {
    pub host: String,
    pub endpoint_path: String,
    pub method: String,
    pub app_platform: String,
    pub app_version: String,
    pub app_environment: String,
    pub app_language: String,
    pub response_status: u16,
    pub response_length: usize,
    pub latency_ms: u64,
}

/// Pooled SQLite handle shared by every component.
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
}

impl Store {
    /// Open (and create if necessary) the record store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.execute_batch(
                r#"
                PRAGMA journal_mode=WAL;
                PRAGMA synchronous=NORMAL;
                PRAGMA busy_timeout=5000;
                PRAGMA cache_size=-16000;
                "#,
            )
        });
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .context("failed to build SQLite pool")?;
        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory();
        // A single connection: each :memory: connection is its own database.
        let pool = Pool::builder().max_size(1).build(manager)?;
        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    pub(crate) fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().context("failed to get SQLite connection")
    }

    /// Create tables and the indexes used by the hot-path lookups.
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS api_requests (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id         INTEGER,
                method          TEXT NOT NULL,
                host            TEXT NOT NULL DEFAULT '',
                endpoint_path   TEXT NOT NULL,
                query_params    TEXT NOT NULL DEFAULT '{}',
                request_headers TEXT NOT NULL DEFAULT '{}',
                request_body    TEXT,
                app_version     TEXT NOT NULL DEFAULT '',
                app_platform    TEXT NOT NULL DEFAULT '',
                app_environment TEXT NOT NULL DEFAULT '',
                app_language    TEXT NOT NULL DEFAULT '',
                endpoint_type   TEXT NOT NULL DEFAULT 'public',
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_api_requests_lookup
                ON api_requests(method, endpoint_path);

            CREATE TABLE IF NOT EXISTS api_responses (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                api_request_id   INTEGER NOT NULL UNIQUE,
                response_status  INTEGER NOT NULL,
                response_headers TEXT NOT NULL DEFAULT '{}',
                response_body    TEXT,
                response_source  TEXT NOT NULL DEFAULT 'upstream',
                latency_ms       INTEGER NOT NULL DEFAULT 0,
                created_at       TEXT NOT NULL,
                updated_at       TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sessions (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id          INTEGER,
                p_session        TEXT NOT NULL UNIQUE,
                u_session        TEXT,
                us_hash          TEXT NOT NULL DEFAULT '[]',
                oauth_token      TEXT,
                oauth_hash       TEXT NOT NULL DEFAULT '[]',
                device_name      TEXT,
                device_os        TEXT,
                device_model     TEXT,
                created_at       TEXT NOT NULL,
                expires_at       TEXT NOT NULL,
                last_activity_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_p_session ON sessions(p_session);

            CREATE TABLE IF NOT EXISTS users (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id    TEXT NOT NULL UNIQUE,
                party_id   TEXT,
                client_id  TEXT,
                email      TEXT,
                first_name TEXT,
                last_name  TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS stats (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                host            TEXT NOT NULL DEFAULT '',
                endpoint_path   TEXT NOT NULL DEFAULT '',
                method          TEXT NOT NULL DEFAULT '',
                app_platform    TEXT NOT NULL DEFAULT '',
                app_version     TEXT NOT NULL DEFAULT '',
                app_environment TEXT NOT NULL DEFAULT '',
                app_language    TEXT NOT NULL DEFAULT '',
                response_status INTEGER NOT NULL DEFAULT 0,
                response_length INTEGER NOT NULL DEFAULT 0,
                latency_ms      INTEGER NOT NULL DEFAULT 0,
                created_at      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_stats_created ON stats(created_at);

            CREATE TABLE IF NOT EXISTS config (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                type       TEXT NOT NULL UNIQUE,
                config     TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS endpoint_matching_config (
                id                    INTEGER PRIMARY KEY AUTOINCREMENT,
                http_method           TEXT NOT NULL DEFAULT '*',
                endpoint_pattern      TEXT NOT NULL,
                regex                 INTEGER NOT NULL DEFAULT 0,
                priority              INTEGER NOT NULL DEFAULT 100,
                enabled               INTEGER NOT NULL DEFAULT 1,
                type                  TEXT NOT NULL DEFAULT 'both',
                match_version         INTEGER NOT NULL DEFAULT 1,
                match_language        INTEGER NOT NULL DEFAULT 1,
                match_platform        INTEGER NOT NULL DEFAULT 1,
                match_environment     TEXT NOT NULL DEFAULT 'exact',
                match_query_params    TEXT,
                match_headers         TEXT,
                match_body            TEXT,
                match_response_status TEXT NOT NULL DEFAULT '2xx',
                created_at            TEXT NOT NULL,
                updated_at            TEXT NOT NULL
            );
            "#,
        )
        .context("failed to initialize schema")?;
        Ok(())
    }

    /// Insert one stats row. Called from the stats writer thread only.
    pub fn insert_stat(&self, row: &StatsRow) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO stats (host, endpoint_path, method, app_platform, app_version,
                app_environment, app_language, response_status, response_length, latency_ms, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
            params![
                row.host,
                row.endpoint_path,
                row.method,
                row.app_platform,
                row.app_version,
                row.app_environment,
                row.app_language,
                row.response_status,
                row.response_length as i64,
                row.latency_ms as i64,
                now_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Number of stats rows (used in tests and the startup banner).
    pub fn stats_count(&self) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row("SELECT COUNT(*) FROM stats", [], |row| row.get(0))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_initializes_and_stats_insert() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_stat(&StatsRow {
                host: "api.example.com".into(),
                endpoint_path: "/v1/profile".into(),
                method: "POST".into(),
                app_platform: "android".into(),
                app_version: "1.2.3".into(),
                response_status: 200,
                response_length: 42,
                latency_ms: 17,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(store.stats_count().unwrap(), 1);
    }
}
