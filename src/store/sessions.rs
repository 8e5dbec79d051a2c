//! Session and user rows
//!
//! `us_hash` and `oauth_hash` are append-only JSON arrays of SHA-256 digests;
//! the raw columns (`u_session`, `oauth_token`) hold only the newest value.
//! Appends are single idempotent statements so concurrent writers cannot
//! lose entries.

use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};

use super::Store;
use crate::util::now_rfc3339;

/// One row of the `sessions` table.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: i64,
    pub user_id: Option<i64>,
    pub p_session: String,
    pub u_session: Option<String>,
    pub us_hash: Vec<String>,
    pub oauth_token: Option<String>,
    pub oauth_hash: Vec<String>,
    pub created_at: String,
    pub expires_at: String,
    pub last_activity_at: String,
}

/// One row of the `users` table. Users are auto-created on first observation.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub user_id: String,
    pub party_id: Option<String>,
    pub client_id: Option<String>,
    pub email: Option<String>,
}

fn hashes_from_json(raw: &str) -> Vec<String> {
    serde_json::from_str::<Vec<String>>(raw).unwrap_or_default()
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<SessionRow> {
    let us_raw: String = row.get(4)?;
    let oauth_raw: String = row.get(6)?;
    Ok(SessionRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        p_session: row.get(2)?,
        u_session: row.get(3)?,
        us_hash: hashes_from_json(&us_raw),
        oauth_token: row.get(5)?,
        oauth_hash: hashes_from_json(&oauth_raw),
        created_at: row.get(7)?,
        expires_at: row.get(8)?,
        last_activity_at: row.get(9)?,
    })
}

const SESSION_COLUMNS: &str = "id, user_id, p_session, u_session, us_hash, oauth_token, \
     oauth_hash, created_at, expires_at, last_activity_at";

impl Store {
    /// Create a session for a user. `p_session` must be a fresh v4 UUID.
    pub fn create_session(
        &self,
        user_id: Option<i64>,
        p_session: &str,
        expires_at: &str,
    ) -> Result<SessionRow> {
        let now = now_rfc3339();
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO sessions (user_id, p_session, created_at, expires_at, last_activity_at)
               VALUES (?1, ?2, ?3, ?4, ?3)"#,
            params![user_id, p_session, now, expires_at],
        )?;
        let id = conn.last_insert_rowid();
        let row = conn.query_row(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
            params![id],
            session_from_row,
        )?;
        Ok(row)
    }

    pub fn find_session_by_p_session(&self, p_session: &str) -> Result<Option<SessionRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE p_session = ?1"),
                params![p_session],
                session_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Session whose `us_hash` array contains `hash`.
    pub fn find_session_by_us_hash(&self, hash: &str) -> Result<Option<SessionRow>> {
        self.find_session_by_hash_column("us_hash", hash)
    }

    /// Session whose `oauth_hash` array contains `hash`.
    pub fn find_session_by_oauth_hash(&self, hash: &str) -> Result<Option<SessionRow>> {
        self.find_session_by_hash_column("oauth_hash", hash)
    }

    fn find_session_by_hash_column(&self, column: &str, hash: &str) -> Result<Option<SessionRow>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE EXISTS (SELECT 1 FROM json_each(sessions.{column}) WHERE json_each.value = ?1) \
             ORDER BY last_activity_at DESC LIMIT 1"
        );
        let row = conn
            .query_row(&sql, params![hash], session_from_row)
            .optional()?;
        Ok(row)
    }

    /// Append a cookie-session hash and replace the latest raw value.
    /// Idempotent: an already-present hash is not appended twice.
    pub fn append_us_hash(&self, session_id: i64, hash: &str, latest_raw: &str) -> Result<()> {
        self.append_hash_column(session_id, "us_hash", "u_session", hash, latest_raw)
    }

    /// Append a bearer-token hash and replace the latest raw value.
    pub fn append_oauth_hash(&self, session_id: i64, hash: &str, latest_raw: &str) -> Result<()> {
        self.append_hash_column(session_id, "oauth_hash", "oauth_token", hash, latest_raw)
    }

    fn append_hash_column(
        &self,
        session_id: i64,
        hash_column: &str,
        raw_column: &str,
        hash: &str,
        latest_raw: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        let sql = format!(
            "UPDATE sessions SET \
               {hash_column} = CASE \
                 WHEN EXISTS (SELECT 1 FROM json_each({hash_column}) WHERE json_each.value = ?1) \
                 THEN {hash_column} \
                 ELSE json_insert({hash_column}, '$[#]', ?1) END, \
               {raw_column} = ?2, \
               last_activity_at = ?3 \
             WHERE id = ?4"
        );
        conn.execute(&sql, params![hash, latest_raw, now_rfc3339(), session_id])?;
        Ok(())
    }

    /// Refresh `last_activity_at` on a resolved session.
    pub fn touch_session(&self, session_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE sessions SET last_activity_at = ?1 WHERE id = ?2",
            params![now_rfc3339(), session_id],
        )?;
        Ok(())
    }

    /// Remove a session that turned out to be expired.
    pub fn delete_session(&self, session_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        Ok(())
    }

    /// Look up a user by external identifier, creating the row on first
    /// observation.
    pub fn get_or_create_user(&self, external_id: &str) -> Result<UserRow> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO users (user_id, created_at, updated_at) VALUES (?1, ?2, ?2) \
             ON CONFLICT(user_id) DO NOTHING",
            params![external_id, now],
        )?;
        let row = conn.query_row(
            "SELECT id, user_id, party_id, client_id, email FROM users WHERE user_id = ?1",
            params![external_id],
            |row| {
                Ok(UserRow {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    party_id: row.get(2)?,
                    client_id: row.get(3)?,
                    email: row.get(4)?,
                })
            },
        )?;
        Ok(row)
    }
}
