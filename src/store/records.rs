//! Recorded request/response rows and the indexed candidate queries
//!
//! Rows are materialized into typed fields at read time: query params become
//! an ordered pair list, headers a multimap, bodies a JSON value. Callers
//! never re-parse stored JSON on the hot path.

use anyhow::Result;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Row};

use super::Store;
use crate::context::Headers;
use crate::util::now_rfc3339;

/// Response-status clause of the base matching predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    /// 200 <= status < 300
    Success,
    /// status >= 400
    Error,
    /// Exact status code
    Code(u16),
}

/// A recorded request materialized from its row.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub id: i64,
    /// Null means the row belongs to a public endpoint.
    pub user_id: Option<i64>,
    pub method: String,
    pub host: String,
    pub endpoint_path: String,
    /// Original casing, flattened from the stored JSON object.
    pub query_params: Vec<(String, String)>,
    pub headers: Headers,
    pub body: Option<serde_json::Value>,
    pub app_version: String,
    pub app_platform: String,
    pub app_environment: String,
    pub app_language: String,
    pub endpoint_type: String,
    pub created_at: String,
    pub updated_at: String,
}

/// The recorded response paired one-to-one with a request.
#[derive(Debug, Clone)]
pub struct RecordedResponse {
    pub id: i64,
    pub api_request_id: i64,
    pub status: u16,
    pub headers: Headers,
    pub body: Option<serde_json::Value>,
    pub source: String,
    pub latency_ms: u64,
    pub created_at: String,
    pub updated_at: String,
}

/// Joined request + response candidate returned by the matching queries.
#[derive(Debug, Clone)]
pub struct RecordedPair {
    pub request: RecordedRequest,
    pub response: RecordedResponse,
}

/// Base predicate of a candidate lookup. Dimension fields set to `None`
/// produce no SQL clause, which is how the relaxation strategies widen the
/// search.
#[derive(Debug, Clone, Default)]
pub struct CandidateQuery<'a> {
    pub method: &'a str,
    pub path: &'a str,
    /// "public" or "secure"; decides whether `user_id` participates.
    pub endpoint_type: &'a str,
    pub user_id: Option<i64>,
    pub status: Option<StatusFilter>,
    /// `Some(v)` adds case-insensitive equality; `None` omits the clause.
    pub environment: Option<&'a str>,
    pub version: Option<&'a str>,
    pub language: Option<&'a str>,
    pub platform: Option<&'a str>,
}

impl Default for StatusFilter {
    fn default() -> Self {
        StatusFilter::Success
    }
}

/// Payload for a new or updated recording.
#[derive(Debug, Clone)]
pub struct NewRecording {
    pub user_id: Option<i64>,
    pub method: String,
    pub host: String,
    pub endpoint_path: String,
    pub query_params: serde_json::Value,
    pub request_headers: serde_json::Value,
    pub request_body: Option<serde_json::Value>,
    pub app_version: String,
    pub app_platform: String,
    pub app_environment: String,
    pub app_language: String,
    pub endpoint_type: String,
    pub response_status: u16,
    pub response_headers: serde_json::Value,
    pub response_body: Option<serde_json::Value>,
    pub response_source: String,
    pub latency_ms: u64,
}

const PAIR_COLUMNS: &str = r#"
    ar.id, ar.user_id, ar.method, ar.host, ar.endpoint_path, ar.query_params,
    ar.request_headers, ar.request_body, ar.app_version, ar.app_platform,
    ar.app_environment, ar.app_language, ar.endpoint_type, ar.created_at, ar.updated_at,
    resp.id, resp.api_request_id, resp.response_status, resp.response_headers,
    resp.response_body, resp.response_source, resp.latency_ms, resp.created_at, resp.updated_at
"#;

/// Flatten a stored query-param JSON object into ordered pairs. Array values
/// (repeated keys) expand into one pair per element.
fn query_pairs_from_json(raw: &str) -> Vec<(String, String)> {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return Vec::new();
    };
    let Some(obj) = value.as_object() else {
        return Vec::new();
    };
    let mut pairs = Vec::new();
    for (k, v) in obj {
        match v {
            serde_json::Value::Array(items) => {
                for item in items {
                    pairs.push((k.clone(), json_scalar_to_string(item)));
                }
            }
            other => pairs.push((k.clone(), json_scalar_to_string(other))),
        }
    }
    pairs
}

fn json_scalar_to_string(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Stored bodies are JSON when they parse, otherwise kept as a JSON string.
fn body_from_column(raw: Option<String>) -> Option<serde_json::Value> {
    let raw = raw?;
    if raw.is_empty() {
        return None;
    }
    match serde_json::from_str(&raw) {
        Ok(v) => Some(v),
        Err(_) => Some(serde_json::Value::String(raw)),
    }
}

fn pair_from_row(row: &Row<'_>) -> rusqlite::Result<RecordedPair> {
    let query_raw: String = row.get(5)?;
    let headers_raw: String = row.get(6)?;
    let body_raw: Option<String> = row.get(7)?;
    let resp_headers_raw: String = row.get(18)?;
    let resp_body_raw: Option<String> = row.get(19)?;
    Ok(RecordedPair {
        request: RecordedRequest {
            id: row.get(0)?,
            user_id: row.get(1)?,
            method: row.get(2)?,
            host: row.get(3)?,
            endpoint_path: row.get(4)?,
            query_params: query_pairs_from_json(&query_raw),
            headers: Headers::from_json(
                &serde_json::from_str(&headers_raw).unwrap_or(serde_json::Value::Null),
            ),
            body: body_from_column(body_raw),
            app_version: row.get(8)?,
            app_platform: row.get(9)?,
            app_environment: row.get(10)?,
            app_language: row.get(11)?,
            endpoint_type: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        },
        response: RecordedResponse {
            id: row.get(15)?,
            api_request_id: row.get(16)?,
            status: row.get::<_, i64>(17)? as u16,
            headers: Headers::from_json(
                &serde_json::from_str(&resp_headers_raw).unwrap_or(serde_json::Value::Null),
            ),
            body: body_from_column(resp_body_raw),
            source: row.get(20)?,
            latency_ms: row.get::<_, i64>(21)? as u64,
            created_at: row.get(22)?,
            updated_at: row.get(23)?,
        },
    })
}

impl Store {
    /// Fetch matching candidates ordered by `ar.updated_at DESC`.
    ///
    /// This is the base query of the matching engine; strategy relaxations
    /// arrive here as `None` dimension filters.
    pub fn find_candidates(&self, q: &CandidateQuery<'_>) -> Result<Vec<RecordedPair>> {
        let mut sql = format!(
            "SELECT {PAIR_COLUMNS} FROM api_requests ar \
             JOIN api_responses resp ON resp.api_request_id = ar.id \
             WHERE lower(ar.method) = lower(?) AND lower(ar.endpoint_path) = lower(?) \
             AND ar.endpoint_type = ?"
        );
        let mut binds: Vec<SqlValue> = vec![
            SqlValue::from(q.method.to_string()),
            SqlValue::from(q.path.to_string()),
            SqlValue::from(q.endpoint_type.to_string()),
        ];

        if q.endpoint_type == "secure" {
            match q.user_id {
                Some(uid) => {
                    sql.push_str(" AND (ar.user_id = ? OR ar.user_id IS NULL)");
                    binds.push(SqlValue::from(uid));
                }
                None => sql.push_str(" AND ar.user_id IS NULL"),
            }
        }

        match q.status {
            Some(StatusFilter::Success) => {
                sql.push_str(" AND resp.response_status >= 200 AND resp.response_status < 300")
            }
            Some(StatusFilter::Error) => sql.push_str(" AND resp.response_status >= 400"),
            Some(StatusFilter::Code(code)) => {
                sql.push_str(" AND resp.response_status = ?");
                binds.push(SqlValue::from(code as i64));
            }
            None => {}
        }

        for (column, filter) in [
            ("app_environment", q.environment),
            ("app_version", q.version),
            ("app_language", q.language),
            ("app_platform", q.platform),
        ] {
            if let Some(value) = filter {
                sql.push_str(&format!(" AND lower(ar.{column}) = lower(?)"));
                binds.push(SqlValue::from(value.to_string()));
            }
        }

        sql.push_str(" ORDER BY ar.updated_at DESC");

        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(binds), pair_from_row)?;
        let mut pairs = Vec::new();
        for row in rows {
            pairs.push(row?);
        }
        Ok(pairs)
    }

    /// Rows sharing the recording upsert key `(user_id, method, path, dims,
    /// endpoint_type)`. Query-param and body comparison happens in the mode
    /// handler, which then updates or inserts.
    pub fn find_recordings_for_key(
        &self,
        user_id: Option<i64>,
        method: &str,
        path: &str,
        version: &str,
        platform: &str,
        environment: &str,
        language: &str,
        endpoint_type: &str,
    ) -> Result<Vec<RecordedPair>> {
        let user_clause = match user_id {
            Some(_) => "ar.user_id = ?",
            None => "ar.user_id IS NULL AND ? IS NULL",
        };
        let sql = format!(
            "SELECT {PAIR_COLUMNS} FROM api_requests ar \
             JOIN api_responses resp ON resp.api_request_id = ar.id \
             WHERE {user_clause} AND lower(ar.method) = lower(?) \
             AND lower(ar.endpoint_path) = lower(?) \
             AND ar.app_version = ? AND ar.app_platform = ? \
             AND ar.app_environment = ? AND ar.app_language = ? \
             AND ar.endpoint_type = ? \
             ORDER BY ar.updated_at DESC"
        );
        let binds: Vec<SqlValue> = vec![
            match user_id {
                Some(uid) => SqlValue::from(uid),
                None => SqlValue::Null,
            },
            SqlValue::from(method.to_string()),
            SqlValue::from(path.to_string()),
            SqlValue::from(version.to_string()),
            SqlValue::from(platform.to_string()),
            SqlValue::from(environment.to_string()),
            SqlValue::from(language.to_string()),
            SqlValue::from(endpoint_type.to_string()),
        ];
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(binds), pair_from_row)?;
        let mut pairs = Vec::new();
        for row in rows {
            pairs.push(row?);
        }
        Ok(pairs)
    }

    /// Insert a new request/response pair. Returns the request row id.
    pub fn insert_recording(&self, rec: &NewRecording) -> Result<i64> {
        let now = now_rfc3339();
        let conn = self.conn()?;
        conn.execute(
            r#"INSERT INTO api_requests (user_id, method, host, endpoint_path, query_params,
                request_headers, request_body, app_version, app_platform, app_environment,
                app_language, endpoint_type, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)"#,
            rusqlite::params![
                rec.user_id,
                rec.method,
                rec.host,
                rec.endpoint_path,
                rec.query_params.to_string(),
                rec.request_headers.to_string(),
                rec.request_body.as_ref().map(|b| b.to_string()),
                rec.app_version,
                rec.app_platform,
                rec.app_environment,
                rec.app_language,
                rec.endpoint_type,
                now,
            ],
        )?;
        let request_id = conn.last_insert_rowid();
        conn.execute(
            r#"INSERT INTO api_responses (api_request_id, response_status, response_headers,
                response_body, response_source, latency_ms, created_at, updated_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)"#,
            rusqlite::params![
                request_id,
                rec.response_status,
                rec.response_headers.to_string(),
                rec.response_body.as_ref().map(|b| b.to_string()),
                rec.response_source,
                rec.latency_ms as i64,
                now,
            ],
        )?;
        Ok(request_id)
    }

    /// Refresh an existing recording in place (recording-mode upsert hit).
    pub fn update_recording(&self, request_id: i64, rec: &NewRecording) -> Result<()> {
        let now = now_rfc3339();
        let conn = self.conn()?;
        conn.execute(
            r#"UPDATE api_requests SET query_params = ?1, request_headers = ?2,
                request_body = ?3, host = ?4, updated_at = ?5 WHERE id = ?6"#,
            rusqlite::params![
                rec.query_params.to_string(),
                rec.request_headers.to_string(),
                rec.request_body.as_ref().map(|b| b.to_string()),
                rec.host,
                now,
                request_id,
            ],
        )?;
        conn.execute(
            r#"UPDATE api_responses SET response_status = ?1, response_headers = ?2,
                response_body = ?3, response_source = ?4, latency_ms = ?5, updated_at = ?6
               WHERE api_request_id = ?7"#,
            rusqlite::params![
                rec.response_status,
                rec.response_headers.to_string(),
                rec.response_body.as_ref().map(|b| b.to_string()),
                rec.response_source,
                rec.latency_ms as i64,
                now,
                request_id,
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recording(path: &str, version: &str, status: u16) -> NewRecording {
        NewRecording {
            user_id: None,
            method: "GET".into(),
            host: "api.example.com".into(),
            endpoint_path: path.into(),
            query_params: json!({}),
            request_headers: json!({}),
            request_body: None,
            app_version: version.into(),
            app_platform: "android".into(),
            app_environment: "sit".into(),
            app_language: "en".into(),
            endpoint_type: "public".into(),
            response_status: status,
            response_headers: json!({"content-type": "application/json"}),
            response_body: Some(json!({"ok": true})),
            response_source: "recording".into(),
            latency_ms: 12,
        }
    }

    #[test]
    fn test_insert_and_find_candidates_exact() {
        let store = Store::open_in_memory().unwrap();
        store.insert_recording(&recording("/v1/profile", "1.2.3", 200)).unwrap();
        store.insert_recording(&recording("/v1/other", "1.2.3", 200)).unwrap();

        let pairs = store
            .find_candidates(&CandidateQuery {
                method: "get",
                path: "/V1/PROFILE",
                endpoint_type: "public",
                status: Some(StatusFilter::Success),
                version: Some("1.2.3"),
                language: Some("en"),
                platform: Some("android"),
                environment: Some("SIT"),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].request.endpoint_path, "/v1/profile");
        assert_eq!(pairs[0].response.status, 200);
    }

    #[test]
    fn test_status_filter_error_and_exact_code() {
        let store = Store::open_in_memory().unwrap();
        store.insert_recording(&recording("/v1/a", "1.0.0", 200)).unwrap();
        store.insert_recording(&recording("/v1/a", "1.0.0", 404)).unwrap();

        let base = CandidateQuery {
            method: "GET",
            path: "/v1/a",
            endpoint_type: "public",
            ..Default::default()
        };
        let errors = store
            .find_candidates(&CandidateQuery { status: Some(StatusFilter::Error), ..base.clone() })
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].response.status, 404);

        let exact = store
            .find_candidates(&CandidateQuery { status: Some(StatusFilter::Code(404)), ..base })
            .unwrap();
        assert_eq!(exact.len(), 1);
    }

    #[test]
    fn test_secure_endpoint_user_predicate() {
        let store = Store::open_in_memory().unwrap();
        let mut secure = recording("/v1/acct", "1.0.0", 200);
        secure.endpoint_type = "secure".into();
        secure.user_id = Some(7);
        store.insert_recording(&secure).unwrap();

        let mut public_row = recording("/v1/acct", "1.0.0", 200);
        public_row.endpoint_type = "secure".into();
        store.insert_recording(&public_row).unwrap();

        let q = CandidateQuery {
            method: "GET",
            path: "/v1/acct",
            endpoint_type: "secure",
            user_id: Some(7),
            ..Default::default()
        };
        // user 7 sees their row plus the null-user row
        assert_eq!(store.find_candidates(&q).unwrap().len(), 2);

        // anonymous sees only the null-user row
        let anon = CandidateQuery { user_id: None, ..q };
        assert_eq!(store.find_candidates(&anon).unwrap().len(), 1);
    }

    #[test]
    fn test_update_recording_bumps_updated_at() {
        let store = Store::open_in_memory().unwrap();
        let rec = recording("/v1/profile", "1.2.3", 200);
        let id = store.insert_recording(&rec).unwrap();
        let mut newer = rec.clone();
        newer.response_body = Some(json!({"ok": false}));
        store.update_recording(id, &newer).unwrap();

        let pairs = store
            .find_recordings_for_key(None, "GET", "/v1/profile", "1.2.3", "android", "sit", "en", "public")
            .unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].response.body, Some(json!({"ok": false})));
    }

    #[test]
    fn test_query_pairs_from_json_flattens_arrays() {
        let pairs = query_pairs_from_json(r#"{"A": "x", "b": ["1", "2"]}"#);
        assert_eq!(
            pairs,
            vec![
                ("A".to_string(), "x".to_string()),
                ("b".to_string(), "1".to_string()),
                ("b".to_string(), "2".to_string()),
            ]
        );
    }
}
