// Request and response contexts threaded through the interceptor chain
//
// Every parsed inbound request becomes a RequestContext: an immutable
// snapshot of what the client sent plus a writable copy that interceptors
// mutate. The mode handler produces a ResponseContext which flows back
// through the response interceptors before serialization.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use bytes::Bytes;
use serde_json::json;

use crate::util::now_millis;

// ─────────────────────────────────────────────────────────────────────────────
// Headers
// ─────────────────────────────────────────────────────────────────────────────

/// Case-insensitive, multi-valued header map.
///
/// Keys are stored lowercased; insertion order within a key is preserved so
/// that multiple `Set-Cookie` values survive as an array and are never
/// joined with commas.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    entries: BTreeMap<String, Vec<String>>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// First value for a header, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .get(&name.to_ascii_lowercase())
            .and_then(|v| v.first())
            .map(String::as_str)
    }

    /// All values for a header.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    /// Replace all values for a header.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.entries
            .insert(name.to_ascii_lowercase(), vec![value.into()]);
    }

    /// Append a value, keeping existing ones (Set-Cookie semantics).
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        self.entries
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value.into());
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<String>> {
        self.entries.remove(&name.to_ascii_lowercase())
    }

    /// Iterate (lowercased name, value) pairs, one pair per value.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// JSON object representation for persistence. Single values serialize
    /// as strings, repeated headers as arrays.
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for (k, vs) in &self.entries {
            if vs.len() == 1 {
                map.insert(k.clone(), json!(vs[0]));
            } else {
                map.insert(k.clone(), json!(vs));
            }
        }
        serde_json::Value::Object(map)
    }

    /// Rebuild from the persisted JSON form.
    pub fn from_json(value: &serde_json::Value) -> Self {
        let mut headers = Self::new();
        if let Some(obj) = value.as_object() {
            for (k, v) in obj {
                match v {
                    serde_json::Value::String(s) => headers.append(k, s.clone()),
                    serde_json::Value::Array(items) => {
                        for item in items {
                            if let Some(s) = item.as_str() {
                                headers.append(k, s.to_string());
                            }
                        }
                    }
                    other => headers.append(k, other.to_string()),
                }
            }
        }
        headers
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Body
// ─────────────────────────────────────────────────────────────────────────────

/// Response/request body union: raw bytes, structured JSON, or text.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Empty,
    Bytes(Bytes),
    Json(serde_json::Value),
    Text(String),
}

impl Body {
    /// Parse bytes into the richest representation we can.
    pub fn from_bytes(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            return Body::Empty;
        }
        if let Ok(value) = serde_json::from_slice::<serde_json::Value>(&bytes) {
            return Body::Json(value);
        }
        match std::str::from_utf8(&bytes) {
            Ok(s) => Body::Text(s.to_string()),
            Err(_) => Body::Bytes(bytes),
        }
    }

    /// Serialize to wire bytes.
    pub fn to_bytes(&self) -> Bytes {
        match self {
            Body::Empty => Bytes::new(),
            Body::Bytes(b) => b.clone(),
            Body::Json(v) => Bytes::from(serde_json::to_vec(v).unwrap_or_default()),
            Body::Text(s) => Bytes::from(s.clone().into_bytes()),
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Body::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Body::Empty => true,
            Body::Bytes(b) => b.is_empty(),
            Body::Json(_) => false,
            Body::Text(s) => s.is_empty(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Body::Empty => 0,
            Body::Bytes(b) => b.len(),
            Body::Json(v) => serde_json::to_vec(v).map(|b| b.len()).unwrap_or(0),
            Body::Text(s) => s.len(),
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Empty
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request context
// ─────────────────────────────────────────────────────────────────────────────

/// One parsed form of an HTTP request.
#[derive(Debug, Clone)]
pub struct RequestForm {
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub port: u16,
    /// Path only, no query string.
    pub path: String,
    /// Query pairs in original order and casing. `?key` with no `=` and
    /// `?key=` both become `(key, "")`.
    pub query: Vec<(String, String)>,
    pub headers: Headers,
    pub body: Bytes,
}

impl RequestForm {
    /// Raw query string re-assembled from the pairs, without the leading `?`.
    pub fn query_string(&self) -> String {
        self.query
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{}={}", k, v)
                }
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Query value lookup, case-insensitive on key.
    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

/// Mutable per-request metadata populated by interceptors and the session
/// fabric. Absent dimension values stay empty strings, never null.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    pub user_id: Option<i64>,
    pub external_user_id: Option<String>,
    pub session_id: Option<i64>,
    pub app_version: String,
    pub app_platform: String,
    pub app_environment: String,
    pub app_language: String,
    pub correlation_id: String,
    pub traceability_id: String,
    pub mode: String,
    pub request_id: String,
    pub has_jwt: bool,
    /// Raw bearer token observed on the request, used for identity lookups.
    pub bearer_token: Option<String>,
}

/// Per-request record carrying the immutable original and the writable
/// current form. Exclusively owned by the task handling one request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub original: RequestForm,
    pub current: RequestForm,
    pub metadata: Metadata,
    pub client_addr: Option<SocketAddr>,
    pub monitored: bool,
}

impl RequestContext {
    pub fn new(form: RequestForm, client_addr: Option<SocketAddr>, request_id: String) -> Self {
        Self {
            original: form.clone(),
            current: form,
            metadata: Metadata {
                request_id,
                ..Metadata::default()
            },
            client_addr,
            monitored: false,
        }
    }

    /// Cookie value from the request `Cookie` header(s).
    pub fn cookie(&self, name: &str) -> Option<String> {
        for value in self.current.headers.get_all("cookie") {
            for pair in value.split(';') {
                let pair = pair.trim();
                if let Some((k, v)) = pair.split_once('=') {
                    if k.trim().eq_ignore_ascii_case(name) {
                        return Some(v.trim().to_string());
                    }
                }
            }
        }
        None
    }

    /// Bearer token from `Authorization`, if present.
    pub fn bearer(&self) -> Option<String> {
        self.current
            .headers
            .get("authorization")
            .filter(|v| v.len() > 7 && v[..7].eq_ignore_ascii_case("bearer "))
            .map(|v| v[7..].trim().to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Response context
// ─────────────────────────────────────────────────────────────────────────────

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Upstream,
    Recording,
    Replay,
    ReplayMiss,
    Error,
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upstream => "upstream",
            Self::Recording => "recording",
            Self::Replay => "replay",
            Self::ReplayMiss => "replay-miss",
            Self::Error => "error",
        }
    }
}

/// Mutable response record, serialized only after the response interceptors
/// have run.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    pub status: u16,
    pub headers: Headers,
    pub body: Body,
    pub source: ResponseSource,
    pub latency_ms: u64,
    pub target_url: Option<String>,
    pub request_id: String,
    /// Matching strategy that produced a replayed response.
    pub strategy: Option<&'static str>,
}

impl ResponseContext {
    pub fn new(status: u16, request_id: String, source: ResponseSource) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::Empty,
            source,
            latency_ms: 0,
            target_url: None,
            request_id,
            strategy: None,
        }
    }

    /// Canonical error response body: `{error, status, message, timestamp}`.
    /// No stack traces ever go over the wire.
    pub fn error(status: u16, message: &str, request_id: String) -> Self {
        let mut resp = Self::new(status, request_id, ResponseSource::Error);
        resp.body = Body::Json(error_body(status, message));
        resp.headers
            .set("content-type", "application/json; charset=utf-8");
        resp
    }

    /// Byte length reported to stats: `Content-Length` if present, else the
    /// computed body length.
    pub fn response_length(&self) -> usize {
        self.headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| self.body.len())
    }
}

/// The canonical error body shape shared by every error path.
pub fn error_body(status: u16, message: &str) -> serde_json::Value {
    json!({
        "error": true,
        "status": status,
        "message": message,
        "timestamp": now_millis(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_lowercase_and_multivalue() {
        let mut h = Headers::new();
        h.append("Set-Cookie", "a=1");
        h.append("set-cookie", "b=2");
        assert_eq!(h.get_all("SET-COOKIE"), &["a=1".to_string(), "b=2".to_string()]);
        assert_eq!(h.get("set-cookie"), Some("a=1"));
    }

    #[test]
    fn test_headers_json_round_trip_preserves_arrays() {
        let mut h = Headers::new();
        h.append("set-cookie", "a=1");
        h.append("set-cookie", "b=2");
        h.set("content-type", "application/json");
        let rebuilt = Headers::from_json(&h.to_json());
        assert_eq!(rebuilt.get_all("set-cookie").len(), 2);
        assert_eq!(rebuilt.get("content-type"), Some("application/json"));
    }

    #[test]
    fn test_body_from_bytes_detects_json() {
        let body = Body::from_bytes(Bytes::from_static(b"{\"a\":1}"));
        assert_eq!(body.as_json().unwrap()["a"], 1);
        let text = Body::from_bytes(Bytes::from_static(b"plain"));
        assert!(matches!(text, Body::Text(_)));
        assert!(Body::from_bytes(Bytes::new()).is_empty());
    }

    #[test]
    fn test_cookie_lookup() {
        let form = RequestForm {
            method: "GET".into(),
            scheme: "https".into(),
            host: "api.example.com".into(),
            port: 443,
            path: "/".into(),
            query: vec![],
            headers: {
                let mut h = Headers::new();
                h.set("cookie", "foo=bar; DPSESSION=abc-123");
                h
            },
            body: Bytes::new(),
        };
        let ctx = RequestContext::new(form, None, "r1".into());
        assert_eq!(ctx.cookie("DPSESSION").as_deref(), Some("abc-123"));
        assert_eq!(ctx.cookie("dpsession").as_deref(), Some("abc-123"));
        assert_eq!(ctx.cookie("missing"), None);
    }

    #[test]
    fn test_bearer_extraction() {
        let mut h = Headers::new();
        h.set("authorization", "Bearer tok-1");
        let form = RequestForm {
            method: "GET".into(),
            scheme: "https".into(),
            host: "h".into(),
            port: 443,
            path: "/".into(),
            query: vec![],
            headers: h,
            body: Bytes::new(),
        };
        let ctx = RequestContext::new(form, None, "r1".into());
        assert_eq!(ctx.bearer().as_deref(), Some("tok-1"));
    }

    #[test]
    fn test_error_body_shape() {
        let body = error_body(502, "no-match");
        assert_eq!(body["error"], true);
        assert_eq!(body["status"], 502);
        assert_eq!(body["message"], "no-match");
        assert!(body["timestamp"].is_i64());
    }
}
