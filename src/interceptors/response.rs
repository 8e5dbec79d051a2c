//! Response-stage interceptors (monitored requests only)

use std::sync::Arc;

use anyhow::Result;

use super::Interceptor;
use crate::context::{error_body, Body, RequestContext, ResponseContext};
use crate::stats::StatsAggregator;

/// Adds the standard security headers when the upstream did not.
pub struct SecurityHeadersInterceptor;

impl Interceptor for SecurityHeadersInterceptor {
    fn name(&self) -> &'static str {
        "security-headers"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn on_response(&self, _req: &RequestContext, resp: &mut ResponseContext) -> Result<()> {
        let defaults = [
            ("x-content-type-options", "nosniff"),
            ("x-frame-options", "DENY"),
            ("x-xss-protection", "1; mode=block"),
            ("strict-transport-security", "max-age=31536000; includeSubDomains"),
        ];
        for (name, value) in defaults {
            if !resp.headers.contains(name) {
                resp.headers.set(name, value);
            }
        }
        Ok(())
    }
}

/// Rewrites 4xx/5xx bodies into the canonical
/// `{error, status, message, timestamp}` shape unless already shaped.
pub struct ErrorFormatInterceptor;

impl Interceptor for ErrorFormatInterceptor {
    fn name(&self) -> &'static str {
        "error-format"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn on_response(&self, _req: &RequestContext, resp: &mut ResponseContext) -> Result<()> {
        if resp.status < 400 {
            return Ok(());
        }
        let already_shaped = resp
            .body
            .as_json()
            .map(|b| b.get("error").is_some() && b.get("status").is_some())
            .unwrap_or(false);
        if already_shaped {
            return Ok(());
        }
        let message = match &resp.body {
            Body::Text(s) if !s.is_empty() => s.clone(),
            Body::Json(v) => v
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("request failed")
                .to_string(),
            _ => "request failed".to_string(),
        };
        resp.body = Body::Json(error_body(resp.status, &message));
        resp.headers
            .set("content-type", "application/json; charset=utf-8");
        Ok(())
    }
}

/// `Access-Control-Allow-Origin: *` unless the upstream set its own.
pub struct CorsInterceptor;

impl Interceptor for CorsInterceptor {
    fn name(&self) -> &'static str {
        "cors"
    }

    fn priority(&self) -> i32 {
        90
    }

    fn on_response(&self, _req: &RequestContext, resp: &mut ResponseContext) -> Result<()> {
        if !resp.headers.contains("access-control-allow-origin") {
            resp.headers.set("access-control-allow-origin", "*");
        }
        Ok(())
    }
}

/// Structured bodies without a content type get the JSON one.
pub struct JsonResponseInterceptor;

impl Interceptor for JsonResponseInterceptor {
    fn name(&self) -> &'static str {
        "json-response"
    }

    fn priority(&self) -> i32 {
        80
    }

    fn on_response(&self, _req: &RequestContext, resp: &mut ResponseContext) -> Result<()> {
        if matches!(resp.body, Body::Json(_)) && !resp.headers.contains("content-type") {
            resp.headers
                .set("content-type", "application/json; charset=utf-8");
        }
        Ok(())
    }
}

/// Queues one stats row per monitored passthrough/recording response.
/// Replay mode writes nothing, regardless of match outcome.
pub struct StatsInterceptor {
    stats: Arc<StatsAggregator>,
}

impl StatsInterceptor {
    pub fn new(stats: Arc<StatsAggregator>) -> Self {
        Self { stats }
    }
}

impl Interceptor for StatsInterceptor {
    fn name(&self) -> &'static str {
        "stats"
    }

    fn priority(&self) -> i32 {
        50
    }

    fn on_response(&self, req: &RequestContext, resp: &mut ResponseContext) -> Result<()> {
        if req.metadata.mode == "replay" {
            return Ok(());
        }
        self.stats.record(req, resp);
        Ok(())
    }
}

pub struct ResponseLoggingInterceptor;

impl Interceptor for ResponseLoggingInterceptor {
    fn name(&self) -> &'static str {
        "response-logging"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn on_response(&self, req: &RequestContext, resp: &mut ResponseContext) -> Result<()> {
        tracing::debug!(
            "{} -> {} ({}, {} ms, {} bytes)",
            req.metadata.request_id,
            resp.status,
            resp.source.as_str(),
            resp.latency_ms,
            resp.body.len(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Headers, RequestForm, ResponseSource};
    use crate::store::Store;
    use bytes::Bytes;
    use serde_json::json;

    fn req() -> RequestContext {
        let form = RequestForm {
            method: "GET".into(),
            scheme: "https".into(),
            host: "api.example.com".into(),
            port: 443,
            path: "/v1/x".into(),
            query: vec![],
            headers: Headers::new(),
            body: Bytes::new(),
        };
        RequestContext::new(form, None, "r1".into())
    }

    fn resp(status: u16) -> ResponseContext {
        ResponseContext::new(status, "r1".into(), ResponseSource::Upstream)
    }

    #[test]
    fn test_security_headers_do_not_override_upstream() {
        let mut resp = resp(200);
        resp.headers.set("x-frame-options", "SAMEORIGIN");
        SecurityHeadersInterceptor.on_response(&req(), &mut resp).unwrap();
        assert_eq!(resp.headers.get("x-frame-options"), Some("SAMEORIGIN"));
        assert_eq!(resp.headers.get("x-content-type-options"), Some("nosniff"));
    }

    #[test]
    fn test_error_format_rewrites_unshaped_bodies() {
        let mut resp = resp(503);
        resp.body = Body::Text("service down".into());
        ErrorFormatInterceptor.on_response(&req(), &mut resp).unwrap();
        let body = resp.body.as_json().unwrap();
        assert_eq!(body["error"], true);
        assert_eq!(body["status"], 503);
        assert_eq!(body["message"], "service down");

        // already-shaped bodies pass through untouched
        let mut shaped = self::resp(502);
        shaped.body = Body::Json(error_body(502, "no-match"));
        let before = shaped.body.clone();
        ErrorFormatInterceptor.on_response(&req(), &mut shaped).unwrap();
        assert_eq!(shaped.body, before);
    }

    #[test]
    fn test_error_format_ignores_success() {
        let mut resp = resp(200);
        resp.body = Body::Json(json!({"name": "a"}));
        ErrorFormatInterceptor.on_response(&req(), &mut resp).unwrap();
        assert_eq!(resp.body.as_json().unwrap()["name"], "a");
    }

    #[test]
    fn test_cors_and_json_content_type() {
        let mut resp = resp(200);
        resp.body = Body::Json(json!({"a": 1}));
        CorsInterceptor.on_response(&req(), &mut resp).unwrap();
        JsonResponseInterceptor.on_response(&req(), &mut resp).unwrap();
        assert_eq!(resp.headers.get("access-control-allow-origin"), Some("*"));
        assert_eq!(
            resp.headers.get("content-type"),
            Some("application/json; charset=utf-8")
        );
    }

    #[test]
    fn test_stats_skips_replay_mode() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let stats = Arc::new(StatsAggregator::new(store.clone()));
        let interceptor = StatsInterceptor::new(stats.clone());

        let mut replay_req = req();
        replay_req.metadata.mode = "replay".into();
        interceptor.on_response(&replay_req, &mut resp(200)).unwrap();

        let mut passthrough_req = req();
        passthrough_req.metadata.mode = "passthrough".into();
        interceptor.on_response(&passthrough_req, &mut resp(200)).unwrap();

        stats.shutdown();
        assert_eq!(store.stats_count().unwrap(), 1);
    }
}
