//! Request-stage interceptors

use std::sync::Arc;

use anyhow::Result;

use super::Interceptor;
use crate::context::RequestContext;
use crate::traffic::TrafficConfig;

/// Extracts the caller's identity hints: an explicit `X-User-ID` header, or
/// a JWT bearer noted for the session fabric to resolve.
pub struct UserIdInterceptor;

impl Interceptor for UserIdInterceptor {
    fn name(&self) -> &'static str {
        "user-id"
    }

    fn priority(&self) -> i32 {
        100
    }

    fn on_request(&self, ctx: &mut RequestContext) -> Result<()> {
        if ctx.metadata.external_user_id.is_none() {
            if let Some(explicit) = ctx.current.headers.get("x-user-id") {
                ctx.metadata.external_user_id = Some(explicit.to_string());
            }
        }
        if let Some(bearer) = ctx.bearer() {
            ctx.metadata.has_jwt = true;
            ctx.metadata.bearer_token = Some(bearer);
        }
        Ok(())
    }
}

/// Pulls the mobile dimensions (version, platform, environment, language)
/// plus correlation ids out of the request via the mapping config.
pub struct MobileHeadersInterceptor {
    traffic: Arc<TrafficConfig>,
}

impl MobileHeadersInterceptor {
    pub fn new(traffic: Arc<TrafficConfig>) -> Self {
        Self { traffic }
    }
}

impl Interceptor for MobileHeadersInterceptor {
    fn name(&self) -> &'static str {
        "mobile-headers"
    }

    fn priority(&self) -> i32 {
        95
    }

    fn on_request(&self, ctx: &mut RequestContext) -> Result<()> {
        let values = self
            .traffic
            .extract_all_mapped_values(&ctx.current.headers, &ctx.current.query);
        ctx.metadata.app_version = values.app_version;
        ctx.metadata.app_platform = values.app_platform;
        ctx.metadata.app_environment = values.app_environment;
        ctx.metadata.app_language = values.app_language;
        ctx.metadata.correlation_id = values.correlation_id;
        ctx.metadata.traceability_id = values.traceability_id;
        Ok(())
    }
}

/// Strips proxy-hop headers. `Host` goes too; the forwarder restores it
/// from the target URL.
pub struct HeaderNormalizationInterceptor;

impl Interceptor for HeaderNormalizationInterceptor {
    fn name(&self) -> &'static str {
        "header-normalization"
    }

    fn priority(&self) -> i32 {
        90
    }

    fn on_request(&self, ctx: &mut RequestContext) -> Result<()> {
        for name in ["proxy-connection", "proxy-authorization", "proxy-authenticate", "host"] {
            ctx.current.headers.remove(name);
        }
        Ok(())
    }
}

pub struct RequestLoggingInterceptor;

impl Interceptor for RequestLoggingInterceptor {
    fn name(&self) -> &'static str {
        "request-logging"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn on_request(&self, ctx: &mut RequestContext) -> Result<()> {
        tracing::debug!(
            "{} {} {} ({} bytes, version='{}', platform='{}')",
            ctx.metadata.request_id,
            ctx.current.method,
            ctx.current.path,
            ctx.current.body.len(),
            ctx.metadata.app_version,
            ctx.metadata.app_platform,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Headers, RequestForm};
    use crate::store::Store;
    use bytes::Bytes;
    use serde_json::json;

    fn ctx(headers: Headers) -> RequestContext {
        let form = RequestForm {
            method: "GET".into(),
            scheme: "https".into(),
            host: "api.example.com".into(),
            port: 443,
            path: "/v1/profile".into(),
            query: vec![],
            headers,
            body: Bytes::new(),
        };
        RequestContext::new(form, None, "r1".into())
    }

    #[test]
    fn test_user_id_extraction() {
        let mut headers = Headers::new();
        headers.set("x-user-id", "alice");
        headers.set("authorization", "Bearer tok");
        let mut ctx = ctx(headers);
        UserIdInterceptor.on_request(&mut ctx).unwrap();
        assert_eq!(ctx.metadata.external_user_id.as_deref(), Some("alice"));
        assert!(ctx.metadata.has_jwt);
        assert_eq!(ctx.metadata.bearer_token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_mobile_headers_extraction() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .set_config(
                "mapping",
                &json!({
                    "app_version": {"source": "header", "key": "mobile-version"},
                    "app_platform": {"source": "header", "key": "mobile-platform"},
                    "app_language": {"source": "header", "key": "accept-language", "pattern": "^([a-z]{2})"},
                }),
            )
            .unwrap();
        let traffic = Arc::new(TrafficConfig::load(store).unwrap());

        let mut headers = Headers::new();
        headers.set("mobile-version", "1.2.3");
        headers.set("mobile-platform", "android");
        headers.set("accept-language", "en-US,en;q=0.9");
        let mut ctx = ctx(headers);
        MobileHeadersInterceptor::new(traffic).on_request(&mut ctx).unwrap();
        assert_eq!(ctx.metadata.app_version, "1.2.3");
        assert_eq!(ctx.metadata.app_platform, "android");
        assert_eq!(ctx.metadata.app_language, "en");
        assert_eq!(ctx.metadata.app_environment, "");
    }

    #[test]
    fn test_header_normalization_strips_proxy_headers() {
        let mut headers = Headers::new();
        headers.set("proxy-connection", "keep-alive");
        headers.set("proxy-authorization", "Basic x");
        headers.set("host", "api.example.com");
        headers.set("accept", "application/json");
        let mut ctx = ctx(headers);
        HeaderNormalizationInterceptor.on_request(&mut ctx).unwrap();
        assert!(!ctx.current.headers.contains("proxy-connection"));
        assert!(!ctx.current.headers.contains("proxy-authorization"));
        assert!(!ctx.current.headers.contains("host"));
        assert!(ctx.current.headers.contains("accept"));
        // the original snapshot keeps what the client sent
        assert!(ctx.original.headers.contains("host"));
    }
}
