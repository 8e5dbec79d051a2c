//! Session fabric
//!
//! Issues opaque `DPSESSION` cookies, resolves request identity, records
//! hashed upstream session tokens, and synthesizes replay-mode tokens so a
//! correlated identity survives across domains and modes. `DPSESSION` is a
//! random v4 UUID carrying no claims; the upstream token columns store only
//! SHA-256 digests plus the newest raw value.

pub mod cookies;
pub mod jwt;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::context::{Body, RequestContext, ResponseContext};
use crate::matching::json_at_path;
use crate::store::{SessionRow, Store};
use crate::traffic::{ExtractSource, ReplayLatency, SessionUpdateRule, TrafficConfig, UpdateKind};
use crate::util::sha256_hex;

use cookies::{dpsession_cookie, parse_set_cookie, replace_set_cookie_value, DPSESSION};

/// How a request's identity was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityVia {
    /// The `DPSESSION` cookie itself.
    Dpsession,
    /// A hashed upstream session cookie from an update rule.
    UpstreamCookie,
    /// A hashed bearer token.
    BearerToken,
}

/// A resolved session plus how it was found.
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub session: SessionRow,
    pub via: IdentityVia,
}

pub struct SessionFabric {
    store: Arc<Store>,
    traffic: Arc<TrafficConfig>,
    expiry: Duration,
    /// Per-session serialization of hash-array appends.
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl SessionFabric {
    pub fn new(store: Arc<Store>, traffic: Arc<TrafficConfig>, expiry: Duration) -> Self {
        Self {
            store,
            traffic,
            expiry,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve identity for an inbound request. Tries, in order: the
    /// `DPSESSION` cookie, hashed upstream cookies named by update rules,
    /// then a hashed bearer token. First hit wins; expired sessions are
    /// lazily deleted and treated as absent.
    pub fn resolve_identity(&self, ctx: &mut RequestContext) -> Result<Option<ResolvedIdentity>> {
        let snap = self.traffic.snapshot();

        if let Some(token) = ctx.cookie(DPSESSION) {
            if let Some(session) = self.live_session(self.store.find_session_by_p_session(&token)?)? {
                return Ok(Some(self.adopt(ctx, session, IdentityVia::Dpsession)));
            }
        }

        for rule in snap.session.update.iter().filter(|r| r.kind == UpdateKind::Cookie) {
            if let Some(value) = ctx.cookie(&rule.key) {
                let hash = sha256_hex(&value);
                if let Some(session) = self.live_session(self.store.find_session_by_us_hash(&hash)?)? {
                    return Ok(Some(self.adopt(ctx, session, IdentityVia::UpstreamCookie)));
                }
            }
        }

        if let Some(bearer) = ctx.bearer() {
            let hash = sha256_hex(&bearer);
            if let Some(session) = self.live_session(self.store.find_session_by_oauth_hash(&hash)?)? {
                return Ok(Some(self.adopt(ctx, session, IdentityVia::BearerToken)));
            }
        }

        Ok(None)
    }

    fn adopt(
        &self,
        ctx: &mut RequestContext,
        session: SessionRow,
        via: IdentityVia,
    ) -> ResolvedIdentity {
        ctx.metadata.session_id = Some(session.id);
        ctx.metadata.user_id = session.user_id;
        if let Err(e) = self.store.touch_session(session.id) {
            tracing::warn!("Failed to touch session {}: {}", session.id, e);
        }
        ResolvedIdentity { session, via }
    }

    fn live_session(&self, session: Option<SessionRow>) -> Result<Option<SessionRow>> {
        let Some(session) = session else {
            return Ok(None);
        };
        let expired = DateTime::parse_from_rfc3339(&session.expires_at)
            .map(|t| t.with_timezone(&Utc) <= Utc::now())
            .unwrap_or(false);
        if expired {
            tracing::debug!("Session {} expired, deleting", session.id);
            self.store.delete_session(session.id)?;
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// Apply session-create triggers: when a create rule matches the request,
    /// extract the identifier, get-or-create the user, create a session, and
    /// emit `DPSESSION` cookies across every monitored domain.
    pub fn apply_create_rules(
        &self,
        ctx: &mut RequestContext,
        resp: &mut ResponseContext,
    ) -> Result<Option<SessionRow>> {
        let snap = self.traffic.snapshot();
        let method = ctx.current.method.clone();
        let path = ctx.current.path.clone();

        for rule in &snap.session.create {
            if !rule.matches(&method, &path) {
                continue;
            }
            let raw = extract_request_value(ctx, rule.source, &rule.key);
            let Some(raw) = raw else { continue };
            let identifier = match &rule.pattern {
                Some(pattern) => match pattern.captures(&raw).and_then(|c| c.get(1)) {
                    Some(m) => m.as_str().to_string(),
                    None => continue,
                },
                None => raw,
            };
            if identifier.is_empty() {
                continue;
            }

            let user = self.store.get_or_create_user(&identifier)?;
            let p_session = Uuid::new_v4().to_string();
            let expires_at = (Utc::now() + chrono::Duration::from_std(self.expiry)?)
                .to_rfc3339_opts(SecondsFormat::Millis, true);
            let session = self.store.create_session(Some(user.id), &p_session, &expires_at)?;

            ctx.metadata.session_id = Some(session.id);
            ctx.metadata.user_id = Some(user.id);
            ctx.metadata.external_user_id = Some(user.user_id.clone());

            self.issue_cookies(resp, &p_session, &snap);
            tracing::info!(
                "Session {} created for user '{}' via {} {}",
                session.id,
                user.user_id,
                method,
                path
            );
            return Ok(Some(session));
        }
        Ok(None)
    }

    /// One `Set-Cookie` per configured monitored domain.
    fn issue_cookies(
        &self,
        resp: &mut ResponseContext,
        p_session: &str,
        snap: &crate::traffic::Snapshot,
    ) {
        for domain in &snap.domains {
            resp.headers.append(
                "set-cookie",
                dpsession_cookie(p_session, &domain.cookie_domain(), domain.secure),
            );
        }
    }

    /// Apply session-update triggers: extract the new upstream token from
    /// the response, hash it, and append to the session's hash array.
    /// Appends for one session are serialized through a per-session mutex.
    pub async fn apply_update_rules(
        &self,
        ctx: &RequestContext,
        resp: &ResponseContext,
        session_id: i64,
    ) -> Result<()> {
        let snap = self.traffic.snapshot();
        let method = &ctx.current.method;
        let path = &ctx.current.path;

        for rule in &snap.session.update {
            if !rule.matches(method, path) {
                continue;
            }
            let Some(raw) = extract_response_value(resp, rule) else {
                continue;
            };
            let value = match &rule.pattern {
                Some(pattern) => match pattern.captures(&raw).and_then(|c| c.get(1)) {
                    Some(m) => m.as_str().to_string(),
                    None => continue,
                },
                None => raw,
            };
            if value.is_empty() {
                continue;
            }
            let hash = sha256_hex(&value);

            let lock = self.session_lock(session_id).await;
            let _guard = lock.lock().await;
            let result = match rule.kind {
                UpdateKind::Cookie => self.store.append_us_hash(session_id, &hash, &value),
                UpdateKind::Auth => self.store.append_oauth_hash(session_id, &hash, &value),
            };
            if let Err(e) = result {
                tracing::warn!("Failed to append session hash for {}: {}", session_id, e);
            }
        }
        Ok(())
    }

    /// Cross-domain projection: identity resolved through an upstream token
    /// but no `DPSESSION` cookie presented — emit one for the inbound host's
    /// domain so subsequent requests carry it.
    pub fn project_cross_domain(
        &self,
        ctx: &RequestContext,
        resp: &mut ResponseContext,
        identity: &ResolvedIdentity,
    ) {
        if identity.via == IdentityVia::Dpsession || ctx.cookie(DPSESSION).is_some() {
            return;
        }
        let snap = self.traffic.snapshot();
        let host = &ctx.current.host;
        let (domain, secure) = snap
            .domains
            .iter()
            .find(|d| d.pattern.is_match(host))
            .map(|d| (d.cookie_domain(), d.secure))
            .unwrap_or_else(|| (host.clone(), ctx.current.scheme == "https"));
        resp.headers.append(
            "set-cookie",
            dpsession_cookie(&identity.session.p_session, &domain, secure),
        );
    }

    /// Replay-mode substitutions: when the replayed endpoint matches an auth
    /// update rule, replace the recorded token at the configured body path
    /// with a fresh replay JWT; recorded session cookies get the session's
    /// own opaque value so the client sees a self-consistent identity.
    pub fn apply_replay_substitutions(
        &self,
        ctx: &RequestContext,
        resp: &mut ResponseContext,
        session: &SessionRow,
    ) -> Result<()> {
        let snap = self.traffic.snapshot();
        let method = &ctx.current.method;
        let path = &ctx.current.path;

        for rule in &snap.session.update {
            if !rule.matches(method, path) {
                continue;
            }
            match rule.kind {
                UpdateKind::Auth => {
                    let token = jwt::sign_replay_token(
                        session.user_id.unwrap_or(0),
                        &session.p_session,
                        self.expiry.as_secs(),
                    )?;
                    if let Body::Json(body) = &mut resp.body {
                        if json_set_at_path(body, &rule.key, serde_json::Value::String(token)) {
                            tracing::debug!("Replay token substituted at '{}'", rule.key);
                        }
                    }
                }
                UpdateKind::Cookie => {
                    let rewritten: Vec<String> = resp
                        .headers
                        .get_all("set-cookie")
                        .iter()
                        .map(|raw| match parse_set_cookie(raw) {
                            Some((name, _)) if name.eq_ignore_ascii_case(&rule.key) => {
                                replace_set_cookie_value(raw, &session.p_session)
                            }
                            _ => raw.clone(),
                        })
                        .collect();
                    if !rewritten.is_empty() {
                        resp.headers.remove("set-cookie");
                        for value in rewritten {
                            resp.headers.append("set-cookie", value);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn session_lock(&self, session_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(session_id).or_default().clone()
    }
}

/// Replay latency shaping. Sleeps are cancellable with the request task.
pub async fn shape_latency(latency: ReplayLatency, recorded_ms: u64) {
    use rand::Rng;
    let ms = match latency {
        ReplayLatency::Instant => return,
        ReplayLatency::Average => recorded_ms,
        ReplayLatency::Fixed(v) => v,
        ReplayLatency::Random(start, end) => {
            if start >= end {
                start
            } else {
                rand::thread_rng().gen_range(start..=end)
            }
        }
    };
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

fn extract_request_value(ctx: &RequestContext, source: ExtractSource, key: &str) -> Option<String> {
    match source {
        ExtractSource::Header => ctx.current.headers.get(key).map(str::to_string),
        ExtractSource::Query => ctx.current.query_value(key).map(str::to_string),
        ExtractSource::Body => {
            let body: serde_json::Value = serde_json::from_slice(&ctx.current.body).ok()?;
            json_at_path(&body, key).map(json_value_to_string)
        }
    }
}

fn extract_response_value(resp: &ResponseContext, rule: &SessionUpdateRule) -> Option<String> {
    match rule.kind {
        UpdateKind::Cookie => resp
            .headers
            .get_all("set-cookie")
            .iter()
            .filter_map(|raw| parse_set_cookie(raw))
            .find(|(name, _)| name.eq_ignore_ascii_case(&rule.key))
            .map(|(_, value)| value),
        UpdateKind::Auth => resp
            .body
            .as_json()
            .and_then(|body| json_at_path(body, &rule.key))
            .map(json_value_to_string),
    }
}

fn json_value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Set a dot-path in a JSON value, creating nothing: returns false when the
/// path does not already lead to a value.
fn json_set_at_path(value: &mut serde_json::Value, path: &str, new_value: serde_json::Value) -> bool {
    let mut current = value;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        match current {
            serde_json::Value::Object(map) => {
                if last {
                    if map.contains_key(*segment) {
                        map.insert(segment.to_string(), new_value);
                        return true;
                    }
                    return false;
                }
                match map.get_mut(*segment) {
                    Some(next) => current = next,
                    None => return false,
                }
            }
            serde_json::Value::Array(items) => {
                let Ok(index) = segment.parse::<usize>() else {
                    return false;
                };
                if last {
                    if index < items.len() {
                        items[index] = new_value;
                        return true;
                    }
                    return false;
                }
                match items.get_mut(index) {
                    Some(next) => current = next,
                    None => return false,
                }
            }
            _ => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Headers, RequestForm, ResponseSource};
    use bytes::Bytes;
    use serde_json::json;

    fn fabric() -> (SessionFabric, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .set_config(
                "traffic",
                &json!({
                    "monitor": {"source": "header", "key": "X-App", "pattern": "^dpx$"},
                    "domains": [
                        {"domain": r"^api\.example\.com$", "secure": true},
                        {"domain": r"^auth\.example\.com$", "secure": false},
                    ],
                }),
            )
            .unwrap();
        store
            .set_config(
                "proxy",
                &json!({
                    "session": {
                        "create": [
                            {"endpoint": "/auth/login", "method": "POST", "source": "body", "key": "username"},
                        ],
                        "update": [
                            {"endpoint": "/auth/login", "method": "POST", "type": "cookie", "key": "JSESSIONID"},
                            {"endpoint": "/auth/token", "method": "POST", "type": "auth", "key": "access_token"},
                        ],
                    },
                }),
            )
            .unwrap();
        let traffic = Arc::new(TrafficConfig::load(store.clone()).unwrap());
        (
            SessionFabric::new(store.clone(), traffic, Duration::from_secs(86_400)),
            store,
        )
    }

    fn request(method: &str, path: &str, body: &str) -> RequestContext {
        let form = RequestForm {
            method: method.into(),
            scheme: "https".into(),
            host: "api.example.com".into(),
            port: 443,
            path: path.into(),
            query: vec![],
            headers: Headers::new(),
            body: Bytes::from(body.to_string().into_bytes()),
        };
        RequestContext::new(form, None, "r1".into())
    }

    fn response(status: u16) -> ResponseContext {
        ResponseContext::new(status, "r1".into(), ResponseSource::Upstream)
    }

    #[tokio::test]
    async fn test_session_creation_issues_cookies_for_all_domains() {
        let (fabric, _store) = fabric();
        let mut ctx = request("POST", "/auth/login", r#"{"username": "alice"}"#);
        let mut resp = response(200);

        let session = fabric.apply_create_rules(&mut ctx, &mut resp).unwrap().unwrap();
        let cookies = resp.headers.get_all("set-cookie");
        assert_eq!(cookies.len(), 2);
        assert!(cookies[0].starts_with(&format!("DPSESSION={}", session.p_session)));
        assert!(cookies[0].contains("Domain=api.example.com"));
        assert!(cookies[0].contains("Secure; "));
        assert!(cookies[1].contains("Domain=auth.example.com"));
        assert!(!cookies[1].contains("Secure"));

        // DPSESSION is a valid v4 UUID
        let parsed = Uuid::parse_str(&session.p_session).unwrap();
        assert_eq!(parsed.get_version_num(), 4);
        assert_eq!(ctx.metadata.session_id, Some(session.id));
    }

    #[tokio::test]
    async fn test_no_create_rule_no_session() {
        let (fabric, _store) = fabric();
        let mut ctx = request("POST", "/v1/other", r#"{"username": "alice"}"#);
        let mut resp = response(200);
        assert!(fabric.apply_create_rules(&mut ctx, &mut resp).unwrap().is_none());
        assert!(resp.headers.get_all("set-cookie").is_empty());
    }

    #[tokio::test]
    async fn test_identity_resolution_order() {
        let (fabric, store) = fabric();
        let mut ctx = request("POST", "/auth/login", r#"{"username": "alice"}"#);
        let mut resp = response(200);
        let session = fabric.apply_create_rules(&mut ctx, &mut resp).unwrap().unwrap();

        // (a) DPSESSION cookie
        let mut ctx = request("GET", "/v1/profile", "");
        ctx.current
            .headers
            .set("cookie", format!("DPSESSION={}", session.p_session));
        let identity = fabric.resolve_identity(&mut ctx).unwrap().unwrap();
        assert_eq!(identity.via, IdentityVia::Dpsession);
        assert_eq!(ctx.metadata.session_id, Some(session.id));

        // (b) upstream cookie hash
        store
            .append_us_hash(session.id, &sha256_hex("upstream-cookie"), "upstream-cookie")
            .unwrap();
        let mut ctx = request("GET", "/v1/profile", "");
        ctx.current.headers.set("cookie", "JSESSIONID=upstream-cookie");
        let identity = fabric.resolve_identity(&mut ctx).unwrap().unwrap();
        assert_eq!(identity.via, IdentityVia::UpstreamCookie);

        // (c) bearer hash
        store
            .append_oauth_hash(session.id, &sha256_hex("bearer-1"), "bearer-1")
            .unwrap();
        let mut ctx = request("GET", "/v1/profile", "");
        ctx.current.headers.set("authorization", "Bearer bearer-1");
        let identity = fabric.resolve_identity(&mut ctx).unwrap().unwrap();
        assert_eq!(identity.via, IdentityVia::BearerToken);

        // anonymous
        let mut ctx = request("GET", "/v1/profile", "");
        assert!(fabric.resolve_identity(&mut ctx).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_rules_append_hashes() {
        let (fabric, store) = fabric();
        let mut ctx = request("POST", "/auth/login", r#"{"username": "alice"}"#);
        let mut resp = response(200);
        let session = fabric.apply_create_rules(&mut ctx, &mut resp).unwrap().unwrap();

        resp.headers
            .append("set-cookie", "JSESSIONID=fresh-upstream; Path=/");
        fabric.apply_update_rules(&ctx, &resp, session.id).await.unwrap();

        let row = store.find_session_by_p_session(&session.p_session).unwrap().unwrap();
        assert_eq!(row.us_hash, vec![sha256_hex("fresh-upstream")]);
        assert_eq!(row.u_session.as_deref(), Some("fresh-upstream"));

        // auth update rule on /auth/token
        let ctx = request("POST", "/auth/token", "");
        let mut resp = response(200);
        resp.body = Body::Json(json!({"access_token": "tok-123"}));
        fabric.apply_update_rules(&ctx, &resp, session.id).await.unwrap();
        let row = store.find_session_by_p_session(&session.p_session).unwrap().unwrap();
        assert_eq!(row.oauth_hash, vec![sha256_hex("tok-123")]);
        assert_eq!(row.oauth_token.as_deref(), Some("tok-123"));
    }

    #[tokio::test]
    async fn test_cross_domain_projection() {
        let (fabric, store) = fabric();
        let session = store.create_session(None, "p-x", "2099-01-01T00:00:00.000Z").unwrap();
        let identity = ResolvedIdentity { session, via: IdentityVia::BearerToken };

        let ctx = request("GET", "/v1/profile", "");
        let mut resp = response(200);
        fabric.project_cross_domain(&ctx, &mut resp, &identity);
        let cookies = resp.headers.get_all("set-cookie");
        assert_eq!(cookies.len(), 1);
        assert!(cookies[0].starts_with("DPSESSION=p-x"));
        assert!(cookies[0].contains("Domain=api.example.com"));

        // resolved via DPSESSION itself: no projection
        let identity = ResolvedIdentity { via: IdentityVia::Dpsession, ..identity };
        let mut resp = response(200);
        fabric.project_cross_domain(&ctx, &mut resp, &identity);
        assert!(resp.headers.get_all("set-cookie").is_empty());
    }

    #[tokio::test]
    async fn test_replay_substitutions() {
        let (fabric, store) = fabric();
        let user = store.get_or_create_user("alice").unwrap();
        let session = store
            .create_session(Some(user.id), "p-replay", "2099-01-01T00:00:00.000Z")
            .unwrap();

        let ctx = request("POST", "/auth/token", "");
        let mut resp = response(200);
        resp.body = Body::Json(json!({"access_token": "recorded-token", "other": 1}));
        fabric.apply_replay_substitutions(&ctx, &mut resp, &session).unwrap();

        let body = resp.body.as_json().unwrap();
        let token = body["access_token"].as_str().unwrap();
        assert_ne!(token, "recorded-token");
        let claims = jwt::verify_replay_token(token).unwrap();
        assert_eq!(claims.sub, format!("user-{}", user.id));
        assert_eq!(claims.session_id, "p-replay");
        assert_eq!(body["other"], 1);

        // cookie substitution on /auth/login
        let ctx = request("POST", "/auth/login", "");
        let mut resp = response(200);
        resp.headers
            .append("set-cookie", "JSESSIONID=recorded-upstream; Path=/; HttpOnly");
        fabric.apply_replay_substitutions(&ctx, &mut resp, &session).unwrap();
        assert_eq!(
            resp.headers.get_all("set-cookie"),
            &["JSESSIONID=p-replay; Path=/; HttpOnly".to_string()]
        );
    }

    #[test]
    fn test_json_set_at_path() {
        let mut v = json!({"a": {"b": "old"}});
        assert!(json_set_at_path(&mut v, "a.b", json!("new")));
        assert_eq!(v, json!({"a": {"b": "new"}}));
        // never creates missing paths
        assert!(!json_set_at_path(&mut v, "a.missing.deep", json!(1)));
        assert!(!json_set_at_path(&mut v, "x", json!(1)));
    }

    #[tokio::test]
    async fn test_expired_session_is_deleted() {
        let (fabric, store) = fabric();
        store.create_session(None, "p-old", "2000-01-01T00:00:00.000Z").unwrap();
        let mut ctx = request("GET", "/v1/profile", "");
        ctx.current.headers.set("cookie", "DPSESSION=p-old");
        assert!(fabric.resolve_identity(&mut ctx).unwrap().is_none());
        assert!(store.find_session_by_p_session("p-old").unwrap().is_none());
    }
}
