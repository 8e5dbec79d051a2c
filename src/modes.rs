//! Mode service
//!
//! Holds the current operating mode (persisted in the `proxy` config row,
//! cached atomically) and dispatches each monitored request to the
//! passthrough, recording, or replay handler.

use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;

use crate::context::{Body, RequestContext, ResponseContext, ResponseSource};
use crate::forward::{compose_target_url, Forwarder};
use crate::matching::{body_score, query_params_equal, MatchingEngine};
use crate::sessions::{shape_latency, ResolvedIdentity, SessionFabric};
use crate::store::{NewRecording, Store};
use crate::traffic::TrafficConfig;

/// The three mutually exclusive operating modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Passthrough,
    Recording,
    Replay,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::Recording => "recording",
            Self::Replay => "replay",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "passthrough" => Some(Self::Passthrough),
            "recording" => Some(Self::Recording),
            "replay" => Some(Self::Replay),
            _ => None,
        }
    }
}

/// Collaborators the mode handlers dispatch into.
pub struct ModeDeps {
    pub store: Arc<Store>,
    pub traffic: Arc<TrafficConfig>,
    pub forwarder: Arc<Forwarder>,
    pub matching: Arc<MatchingEngine>,
    pub sessions: Arc<SessionFabric>,
}

pub struct ModeService {
    store: Arc<Store>,
    current: ArcSwap<Mode>,
}

impl ModeService {
    /// Load the persisted mode from the store, seeding it with the
    /// environment default when absent.
    pub fn load(store: Arc<Store>, default_mode: &str) -> Result<Self> {
        let default = Mode::parse(default_mode).unwrap_or(Mode::Passthrough);
        let persisted = store
            .get_config("proxy")?
            .and_then(|cfg| cfg.get("mode").and_then(|m| m.as_str()).and_then(Mode::parse));
        let mode = persisted.unwrap_or(default);
        if persisted.is_none() {
            let mut cfg = store.get_config("proxy")?.unwrap_or_else(|| serde_json::json!({}));
            cfg["mode"] = serde_json::json!(mode.as_str());
            store.set_config("proxy", &cfg)?;
        }
        tracing::info!("Proxy mode: {}", mode.as_str());
        Ok(Self {
            store,
            current: ArcSwap::from_pointee(mode),
        })
    }

    pub fn current(&self) -> Mode {
        **self.current.load()
    }

    /// Persist and switch the mode atomically.
    pub fn set_mode(&self, mode: Mode) -> Result<()> {
        let mut cfg = self
            .store
            .get_config("proxy")?
            .unwrap_or_else(|| serde_json::json!({}));
        cfg["mode"] = serde_json::json!(mode.as_str());
        self.store.set_config("proxy", &cfg)?;
        self.current.store(Arc::new(mode));
        tracing::info!("Proxy mode set to {}", mode.as_str());
        Ok(())
    }

    /// Dispatch one monitored request to the current mode's handler.
    pub async fn handle(
        &self,
        ctx: &mut RequestContext,
        identity: Option<&ResolvedIdentity>,
        deps: &ModeDeps,
    ) -> ResponseContext {
        let mode = self.current();
        ctx.metadata.mode = mode.as_str().to_string();
        match mode {
            Mode::Passthrough => forward_upstream(ctx, deps).await,
            Mode::Recording => {
                let resp = forward_upstream(ctx, deps).await;
                if resp.source == ResponseSource::Upstream && resp.status < 400 {
                    if let Err(e) = record_response(ctx, &resp, deps) {
                        // Recording is best-effort; the client still gets its response
                        tracing::warn!("Failed to record response: {}", e);
                    }
                }
                resp
            }
            Mode::Replay => replay(ctx, identity, deps).await,
        }
    }
}

/// Compose the target URL and forward. Scheme comes from the monitored
/// domain's secure flag when the host is configured, else from the inbound
/// scheme. Non-monitored requests use this path directly regardless of mode.
pub async fn forward_upstream(ctx: &RequestContext, deps: &ModeDeps) -> ResponseContext {
    let host = &ctx.current.host;
    let scheme = if deps.traffic.is_monitored_domain(host) {
        if deps.traffic.is_secure_domain(host) {
            "https"
        } else {
            "http"
        }
    } else {
        ctx.current.scheme.as_str()
    };
    let target = compose_target_url(
        scheme,
        host,
        ctx.current.port,
        &ctx.current.path,
        &ctx.current.query_string(),
    );
    deps.forwarder.forward(ctx, &target).await
}

/// Recording-mode upsert keyed by `(user_id, method, endpoint_path,
/// normalized query, dimensions, endpoint_type)`, with a secondary body
/// match selecting an existing row when the rule lists body fields.
fn record_response(ctx: &RequestContext, resp: &ResponseContext, deps: &ModeDeps) -> Result<()> {
    let snap = deps.traffic.snapshot();
    let path = ctx.current.path.as_str();
    let is_secure = snap.get_endpoint_type(path) == "secure";
    let endpoint_type = if is_secure { "secure" } else { "public" };
    let user_id = if is_secure { ctx.metadata.user_id } else { None };

    let recording = NewRecording {
        user_id,
        method: ctx.current.method.to_ascii_uppercase(),
        host: ctx.current.host.clone(),
        endpoint_path: path.to_string(),
        query_params: query_to_json(&ctx.current.query),
        request_headers: ctx.current.headers.to_json(),
        request_body: body_to_json(&ctx.current.body),
        app_version: ctx.metadata.app_version.clone(),
        app_platform: ctx.metadata.app_platform.clone(),
        app_environment: ctx.metadata.app_environment.clone(),
        app_language: ctx.metadata.app_language.clone(),
        endpoint_type: endpoint_type.to_string(),
        response_status: resp.status,
        response_headers: resp.headers.to_json(),
        response_body: match &resp.body {
            Body::Empty => None,
            Body::Json(v) => Some(v.clone()),
            Body::Text(s) => Some(serde_json::Value::String(s.clone())),
            Body::Bytes(b) => Some(serde_json::Value::String(
                String::from_utf8_lossy(b).into_owned(),
            )),
        },
        response_source: "recording".to_string(),
        latency_ms: resp.latency_ms,
    };

    let existing = deps.store.find_recordings_for_key(
        user_id,
        &recording.method,
        path,
        &recording.app_version,
        &recording.app_platform,
        &recording.app_environment,
        &recording.app_language,
        endpoint_type,
    )?;

    let same_query: Vec<_> = existing
        .into_iter()
        .filter(|pair| query_params_equal(&ctx.current.query, &pair.request.query_params))
        .collect();

    let target_row = if same_query.is_empty() {
        None
    } else {
        // A recording rule with body fields can pin the update to the row
        // whose body matches best
        let rule = deps
            .matching
            .select_rule(&snap, "recording", &recording.method, path);
        match rule.as_ref().and_then(|r| r.directives.body.as_ref()) {
            Some(fields) => {
                let incoming = recording.request_body.as_ref();
                same_query
                    .iter()
                    .map(|pair| {
                        let (idx, weight) = body_score(fields, incoming, pair.request.body.as_ref());
                        (pair.request.id, idx, weight)
                    })
                    .filter(|(_, idx, _)| *idx != usize::MAX)
                    .min_by(|a, b| a.1.cmp(&b.1).then(b.2.cmp(&a.2)))
                    .map(|(id, _, _)| id)
                    .or_else(|| {
                        // body fields configured but nothing matched: distinct
                        // payload, insert a new row
                        None
                    })
            }
            None => Some(same_query[0].request.id),
        }
    };

    match target_row {
        Some(request_id) => {
            deps.store.update_recording(request_id, &recording)?;
            tracing::debug!("Updated recording {} for {} {}", request_id, recording.method, path);
        }
        None => {
            let id = deps.store.insert_recording(&recording)?;
            tracing::debug!("Inserted recording {} for {} {}", id, recording.method, path);
        }
    }
    Ok(())
}

/// Replay: find the best recorded response, shape latency, substitute
/// session tokens, or report a miss as 502.
async fn replay(
    ctx: &mut RequestContext,
    identity: Option<&ResolvedIdentity>,
    deps: &ModeDeps,
) -> ResponseContext {
    let result = match deps.matching.find_match(ctx, "replay") {
        Ok(result) => result,
        Err(e) => {
            // Store errors in the read path are a replay miss
            tracing::warn!("Matching query failed: {}", e);
            None
        }
    };

    let Some(found) = result else {
        let mut resp =
            ResponseContext::error(502, "no-match", ctx.metadata.request_id.clone());
        resp.source = ResponseSource::ReplayMiss;
        return resp;
    };

    let recorded = &found.pair.response;
    let mut resp = ResponseContext::new(
        recorded.status,
        ctx.metadata.request_id.clone(),
        ResponseSource::Replay,
    );
    resp.headers = recorded.headers.clone();
    // Content-Length is recomputed at serialization; the stored one may
    // describe a compressed body
    resp.headers.remove("content-length");
    resp.headers.remove("transfer-encoding");
    resp.body = match &recorded.body {
        Some(serde_json::Value::String(s)) => Body::Text(s.clone()),
        Some(value) => Body::Json(value.clone()),
        None => Body::Empty,
    };
    resp.strategy = Some(found.strategy.as_str());
    resp.latency_ms = recorded.latency_ms;

    shape_latency(deps.traffic.replay_latency(), recorded.latency_ms).await;

    if let Some(identity) = identity {
        if let Err(e) = deps
            .sessions
            .apply_replay_substitutions(ctx, &mut resp, &identity.session)
        {
            tracing::warn!("Replay token substitution failed: {}", e);
        }
    }

    resp
}

/// Query pairs as the persisted JSON object (original casing; repeated keys
/// become arrays).
fn query_to_json(pairs: &[(String, String)]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (k, v) in pairs {
        match map.get_mut(k) {
            None => {
                map.insert(k.clone(), serde_json::Value::String(v.clone()));
            }
            Some(serde_json::Value::Array(items)) => {
                items.push(serde_json::Value::String(v.clone()));
            }
            Some(existing) => {
                let prior = existing.clone();
                *existing = serde_json::Value::Array(vec![
                    prior,
                    serde_json::Value::String(v.clone()),
                ]);
            }
        }
    }
    serde_json::Value::Object(map)
}

fn body_to_json(body: &bytes::Bytes) -> Option<serde_json::Value> {
    if body.is_empty() {
        return None;
    }
    match serde_json::from_slice(body) {
        Ok(value) => Some(value),
        Err(_) => Some(serde_json::Value::String(
            String::from_utf8_lossy(body).into_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Headers;
    use crate::context::RequestForm;
    use bytes::Bytes;
    use serde_json::json;
    use std::time::Duration;

    fn deps() -> ModeDeps {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .set_config(
                "traffic",
                &json!({
                    "monitor": {"source": "header", "key": "X-App", "pattern": "^dpx$"},
                    "domains": [{"domain": r"^api\.example\.com$", "secure": true}],
                }),
            )
            .unwrap();
        let traffic = Arc::new(TrafficConfig::load(store.clone()).unwrap());
        ModeDeps {
            store: store.clone(),
            traffic: traffic.clone(),
            forwarder: Arc::new(Forwarder::new(&crate::config::ForwarderConfig::default()).unwrap()),
            matching: Arc::new(MatchingEngine::new(store.clone(), traffic.clone())),
            sessions: Arc::new(SessionFabric::new(store, traffic, Duration::from_secs(3600))),
        }
    }

    fn request_ctx() -> RequestContext {
        let form = RequestForm {
            method: "POST".into(),
            scheme: "https".into(),
            host: "api.example.com".into(),
            port: 443,
            path: "/v1/profile".into(),
            query: vec![],
            headers: Headers::new(),
            body: Bytes::from_static(b"{\"id\":1}"),
        };
        let mut ctx = RequestContext::new(form, None, "r1".into());
        ctx.metadata.app_version = "1.2.3".into();
        ctx.metadata.app_platform = "android".into();
        ctx.metadata.app_environment = "sit".into();
        ctx.metadata.app_language = "en".into();
        ctx
    }

    fn upstream_response() -> ResponseContext {
        let mut resp = ResponseContext::new(200, "r1".into(), ResponseSource::Upstream);
        resp.headers.set("content-type", "application/json");
        resp.body = Body::Json(json!({"name": "a"}));
        resp.latency_ms = 20;
        resp
    }

    #[tokio::test]
    async fn test_record_then_replay_returns_captured_response() {
        let deps = deps();
        let ctx = request_ctx();
        record_response(&ctx, &upstream_response(), &deps).unwrap();

        let mut replay_ctx = request_ctx();
        let resp = replay(&mut replay_ctx, None, &deps).await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.source, ResponseSource::Replay);
        assert_eq!(resp.strategy, Some("exact"));
        assert_eq!(resp.body.as_json().unwrap()["name"], "a");
        assert_eq!(resp.headers.get("content-type"), Some("application/json"));
    }

    #[tokio::test]
    async fn test_recording_same_key_updates_in_place() {
        let deps = deps();
        let ctx = request_ctx();
        record_response(&ctx, &upstream_response(), &deps).unwrap();

        let mut second = upstream_response();
        second.body = Body::Json(json!({"name": "b"}));
        record_response(&ctx, &second, &deps).unwrap();

        // one row, carrying the newer body
        let pairs = deps
            .store
            .find_recordings_for_key(None, "POST", "/v1/profile", "1.2.3", "android", "sit", "en", "public")
            .unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].response.body, Some(json!({"name": "b"})));
    }

    #[tokio::test]
    async fn test_replay_miss_is_502_no_match() {
        let deps = deps();
        let mut ctx = request_ctx();
        let resp = replay(&mut ctx, None, &deps).await;
        assert_eq!(resp.status, 502);
        assert_eq!(resp.source, ResponseSource::ReplayMiss);
        let body = resp.body.as_json().unwrap();
        assert_eq!(body["error"], true);
        assert_eq!(body["message"], "no-match");
    }

    #[test]
    fn test_mode_parse_and_round_trip() {
        assert_eq!(Mode::parse("replay"), Some(Mode::Replay));
        assert_eq!(Mode::parse("RECORDING"), Some(Mode::Recording));
        assert_eq!(Mode::parse("bogus"), None);
        assert_eq!(Mode::Passthrough.as_str(), "passthrough");
    }

    #[test]
    fn test_mode_service_persists_mode() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let service = ModeService::load(store.clone(), "recording").unwrap();
        assert_eq!(service.current(), Mode::Recording);

        service.set_mode(Mode::Replay).unwrap();
        assert_eq!(service.current(), Mode::Replay);

        // a fresh service sees the persisted mode, not the env default
        let reloaded = ModeService::load(store, "passthrough").unwrap();
        assert_eq!(reloaded.current(), Mode::Replay);
    }

    #[test]
    fn test_mode_set_preserves_other_proxy_config() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .set_config("proxy", &json!({"replayLatency": {"type": "instant"}}))
            .unwrap();
        let service = ModeService::load(store.clone(), "passthrough").unwrap();
        service.set_mode(Mode::Recording).unwrap();
        let cfg = store.get_config("proxy").unwrap().unwrap();
        assert_eq!(cfg["mode"], "recording");
        assert_eq!(cfg["replayLatency"]["type"], "instant");
    }

    #[test]
    fn test_query_to_json_preserves_casing_and_repeats() {
        let pairs = vec![
            ("A".to_string(), "x".to_string()),
            ("b".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ];
        assert_eq!(query_to_json(&pairs), json!({"A": "x", "b": ["1", "2"]}));
    }
}
