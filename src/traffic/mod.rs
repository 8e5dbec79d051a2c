//! Traffic configuration cache
//!
//! Compiles the monitor, domain, mapping, endpoint-classification, replay
//! and session rules out of the record store's `config` rows (plus the
//! endpoint matching rules) into an immutable snapshot, and exposes the
//! synchronous predicates used on the hot path. `refresh_all` rebuilds the
//! snapshot and swaps it atomically; readers keep seeing a whole prior
//! snapshot until the swap.
//!
//! Invalid patterns are logged and skipped. A broken rule never prevents the
//! others from loading, and a missing monitor rule simply means nothing is
//! monitored.

mod rules;

pub use rules::{
    compile_endpoint_pattern, compile_glob, compile_rule, EnvironmentMatch, LanguageMatch,
    MatchDirectives, MatchRule, PlatformMatch, RuleType, VersionMatch,
};

use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use regex::Regex;

use crate::context::Headers;
use crate::store::Store;

// ─────────────────────────────────────────────────────────────────────────────
// Compiled rule types
// ─────────────────────────────────────────────────────────────────────────────

/// Where a monitored/mapped value is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueSource {
    Header,
    Query,
}

impl ValueSource {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "header" => Some(Self::Header),
            "query" => Some(Self::Query),
            _ => None,
        }
    }
}

/// The monitor rule: a request is monitored iff `pattern` matches the value
/// at `key` in the chosen source.
#[derive(Debug)]
pub struct MonitorRule {
    pub source: ValueSource,
    pub key: String,
    pub pattern: Regex,
}

/// One monitored domain.
#[derive(Debug)]
pub struct DomainRule {
    /// Raw pattern text, used as the cookie `Domain=` attribute.
    pub name: String,
    pub pattern: Regex,
    pub secure: bool,
}

impl DomainRule {
    /// Cookie `Domain=` value: the literal domain when the pattern is a
    /// plain anchored literal, else the raw pattern with anchors stripped.
    pub fn cookie_domain(&self) -> String {
        self.name
            .trim_start_matches('^')
            .trim_end_matches('$')
            .replace("\\.", ".")
    }
}

/// One mapped mobile dimension.
#[derive(Debug)]
pub struct MappingRule {
    pub source: ValueSource,
    pub key: String,
    /// When set, the first capture group becomes the value.
    pub pattern: Option<Regex>,
}

/// The full mapping config: where each dimension comes from.
#[derive(Debug, Default)]
pub struct Mapping {
    pub app_version: Option<MappingRule>,
    pub app_platform: Option<MappingRule>,
    pub app_environment: Option<MappingRule>,
    pub app_language: Option<MappingRule>,
    pub correlation_id: Option<MappingRule>,
    pub traceability_id: Option<MappingRule>,
}

/// Extracted dimension values. Absent values are empty strings, never null.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappedValues {
    pub app_version: String,
    pub app_platform: String,
    pub app_environment: String,
    pub app_language: String,
    pub correlation_id: String,
    pub traceability_id: String,
}

/// One endpoint classification rule.
#[derive(Debug)]
pub struct EndpointTypeRule {
    pub name: String,
    pub patterns: Vec<Regex>,
    pub priority: i64,
}

/// A display tag attached to matching paths.
#[derive(Debug)]
pub struct EndpointTag {
    pub name: String,
    pub pattern: Regex,
    pub color: String,
}

/// Replay latency policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayLatency {
    Instant,
    /// Use the recorded response's own latency.
    Average,
    /// Fixed milliseconds, clamped to 5..=30000 at parse time.
    Fixed(u64),
    /// Uniform sample in [start, end] milliseconds.
    Random(u64, u64),
}

/// Session create trigger.
#[derive(Debug)]
pub struct SessionCreateRule {
    pub endpoint: String,
    pub method: String,
    pub source: ExtractSource,
    pub key: String,
    pub pattern: Option<Regex>,
}

/// Session update trigger.
#[derive(Debug)]
pub struct SessionUpdateRule {
    pub endpoint: String,
    pub method: String,
    pub kind: UpdateKind,
    pub key: String,
    pub pattern: Option<Regex>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    /// Upstream session cookie observed in `Set-Cookie`.
    Cookie,
    /// Bearer token observed at a response-body path.
    Auth,
}

/// Where a session identifier/token is extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractSource {
    Body,
    Header,
    Query,
}

impl ExtractSource {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "body" => Some(Self::Body),
            "header" => Some(Self::Header),
            "query" => Some(Self::Query),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct SessionRules {
    pub create: Vec<SessionCreateRule>,
    pub update: Vec<SessionUpdateRule>,
}

impl SessionCreateRule {
    pub fn matches(&self, method: &str, path: &str) -> bool {
        (self.method == "*" || self.method.eq_ignore_ascii_case(method))
            && self.endpoint.eq_ignore_ascii_case(path)
    }
}

impl SessionUpdateRule {
    pub fn matches(&self, method: &str, path: &str) -> bool {
        (self.method == "*" || self.method.eq_ignore_ascii_case(method))
            && self.endpoint.eq_ignore_ascii_case(path)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Snapshot
// ─────────────────────────────────────────────────────────────────────────────

/// The compiled, immutable configuration snapshot.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub monitor: Option<MonitorRule>,
    pub domains: Vec<DomainRule>,
    pub mapping: Mapping,
    pub endpoint_types: Vec<EndpointTypeRule>,
    pub fallback_type: String,
    pub tags: Vec<EndpointTag>,
    pub replay_latency: ReplayLatency,
    pub replay_defaults: MatchDirectives,
    pub session: SessionRules,
    pub matching_rules: Vec<Arc<MatchRule>>,
}

impl Default for ReplayLatency {
    fn default() -> Self {
        ReplayLatency::Instant
    }
}

/// Process-wide configuration cache with atomic snapshot swap.
pub struct TrafficConfig {
    store: Arc<Store>,
    snapshot: ArcSwap<Snapshot>,
}

impl TrafficConfig {
    /// Build the cache and load the first snapshot.
    pub fn load(store: Arc<Store>) -> Result<Self> {
        let cache = Self {
            store,
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
        };
        cache.refresh_all()?;
        Ok(cache)
    }

    /// Rebuild the snapshot from the store and swap it in atomically.
    pub fn refresh_all(&self) -> Result<()> {
        let traffic = self.store.get_config("traffic")?;
        let mapping = self.store.get_config("mapping")?;
        let endpoint = self.store.get_config("endpoint")?;
        let proxy = self.store.get_config("proxy")?;
        let rule_rows = self.store.load_matching_rules()?;

        let snapshot = compile_snapshot(traffic, mapping, endpoint, proxy, &rule_rows);
        tracing::debug!(
            "Traffic config refreshed: monitor={}, domains={}, rules={}",
            snapshot.monitor.is_some(),
            snapshot.domains.len(),
            snapshot.matching_rules.len()
        );
        self.snapshot.store(Arc::new(snapshot));
        Ok(())
    }

    /// Current snapshot. Cheap; hold it for the duration of one request so
    /// the request sees consistent rules.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    pub fn is_monitoring_enabled(&self) -> bool {
        self.snapshot().monitor.is_some()
    }

    /// A request is monitored iff the monitor value matches *and* the host
    /// matches a monitored domain.
    pub fn is_monitored_request(
        &self,
        host: &str,
        headers: &Headers,
        query: &[(String, String)],
    ) -> bool {
        let snap = self.snapshot();
        snap.monitor_value_matches(headers, query) && snap.is_monitored_domain(host)
    }

    pub fn is_monitored_domain(&self, host: &str) -> bool {
        self.snapshot().is_monitored_domain(host)
    }

    pub fn is_secure_domain(&self, host: &str) -> bool {
        self.snapshot().is_secure_domain(host)
    }

    pub fn extract_all_mapped_values(
        &self,
        headers: &Headers,
        query: &[(String, String)],
    ) -> MappedValues {
        self.snapshot().extract_all_mapped_values(headers, query)
    }

    pub fn replay_latency(&self) -> ReplayLatency {
        self.snapshot().replay_latency
    }
}

impl Snapshot {
    pub fn monitor_value_matches(&self, headers: &Headers, query: &[(String, String)]) -> bool {
        let Some(monitor) = &self.monitor else {
            return false;
        };
        match lookup_value(monitor.source, &monitor.key, headers, query) {
            Some(value) => monitor.pattern.is_match(&value),
            None => false,
        }
    }

    pub fn is_monitored_domain(&self, host: &str) -> bool {
        self.domains.iter().any(|d| d.pattern.is_match(host))
    }

    pub fn is_secure_domain(&self, host: &str) -> bool {
        self.domains
            .iter()
            .find(|d| d.pattern.is_match(host))
            .map(|d| d.secure)
            .unwrap_or(false)
    }

    /// First endpoint type (priority ascending) with a matching pattern,
    /// else the fallback.
    pub fn get_endpoint_type(&self, path: &str) -> String {
        for rule in &self.endpoint_types {
            if rule.patterns.iter().any(|p| p.is_match(path)) {
                return rule.name.clone();
            }
        }
        self.fallback_type.clone()
    }

    pub fn extract_all_mapped_values(
        &self,
        headers: &Headers,
        query: &[(String, String)],
    ) -> MappedValues {
        MappedValues {
            app_version: extract_mapped(&self.mapping.app_version, headers, query),
            app_platform: extract_mapped(&self.mapping.app_platform, headers, query),
            app_environment: extract_mapped(&self.mapping.app_environment, headers, query),
            app_language: extract_mapped(&self.mapping.app_language, headers, query),
            correlation_id: extract_mapped(&self.mapping.correlation_id, headers, query),
            traceability_id: extract_mapped(&self.mapping.traceability_id, headers, query),
        }
    }

    /// Enabled rules applying to `mode`, already ordered priority ascending.
    pub fn rules_for_mode<'a>(&'a self, mode: &'a str) -> impl Iterator<Item = &'a Arc<MatchRule>> {
        self.matching_rules
            .iter()
            .filter(move |r| r.rule_type.applies_to(mode))
    }
}

fn lookup_value(
    source: ValueSource,
    key: &str,
    headers: &Headers,
    query: &[(String, String)],
) -> Option<String> {
    match source {
        ValueSource::Header => headers.get(key).map(str::to_string),
        ValueSource::Query => query
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.clone()),
    }
}

fn extract_mapped(
    rule: &Option<MappingRule>,
    headers: &Headers,
    query: &[(String, String)],
) -> String {
    let Some(rule) = rule else {
        return String::new();
    };
    let Some(raw) = lookup_value(rule.source, &rule.key, headers, query) else {
        return String::new();
    };
    match &rule.pattern {
        Some(pattern) => match pattern.captures(&raw) {
            Some(caps) => caps
                .get(1)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default()),
            None => String::new(),
        },
        None => raw,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Compilation
// ─────────────────────────────────────────────────────────────────────────────

fn compile_regex_ci(raw: &str, what: &str) -> Option<Regex> {
    match Regex::new(&format!("(?i){raw}")) {
        Ok(re) => Some(re),
        Err(e) => {
            tracing::warn!("Skipping invalid {} pattern '{}': {}", what, raw, e);
            None
        }
    }
}

fn compile_snapshot(
    traffic: Option<serde_json::Value>,
    mapping: Option<serde_json::Value>,
    endpoint: Option<serde_json::Value>,
    proxy: Option<serde_json::Value>,
    rule_rows: &[crate::store::MatchingRuleRow],
) -> Snapshot {
    let mut snap = Snapshot {
        fallback_type: "public".to_string(),
        ..Snapshot::default()
    };

    if let Some(traffic) = traffic {
        snap.monitor = compile_monitor(traffic.get("monitor"));
        snap.domains = compile_domains(traffic.get("domains"));
    }

    if let Some(mapping) = mapping {
        snap.mapping = Mapping {
            app_version: compile_mapping_rule(mapping.get("app_version"), "app_version"),
            app_platform: compile_mapping_rule(mapping.get("app_platform"), "app_platform"),
            app_environment: compile_mapping_rule(mapping.get("app_environment"), "app_environment"),
            app_language: compile_mapping_rule(mapping.get("app_language"), "app_language"),
            correlation_id: compile_mapping_rule(mapping.get("correlation_id"), "correlation_id"),
            traceability_id: compile_mapping_rule(mapping.get("traceability_id"), "traceability_id"),
        };
    }

    if let Some(endpoint) = endpoint {
        if let Some(name) = endpoint.get("fallback").and_then(|v| v.as_str()) {
            if !name.is_empty() {
                snap.fallback_type = name.to_string();
            }
        }
        let mut types: Vec<EndpointTypeRule> = endpoint
            .get("types")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(compile_endpoint_type).collect())
            .unwrap_or_default();
        types.sort_by_key(|t| t.priority);
        snap.endpoint_types = types;
        snap.tags = endpoint
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|items| items.iter().filter_map(compile_tag).collect())
            .unwrap_or_default();
    }

    if let Some(proxy) = proxy {
        snap.replay_latency = compile_replay_latency(proxy.get("replayLatency"));
        snap.replay_defaults = compile_replay_defaults(proxy.get("replayDefaults"));
        snap.session = compile_session_rules(proxy.get("session"));
    }

    snap.matching_rules = rule_rows
        .iter()
        .filter_map(|row| compile_rule(row).map(Arc::new))
        .collect();

    snap
}

fn compile_monitor(value: Option<&serde_json::Value>) -> Option<MonitorRule> {
    let value = value?;
    let source = ValueSource::parse(value.get("source")?.as_str()?)?;
    let key = value.get("key")?.as_str()?.to_string();
    let pattern = compile_regex_ci(value.get("pattern")?.as_str()?, "monitor")?;
    Some(MonitorRule { source, key, pattern })
}

fn compile_domains(value: Option<&serde_json::Value>) -> Vec<DomainRule> {
    let Some(items) = value.and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let name = item.get("domain")?.as_str()?.to_string();
            let pattern = compile_regex_ci(&name, "domain")?;
            let secure = item.get("secure").and_then(|v| v.as_bool()).unwrap_or(false);
            Some(DomainRule { name, pattern, secure })
        })
        .collect()
}

fn compile_mapping_rule(value: Option<&serde_json::Value>, what: &str) -> Option<MappingRule> {
    let value = value?;
    let source = ValueSource::parse(value.get("source")?.as_str()?)?;
    let key = value.get("key")?.as_str()?.to_string();
    let pattern = match value.get("pattern").and_then(|v| v.as_str()) {
        Some(raw) if !raw.is_empty() => {
            // An invalid mapping pattern disables capture for this field only
            compile_regex_ci(raw, what)
        }
        _ => None,
    };
    Some(MappingRule { source, key, pattern })
}

fn compile_endpoint_type(item: &serde_json::Value) -> Option<EndpointTypeRule> {
    let name = item.get("name")?.as_str()?.to_string();
    let priority = item.get("priority").and_then(|v| v.as_i64()).unwrap_or(100);
    let patterns = item
        .get("patterns")?
        .as_array()?
        .iter()
        .filter_map(|p| p.as_str())
        .filter_map(|p| compile_regex_ci(p, "endpoint type"))
        .collect::<Vec<_>>();
    if patterns.is_empty() {
        tracing::warn!("Endpoint type '{}' has no valid patterns, skipping", name);
        return None;
    }
    Some(EndpointTypeRule { name, patterns, priority })
}

fn compile_tag(item: &serde_json::Value) -> Option<EndpointTag> {
    let name = item.get("name")?.as_str()?.to_string();
    let pattern = compile_regex_ci(item.get("pattern")?.as_str()?, "tag")?;
    let color = item.get("color").and_then(|v| v.as_str()).unwrap_or("").to_string();
    Some(EndpointTag { name, pattern, color })
}

fn compile_replay_latency(value: Option<&serde_json::Value>) -> ReplayLatency {
    let Some(value) = value else {
        return ReplayLatency::Instant;
    };
    match value.get("type").and_then(|v| v.as_str()) {
        Some("average") => ReplayLatency::Average,
        Some("fixed") => {
            let ms = value.get("value").and_then(|v| v.as_u64()).unwrap_or(0);
            if !(5..=30_000).contains(&ms) {
                tracing::warn!("replayLatency fixed value {}ms out of bounds (5-30000), using instant", ms);
                ReplayLatency::Instant
            } else {
                ReplayLatency::Fixed(ms)
            }
        }
        Some("random") => {
            let start = value.get("start").and_then(|v| v.as_u64()).unwrap_or(0);
            let end = value.get("end").and_then(|v| v.as_u64()).unwrap_or(0);
            if start > end {
                tracing::warn!("replayLatency random bounds inverted ({start} > {end}), using instant");
                ReplayLatency::Instant
            } else {
                ReplayLatency::Random(start, end)
            }
        }
        _ => ReplayLatency::Instant,
    }
}

fn compile_replay_defaults(value: Option<&serde_json::Value>) -> MatchDirectives {
    let mut defaults = MatchDirectives::default();
    let Some(value) = value else {
        return defaults;
    };
    if value.get("match_version").and_then(|v| v.as_i64()) == Some(0) {
        defaults.version = VersionMatch::Closest;
    }
    if value.get("match_language").and_then(|v| v.as_i64()) == Some(0) {
        defaults.language = LanguageMatch::Fallback;
    }
    if value.get("match_platform").and_then(|v| v.as_i64()) == Some(0) {
        defaults.platform = PlatformMatch::Any;
    }
    if let Some(env) = value.get("match_environment").and_then(|v| v.as_str()) {
        if env != "exact" && !env.is_empty() {
            defaults.environment = EnvironmentMatch::Literal(env.to_ascii_lowercase());
        }
    }
    defaults
}

fn compile_session_rules(value: Option<&serde_json::Value>) -> SessionRules {
    let mut rules = SessionRules::default();
    let Some(value) = value else {
        return rules;
    };
    if let Some(items) = value.get("create").and_then(|v| v.as_array()) {
        for item in items {
            let Some(endpoint) = item.get("endpoint").and_then(|v| v.as_str()) else { continue };
            let Some(source) = item.get("source").and_then(|v| v.as_str()).and_then(ExtractSource::parse) else {
                tracing::warn!("Session create rule for '{}' has invalid source, skipping", endpoint);
                continue;
            };
            let Some(key) = item.get("key").and_then(|v| v.as_str()) else { continue };
            rules.create.push(SessionCreateRule {
                endpoint: endpoint.to_string(),
                method: item.get("method").and_then(|v| v.as_str()).unwrap_or("*").to_string(),
                source,
                key: key.to_string(),
                pattern: item
                    .get("pattern")
                    .and_then(|v| v.as_str())
                    .and_then(|p| compile_regex_ci(p, "session create")),
            });
        }
    }
    if let Some(items) = value.get("update").and_then(|v| v.as_array()) {
        for item in items {
            let Some(endpoint) = item.get("endpoint").and_then(|v| v.as_str()) else { continue };
            let kind = match item.get("type").and_then(|v| v.as_str()) {
                Some("cookie") => UpdateKind::Cookie,
                Some("auth") => UpdateKind::Auth,
                other => {
                    tracing::warn!("Session update rule for '{}' has invalid type {:?}, skipping", endpoint, other);
                    continue;
                }
            };
            let Some(key) = item.get("key").and_then(|v| v.as_str()) else { continue };
            rules.update.push(SessionUpdateRule {
                endpoint: endpoint.to_string(),
                method: item.get("method").and_then(|v| v.as_str()).unwrap_or("*").to_string(),
                kind,
                key: key.to_string(),
                pattern: item
                    .get("pattern")
                    .and_then(|v| v.as_str())
                    .and_then(|p| compile_regex_ci(p, "session update")),
            });
        }
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn headers(pairs: &[(&str, &str)]) -> Headers {
        let mut h = Headers::new();
        for (k, v) in pairs {
            h.append(*k, v.to_string());
        }
        h
    }

    fn snapshot_with(traffic: serde_json::Value) -> Snapshot {
        compile_snapshot(Some(traffic), None, None, None, &[])
    }

    #[test]
    fn test_monitor_and_domain_decision() {
        let snap = snapshot_with(json!({
            "monitor": {"source": "header", "key": "X-App", "pattern": "^dpx$"},
            "domains": [{"domain": r"^api\.example\.com$", "secure": true}],
        }));
        let hit = headers(&[("x-app", "dpx")]);
        let miss = headers(&[("x-app", "other")]);
        assert!(snap.monitor_value_matches(&hit, &[]));
        assert!(snap.monitor_value_matches(&headers(&[("X-APP", "DPX")]), &[]));
        assert!(!snap.monitor_value_matches(&miss, &[]));
        assert!(!snap.monitor_value_matches(&Headers::new(), &[]));
        assert!(snap.is_monitored_domain("api.example.com"));
        assert!(snap.is_monitored_domain("API.EXAMPLE.COM"));
        assert!(!snap.is_monitored_domain("cdn.other.com"));
        assert!(snap.is_secure_domain("api.example.com"));
    }

    #[test]
    fn test_monitor_from_query_source() {
        let snap = snapshot_with(json!({
            "monitor": {"source": "query", "key": "app", "pattern": "^dpx$"},
            "domains": [],
        }));
        let q = vec![("App".to_string(), "dpx".to_string())];
        assert!(snap.monitor_value_matches(&Headers::new(), &q));
    }

    #[test]
    fn test_invalid_monitor_pattern_is_skipped() {
        let snap = snapshot_with(json!({
            "monitor": {"source": "header", "key": "X-App", "pattern": "("},
            "domains": [{"domain": r"^api\.example\.com$", "secure": true}],
        }));
        assert!(snap.monitor.is_none());
        // other rules still loaded
        assert!(snap.is_monitored_domain("api.example.com"));
    }

    #[test]
    fn test_mapping_extraction_with_capture_group() {
        let snap = compile_snapshot(
            None,
            Some(json!({
                "app_version": {"source": "header", "key": "mobile-version"},
                "app_platform": {"source": "header", "key": "user-agent", "pattern": r"\((\w+);"},
                "app_language": {"source": "header", "key": "accept-language"},
            })),
            None,
            None,
            &[],
        );
        let h = headers(&[
            ("mobile-version", "1.2.3"),
            ("user-agent", "App/1.0 (android; phone)"),
        ]);
        let values = snap.extract_all_mapped_values(&h, &[]);
        assert_eq!(values.app_version, "1.2.3");
        assert_eq!(values.app_platform, "android");
        // absent values are empty strings, never null
        assert_eq!(values.app_language, "");
        assert_eq!(values.app_environment, "");
    }

    #[test]
    fn test_endpoint_classification_priority_and_fallback() {
        let snap = compile_snapshot(
            None,
            None,
            Some(json!({
                "fallback": "public",
                "types": [
                    {"name": "secure", "patterns": ["^/v1/account"], "priority": 1},
                    {"name": "internal", "patterns": ["^/v1/.*"], "priority": 5},
                ],
            })),
            None,
            &[],
        );
        assert_eq!(snap.get_endpoint_type("/v1/account/balance"), "secure");
        assert_eq!(snap.get_endpoint_type("/v1/profile"), "internal");
        assert_eq!(snap.get_endpoint_type("/healthz"), "public");
    }

    #[test]
    fn test_replay_latency_bounds() {
        let fixed = compile_replay_latency(Some(&json!({"type": "fixed", "value": 100})));
        assert_eq!(fixed, ReplayLatency::Fixed(100));
        let out_of_bounds = compile_replay_latency(Some(&json!({"type": "fixed", "value": 2})));
        assert_eq!(out_of_bounds, ReplayLatency::Instant);
        let random = compile_replay_latency(Some(&json!({"type": "random", "start": 10, "end": 20})));
        assert_eq!(random, ReplayLatency::Random(10, 20));
        let inverted = compile_replay_latency(Some(&json!({"type": "random", "start": 30, "end": 20})));
        assert_eq!(inverted, ReplayLatency::Instant);
        assert_eq!(compile_replay_latency(None), ReplayLatency::Instant);
    }

    #[test]
    fn test_session_rules_compile() {
        let snap = compile_snapshot(
            None,
            None,
            None,
            Some(json!({
                "session": {
                    "create": [
                        {"endpoint": "/auth/login", "method": "POST", "source": "body", "key": "username"},
                    ],
                    "update": [
                        {"endpoint": "/auth/login", "method": "POST", "type": "cookie", "key": "JSESSIONID"},
                        {"endpoint": "/auth/token", "method": "POST", "type": "auth", "key": "access_token"},
                        {"endpoint": "/bad", "method": "POST", "type": "nope", "key": "x"},
                    ],
                },
            })),
            &[],
        );
        assert_eq!(snap.session.create.len(), 1);
        assert!(snap.session.create[0].matches("post", "/auth/login"));
        assert!(!snap.session.create[0].matches("GET", "/auth/login"));
        assert_eq!(snap.session.update.len(), 2);
        assert_eq!(snap.session.update[0].kind, UpdateKind::Cookie);
        assert_eq!(snap.session.update[1].kind, UpdateKind::Auth);
    }

    #[test]
    fn test_cookie_domain_strips_anchors() {
        let rule = DomainRule {
            name: r"^api\.example\.com$".into(),
            pattern: Regex::new(r"(?i)^api\.example\.com$").unwrap(),
            secure: true,
        };
        assert_eq!(rule.cookie_domain(), "api.example.com");
    }
}
