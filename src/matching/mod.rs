//! Matching engine
//!
//! Finds the best recorded response for an incoming request. A rule from the
//! endpoint matching config (or the replay defaults) decides how strictly
//! each dimension is compared; the engine then walks a fixed ladder of
//! relaxation strategies, stopping at the first that yields candidates:
//!
//! 1. `exact` — exact version, language, platform
//! 2. `version_closest` — no version filter, sorted by numeric distance
//! 3. `language_en` — force `en`
//! 4. `language_any` — no language filter
//! 5. `platform_any` — no platform filter
//! 6. `all_fallback` — all allowed relaxations combined
//!
//! Post-filters (query params, headers) drop candidates; body fields only
//! reorder them. Given a fixed store and config the result is deterministic.

mod score;
mod version;

pub use score::{
    body_score, headers_match, json_at_path, normalize_query, optional_params_score,
    query_params_equal, required_params_match,
};
pub use version::{parse_version, version_distance};

use std::sync::Arc;

use anyhow::Result;

use crate::context::RequestContext;
use crate::store::{CandidateQuery, RecordedPair, Store};
use crate::traffic::{
    EnvironmentMatch, LanguageMatch, MatchDirectives, MatchRule, PlatformMatch, Snapshot,
    TrafficConfig, VersionMatch,
};

/// The strategy that produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Exact,
    VersionClosest,
    LanguageEn,
    LanguageAny,
    PlatformAny,
    AllFallback,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::VersionClosest => "version_closest",
            Self::LanguageEn => "language_en",
            Self::LanguageAny => "language_any",
            Self::PlatformAny => "platform_any",
            Self::AllFallback => "all_fallback",
        }
    }
}

/// A successful lookup.
#[derive(Debug)]
pub struct MatchResult {
    pub pair: RecordedPair,
    pub strategy: Strategy,
    pub config_id: Option<i64>,
}

/// Dimension filters of one strategy. `None` omits the SQL clause.
#[derive(Debug, Clone, PartialEq, Eq)]
struct StrategyFilter {
    version: Option<String>,
    /// Sort candidates by version distance after the query.
    closest_sort: bool,
    language: Option<String>,
    platform: Option<String>,
}

pub struct MatchingEngine {
    store: Arc<Store>,
    traffic: Arc<TrafficConfig>,
}

impl MatchingEngine {
    pub fn new(store: Arc<Store>, traffic: Arc<TrafficConfig>) -> Self {
        Self { store, traffic }
    }

    /// First enabled rule applying to `mode` whose method and pattern match.
    pub fn select_rule(
        &self,
        snap: &Snapshot,
        mode: &str,
        method: &str,
        path: &str,
    ) -> Option<Arc<MatchRule>> {
        snap.rules_for_mode(mode)
            .find(|r| r.matches(method, path))
            .cloned()
    }

    /// Find the best recorded response for `ctx`, or `None` on a miss.
    pub fn find_match(&self, ctx: &RequestContext, mode: &str) -> Result<Option<MatchResult>> {
        let snap = self.traffic.snapshot();
        let method = ctx.current.method.as_str();
        let path = ctx.current.path.as_str();

        let rule = self.select_rule(&snap, mode, method, path);
        let config_id = rule.as_ref().map(|r| r.id);
        let directives: MatchDirectives = match &rule {
            Some(rule) => rule.directives.clone(),
            None => snap.replay_defaults.clone(),
        };

        // Secure endpoints bring the resolved user into the base predicate
        let endpoint_type = if snap.get_endpoint_type(path) == "secure" {
            "secure"
        } else {
            "public"
        };

        let environment = match &directives.environment {
            EnvironmentMatch::Exact => {
                let env = ctx.metadata.app_environment.as_str();
                if env.is_empty() {
                    None
                } else {
                    Some(env.to_string())
                }
            }
            EnvironmentMatch::Literal(literal) => Some(literal.clone()),
        };

        let incoming_body: Option<serde_json::Value> = if directives.body.is_some() {
            serde_json::from_slice(&ctx.current.body).ok()
        } else {
            None
        };

        let mut tried: Vec<StrategyFilter> = Vec::new();
        for (strategy, filter) in build_strategies(&directives, ctx) {
            if tried.contains(&filter) {
                continue;
            }
            tried.push(filter.clone());

            let query = CandidateQuery {
                method,
                path,
                endpoint_type,
                user_id: ctx.metadata.user_id,
                status: Some(directives.response_status),
                environment: environment.as_deref(),
                version: filter.version.as_deref(),
                language: filter.language.as_deref(),
                platform: filter.platform.as_deref(),
            };
            let candidates = self.store.find_candidates(&query)?;
            if candidates.is_empty() {
                continue;
            }

            if let Some(best) = select_candidate(candidates, &directives, ctx, &incoming_body, filter.closest_sort) {
                tracing::debug!(
                    "Match for {} {} via strategy {} (rule {:?})",
                    method,
                    path,
                    strategy.as_str(),
                    config_id
                );
                return Ok(Some(MatchResult { pair: best, strategy, config_id }));
            }
        }

        Ok(None)
    }
}

/// The strategy ladder allowed by the directives, in order.
fn build_strategies(
    directives: &MatchDirectives,
    ctx: &RequestContext,
) -> Vec<(Strategy, StrategyFilter)> {
    let version = ctx.metadata.app_version.clone();
    let language = ctx.metadata.app_language.clone();
    let platform = ctx.metadata.app_platform.clone();

    let version_allowed_closest = directives.version == VersionMatch::Closest;
    let version_filter = |relaxed: bool| -> (Option<String>, bool) {
        if relaxed && version_allowed_closest {
            (None, true)
        } else {
            (Some(version.clone()), false)
        }
    };

    let mut strategies = Vec::new();

    strategies.push((
        Strategy::Exact,
        StrategyFilter {
            version: Some(version.clone()),
            closest_sort: false,
            language: Some(language.clone()),
            platform: Some(platform.clone()),
        },
    ));

    if version_allowed_closest {
        strategies.push((
            Strategy::VersionClosest,
            StrategyFilter {
                version: None,
                closest_sort: true,
                language: Some(language.clone()),
                platform: Some(platform.clone()),
            },
        ));
    }

    if directives.language == LanguageMatch::Fallback {
        if !language.eq_ignore_ascii_case("en") {
            let (v, closest) = version_filter(true);
            strategies.push((
                Strategy::LanguageEn,
                StrategyFilter {
                    version: v,
                    closest_sort: closest,
                    language: Some("en".to_string()),
                    platform: Some(platform.clone()),
                },
            ));
        }
        let (v, closest) = version_filter(true);
        strategies.push((
            Strategy::LanguageAny,
            StrategyFilter {
                version: v,
                closest_sort: closest,
                language: None,
                platform: Some(platform.clone()),
            },
        ));
    }

    if directives.platform == PlatformMatch::Any {
        let (v, closest) = version_filter(true);
        strategies.push((
            Strategy::PlatformAny,
            StrategyFilter {
                version: v,
                closest_sort: closest,
                language: Some(language.clone()),
                platform: None,
            },
        ));
    }

    // Combine every allowed relaxation; skipped by the dedup check when it
    // collapses to a strategy already tried.
    let (v, closest) = version_filter(true);
    strategies.push((
        Strategy::AllFallback,
        StrategyFilter {
            version: v,
            closest_sort: closest,
            language: if directives.language == LanguageMatch::Fallback {
                None
            } else {
                Some(language)
            },
            platform: if directives.platform == PlatformMatch::Any {
                None
            } else {
                Some(platform)
            },
        },
    ));

    strategies
}

/// Apply post-filters and preference ordering, returning the winner.
///
/// The SQL result arrives ordered `updated_at DESC`; every sort below is
/// stable, so recency stays the final tiebreaker. Precedence of the
/// preference keys: version distance (closest strategies), then body
/// priority, then query-param score.
fn select_candidate(
    candidates: Vec<RecordedPair>,
    directives: &MatchDirectives,
    ctx: &RequestContext,
    incoming_body: &Option<serde_json::Value>,
    closest_sort: bool,
) -> Option<RecordedPair> {
    struct Scored {
        pair: RecordedPair,
        distance: i64,
        body_index: usize,
        body_weight: i64,
        query_score: i64,
    }

    let incoming_query = &ctx.current.query;
    let mut scored: Vec<Scored> = Vec::with_capacity(candidates.len());

    'candidates: for pair in candidates {
        if let Some(required_headers) = &directives.headers {
            if !headers_match(required_headers, &ctx.current.headers, &pair.request.headers) {
                continue 'candidates;
            }
        }

        let mut query_score = 0;
        match &directives.query_params {
            None => {
                if !query_params_equal(incoming_query, &pair.request.query_params) {
                    continue 'candidates;
                }
            }
            Some(required) => {
                if !required_params_match(required, incoming_query, &pair.request.query_params) {
                    continue 'candidates;
                }
                query_score = optional_params_score(required, incoming_query, &pair.request.query_params);
            }
        }

        let (body_index, body_weight) = match &directives.body {
            Some(fields) => body_score(fields, incoming_body.as_ref(), pair.request.body.as_ref()),
            None => (usize::MAX, 0),
        };

        let distance = if closest_sort {
            version_distance(&ctx.metadata.app_version, &pair.request.app_version)
        } else {
            0
        };

        scored.push(Scored { pair, distance, body_index, body_weight, query_score });
    }

    scored.sort_by(|a, b| {
        a.distance
            .cmp(&b.distance)
            .then(a.body_index.cmp(&b.body_index))
            .then(b.body_weight.cmp(&a.body_weight))
            .then(b.query_score.cmp(&a.query_score))
    });

    scored.into_iter().next().map(|s| s.pair)
}
