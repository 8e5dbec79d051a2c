//! Endpoint matching rules: compiled form of `endpoint_matching_config`
//!
//! Patterns are either plain glob (`:name` matches one path segment, `*`
//! matches anything) or full regex, selected by the row's `regex` flag.
//! Compilation failures drop the rule with a warning; they never prevent
//! other rules from loading.

use regex::Regex;

use crate::store::{MatchingRuleRow, StatusFilter};

/// Version dimension directive: 0 = closest fallback allowed, 1 = exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionMatch {
    Closest,
    Exact,
}

/// Language dimension directive: 0 = exact → en → any, 1 = exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanguageMatch {
    Fallback,
    Exact,
}

/// Platform dimension directive: 0 = exact → any, 1 = exact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformMatch {
    Any,
    Exact,
}

/// Environment directive: `exact` compares against the inbound value, a
/// literal (`sit`, `stage`, `dev`, `prod`) forces equality to that value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentMatch {
    Exact,
    Literal(String),
}

/// Which mode(s) a rule applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
    Replay,
    Recording,
    Both,
}

impl RuleType {
    pub fn applies_to(&self, mode: &str) -> bool {
        match self {
            RuleType::Both => true,
            RuleType::Replay => mode == "replay",
            RuleType::Recording => mode == "recording",
        }
    }
}

/// Dimension directives of one rule (or the replay defaults).
#[derive(Debug, Clone)]
pub struct MatchDirectives {
    pub version: VersionMatch,
    pub language: LanguageMatch,
    pub platform: PlatformMatch,
    pub environment: EnvironmentMatch,
    /// Required query-param keys; absent means normalized full equality.
    pub query_params: Option<Vec<String>>,
    /// Required header names; absent means headers are ignored.
    pub headers: Option<Vec<String>>,
    /// Priority-ordered body field dot-paths; absent means no body scoring.
    pub body: Option<Vec<String>>,
    pub response_status: StatusFilter,
}

impl Default for MatchDirectives {
    fn default() -> Self {
        Self {
            version: VersionMatch::Exact,
            language: LanguageMatch::Exact,
            platform: PlatformMatch::Exact,
            environment: EnvironmentMatch::Exact,
            query_params: None,
            headers: None,
            body: None,
            response_status: StatusFilter::Success,
        }
    }
}

/// A compiled endpoint matching rule.
#[derive(Debug)]
pub struct MatchRule {
    pub id: i64,
    pub http_method: String,
    pub pattern: Regex,
    pub priority: i64,
    pub rule_type: RuleType,
    pub directives: MatchDirectives,
}

impl MatchRule {
    pub fn matches(&self, method: &str, path: &str) -> bool {
        (self.http_method == "*" || self.http_method.eq_ignore_ascii_case(method))
            && self.pattern.is_match(path)
    }
}

/// Compile a glob endpoint pattern: `:name` → `[^/]+`, `*` → `.*`,
/// everything else escaped, anchored, case-insensitive.
pub fn compile_glob(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push_str("(?i)^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            ':' => {
                // consume the parameter name
                while matches!(chars.peek(), Some(n) if n.is_ascii_alphanumeric() || *n == '_') {
                    chars.next();
                }
                out.push_str("[^/]+");
            }
            '*' => out.push_str(".*"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out)
}

/// Compile a rule's pattern per its `regex` flag.
pub fn compile_endpoint_pattern(pattern: &str, is_regex: bool) -> Result<Regex, regex::Error> {
    if is_regex {
        Regex::new(&format!("(?i){pattern}"))
    } else {
        compile_glob(pattern)
    }
}

fn parse_status_filter(raw: &str) -> StatusFilter {
    match raw {
        "2xx" | "" => StatusFilter::Success,
        "error" => StatusFilter::Error,
        other => match other.parse::<u16>() {
            Ok(code) => StatusFilter::Code(code),
            Err(_) => {
                tracing::warn!("Invalid match_response_status '{}', using 2xx", other);
                StatusFilter::Success
            }
        },
    }
}

fn parse_string_list(raw: &Option<String>) -> Option<Vec<String>> {
    let raw = raw.as_deref()?.trim();
    if raw.is_empty() {
        return None;
    }
    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(list) if list.is_empty() => None,
        Ok(list) => Some(list),
        Err(e) => {
            tracing::warn!("Invalid JSON list in matching rule ('{}'): {}", raw, e);
            None
        }
    }
}

/// Compile a raw row, or `None` when the pattern is invalid.
pub fn compile_rule(row: &MatchingRuleRow) -> Option<MatchRule> {
    let pattern = match compile_endpoint_pattern(&row.endpoint_pattern, row.regex) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(
                "Skipping matching rule {}: invalid pattern '{}': {}",
                row.id,
                row.endpoint_pattern,
                e
            );
            return None;
        }
    };
    let rule_type = match row.rule_type.as_str() {
        "replay" => RuleType::Replay,
        "recording" => RuleType::Recording,
        _ => RuleType::Both,
    };
    let environment = match row.match_environment.as_str() {
        "exact" | "" => EnvironmentMatch::Exact,
        literal => EnvironmentMatch::Literal(literal.to_ascii_lowercase()),
    };
    Some(MatchRule {
        id: row.id,
        http_method: row.http_method.to_ascii_uppercase(),
        pattern,
        priority: row.priority,
        rule_type,
        directives: MatchDirectives {
            version: if row.match_version == 0 { VersionMatch::Closest } else { VersionMatch::Exact },
            language: if row.match_language == 0 { LanguageMatch::Fallback } else { LanguageMatch::Exact },
            platform: if row.match_platform == 0 { PlatformMatch::Any } else { PlatformMatch::Exact },
            environment,
            query_params: parse_string_list(&row.match_query_params),
            headers: parse_string_list(&row.match_headers),
            body: parse_string_list(&row.match_body),
            response_status: parse_status_filter(&row.match_response_status),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_param_and_star() {
        let re = compile_glob("/v1/users/:id/orders/*").unwrap();
        assert!(re.is_match("/v1/users/42/orders/recent"));
        assert!(re.is_match("/V1/USERS/abc/orders/"));
        assert!(!re.is_match("/v1/users/42/41/orders/x"));
        assert!(!re.is_match("/v1/users//orders/x"));
    }

    #[test]
    fn test_glob_escapes_regex_chars() {
        let re = compile_glob("/v1/search.json").unwrap();
        assert!(re.is_match("/v1/search.json"));
        assert!(!re.is_match("/v1/searchXjson"));
    }

    #[test]
    fn test_regex_flag_uses_pattern_verbatim() {
        let re = compile_endpoint_pattern(r"^/v[12]/profile$", true).unwrap();
        assert!(re.is_match("/v1/profile"));
        assert!(re.is_match("/V2/PROFILE"));
        assert!(!re.is_match("/v3/profile"));
    }

    #[test]
    fn test_compile_rule_defaults_and_lists() {
        let row = MatchingRuleRow {
            id: 1,
            http_method: "post".into(),
            endpoint_pattern: "/v1/profile".into(),
            match_version: 0,
            match_query_params: Some(r#"["id"]"#.into()),
            match_response_status: "404".into(),
            ..Default::default()
        };
        let rule = compile_rule(&row).unwrap();
        assert!(rule.matches("POST", "/v1/profile"));
        assert!(!rule.matches("GET", "/v1/profile"));
        assert_eq!(rule.directives.version, VersionMatch::Closest);
        assert_eq!(rule.directives.query_params.as_deref(), Some(&["id".to_string()][..]));
        assert_eq!(rule.directives.response_status, StatusFilter::Code(404));
    }

    #[test]
    fn test_invalid_pattern_is_skipped() {
        let row = MatchingRuleRow {
            endpoint_pattern: "(".into(),
            regex: true,
            ..Default::default()
        };
        assert!(compile_rule(&row).is_none());
    }
}
