//! Candidate scoring: query parameters, headers, and body fields
//!
//! Query parameters have two modes. Without a `match_query_params` list,
//! normalized equality is required (order- and case-insensitive). With a
//! list, the listed keys must match and the remaining keys contribute a
//! preference score. Body fields never filter; they only reorder.

use crate::context::Headers;

/// Normalized query form: sorted `(lowercase key, lowercase value)` pairs.
pub fn normalize_query(pairs: &[(String, String)]) -> Vec<(String, String)> {
    let mut normalized: Vec<(String, String)> = pairs
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.to_ascii_lowercase()))
        .collect();
    normalized.sort();
    normalized
}

/// Order- and case-insensitive equality of two query param sets.
pub fn query_params_equal(a: &[(String, String)], b: &[(String, String)]) -> bool {
    normalize_query(a) == normalize_query(b)
}

fn value_for<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

/// Required-key check: every listed key must carry the same value (case-
/// insensitively) on both sides. A key absent from both sides is vacuously
/// equal.
pub fn required_params_match(
    required: &[String],
    incoming: &[(String, String)],
    recorded: &[(String, String)],
) -> bool {
    required.iter().all(|key| {
        match (value_for(incoming, key), value_for(recorded, key)) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            (None, None) => true,
            _ => false,
        }
    })
}

/// Preference score over the keys *not* in the required list: +2 when the
/// recorded value matches the incoming one, +1 when the key is present with
/// a different value.
pub fn optional_params_score(
    required: &[String],
    incoming: &[(String, String)],
    recorded: &[(String, String)],
) -> i64 {
    let mut score = 0;
    for (key, value) in incoming {
        if required.iter().any(|r| r.eq_ignore_ascii_case(key)) {
            continue;
        }
        match value_for(recorded, key) {
            Some(rv) if rv.eq_ignore_ascii_case(value) => score += 2,
            Some(_) => score += 1,
            None => {}
        }
    }
    score
}

/// Header match: every listed header must be equal, case-insensitively in
/// value, between the incoming request and the recorded one.
pub fn headers_match(required: &[String], incoming: &Headers, recorded: &Headers) -> bool {
    required.iter().all(|name| {
        match (incoming.get(name), recorded.get(name)) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            (None, None) => true,
            _ => false,
        }
    })
}

/// Look up a dot-path (`a.b.0.c`) in a JSON value. Numeric segments index
/// arrays.
pub fn json_at_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Body preference for one candidate against the priority-ordered field
/// list. For an N-element list, the field at index `i` weighs `N - i`.
///
/// Returns `(best_index, total_weight)`: the lowest matching index (the
/// dominant criterion — `usize::MAX` when nothing matched) and the summed
/// weight of all matches.
pub fn body_score(
    fields: &[String],
    incoming: Option<&serde_json::Value>,
    recorded: Option<&serde_json::Value>,
) -> (usize, i64) {
    let (Some(incoming), Some(recorded)) = (incoming, recorded) else {
        return (usize::MAX, 0);
    };
    let n = fields.len() as i64;
    let mut best_index = usize::MAX;
    let mut total_weight = 0;
    for (i, field) in fields.iter().enumerate() {
        let a = json_at_path(incoming, field);
        let b = json_at_path(recorded, field);
        if let (Some(a), Some(b)) = (a, b) {
            if a == b {
                if i < best_index {
                    best_index = i;
                }
                total_weight += n - i as i64;
            }
        }
    }
    (best_index, total_weight)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_normalized_equality_order_and_case_insensitive() {
        let a = pairs(&[("A", "X"), ("b", "Y")]);
        let b = pairs(&[("b", "y"), ("a", "x")]);
        assert!(query_params_equal(&a, &b));
        let c = pairs(&[("a", "x")]);
        assert!(!query_params_equal(&a, &c));
    }

    #[test]
    fn test_empty_value_round_trips() {
        // `?key` with no value must compare equal to `{key: ""}`
        let a = pairs(&[("key", "")]);
        let b = pairs(&[("KEY", "")]);
        assert!(query_params_equal(&a, &b));
    }

    #[test]
    fn test_required_params() {
        let required = vec!["id".to_string()];
        let incoming = pairs(&[("id", "42"), ("page", "1")]);
        assert!(required_params_match(&required, &incoming, &pairs(&[("ID", "42")])));
        assert!(!required_params_match(&required, &incoming, &pairs(&[("id", "43")])));
        assert!(!required_params_match(&required, &incoming, &pairs(&[("page", "1")])));
        // absent from both sides is vacuously equal
        assert!(required_params_match(&required, &pairs(&[]), &pairs(&[])));
    }

    #[test]
    fn test_optional_score() {
        let required = vec!["id".to_string()];
        let incoming = pairs(&[("id", "42"), ("page", "1"), ("sort", "asc")]);
        // page matches (+2), sort differs (+1), id is required (ignored)
        let recorded = pairs(&[("id", "42"), ("page", "1"), ("sort", "desc")]);
        assert_eq!(optional_params_score(&required, &incoming, &recorded), 3);
        // no optional keys present
        assert_eq!(optional_params_score(&required, &incoming, &pairs(&[("id", "42")])), 0);
    }

    #[test]
    fn test_headers_match_ci() {
        let mut incoming = Headers::new();
        incoming.set("X-Channel", "Mobile");
        let mut recorded = Headers::new();
        recorded.set("x-channel", "mobile");
        let required = vec!["x-channel".to_string()];
        assert!(headers_match(&required, &incoming, &recorded));
        recorded.set("x-channel", "web");
        assert!(!headers_match(&required, &incoming, &recorded));
    }

    #[test]
    fn test_json_at_path() {
        let v = json!({"a": {"b": [{"c": 1}]}});
        assert_eq!(json_at_path(&v, "a.b.0.c"), Some(&json!(1)));
        assert_eq!(json_at_path(&v, "a.b.1.c"), None);
        assert_eq!(json_at_path(&v, "a.x"), None);
    }

    #[test]
    fn test_body_score_priority_dominates() {
        let fields = vec!["id".to_string(), "type".to_string(), "name".to_string()];
        let incoming = json!({"id": 1, "type": "a", "name": "n"});

        // matches the highest-priority field only
        let top = json!({"id": 1, "type": "x", "name": "x"});
        // matches the two lower-priority fields
        let lower = json!({"id": 2, "type": "a", "name": "n"});

        let (top_idx, top_weight) = body_score(&fields, Some(&incoming), Some(&top));
        let (low_idx, low_weight) = body_score(&fields, Some(&incoming), Some(&lower));
        assert_eq!(top_idx, 0);
        assert_eq!(top_weight, 3);
        assert_eq!(low_idx, 1);
        assert_eq!(low_weight, 3);
        // lowest index wins even though the weights tie
        assert!(top_idx < low_idx);
    }

    #[test]
    fn test_body_score_no_match_is_not_exclusion() {
        let fields = vec!["id".to_string()];
        let (idx, weight) = body_score(&fields, Some(&json!({"id": 1})), Some(&json!({"id": 2})));
        assert_eq!(idx, usize::MAX);
        assert_eq!(weight, 0);
    }
}
