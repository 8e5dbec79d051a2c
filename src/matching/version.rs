//! App version parsing and distance
//!
//! Versions compare as `(major, minor, patch)` triples; missing parts parse
//! as 0 (`"1.2"` → `(1, 2, 0)`). Distance is the weighted numeric gap used
//! by the `version_closest` strategy.

/// Parse a dotted version. Each part takes its leading digits; a part with
/// none (or a missing part) is 0.
pub fn parse_version(raw: &str) -> (i64, i64, i64) {
    let mut parts = raw.split('.');
    let mut next = || -> i64 {
        parts
            .next()
            .map(|p| {
                let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().unwrap_or(0)
            })
            .unwrap_or(0)
    };
    let major = next();
    let minor = next();
    let patch = next();
    (major, minor, patch)
}

/// Weighted distance: `|Δmajor|·10000 + |Δminor|·100 + |Δpatch|`.
pub fn version_distance(a: &str, b: &str) -> i64 {
    let (am, ai, ap) = parse_version(a);
    let (bm, bi, bp) = parse_version(b);
    (am - bm).abs() * 10_000 + (ai - bi).abs() * 100 + (ap - bp).abs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_and_partial() {
        assert_eq!(parse_version("1.2.3"), (1, 2, 3));
        assert_eq!(parse_version("1.2"), (1, 2, 0));
        assert_eq!(parse_version("2"), (2, 0, 0));
        assert_eq!(parse_version(""), (0, 0, 0));
        assert_eq!(parse_version("1.2.3-beta"), (1, 2, 3));
        assert_eq!(parse_version("x.y"), (0, 0, 0));
    }

    #[test]
    fn test_distance_weights() {
        assert_eq!(version_distance("1.2.3", "1.2.3"), 0);
        assert_eq!(version_distance("1.2.3", "1.2.5"), 2);
        assert_eq!(version_distance("1.2.3", "1.3.3"), 100);
        assert_eq!(version_distance("1.2.3", "2.2.3"), 10_000);
        assert_eq!(version_distance("2.0.0", "1.9.9"), 10_909);
    }

    #[test]
    fn test_distance_is_symmetric() {
        assert_eq!(version_distance("1.2.3", "1.2.5"), version_distance("1.2.5", "1.2.3"));
    }
}
