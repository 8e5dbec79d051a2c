//! Cookie formatting and parsing helpers
//!
//! `DPSESSION` has an exact wire format per domain:
//! `DPSESSION=<uuid>; Domain=<d>; Path=/; [Secure; ]HttpOnly; SameSite=None`

/// Cookie name of the proxy's opaque session identifier.
pub const DPSESSION: &str = "DPSESSION";

/// Format the DPSESSION Set-Cookie value for one domain.
pub fn dpsession_cookie(value: &str, domain: &str, secure: bool) -> String {
    if secure {
        format!("{DPSESSION}={value}; Domain={domain}; Path=/; Secure; HttpOnly; SameSite=None")
    } else {
        format!("{DPSESSION}={value}; Domain={domain}; Path=/; HttpOnly; SameSite=None")
    }
}

/// Name and value of a `Set-Cookie` header value (the first `name=value`
/// pair, attributes ignored).
pub fn parse_set_cookie(raw: &str) -> Option<(String, String)> {
    let first = raw.split(';').next()?.trim();
    let (name, value) = first.split_once('=')?;
    Some((name.trim().to_string(), value.trim().to_string()))
}

/// Rewrite the value of a `Set-Cookie` header, keeping its attributes.
pub fn replace_set_cookie_value(raw: &str, new_value: &str) -> String {
    match raw.split_once(';') {
        Some((first, rest)) => match first.split_once('=') {
            Some((name, _)) => format!("{}={};{}", name.trim(), new_value, rest),
            None => raw.to_string(),
        },
        None => match raw.split_once('=') {
            Some((name, _)) => format!("{}={}", name.trim(), new_value),
            None => raw.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dpsession_format_secure() {
        let cookie = dpsession_cookie("abc-123", "api.example.com", true);
        assert_eq!(
            cookie,
            "DPSESSION=abc-123; Domain=api.example.com; Path=/; Secure; HttpOnly; SameSite=None"
        );
    }

    #[test]
    fn test_dpsession_format_insecure() {
        let cookie = dpsession_cookie("abc-123", "dev.example.com", false);
        assert_eq!(
            cookie,
            "DPSESSION=abc-123; Domain=dev.example.com; Path=/; HttpOnly; SameSite=None"
        );
    }

    #[test]
    fn test_parse_set_cookie() {
        let (name, value) =
            parse_set_cookie("JSESSIONID=xyz789; Path=/; HttpOnly").unwrap();
        assert_eq!(name, "JSESSIONID");
        assert_eq!(value, "xyz789");
        assert!(parse_set_cookie("garbage").is_none());
    }

    #[test]
    fn test_replace_set_cookie_value_keeps_attributes() {
        let rewritten =
            replace_set_cookie_value("JSESSIONID=old; Path=/; HttpOnly", "new");
        assert_eq!(rewritten, "JSESSIONID=new; Path=/; HttpOnly");
        assert_eq!(replace_set_cookie_value("A=b", "c"), "A=c");
    }
}
