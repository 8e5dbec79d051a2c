//! HTTP/1.1 parsing and serialization over raw byte streams
//!
//! The interceptor reads cleartext HTTP out of decrypted TLS streams (and the
//! plaintext listener reads the same format off TCP), so parsing works from a
//! rolling byte buffer: request heads via httparse, bodies by Content-Length
//! or chunked transfer coding (terminating at `0\r\n\r\n`). Any bytes that
//! arrive beyond one request stay in the buffer for the next call.

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::context::{Headers, ResponseContext};
use crate::util::split_authority;

/// Cap on the request head (request line + headers).
const MAX_HEAD_BYTES: usize = 64 * 1024;
/// Cap on a request body.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const MAX_HEADERS: usize = 64;

/// Errors from the byte-stream parser. `Malformed` maps to a 400 at the
/// connection level, the size errors to 413-style protocol failures.
#[derive(Debug)]
pub enum Http1Error {
    Malformed(String),
    TooLarge(&'static str),
    Io(std::io::Error),
}

impl std::fmt::Display for Http1Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "malformed request: {msg}"),
            Self::TooLarge(what) => write!(f, "{what} too large"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl std::error::Error for Http1Error {}

impl From<std::io::Error> for Http1Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// One parsed request, target still in request-line form.
#[derive(Debug)]
pub struct ParsedRequest {
    pub method: String,
    pub target: String,
    pub headers: Headers,
    pub body: bytes::Bytes,
}

/// Read one request from the stream. `Ok(None)` on clean EOF before any
/// bytes of a new request.
pub async fn read_request<S>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<Option<ParsedRequest>, Http1Error>
where
    S: AsyncRead + Unpin,
{
    let head = loop {
        let mut header_storage = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut header_storage);
        match request.parse(buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let method = request
                    .method
                    .ok_or_else(|| Http1Error::Malformed("missing method".into()))?
                    .to_string();
                let target = request
                    .path
                    .ok_or_else(|| Http1Error::Malformed("missing request target".into()))?
                    .to_string();
                let mut headers = Headers::new();
                for header in request.headers.iter() {
                    let value = std::str::from_utf8(header.value)
                        .map_err(|_| Http1Error::Malformed("non-UTF8 header value".into()))?;
                    headers.append(header.name, value.trim().to_string());
                }
                buf.advance(head_len);
                break (method, target, headers);
            }
            Ok(httparse::Status::Partial) => {
                if buf.len() > MAX_HEAD_BYTES {
                    return Err(Http1Error::TooLarge("request head"));
                }
                let n = stream.read_buf(buf).await?;
                if n == 0 {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    return Err(Http1Error::Malformed("unexpected eof in request head".into()));
                }
            }
            Err(e) => return Err(Http1Error::Malformed(e.to_string())),
        }
    };

    let (method, target, headers) = head;

    let body = if is_chunked(&headers) {
        read_chunked_body(stream, buf).await?
    } else if let Some(raw_len) = headers.get("content-length") {
        let len: usize = raw_len
            .parse()
            .map_err(|_| Http1Error::Malformed("invalid content-length".into()))?;
        if len > MAX_BODY_BYTES {
            return Err(Http1Error::TooLarge("request body"));
        }
        read_exact_body(stream, buf, len).await?
    } else {
        bytes::Bytes::new()
    };

    Ok(Some(ParsedRequest { method, target, headers, body }))
}

fn is_chunked(headers: &Headers) -> bool {
    headers
        .get("transfer-encoding")
        .map(|v| v.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false)
}

async fn fill<S>(stream: &mut S, buf: &mut BytesMut, needed: usize) -> Result<(), Http1Error>
where
    S: AsyncRead + Unpin,
{
    while buf.len() < needed {
        let n = stream.read_buf(buf).await?;
        if n == 0 {
            return Err(Http1Error::Malformed("unexpected eof in body".into()));
        }
    }
    Ok(())
}

async fn read_exact_body<S>(
    stream: &mut S,
    buf: &mut BytesMut,
    len: usize,
) -> Result<bytes::Bytes, Http1Error>
where
    S: AsyncRead + Unpin,
{
    fill(stream, buf, len).await?;
    Ok(buf.split_to(len).freeze())
}

/// Chunked body: `<hex-size>[;ext]\r\n<chunk>\r\n ... 0\r\n\r\n`. Trailers
/// are not supported; the stream must terminate at exactly `0\r\n\r\n`.
async fn read_chunked_body<S>(
    stream: &mut S,
    buf: &mut BytesMut,
) -> Result<bytes::Bytes, Http1Error>
where
    S: AsyncRead + Unpin,
{
    let mut body = BytesMut::new();
    loop {
        let line_end = loop {
            if let Some(pos) = find_crlf(buf) {
                break pos;
            }
            let n = stream.read_buf(buf).await?;
            if n == 0 {
                return Err(Http1Error::Malformed("unexpected eof in chunk size".into()));
            }
        };
        let size_line = std::str::from_utf8(&buf[..line_end])
            .map_err(|_| Http1Error::Malformed("non-UTF8 chunk size".into()))?;
        let size_text = size_line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_text, 16)
            .map_err(|_| Http1Error::Malformed(format!("invalid chunk size '{size_text}'")))?;
        buf.advance(line_end + 2);

        if size == 0 {
            // the terminating CRLF of `0\r\n\r\n`
            fill(stream, buf, 2).await?;
            if &buf[..2] != b"\r\n" {
                return Err(Http1Error::Malformed("missing chunked terminator".into()));
            }
            buf.advance(2);
            return Ok(body.freeze());
        }

        if body.len() + size > MAX_BODY_BYTES {
            return Err(Http1Error::TooLarge("request body"));
        }
        fill(stream, buf, size + 2).await?;
        body.extend_from_slice(&buf[..size]);
        if &buf[size..size + 2] != b"\r\n" {
            return Err(Http1Error::Malformed("missing CRLF after chunk".into()));
        }
        buf.advance(size + 2);
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Split a request target into `(path, query pairs)`. `?key` and `?key=`
/// both become `(key, "")`.
pub fn parse_path_and_query(target: &str) -> (String, Vec<(String, String)>) {
    match target.split_once('?') {
        Some((path, query)) => (path.to_string(), parse_query(query)),
        None => (target.to_string(), Vec::new()),
    }
}

pub fn parse_query(raw: &str) -> Vec<(String, String)> {
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (part.to_string(), String::new()),
        })
        .collect()
}

/// Resolve the request target into `(scheme, host, port, path, query)`.
///
/// Absolute-form carries its own scheme and authority; origin-form falls
/// back to the `Host` header, then to the connection's target (the CONNECT
/// authority after interception), synthesizing `Host` when absent.
pub fn resolve_target(
    target: &str,
    headers: &mut Headers,
    default_scheme: &str,
    connection_host: Option<(&str, u16)>,
) -> Result<(String, String, u16, String, Vec<(String, String)>), Http1Error> {
    if let Some(rest) = target
        .strip_prefix("http://")
        .map(|r| ("http", r))
        .or_else(|| target.strip_prefix("https://").map(|r| ("https", r)))
    {
        let (scheme, rest) = rest;
        let (authority, path_query) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(Http1Error::Malformed("empty authority in absolute-form".into()));
        }
        let default_port = if scheme == "https" { 443 } else { 80 };
        let (host, port) = split_authority(authority, default_port);
        let (path, query) = parse_path_and_query(path_query);
        if !headers.contains("host") {
            headers.set("host", authority.to_string());
        }
        return Ok((scheme.to_string(), host, port, path, query));
    }

    let default_port = if default_scheme == "https" { 443 } else { 80 };
    let (host, port) = match headers.get("host") {
        Some(value) => split_authority(value, default_port),
        None => match connection_host {
            Some((host, port)) => {
                // synthesize Host from the connection target
                let synthesized = if port == default_port {
                    host.to_string()
                } else {
                    format!("{host}:{port}")
                };
                headers.set("host", synthesized);
                (host.to_string(), port)
            }
            None => return Err(Http1Error::Malformed("origin-form request without Host".into())),
        },
    };
    let (path, query) = parse_path_and_query(target);
    Ok((default_scheme.to_string(), host, port, path, query))
}

/// Serialize a response context to the wire with `Connection: close`.
/// Content-Length is always recomputed from the body bytes.
pub async fn write_response<S>(stream: &mut S, resp: &ResponseContext) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let body = resp.body.to_bytes();
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        resp.status,
        reason_phrase(resp.status)
    );
    for (name, value) in resp.headers.iter() {
        if name == "content-length" || name == "connection" || name == "transfer-encoding" {
            continue;
        }
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(&format!("Content-Length: {}\r\n", body.len()));
    head.push_str("Connection: close\r\n\r\n");

    stream.write_all(head.as_bytes()).await?;
    if !body.is_empty() {
        stream.write_all(&body).await?;
    }
    stream.flush().await
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Body, ResponseSource};
    use std::io::Cursor;

    async fn parse(input: &[u8]) -> Result<Option<ParsedRequest>, Http1Error> {
        let mut stream = Cursor::new(input.to_vec());
        let mut buf = BytesMut::new();
        read_request(&mut stream, &mut buf).await
    }

    #[tokio::test]
    async fn test_parse_get_with_headers() {
        let req = parse(b"GET /v1/profile?a=1 HTTP/1.1\r\nHost: api.example.com\r\nX-App: dpx\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.target, "/v1/profile?a=1");
        assert_eq!(req.headers.get("host"), Some("api.example.com"));
        assert_eq!(req.headers.get("x-app"), Some("dpx"));
        assert!(req.body.is_empty());
    }

    #[tokio::test]
    async fn test_parse_content_length_body() {
        let req = parse(b"POST /v1 HTTP/1.1\r\nHost: h\r\nContent-Length: 7\r\n\r\n{\"a\":1}")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&req.body[..], b"{\"a\":1}");
    }

    #[tokio::test]
    async fn test_zero_content_length_post() {
        let req = parse(b"POST /v1 HTTP/1.1\r\nHost: h\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap()
            .unwrap();
        assert!(req.body.is_empty());
    }

    #[tokio::test]
    async fn test_parse_chunked_body() {
        let req = parse(
            b"POST /v1 HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n",
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&req.body[..], b"Wikipedia");
    }

    #[tokio::test]
    async fn test_chunked_requires_exact_terminator() {
        let result = parse(
            b"POST /v1 HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n1\r\nx\r\n0\r\nX",
        )
        .await;
        assert!(matches!(result, Err(Http1Error::Malformed(_))));
    }

    #[tokio::test]
    async fn test_clean_eof_returns_none() {
        assert!(parse(b"").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_head_is_malformed() {
        let result = parse(b"GET /v1 HTTP/1.1\r\nHost:").await;
        assert!(matches!(result, Err(Http1Error::Malformed(_))));
    }

    #[tokio::test]
    async fn test_two_requests_in_one_buffer() {
        let input = b"GET /a HTTP/1.1\r\nHost: h\r\n\r\nGET /b HTTP/1.1\r\nHost: h\r\n\r\n";
        let mut stream = Cursor::new(input.to_vec());
        let mut buf = BytesMut::new();
        let first = read_request(&mut stream, &mut buf).await.unwrap().unwrap();
        let second = read_request(&mut stream, &mut buf).await.unwrap().unwrap();
        assert_eq!(first.target, "/a");
        assert_eq!(second.target, "/b");
        assert!(read_request(&mut stream, &mut buf).await.unwrap().is_none());
    }

    #[test]
    fn test_parse_query_empty_values() {
        assert_eq!(parse_query("key"), vec![("key".to_string(), String::new())]);
        assert_eq!(parse_query("key="), vec![("key".to_string(), String::new())]);
        assert_eq!(
            parse_query("a=1&b"),
            vec![("a".to_string(), "1".to_string()), ("b".to_string(), String::new())]
        );
        assert!(parse_query("").is_empty());
    }

    #[test]
    fn test_resolve_absolute_form() {
        let mut headers = Headers::new();
        let (scheme, host, port, path, query) =
            resolve_target("http://api.example.com:8080/v1?a=1", &mut headers, "http", None)
                .unwrap();
        assert_eq!(scheme, "http");
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 8080);
        assert_eq!(path, "/v1");
        assert_eq!(query, vec![("a".to_string(), "1".to_string())]);
        assert_eq!(headers.get("host"), Some("api.example.com:8080"));
    }

    #[test]
    fn test_resolve_origin_form_with_host_header() {
        let mut headers = Headers::new();
        headers.set("host", "api.example.com");
        let (scheme, host, port, path, _) =
            resolve_target("/v1/profile", &mut headers, "https", None).unwrap();
        assert_eq!(scheme, "https");
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 443);
        assert_eq!(path, "/v1/profile");
    }

    #[test]
    fn test_resolve_synthesizes_host_from_connection() {
        let mut headers = Headers::new();
        let (_, host, port, _, _) =
            resolve_target("/v1", &mut headers, "https", Some(("api.example.com", 443))).unwrap();
        assert_eq!(host, "api.example.com");
        assert_eq!(port, 443);
        assert_eq!(headers.get("host"), Some("api.example.com"));

        let mut headers = Headers::new();
        resolve_target("/v1", &mut headers, "https", Some(("api.example.com", 8443))).unwrap();
        assert_eq!(headers.get("host"), Some("api.example.com:8443"));
    }

    #[tokio::test]
    async fn test_write_response_shape() {
        let mut resp = ResponseContext::new(200, "r1".into(), ResponseSource::Upstream);
        resp.headers.set("content-type", "application/json");
        resp.body = Body::Text("{\"ok\":true}".into());

        let mut out = Vec::new();
        write_response(&mut out, &resp).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("content-type: application/json\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.contains("Connection: close\r\n\r\n"));
        assert!(text.ends_with("{\"ok\":true}"));
    }
}
