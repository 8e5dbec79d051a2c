//! Upstream forwarder
//!
//! Issues upstream HTTP(S) requests for the passthrough and recording paths:
//! timeouts, constant-delay retries, a redirect cap, optional insecure TLS
//! for self-signed upstream endpoints, and hop-by-hop header stripping in
//! both directions. Compressed bodies (gzip/deflate/br) are decompressed by
//! the client before they reach the response context.

use std::time::Instant;

use anyhow::{Context, Result};
use bytes::Bytes;

use crate::config::ForwarderConfig;
use crate::context::{Body, Headers, RequestContext, ResponseContext, ResponseSource};

/// Request headers never forwarded upstream.
const REQUEST_SKIP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-encoding",
    "content-length",
    "upgrade",
    "host",
];

/// Response headers never returned to the client. `content-encoding` and
/// `content-length` go because the body is stored decompressed.
const RESPONSE_SKIP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "content-encoding",
    "content-length",
    "upgrade",
];

pub struct Forwarder {
    client: reqwest::Client,
    cfg: ForwarderConfig,
}

/// Compose the upstream URL: `<scheme>://<host><path>[?<query>]`, with the
/// port only when it is not the scheme default.
pub fn compose_target_url(scheme: &str, host: &str, port: u16, path: &str, query: &str) -> String {
    let default_port = if scheme == "https" { 443 } else { 80 };
    let authority = if port == default_port || port == 0 {
        host.to_string()
    } else {
        format!("{host}:{port}")
    };
    if query.is_empty() {
        format!("{scheme}://{authority}{path}")
    } else {
        format!("{scheme}://{authority}{path}?{query}")
    }
}

impl Forwarder {
    pub fn new(cfg: &ForwarderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(cfg.connect_timeout)
            .timeout(cfg.total_timeout)
            .redirect(reqwest::redirect::Policy::limited(cfg.max_redirects))
            .danger_accept_invalid_certs(cfg.insecure_tls)
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .build()
            .context("failed to build upstream HTTP client")?;
        Ok(Self { client, cfg: cfg.clone() })
    }

    /// Forward the current form of the request to `target_url`.
    ///
    /// Never returns an Err for upstream problems: unrecoverable failures
    /// become a synthesized error response (`502` for refused/DNS, `504` for
    /// timeout) with `latency` set to the elapsed time.
    pub async fn forward(&self, ctx: &RequestContext, target_url: &str) -> ResponseContext {
        let start = Instant::now();
        let mut attempt = 0u32;

        loop {
            match self.send_once(ctx, target_url).await {
                Ok(mut resp) => {
                    resp.latency_ms = start.elapsed().as_millis() as u64;
                    resp.target_url = Some(target_url.to_string());
                    return resp;
                }
                Err(err) => {
                    let timed_out = err.is_timeout();
                    let retryable = err.is_connect() || (timed_out && self.cfg.retry_on_timeout);
                    if retryable && attempt < self.cfg.retries {
                        attempt += 1;
                        tracing::debug!(
                            "Upstream attempt {}/{} for {} failed: {}",
                            attempt,
                            self.cfg.retries,
                            target_url,
                            err
                        );
                        tokio::time::sleep(self.cfg.retry_delay).await;
                        continue;
                    }

                    let (status, message) = if timed_out {
                        (504u16, "upstream timeout")
                    } else {
                        (502u16, "upstream unreachable")
                    };
                    tracing::warn!("Upstream request to {} failed: {}", target_url, err);
                    let mut resp =
                        ResponseContext::error(status, message, ctx.metadata.request_id.clone());
                    resp.latency_ms = start.elapsed().as_millis() as u64;
                    resp.target_url = Some(target_url.to_string());
                    return resp;
                }
            }
        }
    }

    async fn send_once(
        &self,
        ctx: &RequestContext,
        target_url: &str,
    ) -> std::result::Result<ResponseContext, reqwest::Error> {
        let method = reqwest::Method::from_bytes(ctx.current.method.as_bytes())
            .unwrap_or(reqwest::Method::GET);

        let mut request = self.client.request(method, target_url);
        for (name, value) in ctx.current.headers.iter() {
            if REQUEST_SKIP.contains(&name) || name.starts_with("proxy-") {
                continue;
            }
            request = request.header(name, value);
        }
        if !ctx.current.body.is_empty() {
            request = request.body(ctx.current.body.clone());
        }

        let response = request.send().await?;
        let status = response.status().as_u16();

        let mut headers = Headers::new();
        for (name, value) in response.headers() {
            let name = name.as_str();
            if RESPONSE_SKIP.contains(&name) {
                continue;
            }
            if let Ok(text) = value.to_str() {
                headers.append(name, text.to_string());
            }
        }

        let body_bytes: Bytes = response.bytes().await?;

        let mut resp = ResponseContext::new(
            status,
            ctx.metadata.request_id.clone(),
            ResponseSource::Upstream,
        );
        resp.headers = headers;
        resp.body = Body::from_bytes(body_bytes);
        Ok(resp)
    }
}
