//! Proxy listener
//!
//! One raw TCP accept loop per listener. Each accepted connection gets its
//! own task; within a connection, requests are processed strictly in order.
//! The first parsed request decides the path: `CONNECT` goes to the
//! dispatcher (blind tunnel or MITM), anything else is handled as cleartext
//! proxy traffic — absolute-form or origin-form with a `Host` header.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::ca::CertificateAuthority;
use crate::config::Config;
use crate::context::{RequestContext, RequestForm, ResponseContext};
use crate::forward::Forwarder;
use crate::interceptors::InterceptorChain;
use crate::matching::MatchingEngine;
use crate::modes::{ModeDeps, ModeService};
use crate::sessions::SessionFabric;
use crate::stats::StatsAggregator;
use crate::store::Store;
use crate::traffic::TrafficConfig;
use crate::traffic_log::TrafficLogger;

use super::connect;
use super::handler;
use super::http1::{self, Http1Error};
use super::intercept;

/// Everything the request path needs, constructed once at startup and
/// injected (no module singletons).
pub struct ProxyServices {
    pub config: Config,
    pub store: Arc<Store>,
    pub traffic: Arc<TrafficConfig>,
    pub ca: Arc<CertificateAuthority>,
    pub forwarder: Arc<Forwarder>,
    pub matching: Arc<MatchingEngine>,
    pub sessions: Arc<SessionFabric>,
    pub modes: Arc<ModeService>,
    pub stats: Arc<StatsAggregator>,
    pub traffic_log: Arc<TrafficLogger>,
    pub chain: Arc<InterceptorChain>,
    pub mode_deps: ModeDeps,
}

/// Run the proxy listener until the shutdown signal fires.
pub async fn run_proxy(
    services: Arc<ProxyServices>,
    mut shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let addr = SocketAddr::new(services.config.host, services.config.proxy_port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind proxy listener on {addr}"))?;
    tracing::info!("Proxy listening on {}", addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                let services = services.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, services).await {
                        tracing::debug!("Connection from {} ended with error: {:#}", peer, e);
                    }
                });
            }
            _ = &mut shutdown_rx => {
                tracing::info!("Proxy listener shutting down");
                return Ok(());
            }
        }
    }
}

/// Optional direct HTTPS listener: clients connect straight over TLS (no
/// CONNECT) and the SNI names the host to impersonate.
pub async fn run_https(
    services: Arc<ProxyServices>,
    mut shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> Result<()> {
    let addr = SocketAddr::new(services.config.host, services.config.https_port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind HTTPS listener on {addr}"))?;
    tracing::info!("HTTPS listener on {}", addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                let services = services.clone();
                tokio::spawn(async move {
                    if let Err(e) = intercept::serve_direct_tls(stream, services).await {
                        tracing::debug!("HTTPS connection from {} ended with error: {:#}", peer, e);
                    }
                });
            }
            _ = &mut shutdown_rx => {
                tracing::info!("HTTPS listener shutting down");
                return Ok(());
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    services: Arc<ProxyServices>,
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(8 * 1024);

    loop {
        let parsed = match http1::read_request(&mut stream, &mut buf).await {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return Ok(()),
            Err(Http1Error::Io(_)) => return Ok(()),
            Err(e) => {
                // Protocol errors terminate this one client connection
                tracing::debug!("Malformed request from {}: {}", peer, e);
                let _ = stream
                    .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n")
                    .await;
                return Ok(());
            }
        };

        if parsed.method.eq_ignore_ascii_case("CONNECT") {
            let target = parsed.target.clone();
            // leftover bytes after the CONNECT head belong to the tunnel
            let leftover = std::mem::take(&mut buf);
            return connect::handle_connect(stream, leftover, &target, services).await;
        }

        let close_requested = parsed
            .headers
            .get("connection")
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false);

        let resp = match build_plaintext_context(parsed, peer) {
            Ok(ctx) => {
                let (_ctx, resp) = handler::process(&services, ctx).await;
                resp
            }
            Err(e) => {
                tracing::debug!("Unroutable request from {}: {}", peer, e);
                ResponseContext::error(400, "bad request", intercept::new_request_id())
            }
        };

        http1::write_response(&mut stream, &resp).await?;

        // every response advertises Connection: close; stop once the client
        // asked for it or simply wait for its FIN on the next read
        if close_requested {
            return Ok(());
        }
    }
}

/// Cleartext requests: absolute-form (`GET http://host/path`) or origin-form
/// plus `Host`.
fn build_plaintext_context(
    parsed: http1::ParsedRequest,
    peer: SocketAddr,
) -> Result<RequestContext, Http1Error> {
    let mut headers = parsed.headers;
    let (scheme, host, port, path, query) =
        http1::resolve_target(&parsed.target, &mut headers, "http", None)?;
    let form = RequestForm {
        method: parsed.method,
        scheme,
        host,
        port,
        path,
        query,
        headers,
        body: parsed.body,
    };
    Ok(RequestContext::new(
        form,
        Some(peer),
        intercept::new_request_id(),
    ))
}
