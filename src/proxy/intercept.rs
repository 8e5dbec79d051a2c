//! HTTPS interceptor
//!
//! For monitored CONNECT targets: confirm the tunnel, upgrade the client
//! socket to TLS with a certificate minted for the host, parse HTTP/1.1 off
//! the decrypted stream, run the pipeline, and write the response back with
//! `Connection: close`. The `200 Connection Established` goes out before the
//! TLS upgrade so clients that send their ClientHello immediately after
//! CONNECT do not race; any such early bytes are replayed into the TLS layer.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use anyhow::{Context, Result};
use bytes::BytesMut;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use super::handler;
use super::http1::{self, Http1Error};
use super::server::ProxyServices;
use crate::context::{RequestContext, RequestForm};
use crate::util::now_millis;

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Serve one intercepted HTTPS connection.
pub async fn serve_mitm(
    mut client: TcpStream,
    leftover: BytesMut,
    host: String,
    port: u16,
    services: Arc<ProxyServices>,
) -> Result<()> {
    client
        .write_all(ESTABLISHED)
        .await
        .context("failed to confirm CONNECT before TLS upgrade")?;

    // A mint failure is fatal for this host's interception: the client has
    // already seen the 200, so tunneling is no longer an option.
    let tls_config = services
        .ca
        .server_config_for_host(&host)
        .await
        .with_context(|| format!("no certificate for {host}"))?;

    let acceptor = TlsAcceptor::from(tls_config);
    let prefixed = PrefixedStream::new(leftover, client);
    let tls = acceptor
        .accept(prefixed)
        .await
        .with_context(|| format!("TLS handshake with client failed for {host}"))?;

    serve_decrypted(tls, &host, port, services).await
}

/// Direct HTTPS listener path: read the ClientHello for its SNI, mint a
/// certificate for that name, then serve the decrypted stream the same way
/// the CONNECT path does.
pub async fn serve_direct_tls(stream: TcpStream, services: Arc<ProxyServices>) -> Result<()> {
    let acceptor = tokio_rustls::LazyConfigAcceptor::new(
        tokio_rustls::rustls::server::Acceptor::default(),
        stream,
    );
    let start = acceptor.await.context("TLS ClientHello read failed")?;
    let host = start
        .client_hello()
        .server_name()
        .map(str::to_string)
        .ok_or_else(|| anyhow::anyhow!("direct TLS connection without SNI"))?;
    let tls_config = services
        .ca
        .server_config_for_host(&host)
        .await
        .with_context(|| format!("no certificate for {host}"))?;
    let tls = start
        .into_stream(tls_config)
        .await
        .with_context(|| format!("TLS handshake with client failed for {host}"))?;

    serve_decrypted(tls, &host, 443, services).await
}

/// Parse requests off a decrypted stream sequentially and answer each with
/// `Connection: close`; the stream ends after the response is flushed.
async fn serve_decrypted<S>(
    mut tls: S,
    host: &str,
    port: u16,
    services: Arc<ProxyServices>,
) -> Result<()>
where
    S: tokio::io::AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = BytesMut::new();
    match http1::read_request(&mut tls, &mut buf).await {
        Ok(Some(parsed)) => {
            match build_context(parsed, host, port, None) {
                Ok(ctx) => {
                    let (_ctx, resp) = handler::process(&services, ctx).await;
                    if let Err(e) = http1::write_response(&mut tls, &resp).await {
                        tracing::debug!("Client write failed for {}: {}", host, e);
                    }
                }
                Err(e) => {
                    tracing::debug!("Bad intercepted request for {}: {}", host, e);
                    write_minimal_error(&mut tls, &e.to_string()).await;
                }
            }
        }
        Ok(None) => {}
        Err(e) => {
            tracing::debug!("Parse failure on intercepted stream for {}: {}", host, e);
            write_minimal_error(&mut tls, &e.to_string()).await;
        }
    }

    let _ = tls.shutdown().await;
    Ok(())
}

/// Parse errors and handler crashes on the TLS stream answer with a minimal
/// `502 {error, timestamp}` body.
async fn write_minimal_error<S>(stream: &mut S, message: &str)
where
    S: AsyncWrite + Unpin,
{
    let body = json!({"error": message, "timestamp": now_millis()}).to_string();
    let head = format!(
        "HTTP/1.1 502 Bad Gateway\r\nContent-Type: application/json; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    let _ = stream.write_all(head.as_bytes()).await;
    let _ = stream.write_all(body.as_bytes()).await;
    let _ = stream.flush().await;
}

/// Intercepted requests are origin-form; `Host` is synthesized from the
/// CONNECT target when absent.
fn build_context(
    parsed: http1::ParsedRequest,
    host: &str,
    port: u16,
    peer: Option<std::net::SocketAddr>,
) -> Result<RequestContext, Http1Error> {
    let mut headers = parsed.headers;
    let (scheme, host, port, path, query) =
        http1::resolve_target(&parsed.target, &mut headers, "https", Some((host, port)))?;
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
    Ok(RequestContext::new(form, peer, new_request_id()))
}

pub(super) fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A stream that serves buffered bytes before reading from the socket.
/// Bytes that arrived between the CONNECT head and the TLS upgrade land
/// here so the handshake sees them first.
pub struct PrefixedStream<S> {
    prefix: BytesMut,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: BytesMut, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_prefixed_stream_serves_prefix_first() {
        let inner = std::io::Cursor::new(b"world".to_vec());
        let mut prefix = BytesMut::new();
        prefix.extend_from_slice(b"hello ");
        let mut stream = PrefixedStream::new(prefix, inner);

        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "hello world");
    }

    #[tokio::test]
    async fn test_prefixed_stream_empty_prefix() {
        let inner = std::io::Cursor::new(b"data".to_vec());
        let mut stream = PrefixedStream::new(BytesMut::new(), inner);
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "data");
    }
}
