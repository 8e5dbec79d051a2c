//! CONNECT dispatch and blind tunneling
//!
//! Every `CONNECT host:port` is answered per the exact wire format, then
//! either relayed byte-for-byte (non-monitored hosts) or upgraded to an
//! intercepted TLS session (monitored hosts). The tunnel exclusively owns
//! both sockets; when either side closes, the other is shut down with it.

use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use super::intercept;
use super::server::ProxyServices;
use crate::util::split_authority;

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";

/// Dispatch one CONNECT. `leftover` holds any bytes the client sent after
/// the CONNECT head (an eager TLS ClientHello); they are replayed into
/// whichever path wins.
pub async fn handle_connect(
    mut client: TcpStream,
    leftover: BytesMut,
    target: &str,
    services: Arc<ProxyServices>,
) -> Result<()> {
    let (host, port) = split_authority(target, 443);

    if services.traffic.is_monitored_domain(&host) {
        tracing::debug!("CONNECT {} -> intercept", target);
        return intercept::serve_mitm(client, leftover, host, port, services).await;
    }

    tracing::debug!("CONNECT {} -> blind tunnel", target);
    blind_tunnel(&mut client, leftover, &host, port, &services).await
}

/// Full-duplex byte relay for non-monitored HTTPS. No TLS termination, no
/// records, no stats.
async fn blind_tunnel(
    client: &mut TcpStream,
    leftover: BytesMut,
    host: &str,
    port: u16,
    services: &ProxyServices,
) -> Result<()> {
    let connect = TcpStream::connect((host, port));
    let mut upstream = match tokio::time::timeout(services.config.forwarder.connect_timeout, connect).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            tracing::debug!("Tunnel connect to {}:{} failed: {}", host, port, e);
            let _ = client.write_all(BAD_GATEWAY).await;
            return Ok(());
        }
        Err(_) => {
            tracing::debug!("Tunnel connect to {}:{} timed out", host, port);
            let _ = client.write_all(BAD_GATEWAY).await;
            return Ok(());
        }
    };

    client
        .write_all(ESTABLISHED)
        .await
        .context("failed to confirm tunnel")?;

    if !leftover.is_empty() {
        upstream
            .write_all(&leftover)
            .await
            .context("failed to flush buffered client bytes")?;
    }

    // relay until either side closes; copy_bidirectional shuts the peer down
    match tokio::io::copy_bidirectional(client, &mut upstream).await {
        Ok((up, down)) => {
            tracing::debug!("Tunnel {}:{} closed ({}B up, {}B down)", host, port, up, down)
        }
        Err(e) => tracing::debug!("Tunnel {}:{} ended: {}", host, port, e),
    }
    Ok(())
}
