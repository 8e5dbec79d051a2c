// dproxy - intercepting record/replay proxy for mobile API traffic
//
// The proxy sits between mobile clients and their APIs in one of three
// modes: passthrough (observe), recording (capture request/response pairs
// into the record store), or replay (answer from the store without touching
// the upstream).
//
// Architecture:
// - Proxy listener: raw TCP accept loop; cleartext HTTP plus CONNECT
// - CONNECT dispatcher: blind tunnel for unmonitored hosts, TLS
//   interception with a dynamic CA for monitored ones
// - Interceptor chain: priority-ordered request/response enrichment
// - Mode service: passthrough / recording / replay dispatch
// - Matching engine: priority-ordered multi-strategy replay lookup
// - Session fabric: DPSESSION cookies and hashed upstream token tracking
// - Record store: SQLite via a pooled facade
// - Stats and traffic log: bounded queues draining to writer threads

mod ca;
mod cli;
mod config;
mod context;
mod forward;
mod interceptors;
mod matching;
mod modes;
mod proxy;
mod sessions;
mod stats;
mod store;
mod traffic;
mod traffic_log;
mod util;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::ca::CertificateAuthority;
use crate::config::Config;
use crate::forward::Forwarder;
use crate::interceptors::InterceptorChain;
use crate::matching::MatchingEngine;
use crate::modes::{ModeDeps, ModeService};
use crate::proxy::ProxyServices;
use crate::sessions::SessionFabric;
use crate::stats::StatsAggregator;
use crate::store::Store;
use crate::traffic::TrafficConfig;
use crate::traffic_log::TrafficLogger;

#[tokio::main]
async fn main() -> Result<()> {
    let config = cli::Cli::parse().apply(Config::from_env());

    // Precedence: RUST_LOG env var > config level > "info"
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("dproxy={}", config.log_level).into());

    // Diagnostic logs go to stdout and a daily-rotated file; the traffic
    // log is a separate JSONL stream (see traffic_log)
    let file_appender = tracing_appender::rolling::daily(config.data_dir.join("logs"), "dproxy.log");
    let (file_writer, _log_guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    tracing::info!("dproxy {} starting", config::VERSION);

    let store = Arc::new(Store::open(&config.db_path).context("failed to open record store")?);
    seed_default_configs(&store)?;

    let traffic = Arc::new(TrafficConfig::load(store.clone()).context("failed to compile traffic config")?);
    if !traffic.is_monitoring_enabled() {
        tracing::warn!("No valid monitor rule configured; all traffic passes through unmonitored");
    }

    let ca = Arc::new(
        CertificateAuthority::load_or_create(&config.certs_dir())
            .context("failed to initialize certificate authority")?,
    );
    tracing::info!(
        "CA certificate for client trust: {}",
        ca.ca_cert_path().display()
    );

    let forwarder = Arc::new(Forwarder::new(&config.forwarder)?);
    let matching = Arc::new(MatchingEngine::new(store.clone(), traffic.clone()));
    let sessions = Arc::new(SessionFabric::new(
        store.clone(),
        traffic.clone(),
        config.session_expiry,
    ));
    let modes = Arc::new(ModeService::load(store.clone(), &config.default_mode)?);
    let stats = Arc::new(StatsAggregator::new(store.clone()));
    let traffic_log = Arc::new(TrafficLogger::new(config.traffic_log_dir.clone())?);
    let chain = Arc::new(InterceptorChain::standard(traffic.clone(), stats.clone()));
    tracing::debug!(
        "Interceptor chain: request {:?}, response {:?}",
        chain.request_names(),
        chain.response_names()
    );

    let mode_deps = ModeDeps {
        store: store.clone(),
        traffic: traffic.clone(),
        forwarder: forwarder.clone(),
        matching: matching.clone(),
        sessions: sessions.clone(),
    };

    let enable_https = config.enable_https;
    let services = Arc::new(ProxyServices {
        config,
        store,
        traffic,
        ca,
        forwarder,
        matching,
        sessions,
        modes,
        stats: stats.clone(),
        traffic_log: traffic_log.clone(),
        chain,
        mode_deps,
    });

    let (proxy_shutdown_tx, proxy_shutdown_rx) = tokio::sync::oneshot::channel();
    let proxy_handle = {
        let services = services.clone();
        tokio::spawn(async move { proxy::run_proxy(services, proxy_shutdown_rx).await })
    };

    let https_handle = if enable_https {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let services = services.clone();
        Some((
            tx,
            tokio::spawn(async move { proxy::server::run_https(services, rx).await }),
        ))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    let _ = proxy_shutdown_tx.send(());
    let _ = proxy_handle.await;
    if let Some((tx, handle)) = https_handle {
        let _ = tx.send(());
        let _ = handle.await;
    }

    // Drain the fire-and-forget queues before exit
    let drain = tokio::task::spawn_blocking(move || {
        stats.shutdown();
        traffic_log.shutdown();
    });
    let _ = drain.await;

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Seed the config rows a fresh database needs. Operator-set rows are never
/// touched; monitoring stays off until a monitor rule is configured.
fn seed_default_configs(store: &Store) -> Result<()> {
    store.seed_config_if_absent(
        "traffic",
        &json!({
            "monitor": null,
            "domains": [],
        }),
    )?;
    store.seed_config_if_absent(
        "mapping",
        &json!({
            "app_version": {"source": "header", "key": "mobile-version"},
            "app_platform": {"source": "header", "key": "mobile-platform"},
            "app_environment": {"source": "header", "key": "mobile-environment"},
            "app_language": {"source": "header", "key": "accept-language", "pattern": "^([a-zA-Z]{2})"},
        }),
    )?;
    store.seed_config_if_absent(
        "endpoint",
        &json!({
            "fallback": "public",
            "types": [],
            "tags": [],
        }),
    )?;
    store.seed_config_if_absent(
        "proxy",
        &json!({
            "replayLatency": {"type": "instant"},
            "session": {"create": [], "update": []},
        }),
    )?;
    Ok(())
}
