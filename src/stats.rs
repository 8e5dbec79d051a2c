//! Stats aggregator
//!
//! One row per monitored passthrough/recording response, inserted
//! asynchronously through a bounded queue into a dedicated SQLite writer
//! thread so the request path never blocks on the store. Replay-mode
//! responses are never recorded.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::context::{RequestContext, ResponseContext};
use crate::store::{StatsRow, Store};
use crate::util::{strip_query_and_fragment, BoundedQueue};

const QUEUE_CAPACITY: usize = 4096;
const DROP_LOG_INTERVAL: Duration = Duration::from_secs(60);

pub struct StatsAggregator {
    queue: Arc<BoundedQueue<StatsRow>>,
    writer: std::sync::Mutex<Option<JoinHandle<()>>>,
    last_drop_log: std::sync::Mutex<Option<Instant>>,
}

impl StatsAggregator {
    /// Spawn the writer thread.
    pub fn new(store: Arc<Store>) -> Self {
        let queue = Arc::new(BoundedQueue::new(QUEUE_CAPACITY));
        let writer_queue = queue.clone();
        let writer = std::thread::Builder::new()
            .name("stats-writer".into())
            .spawn(move || {
                while let Some(row) = writer_queue.pop() {
                    if let Err(e) = store.insert_stat(&row) {
                        tracing::warn!("Failed to insert stats row: {}", e);
                    }
                }
                tracing::debug!("Stats writer thread shutting down");
            })
            .expect("failed to spawn stats writer thread");
        Self {
            queue,
            writer: std::sync::Mutex::new(Some(writer)),
            last_drop_log: std::sync::Mutex::new(None),
        }
    }

    /// Fire-and-forget insert.
    pub fn record(&self, ctx: &RequestContext, resp: &ResponseContext) {
        let row = build_row(ctx, resp);
        let before = self.queue.dropped();
        let after = self.queue.push(row);
        if after > before {
            // overflow: log the counter at most once per interval
            let mut last = self.last_drop_log.lock().unwrap();
            let due = last.map(|t| t.elapsed() >= DROP_LOG_INTERVAL).unwrap_or(true);
            if due {
                tracing::warn!("Stats queue overflow, {} rows dropped so far", after);
                *last = Some(Instant::now());
            }
        }
    }

    /// Close the queue and wait for the writer to drain.
    pub fn shutdown(&self) {
        self.queue.close();
        if let Some(handle) = self.writer.lock().unwrap().take() {
            if handle.join().is_err() {
                tracing::warn!("Stats writer thread panicked during shutdown");
            }
        }
    }
}

/// Host and path extraction, in priority order: the forwarder's target URL,
/// the inbound original host, the `Host` header, then `"unknown"`.
fn host_and_path(ctx: &RequestContext, resp: &ResponseContext) -> (String, String) {
    if let Some(target) = &resp.target_url {
        if let Some((host, path)) = split_url(target) {
            return (host, path);
        }
    }
    let path = strip_query_and_fragment(&ctx.original.path).to_string();
    if !ctx.original.host.is_empty() {
        return (ctx.original.host.clone(), path);
    }
    if let Some(host) = ctx.original.headers.get("host") {
        let host = host.split(':').next().unwrap_or(host).to_string();
        return (host, path);
    }
    ("unknown".to_string(), path)
}

/// Pull `(host, path)` out of an absolute URL without a parser dependency.
fn split_url(url: &str) -> Option<(String, String)> {
    let rest = url.split_once("://").map(|(_, rest)| rest)?;
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    let host = authority.split(':').next().unwrap_or(authority);
    if host.is_empty() {
        return None;
    }
    Some((
        host.to_string(),
        strip_query_and_fragment(path).to_string(),
    ))
}

fn build_row(ctx: &RequestContext, resp: &ResponseContext) -> StatsRow {
    let (host, endpoint_path) = host_and_path(ctx, resp);
    StatsRow {
        host,
        endpoint_path,
        method: ctx.original.method.to_ascii_uppercase(),
        app_platform: ctx.metadata.app_platform.clone(),
        app_version: ctx.metadata.app_version.clone(),
        app_environment: ctx.metadata.app_environment.clone(),
        app_language: ctx.metadata.app_language.clone(),
        response_status: resp.status,
        response_length: resp.response_length(),
        latency_ms: resp.latency_ms,
    }
}
