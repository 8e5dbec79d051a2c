// Traffic logger - structured append-only record of processed transactions
//
// One JSON object per line, one line per transaction, separate from the
// diagnostic logs. JSONL keeps the files greppable and jq-friendly:
//   jq 'select(.status >= 500)' data/traffic/traffic-20260801.jsonl
//
// Writes go through a bounded queue into a dedicated thread; overflow drops
// the oldest unwritten lines and counts them.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;

use crate::context::{RequestContext, ResponseContext};
use crate::util::BoundedQueue;

const QUEUE_CAPACITY: usize = 4096;
const DROP_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// One traffic log line.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficRecord {
    pub ts: String,
    pub request_id: String,
    pub mode: String,
    pub source: String,
    pub method: String,
    pub host: String,
    pub path: String,
    pub status: u16,
    pub latency_ms: u64,
    pub monitored: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strategy: Option<&'static str>,
}

impl TrafficRecord {
    pub fn from_exchange(ctx: &RequestContext, resp: &ResponseContext) -> Self {
        Self {
            ts: crate::util::now_rfc3339(),
            request_id: ctx.metadata.request_id.clone(),
            mode: ctx.metadata.mode.clone(),
            source: resp.source.as_str().to_string(),
            method: ctx.original.method.to_ascii_uppercase(),
            host: ctx.original.host.clone(),
            path: ctx.original.path.clone(),
            status: resp.status,
            latency_ms: resp.latency_ms,
            monitored: ctx.monitored,
            user_id: ctx.metadata.user_id,
            session_id: ctx.metadata.session_id,
            strategy: resp.strategy,
        }
    }
}

pub struct TrafficLogger {
    queue: Arc<BoundedQueue<TrafficRecord>>,
    writer: std::sync::Mutex<Option<JoinHandle<()>>>,
    last_drop_log: std::sync::Mutex<Option<Instant>>,
}

impl TrafficLogger {
    /// Create the log directory and spawn the writer thread. Files rotate
    /// daily by name: `traffic-YYYYMMDD.jsonl`.
    pub fn new(log_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("failed to create {}", log_dir.display()))?;
        let queue = Arc::new(BoundedQueue::new(QUEUE_CAPACITY));
        let writer_queue = queue.clone();
        let writer = std::thread::Builder::new()
            .name("traffic-log-writer".into())
            .spawn(move || {
                while let Some(record) = writer_queue.pop() {
                    if let Err(e) = write_record(&log_dir, &record) {
                        tracing::warn!("Failed to write traffic log line: {}", e);
                    }
                }
                tracing::debug!("Traffic log writer shutting down");
            })
            .context("failed to spawn traffic log writer")?;
        Ok(Self {
            queue,
            writer: std::sync::Mutex::new(Some(writer)),
            last_drop_log: std::sync::Mutex::new(None),
        })
    }

    /// Fire-and-forget append.
    pub fn log(&self, record: TrafficRecord) {
        let before = self.queue.dropped();
        let after = self.queue.push(record);
        if after > before {
            let mut last = self.last_drop_log.lock().unwrap();
            let due = last.map(|t| t.elapsed() >= DROP_LOG_INTERVAL).unwrap_or(true);
            if due {
                tracing::warn!("Traffic log queue overflow, {} lines dropped so far", after);
                *last = Some(Instant::now());
            }
        }
    }

    /// Close the queue and wait for the writer to drain.
    pub fn shutdown(&self) {
        self.queue.close();
        if let Some(handle) = self.writer.lock().unwrap().take() {
            if handle.join().is_err() {
                tracing::warn!("Traffic log writer panicked during shutdown");
            }
        }
    }
}

fn write_record(log_dir: &std::path::Path, record: &TrafficRecord) -> Result<()> {
    let file_name = format!(
        "traffic-{}.jsonl",
        chrono::Utc::now().format("%Y%m%d")
    );
    let path = log_dir.join(file_name);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    let json = serde_json::to_string(record).context("failed to serialize traffic record")?;
    writeln!(file, "{}", json)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Headers, RequestForm, ResponseSource};
    use bytes::Bytes;
    use tempfile::tempdir;

    #[test]
    fn test_logs_one_line_per_transaction() {
        let dir = tempdir().unwrap();
        let logger = TrafficLogger::new(dir.path().to_path_buf()).unwrap();

        let form = RequestForm {
            method: "get".into(),
            scheme: "https".into(),
            host: "api.example.com".into(),
            port: 443,
            path: "/v1/profile".into(),
            query: vec![],
            headers: Headers::new(),
            body: Bytes::new(),
        };
        let mut ctx = RequestContext::new(form, None, "req-1".into());
        ctx.metadata.mode = "replay".into();
        ctx.monitored = true;
        let mut resp = ResponseContext::new(200, "req-1".into(), ResponseSource::Replay);
        resp.strategy = Some("exact");

        logger.log(TrafficRecord::from_exchange(&ctx, &resp));
        logger.log(TrafficRecord::from_exchange(&ctx, &resp));
        logger.shutdown();

        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let content = std::fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["method"], "GET");
        assert_eq!(parsed["source"], "replay");
        assert_eq!(parsed["strategy"], "exact");
        assert_eq!(parsed["monitored"], true);
    }
}
