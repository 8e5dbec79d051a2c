//! Shared utility functions

use chrono::{SecondsFormat, Utc};

/// RFC 3339 timestamp with millisecond precision.
///
/// All persisted timestamps use this format so that lexicographic ordering
/// in SQLite matches chronological ordering.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Unix epoch milliseconds, used in error bodies and traffic log lines.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// SHA-256 of a token, hex-encoded.
///
/// Upstream session cookies and bearer tokens are never stored raw in the
/// hash columns; only this digest is appended.
pub fn sha256_hex(value: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Split a `host:port` authority, defaulting the port.
pub fn split_authority(authority: &str, default_port: u16) -> (String, u16) {
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(p) => (host.to_string(), p),
            // IPv6 literal or junk after the colon: treat the whole thing as host
            Err(_) => (authority.to_string(), default_port),
        },
        None => (authority.to_string(), default_port),
    }
}

/// Strip query string and fragment from a path.
pub fn strip_query_and_fragment(path: &str) -> &str {
    let end = path
        .find(|c| c == '?' || c == '#')
        .unwrap_or(path.len());
    &path[..end]
}

/// Bounded fire-and-forget queue feeding a dedicated writer thread.
///
/// `push` never blocks: on overflow the OLDEST unwritten entry is discarded
/// and a counter incremented. `pop` blocks until an entry arrives or the
/// queue is closed and drained.
pub struct BoundedQueue<T> {
    state: std::sync::Mutex<QueueState<T>>,
    available: std::sync::Condvar,
    capacity: usize,
}

struct QueueState<T> {
    items: std::collections::VecDeque<T>,
    closed: bool,
    dropped: u64,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: std::sync::Mutex::new(QueueState {
                items: std::collections::VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            available: std::sync::Condvar::new(),
            capacity,
        }
    }

    /// Enqueue without blocking. Returns the total dropped count so callers
    /// can rate-limit their overflow logging.
    pub fn push(&self, item: T) -> u64 {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return state.dropped;
        }
        if state.items.len() >= self.capacity {
            state.items.pop_front();
            state.dropped += 1;
        }
        state.items.push_back(item);
        let dropped = state.dropped;
        drop(state);
        self.available.notify_one();
        dropped
    }

    /// Blocking dequeue; `None` once the queue is closed and empty.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            state = self.available.wait(state).unwrap();
        }
    }

    /// Close the queue; pending entries stay poppable.
    pub fn close(&self) {
        self.state.lock().unwrap().closed = true;
        self.available.notify_all();
    }

    pub fn dropped(&self) -> u64 {
        self.state.lock().unwrap().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_queue_drops_oldest() {
        let q = BoundedQueue::new(2);
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        q.close();
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_bounded_queue_drains_after_close() {
        let q = BoundedQueue::new(4);
        q.push("a");
        q.close();
        assert_eq!(q.pop(), Some("a"));
        assert_eq!(q.pop(), None);
        // pushes after close are ignored
        q.push("b");
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_split_authority() {
        assert_eq!(split_authority("api.example.com:443", 80), ("api.example.com".into(), 443));
        assert_eq!(split_authority("api.example.com", 443), ("api.example.com".into(), 443));
        assert_eq!(split_authority("10.0.0.1:8443", 443), ("10.0.0.1".into(), 8443));
    }

    #[test]
    fn test_strip_query_and_fragment() {
        assert_eq!(strip_query_and_fragment("/v1/users?id=1"), "/v1/users");
        assert_eq!(strip_query_and_fragment("/v1/users#frag"), "/v1/users");
        assert_eq!(strip_query_and_fragment("/v1/users"), "/v1/users");
    }
}
