use chrono::Local;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stream {
    Supervisor,
    Stdout,
    Stderr,
}

impl Stream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stream::Supervisor => "supervisor",
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// Epoch milliseconds.
    pub ts: i64,
    pub stream: Stream,
    pub line: String,
}

/// Bounded in-memory capture of supervisor events and worker output.
///
/// Appends past `limit` evict the oldest entry first.
#[derive(Debug)]
pub struct LogRing {
    limit: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl LogRing {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            entries: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn push(&self, stream: Stream, line: impl Into<String>) {
        let entry = LogEntry {
            ts: Local::now().timestamp_millis(),
            stream,
            line: line.into(),
        };
        let mut q = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        q.push_back(entry);
        while q.len() > self.limit {
            q.pop_front();
        }
    }

    /// Last `n` entries, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogEntry> {
        let q = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let skip = q.len().saturating_sub(n);
        q.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Emit a supervisor event: timestamped line on stderr, and a `supervisor` entry in the ring.
    pub fn event(&self, component: &str, msg: impl AsRef<str>) {
        let line = format!("[{component}] {}", msg.as_ref());
        eprintln!("{} {line}", Local::now().format("%Y-%m-%d_%H:%M:%S%.3f"));
        self.push(Stream::Supervisor, line);
    }

    /// Record one line of worker output.
    pub fn worker_line(&self, stream: Stream, line: &str) {
        eprintln!(
            "{} [worker:{}] {line}",
            Local::now().format("%Y-%m-%d_%H:%M:%S%.3f"),
            stream.as_str()
        );
        self.push(stream, line);
    }
}
