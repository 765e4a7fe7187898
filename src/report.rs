use crate::wallet::WalletSnapshot;
use serde::Serialize;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Start,
    Running,
    Cancelling,
    Done,
    Stopped,
    Error,
}

/// Point-in-time metrics payload for the stdout protocol.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub total: usize,
    pub processed: usize,
    pub skipped_done: usize,
    pub succeeded: usize,
    pub no_match: usize,
    pub failed: usize,
    pub active_credentials: usize,
    pub banned_credentials: usize,
    pub remaining_credits: u64,
    pub current_row_index: usize,
    pub last_credential_short_id: String,
}

/// Emits the single-line JSON protocol on an opaque sink (stdout by default)
/// and owns the run counters. Counter updates are lock-free; emission of a
/// metrics line happens at most once per row completion so log volume stays
/// bounded by the input size.
pub struct Reporter {
    sink: Mutex<Box<dyn Write + Send>>,
    total: AtomicUsize,
    processed: AtomicUsize,
    skipped_done: AtomicUsize,
    succeeded: AtomicUsize,
    no_match: AtomicUsize,
    failed: AtomicUsize,
    current_row_index: AtomicUsize,
    cancelling: AtomicBool,
    last_credential_short_id: Mutex<String>,
}

impl Reporter {
    pub fn stdout() -> Arc<Self> {
        Self::with_sink(Box::new(std::io::stdout()))
    }

    pub fn with_sink(sink: Box<dyn Write + Send>) -> Arc<Self> {
        Arc::new(Self {
            sink: Mutex::new(sink),
            total: AtomicUsize::new(0),
            processed: AtomicUsize::new(0),
            skipped_done: AtomicUsize::new(0),
            succeeded: AtomicUsize::new(0),
            no_match: AtomicUsize::new(0),
            failed: AtomicUsize::new(0),
            current_row_index: AtomicUsize::new(0),
            cancelling: AtomicBool::new(false),
            last_credential_short_id: Mutex::new(String::new()),
        })
    }

    pub fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::Relaxed);
    }

    pub fn note_row_started(&self, row_index: usize) {
        self.current_row_index.store(row_index, Ordering::Relaxed);
    }

    pub fn note_credential(&self, short_id: &str) {
        if let Ok(mut last) = self.last_credential_short_id.lock() {
            last.clear();
            last.push_str(short_id);
        }
    }

    pub fn note_skipped_done(&self) {
        self.skipped_done.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_no_match(&self) {
        self.no_match.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    /// Flip to the cancelling state (idempotent) and announce it.
    pub fn begin_cancelling(&self) {
        if !self.cancelling.swap(true, Ordering::SeqCst) {
            self.status(Phase::Cancelling, None);
        }
    }

    pub fn is_cancelling(&self) -> bool {
        self.cancelling.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self, wallet: WalletSnapshot) -> MetricsSnapshot {
        MetricsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            skipped_done: self.skipped_done.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            no_match: self.no_match.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            active_credentials: wallet.active,
            banned_credentials: wallet.banned,
            remaining_credits: wallet.total_remaining,
            current_row_index: self.current_row_index.load(Ordering::Relaxed),
            last_credential_short_id: self
                .last_credential_short_id
                .lock()
                .map(|s| s.clone())
                .unwrap_or_default(),
        }
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        self.emit(serde_json::json!({
            "type": "log",
            "level": level,
            "message": message,
        }));
    }

    pub fn status(&self, phase: Phase, metrics: Option<&MetricsSnapshot>) {
        match metrics {
            Some(metrics) => self.emit(serde_json::json!({
                "type": "status",
                "status": phase,
                "metrics": metrics,
            })),
            None => self.emit(serde_json::json!({
                "type": "status",
                "status": phase,
            })),
        }
    }

    pub fn metrics(&self, metrics: &MetricsSnapshot) {
        self.emit(serde_json::json!({
            "type": "metrics",
            "metrics": metrics,
        }));
    }

    /// One metrics line per completed row; call after the row is closed.
    pub fn row_complete(&self, wallet: WalletSnapshot) {
        self.metrics(&self.snapshot(wallet));
    }

    fn emit(&self, event: serde_json::Value) {
        // Protocol emission is best effort; a broken pipe must not take the
        // run down while in-flight credits are being accounted.
        if let Ok(mut sink) = self.sink.lock() {
            let _ = writeln!(sink, "{event}");
            let _ = sink.flush();
        }
    }
}
