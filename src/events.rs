//! Structured progress/result/error events on stdout.
//!
//! The worker's only contract with its parent process is a stream of
//! line-delimited JSON objects: any number of `progress` events, then exactly
//! one `result` or one `error`. [`EventWriter`] serializes emissions under a
//! mutex so concurrent page workers can report without interleaving bytes;
//! [`ProgressTracker`] layers monotonic counters and the dynamic total on top.
//!
//! Everything here is synchronous on purpose: events must be emittable from
//! blocking contexts (the archive writer runs in `spawn_blocking`) as well as
//! from async workers.

use crate::output::ResultPayload;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One `progress` event body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub current: usize,
    pub total: usize,
    /// `current / total * 100`, clamped to at most `100.0`; `0.0` when the
    /// total is still unknown.
    pub percent: f64,
    pub message: String,
    /// Pages finished so far; present only on page-level events so consumers
    /// can track page progress separately from overall pipeline progress.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages_completed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pages_total: Option<usize>,
}

impl ProgressSnapshot {
    /// The snapshot embedded in a zero-page run's result payload.
    pub fn finished(message: impl Into<String>) -> Self {
        Self {
            current: 0,
            total: 0,
            percent: 100.0,
            message: message.into(),
            pages_completed: None,
            pages_total: None,
        }
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Event<'a> {
    Progress { progress: &'a ProgressSnapshot },
    Result { payload: &'a ResultPayload },
    Error { error: &'a str },
}

/// Mutex-serialized NDJSON writer.
///
/// Each call writes one complete line and flushes, so a record is either
/// absent from the stream or fully present — consumers can parse line by
/// line without buffering partial objects.
pub struct EventWriter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl EventWriter {
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Mutex::new(Box::new(out)),
        }
    }

    /// Writer bound to the process stdout.
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    pub fn progress(&self, snapshot: &ProgressSnapshot) {
        self.emit(&Event::Progress { progress: snapshot });
    }

    pub fn result(&self, payload: &ResultPayload) {
        self.emit(&Event::Result { payload });
    }

    pub fn error(&self, message: &str) {
        self.emit(&Event::Error { error: message });
    }

    fn emit(&self, event: &Event<'_>) {
        // Serialization failures are unrepresentable for these types and a
        // broken pipe means the parent is gone; neither is recoverable from
        // here, so emission errors are swallowed.
        let Ok(line) = serde_json::to_string(event) else {
            return;
        };
        if let Ok(mut out) = self.out.lock() {
            let _ = writeln!(out, "{line}");
            let _ = out.flush();
        }
    }
}

/// Monotonic progress counters with a dynamically raisable total.
///
/// `current` only ever increments, so successive `progress` events are
/// non-decreasing no matter which worker emits them. The total starts at the
/// phase-1 value (`pages + 3`) and is raised once the archive entry count is
/// known, because that count does not exist until every page has completed.
pub struct ProgressTracker {
    writer: Arc<EventWriter>,
    current: AtomicUsize,
    total: AtomicUsize,
    pages_completed: AtomicUsize,
    pages_total: AtomicUsize,
}

impl ProgressTracker {
    pub fn new(writer: Arc<EventWriter>) -> Self {
        Self {
            writer,
            current: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            pages_completed: AtomicUsize::new(0),
            pages_total: AtomicUsize::new(0),
        }
    }

    /// Set the phase-1 step total and the page total.
    pub fn begin_pages(&self, pages: usize) {
        self.pages_total.store(pages, Ordering::SeqCst);
        self.total.store((pages + 3).max(1), Ordering::SeqCst);
    }

    /// Raise the step total; never lowers it.
    pub fn raise_total(&self, total: usize) {
        self.total.fetch_max(total, Ordering::SeqCst);
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Emit a progress event without advancing any counter.
    pub fn announce(&self, message: impl Into<String>) {
        self.writer.progress(&self.snapshot(message, false));
    }

    /// Emit a page-tagged progress event without advancing any counter.
    pub fn announce_page(&self, message: impl Into<String>) {
        self.writer.progress(&self.snapshot(message, true));
    }

    /// Advance one step and emit.
    pub fn advance(&self, message: impl Into<String>) {
        self.current.fetch_add(1, Ordering::SeqCst);
        self.writer.progress(&self.snapshot(message, false));
    }

    /// Record one completed page: advances both the page counter and the
    /// overall step counter, then emits a page-tagged event.
    pub fn complete_page(&self, message: impl Into<String>) {
        self.pages_completed.fetch_add(1, Ordering::SeqCst);
        self.current.fetch_add(1, Ordering::SeqCst);
        self.writer.progress(&self.snapshot(message, true));
    }

    /// Current counters as a snapshot.
    pub fn snapshot(&self, message: impl Into<String>, with_pages: bool) -> ProgressSnapshot {
        let current = self.current.load(Ordering::SeqCst);
        let total = self.total.load(Ordering::SeqCst);
        let percent = if total > 0 {
            (current as f64 / total as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
        ProgressSnapshot {
            current,
            total,
            percent,
            message: message.into(),
            pages_completed: with_pages
                .then(|| self.pages_completed.load(Ordering::SeqCst)),
            pages_total: with_pages.then(|| self.pages_total.load(Ordering::SeqCst)),
        }
    }
}
