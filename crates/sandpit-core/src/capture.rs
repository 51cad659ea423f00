//! Console output capture
//!
//! One `Capture` per run. Every console call appends synchronously under a
//! single lock, so sequence numbers follow call order across all kinds.
//! Once sealed, the capture rejects everything; the engine seals it when the
//! run reaches a terminal state, including timeouts.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Classification of a console call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleKind {
    Log,
    Info,
    Warn,
    Error,
}

impl fmt::Display for ConsoleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Log => "log",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        })
    }
}

/// One captured unit of console output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleEntry {
    pub kind: ConsoleKind,
    pub content: String,
    /// Position within the run, starting at 0
    pub emitted_at: u64,
}

/// Receives each accepted entry synchronously
pub type EntryListener = Arc<dyn Fn(&ConsoleEntry) + Send + Sync>;

struct CaptureInner {
    entries: Vec<ConsoleEntry>,
    next_seq: u64,
    sealed: bool,
    truncated: bool,
}

pub struct Capture {
    inner: Mutex<CaptureInner>,
    sealed: AtomicBool,
    max_entries: usize,
    listener: Option<EntryListener>,
}

impl Capture {
    #[must_use]
    pub fn new(max_entries: usize, listener: Option<EntryListener>) -> Self {
        Self {
            inner: Mutex::new(CaptureInner {
                entries: Vec::new(),
                next_seq: 0,
                sealed: false,
                truncated: false,
            }),
            sealed: AtomicBool::new(false),
            max_entries,
            listener,
        }
    }

    /// Append an entry; returns false when the capture no longer accepts output
    pub fn record(&self, kind: ConsoleKind, content: String) -> bool {
        let mut inner = self.inner.lock();
        if inner.sealed {
            return false;
        }

        if inner.entries.len() >= self.max_entries {
            if !inner.truncated {
                inner.truncated = true;
                let notice = format!(
                    "console output truncated after {} entries",
                    self.max_entries
                );
                self.push(&mut inner, ConsoleKind::Warn, notice);
                tracing::debug!(max = self.max_entries, "console capture truncated");
            }
            return false;
        }

        self.push(&mut inner, kind, content);
        true
    }

    fn push(&self, inner: &mut CaptureInner, kind: ConsoleKind, content: String) {
        let entry = ConsoleEntry {
            kind,
            content,
            emitted_at: inner.next_seq,
        };
        inner.next_seq += 1;

        if let Some(listener) = &self.listener {
            listener(&entry);
        }
        inner.entries.push(entry);
    }

    /// Stop accepting output and return everything captured so far
    pub fn seal(&self) -> Vec<ConsoleEntry> {
        let mut inner = self.inner.lock();
        inner.sealed = true;
        self.sealed.store(true, Ordering::Release);
        std::mem::take(&mut inner.entries)
    }

    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Capture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capture")
            .field("max_entries", &self.max_entries)
            .field("sealed", &self.is_sealed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_follows_call_order_across_kinds() {
        let capture = Capture::new(10, None);
        assert!(capture.record(ConsoleKind::Log, "a".into()));
        assert!(capture.record(ConsoleKind::Error, "b".into()));
        assert!(capture.record(ConsoleKind::Info, "c".into()));

        let entries = capture.seal();
        let seqs: Vec<u64> = entries.iter().map(|e| e.emitted_at).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(entries[1].kind, ConsoleKind::Error);
    }

    #[test]
    fn sealed_capture_rejects_output() {
        let capture = Capture::new(10, None);
        capture.record(ConsoleKind::Log, "before".into());
        let entries = capture.seal();
        assert!(capture.is_sealed());
        assert!(!capture.record(ConsoleKind::Log, "after".into()));
        assert_eq!(entries.len(), 1);
        assert!(capture.seal().is_empty());
    }

    #[test]
    fn overflow_adds_a_single_notice() {
        let capture = Capture::new(2, None);
        for i in 0..5 {
            capture.record(ConsoleKind::Log, i.to_string());
        }
        let entries = capture.seal();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].kind, ConsoleKind::Warn);
        assert!(entries[2].content.contains("truncated after 2"));
    }

    #[test]
    fn listener_sees_every_accepted_entry() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: EntryListener = Arc::new(move |e: &ConsoleEntry| {
            sink.lock().push(e.content.clone());
        });

        let capture = Capture::new(10, Some(listener));
        capture.record(ConsoleKind::Warn, "one".into());
        capture.seal();
        capture.record(ConsoleKind::Warn, "two".into());

        assert_eq!(*seen.lock(), vec!["one".to_string()]);
    }

    #[test]
    fn kinds_serialize_lowercase() {
        let entry = ConsoleEntry {
            kind: ConsoleKind::Warn,
            content: "x".into(),
            emitted_at: 4,
        };
        assert_eq!(
            serde_json::to_string(&entry).unwrap(),
            r#"{"kind":"warn","content":"x","emittedAt":4}"#
        );
    }
}
