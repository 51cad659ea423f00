//! Persistence collaborators
//!
//! Storage of console entries and challenge progress lives outside this
//! crate. The traits below are the seams; the in-memory implementations
//! back the daemon and the tests. Failures are logged and never change an
//! `ExecutionResult` or a `ValidationReport`.

use crate::capture::{ConsoleEntry, EntryListener};
use crate::{Result, SandpitError};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};

/// Stores console entries per context
pub trait EntryStore: Send + Sync {
    fn append_entry(&self, context_id: &str, entry: &ConsoleEntry) -> Result<()>;
    fn clear_entries(&self, context_id: &str) -> Result<()>;
    fn entries(&self, context_id: &str) -> Result<Vec<ConsoleEntry>>;
}

/// Records solved challenges
pub trait ProgressStore: Send + Sync {
    fn record_completion(&self, challenge_id: &str, source: &str) -> Result<()>;
}

/// Contexts kept by a default [`MemoryEntryStore`]
pub const DEFAULT_MAX_CONTEXTS: usize = 1024;

/// Entries kept per context by a default [`MemoryEntryStore`]
pub const DEFAULT_ENTRIES_PER_CONTEXT: usize = 10_000;

#[derive(Debug, Default)]
struct Contexts {
    entries: HashMap<String, VecDeque<ConsoleEntry>>,
    /// Context ids, oldest first
    order: VecDeque<String>,
}

/// Bounded in-memory entry store
///
/// Both the number of contexts and the entries per context are capped;
/// the oldest context and the oldest entry go first. A cleared context
/// that receives entries again counts as new.
#[derive(Debug)]
pub struct MemoryEntryStore {
    contexts: Mutex<Contexts>,
    max_contexts: usize,
    capacity: usize,
}

impl Default for MemoryEntryStore {
    fn default() -> Self {
        Self::bounded(DEFAULT_MAX_CONTEXTS, DEFAULT_ENTRIES_PER_CONTEXT)
    }
}

impl MemoryEntryStore {
    /// Bounds below 1 are raised to 1
    #[must_use]
    pub fn bounded(max_contexts: usize, capacity: usize) -> Self {
        Self {
            contexts: Mutex::default(),
            max_contexts: max_contexts.max(1),
            capacity: capacity.max(1),
        }
    }

    #[must_use]
    pub fn context_count(&self) -> usize {
        self.contexts.lock().entries.len()
    }
}

impl EntryStore for MemoryEntryStore {
    fn append_entry(&self, context_id: &str, entry: &ConsoleEntry) -> Result<()> {
        let mut guard = self.contexts.lock();
        let Contexts { entries, order } = &mut *guard;

        if !entries.contains_key(context_id) {
            while order.len() >= self.max_contexts {
                let Some(oldest) = order.pop_front() else { break };
                entries.remove(&oldest);
                tracing::debug!(context_id = %oldest, "entry store full, evicted oldest context");
            }
            order.push_back(context_id.to_owned());
        }

        let kept = entries.entry(context_id.to_owned()).or_default();
        kept.push_back(entry.clone());
        if kept.len() > self.capacity {
            kept.pop_front();
        }
        Ok(())
    }

    fn clear_entries(&self, context_id: &str) -> Result<()> {
        let mut guard = self.contexts.lock();
        if guard.entries.remove(context_id).is_some() {
            guard.order.retain(|id| id != context_id);
        }
        Ok(())
    }

    fn entries(&self, context_id: &str) -> Result<Vec<ConsoleEntry>> {
        Ok(self
            .contexts
            .lock()
            .entries
            .get(context_id)
            .map(|kept| kept.iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// A recorded challenge completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub challenge_id: String,
    pub source: String,
}

/// Latest passing solution per challenge
#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    completions: Mutex<Vec<Completion>>,
}

impl MemoryProgressStore {
    #[must_use]
    pub fn completions(&self) -> Vec<Completion> {
        self.completions.lock().clone()
    }

    #[must_use]
    pub fn is_completed(&self, challenge_id: &str) -> bool {
        self.completions
            .lock()
            .iter()
            .any(|c| c.challenge_id == challenge_id)
    }
}

impl ProgressStore for MemoryProgressStore {
    fn record_completion(&self, challenge_id: &str, source: &str) -> Result<()> {
        let completion = Completion {
            challenge_id: challenge_id.to_owned(),
            source: source.to_owned(),
        };
        let mut completions = self.completions.lock();
        match completions.iter_mut().find(|c| c.challenge_id == challenge_id) {
            Some(existing) => *existing = completion,
            None => completions.push(completion),
        }
        Ok(())
    }
}

enum Forward {
    Append(String, ConsoleEntry),
    Clear(String),
}

/// Moves entries to an `EntryStore` off the interpreter thread
///
/// Capture listeners run under the capture lock, so they only enqueue here.
/// A single background thread drains the queue in order.
#[derive(Clone)]
pub struct Forwarder {
    tx: Sender<Forward>,
}

impl Forwarder {
    /// Start the forwarding thread; it stops once every handle is dropped
    pub fn spawn(store: Arc<dyn EntryStore>) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("sandpit-forward".into())
            .spawn(move || forward_loop(&rx, store.as_ref()))
            .map_err(|e| SandpitError::Collaborator(format!("failed to start forwarder: {e}")))?;
        Ok(Self { tx })
    }

    /// Clear the context, then return a listener that forwards into it
    ///
    /// Both go through the same queue, so the clear lands before any entry
    /// of the new run.
    #[must_use]
    pub fn listener_for(&self, context_id: &str) -> EntryListener {
        self.send(Forward::Clear(context_id.to_owned()));
        let tx = self.tx.clone();
        let context_id = context_id.to_owned();
        Arc::new(move |entry: &ConsoleEntry| {
            if tx
                .send(Forward::Append(context_id.clone(), entry.clone()))
                .is_err()
            {
                tracing::warn!(context_id = %context_id, "entry forwarder is gone, entry dropped");
            }
        })
    }

    fn send(&self, message: Forward) {
        if self.tx.send(message).is_err() {
            tracing::warn!("entry forwarder is gone");
        }
    }
}

fn forward_loop(rx: &Receiver<Forward>, store: &dyn EntryStore) {
    while let Ok(message) = rx.recv() {
        let (context_id, outcome) = match message {
            Forward::Append(context_id, entry) => {
                let outcome = store.append_entry(&context_id, &entry);
                (context_id, outcome)
            }
            Forward::Clear(context_id) => {
                let outcome = store.clear_entries(&context_id);
                (context_id, outcome)
            }
        };
        if let Err(e) = outcome {
            tracing::warn!(context_id = %context_id, error = %e, "entry store rejected update");
        }
    }
    tracing::debug!("entry forwarder stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ConsoleKind;
    use std::time::{Duration, Instant};

    fn entry(seq: u64, content: &str) -> ConsoleEntry {
        ConsoleEntry {
            kind: ConsoleKind::Log,
            content: content.into(),
            emitted_at: seq,
        }
    }

    fn wait_for(store: &MemoryEntryStore, context: &str, n: usize) -> Vec<ConsoleEntry> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let entries = store.entries(context).unwrap();
            if entries.len() >= n || Instant::now() > deadline {
                return entries;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn memory_store_keeps_contexts_apart() {
        let store = MemoryEntryStore::default();
        store.append_entry("a", &entry(0, "one")).unwrap();
        store.append_entry("b", &entry(0, "two")).unwrap();
        store.clear_entries("a").unwrap();
        assert!(store.entries("a").unwrap().is_empty());
        assert_eq!(store.entries("b").unwrap().len(), 1);
    }

    #[test]
    fn bounded_store_drops_oldest_entries() {
        let store = MemoryEntryStore::bounded(4, 2);
        for i in 0..3 {
            store.append_entry("a", &entry(i, &i.to_string())).unwrap();
        }
        let kept: Vec<u64> = store.entries("a").unwrap().iter().map(|e| e.emitted_at).collect();
        assert_eq!(kept, vec![1, 2]);
    }

    #[test]
    fn bounded_store_evicts_oldest_context() {
        let store = MemoryEntryStore::bounded(2, 10);
        store.append_entry("a", &entry(0, "a")).unwrap();
        store.append_entry("b", &entry(0, "b")).unwrap();
        store.append_entry("c", &entry(0, "c")).unwrap();

        assert_eq!(store.context_count(), 2);
        assert!(store.entries("a").unwrap().is_empty());
        assert_eq!(store.entries("b").unwrap().len(), 1);
        assert_eq!(store.entries("c").unwrap().len(), 1);
    }

    #[test]
    fn rerun_context_moves_to_the_back() {
        let store = MemoryEntryStore::bounded(2, 10);
        store.append_entry("a", &entry(0, "a")).unwrap();
        store.append_entry("b", &entry(0, "b")).unwrap();
        store.clear_entries("a").unwrap();
        store.append_entry("a", &entry(0, "again")).unwrap();
        store.append_entry("c", &entry(0, "c")).unwrap();

        assert!(store.entries("b").unwrap().is_empty());
        assert_eq!(store.entries("a").unwrap()[0].content, "again");
        assert_eq!(store.context_count(), 2);
    }

    #[test]
    fn forwarder_clears_then_appends() {
        let store = Arc::new(MemoryEntryStore::default());
        store.append_entry("ctx", &entry(0, "stale")).unwrap();

        let forwarder = Forwarder::spawn(Arc::clone(&store) as Arc<dyn EntryStore>).unwrap();
        let listener = forwarder.listener_for("ctx");
        listener(&entry(0, "fresh"));
        listener(&entry(1, "fresher"));

        let entries = wait_for(&store, "ctx", 2);
        let contents: Vec<&str> = entries.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["fresh", "fresher"]);
    }

    struct FailingStore;

    impl EntryStore for FailingStore {
        fn append_entry(&self, _: &str, _: &ConsoleEntry) -> Result<()> {
            Err(SandpitError::Collaborator("disk full".into()))
        }
        fn clear_entries(&self, _: &str) -> Result<()> {
            Err(SandpitError::Collaborator("disk full".into()))
        }
        fn entries(&self, _: &str) -> Result<Vec<ConsoleEntry>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn store_failures_do_not_reach_the_listener() {
        let forwarder = Forwarder::spawn(Arc::new(FailingStore)).unwrap();
        let listener = forwarder.listener_for("ctx");
        listener(&entry(0, "lost"));
    }

    #[test]
    fn progress_store_records_completions() {
        let store = MemoryProgressStore::default();
        store.record_completion("fizzbuzz", "src").unwrap();
        assert!(store.is_completed("fizzbuzz"));
        assert!(!store.is_completed("other"));
        assert_eq!(store.completions()[0].source, "src");
    }

    #[test]
    fn progress_store_keeps_latest_solution_per_challenge() {
        let store = MemoryProgressStore::default();
        for attempt in 0..5 {
            store.record_completion("fizzbuzz", &format!("v{attempt}")).unwrap();
        }
        store.record_completion("sum", "s").unwrap();

        let completions = store.completions();
        assert_eq!(completions.len(), 2);
        assert_eq!(completions[0].source, "v4");
    }
}
