//! Execution engine
//!
//! Each call builds a fresh capture and sandbox on a dedicated interpreter
//! thread and waits for it until the deadline. The engine itself keeps no
//! state between calls.
//!
//! An interpreter thread that overruns its deadline cannot be preempted from
//! here. The capture is sealed so it produces no further observable effects,
//! and the thread stops at its next promise job or timer, or at the loop
//! iteration limit for straight-line loops. Callers that need
//! the CPU back immediately run the engine inside a worker process and kill
//! it (see [`crate::worker`]).

use crate::capture::{Capture, EntryListener};
use crate::normalize::normalize;
use crate::result::{ExecutionResult, Outcome, ThrownError};
use crate::sandbox::{Evaluation, Sandbox};
use crate::{Result, SandboxConfig, SandpitError};
use serde_json::Value as Json;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

/// Lifecycle of a single run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Completed,
    TimedOut,
    Faulted,
}

impl EngineState {
    const fn can_enter(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Running)
                | (Self::Running, Self::Completed | Self::TimedOut | Self::Faulted)
        )
    }
}

/// One unit of work for a [`Runner`]
#[derive(Clone)]
pub struct RunJob {
    pub source: String,
    pub timeout: Duration,
    /// Receives each captured entry as it is produced
    pub listener: Option<EntryListener>,
}

impl RunJob {
    #[must_use]
    pub fn new(source: impl Into<String>, timeout: Duration) -> Self {
        Self {
            source: source.into(),
            timeout,
            listener: None,
        }
    }

    #[must_use]
    pub fn with_listener(mut self, listener: EntryListener) -> Self {
        self.listener = Some(listener);
        self
    }
}

impl std::fmt::Debug for RunJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunJob")
            .field("source_len", &self.source.len())
            .field("timeout", &self.timeout)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

/// Something that can execute a job to a terminal state
///
/// `Err` is reserved for host failures; faults in user code come back as
/// an `ExecutionResult` with `thrown_error` set.
pub trait Runner: Send + Sync {
    fn run(&self, job: RunJob) -> Result<ExecutionResult>;
}

impl<R: Runner + ?Sized> Runner for Arc<R> {
    fn run(&self, job: RunJob) -> Result<ExecutionResult> {
        (**self).run(job)
    }
}

/// In-process engine; one interpreter thread per run
#[derive(Debug, Clone, Default)]
pub struct Engine {
    config: SandboxConfig,
}

/// What the interpreter thread reports back
enum ThreadOutcome {
    Finished(Evaluation),
    SandboxFailed(SandpitError),
}

impl Engine {
    #[must_use]
    pub const fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `source` on the interactive tier
    pub fn execute(&self, source: &str) -> Result<ExecutionResult> {
        self.run(RunJob::new(source, self.config.timeout))
    }

    fn execute_job(&self, job: RunJob) -> Result<ExecutionResult> {
        let source = if self.config.normalize_source {
            normalize(&job.source)
        } else {
            job.source
        };

        let mut state = Transition::new();
        let capture = Arc::new(Capture::new(self.config.max_entries, job.listener));
        let (tx, rx) = mpsc::sync_channel(1);

        state.enter(EngineState::Running);
        let started = Instant::now();
        let deadline = started + job.timeout;

        let config = self.config.clone();
        let thread_capture = Arc::clone(&capture);
        std::thread::Builder::new()
            .name("sandpit-run".into())
            .stack_size(self.config.stack_size)
            .spawn(move || {
                let outcome = match Sandbox::new(&config, thread_capture, deadline) {
                    Ok(mut sandbox) => ThreadOutcome::Finished(sandbox.evaluate(&source)),
                    Err(e) => ThreadOutcome::SandboxFailed(e),
                };
                // the receiver is gone once the run timed out
                let _ = tx.send(outcome);
            })?;

        let received = rx.recv_timeout(job.timeout);
        let entries = capture.seal();
        let elapsed = started.elapsed();

        let (outcome, return_value, thrown): (Outcome, Option<Json>, Option<ThrownError>) =
            match received {
                Ok(ThreadOutcome::Finished(Evaluation::Completed(value))) => {
                    (Outcome::Completed, Some(value), None)
                }
                Ok(ThreadOutcome::Finished(Evaluation::Faulted(err))) => {
                    (Outcome::Faulted, None, Some(err))
                }
                Ok(ThreadOutcome::Finished(Evaluation::LimitExceeded)) => {
                    if Instant::now() >= deadline {
                        (Outcome::TimedOut, None, Some(ThrownError::timeout(job.timeout)))
                    } else {
                        (Outcome::Faulted, None, Some(limit_error()))
                    }
                }
                Ok(ThreadOutcome::SandboxFailed(e)) => {
                    tracing::error!(error = %e, "sandbox construction failed, run aborted");
                    return Err(e);
                }
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        timeout_ms = u64::try_from(job.timeout.as_millis()).unwrap_or(u64::MAX),
                        "run exceeded deadline, interpreter thread abandoned"
                    );
                    (Outcome::TimedOut, None, Some(ThrownError::timeout(job.timeout)))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    // the interpreter thread panicked
                    return Err(SandpitError::Sandbox("interpreter thread died".into()));
                }
            };

        state.enter(match outcome {
            Outcome::Completed => EngineState::Completed,
            Outcome::TimedOut => EngineState::TimedOut,
            Outcome::Faulted => EngineState::Faulted,
        });

        tracing::debug!(
            state = ?state.current,
            entries = entries.len(),
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "run finished"
        );

        Ok(ExecutionResult::assemble(
            outcome,
            return_value,
            thrown,
            entries,
            elapsed,
        ))
    }
}

impl Runner for Engine {
    fn run(&self, job: RunJob) -> Result<ExecutionResult> {
        self.execute_job(job)
    }
}

fn limit_error() -> ThrownError {
    ThrownError {
        kind: "RangeError".into(),
        message: "runtime limit exceeded (loop iterations or call depth)".into(),
        stack: None,
    }
}

/// Guards the run state machine
struct Transition {
    current: EngineState,
}

impl Transition {
    const fn new() -> Self {
        Self {
            current: EngineState::Idle,
        }
    }

    fn enter(&mut self, next: EngineState) {
        debug_assert!(
            self.current.can_enter(next),
            "invalid engine transition {:?} -> {next:?}",
            self.current
        );
        tracing::trace!(from = ?self.current, to = ?next, "engine transition");
        self.current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::ConsoleEntry;
    use parking_lot::Mutex;
    use serde_json::json;

    fn engine() -> Engine {
        Engine::new(
            SandboxConfig::builder()
                .allow_network(false)
                .timeout(Duration::from_secs(5))
                .build(),
        )
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        assert!(EngineState::Idle.can_enter(EngineState::Running));
        assert!(EngineState::Running.can_enter(EngineState::TimedOut));
        assert!(!EngineState::Idle.can_enter(EngineState::Completed));
        assert!(!EngineState::Completed.can_enter(EngineState::Running));
        assert!(!EngineState::Faulted.can_enter(EngineState::Completed));
    }

    #[test]
    fn completed_run_has_value_and_no_error() {
        let result = engine().execute("var a = 20\na + 22").unwrap();
        assert_eq!(result.outcome, Outcome::Completed);
        assert_eq!(result.return_value, json!(42));
        assert!(result.thrown_error.is_none());
    }

    #[test]
    fn normalization_rescues_missing_semicolons() {
        let result = engine().execute("let a = 1\nlet b = 2\nconsole.log(a + b)").unwrap();
        assert_eq!(result.log_entries, vec!["3"]);
    }

    #[test]
    fn limit_before_deadline_is_a_range_error() {
        let engine = Engine::new(
            SandboxConfig::builder()
                .allow_network(false)
                .loop_iteration_limit(100)
                .build(),
        );
        let result = engine.execute("for (;;) {}").unwrap();
        assert_eq!(result.outcome, Outcome::Faulted);
        assert_eq!(result.thrown_error.unwrap().kind, "RangeError");
    }

    #[test]
    fn runaway_recursion_faults_instead_of_crashing() {
        let result = engine().execute("function f() { return f(); } f()").unwrap();
        assert_eq!(result.outcome, Outcome::Faulted);
        assert!(result.thrown_error.is_some());
    }

    #[test]
    fn timeout_seals_capture() {
        let engine = Engine::new(
            SandboxConfig::builder()
                .allow_network(false)
                .loop_iteration_limit(50_000_000)
                .timeout(Duration::from_millis(150))
                .build(),
        );
        let result = engine
            .execute("console.log('before'); while (true) {}")
            .unwrap();
        assert_eq!(result.outcome, Outcome::TimedOut);
        assert!(result.thrown_error.as_ref().unwrap().is_timeout());
        assert_eq!(result.log_entries, vec!["before"]);
        assert_eq!(result.return_value, Json::Null);
    }

    #[test]
    fn listener_receives_entries_in_order() {
        let seen: Arc<Mutex<Vec<ConsoleEntry>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let job = RunJob::new("console.log(1); console.warn(2)", Duration::from_secs(5))
            .with_listener(Arc::new(move |e: &ConsoleEntry| sink.lock().push(e.clone())));

        let result = engine().run(job).unwrap();
        let seen = seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].emitted_at, 0);
        assert_eq!(seen[1].content, "2");
        assert_eq!(result.entries, *seen);
    }
}
