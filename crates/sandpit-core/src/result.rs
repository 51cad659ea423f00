//! Execution result types

use crate::capture::{ConsoleEntry, ConsoleKind};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use std::time::Duration;

/// Kind reported for runs cut off by the deadline
pub const TIMEOUT_KIND: &str = "TimeoutFault";

/// Terminal state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Completed,
    TimedOut,
    Faulted,
}

/// Error raised by (or imposed on) the sandboxed script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrownError {
    /// Interpreter error name (`SyntaxError`, `TypeError`, ...) or `TimeoutFault`
    pub kind: String,
    pub message: String,
    pub stack: Option<String>,
}

impl ThrownError {
    #[must_use]
    pub fn timeout(budget: Duration) -> Self {
        Self {
            kind: TIMEOUT_KIND.into(),
            message: format!("execution timed out after {}ms", budget.as_millis()),
            stack: None,
        }
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.kind == TIMEOUT_KIND
    }
}

/// Result of a sandboxed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    /// Completion value of the script, null when undefined or when the run failed
    pub return_value: Json,

    pub log_entries: Vec<String>,
    pub warn_entries: Vec<String>,
    pub error_entries: Vec<String>,
    pub info_entries: Vec<String>,

    pub thrown_error: Option<ThrownError>,

    /// Wall-clock time of the engine call, excluding normalization
    pub elapsed_millis: u64,

    pub outcome: Outcome,

    /// Every entry in emission order
    pub entries: Vec<ConsoleEntry>,
}

impl ExecutionResult {
    /// Partition captured entries and attach the terminal state
    ///
    /// The return value is kept only for completed runs.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn assemble(
        outcome: Outcome,
        return_value: Option<Json>,
        thrown_error: Option<ThrownError>,
        entries: Vec<ConsoleEntry>,
        elapsed: Duration,
    ) -> Self {
        let mut result = Self {
            return_value: Json::Null,
            log_entries: Vec::new(),
            warn_entries: Vec::new(),
            error_entries: Vec::new(),
            info_entries: Vec::new(),
            thrown_error: None,
            elapsed_millis: elapsed.as_millis() as u64,
            outcome,
            entries: Vec::new(),
        };

        for entry in &entries {
            let bucket = match entry.kind {
                ConsoleKind::Log => &mut result.log_entries,
                ConsoleKind::Warn => &mut result.warn_entries,
                ConsoleKind::Error => &mut result.error_entries,
                ConsoleKind::Info => &mut result.info_entries,
            };
            bucket.push(entry.content.clone());
        }
        result.entries = entries;

        match outcome {
            Outcome::Completed => {
                result.return_value = return_value.unwrap_or(Json::Null);
            }
            Outcome::TimedOut | Outcome::Faulted => {
                result.thrown_error = thrown_error;
            }
        }

        result
    }

    /// Total entries across all four kinds
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.log_entries.len()
            + self.warn_entries.len()
            + self.error_entries.len()
            + self.info_entries.len()
    }

    /// Check if the run completed without a thrown error
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::Completed && self.thrown_error.is_none()
    }

    #[must_use]
    pub fn timed_out(&self) -> bool {
        self.outcome == Outcome::TimedOut
    }
}
