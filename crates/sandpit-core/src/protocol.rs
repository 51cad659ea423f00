//! Wire protocol
//!
//! Worker frames are MessagePack over the framing in [`crate::pipe`]. The
//! HTTP request and response bodies shared by the daemon and the CLI are
//! plain serde types and travel as JSON.

use crate::capture::ConsoleEntry;
use crate::result::ExecutionResult;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Supervisor to worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerRequest {
    Execute { source: String, timeout_ms: u64 },
    Shutdown,
}

/// Worker to supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerFrame {
    /// Sent once after start-up, before the first request is read
    Ready,
    /// Streamed while the script runs
    Entry(ConsoleEntry),
    /// Final frame of a run
    Done(ExecutionResult),
    /// The run could not start (sandbox construction failed)
    Failed(String),
}

/// Body of `POST /api/execute`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub source: String,
    #[serde(default)]
    pub context_id: Option<String>,
    /// Shortens the interactive deadline; never extends it
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Body of `POST /api/challenges/{id}/validate`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub source: String,
}

/// Worker pool occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub total: usize,
    pub idle: usize,
    pub busy: usize,
    pub recycling: usize,
    pub dead: usize,
}

/// Body of `GET /api/status`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub isolation: String,
    pub pool: PoolStatus,
    pub executions: u64,
    pub timeouts: u64,
}

/// Body of `GET /health`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Error body for every non-2xx response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Encode a message to msgpack, with field names
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(msg)
}

/// Decode a message from msgpack
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(data)
}
