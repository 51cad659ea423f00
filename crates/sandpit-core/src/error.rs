//! Error types for sandpit-core
//!
//! These are host-level failures. Faults raised by user code never become a
//! `SandpitError`; they are reported through `ExecutionResult::thrown_error`.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandpitError {
    #[error("sandbox construction failed: {0}")]
    Sandbox(String),

    #[error("worker error: {0}")]
    Worker(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("challenge not found: {0}")]
    ChallengeNotFound(String),

    #[error("collaborator error: {0}")]
    Collaborator(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),

    #[error("msgpack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("msgpack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}
