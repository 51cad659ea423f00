//! # sandpit-core
//!
//! Sandboxed JavaScript execution for the playground service.
//!
//! This crate provides the execution pipeline:
//! - Line-based source normalization
//! - A capability sandbox over `boa_engine` exposing only console, timers and fetch
//! - An execution engine with a wall-clock deadline on a dedicated interpreter thread
//! - Console capture with deterministic rendering of arbitrary values
//! - Challenge validation against declarative test cases
//! - A worker process protocol so a supervisor can kill runaway runs

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod capture;
pub mod challenge;
pub mod collab;
pub mod config;
pub mod engine;
pub mod error;
pub mod isolation;
pub mod normalize;
pub mod pipe;
pub mod protocol;
pub mod result;
pub mod sandbox;
pub mod value;
pub mod worker;

pub use capture::{ConsoleEntry, ConsoleKind};
pub use config::SandboxConfig;
pub use engine::{Engine, RunJob, Runner};
pub use error::SandpitError;
pub use result::{ExecutionResult, Outcome, ThrownError};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, SandpitError>;
