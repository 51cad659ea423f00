//! Sandbox configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration for sandboxed runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Deadline for interactive runs
    #[serde(with = "duration_ms")]
    pub timeout: Duration,

    /// Deadline for each challenge test case run
    #[serde(with = "duration_ms")]
    pub challenge_timeout: Duration,

    /// Timer delays above this are clamped down to it
    #[serde(with = "duration_ms")]
    pub max_timer_delay: Duration,

    /// Iterations a single loop may run before the interpreter aborts it
    pub loop_iteration_limit: u64,

    /// Maximum call depth inside the interpreter
    pub recursion_limit: usize,

    /// Expose the `fetch` binding
    pub allow_network: bool,

    /// Run the line normalizer before evaluation
    pub normalize_source: bool,

    /// Console entries accepted per run
    pub max_entries: usize,

    /// Stack size of the interpreter thread in bytes
    pub stack_size: usize,

    /// Bounds for rendering captured values
    pub render: RenderLimits,
}

/// Bounds applied when turning sandboxed values into text
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RenderLimits {
    /// Nesting depth before containers collapse to a marker
    pub max_depth: usize,
    /// Items kept per array or object
    pub max_items: usize,
    /// Characters kept per rendered entry
    pub max_chars: usize,
}

impl Default for RenderLimits {
    fn default() -> Self {
        Self {
            max_depth: 8,
            max_items: 100,
            max_chars: 10_000,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            challenge_timeout: Duration::from_secs(2),
            max_timer_delay: Duration::from_secs(5),
            loop_iteration_limit: 500_000_000,
            recursion_limit: 400,
            allow_network: true,
            normalize_source: true,
            max_entries: 1000,
            stack_size: 16 * 1024 * 1024, // 16MB
            render: RenderLimits::default(),
        }
    }
}

impl SandboxConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Clamp a requested deadline to the configured ceiling
    #[must_use]
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        requested.map_or(self.timeout, |t| t.min(self.timeout))
    }
}

/// Builder for SandboxConfig
#[derive(Debug, Default)]
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    #[must_use]
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.config.timeout = duration;
        self
    }

    #[must_use]
    pub fn timeout_ms(self, ms: u64) -> Self {
        self.timeout(Duration::from_millis(ms))
    }

    #[must_use]
    pub fn challenge_timeout(mut self, duration: Duration) -> Self {
        self.config.challenge_timeout = duration;
        self
    }

    #[must_use]
    pub fn max_timer_delay(mut self, duration: Duration) -> Self {
        self.config.max_timer_delay = duration;
        self
    }

    #[must_use]
    pub fn loop_iteration_limit(mut self, limit: u64) -> Self {
        self.config.loop_iteration_limit = limit;
        self
    }

    #[must_use]
    pub fn recursion_limit(mut self, limit: usize) -> Self {
        self.config.recursion_limit = limit;
        self
    }

    #[must_use]
    pub fn allow_network(mut self, allow: bool) -> Self {
        self.config.allow_network = allow;
        self
    }

    #[must_use]
    pub fn normalize_source(mut self, normalize: bool) -> Self {
        self.config.normalize_source = normalize;
        self
    }

    #[must_use]
    pub fn max_entries(mut self, max: usize) -> Self {
        self.config.max_entries = max;
        self
    }

    #[must_use]
    pub fn render(mut self, limits: RenderLimits) -> Self {
        self.config.render = limits;
        self
    }

    #[must_use]
    pub fn build(self) -> SandboxConfig {
        self.config
    }
}

/// Get default listen address from SANDPIT_ADDR env var or the loopback default
///
/// Returns:
/// - `$SANDPIT_ADDR` if set and parseable
/// - `127.0.0.1:7878` otherwise
pub fn default_listen_addr() -> SocketAddr {
    std::env::var("SANDPIT_ADDR")
        .ok()
        .and_then(|addr| addr.parse().ok())
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 7878)))
}

/// Serialize durations as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::cast_possible_truncation)]
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
