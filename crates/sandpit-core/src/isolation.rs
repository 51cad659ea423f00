//! Filesystem restriction for worker processes
//!
//! Workers only need to read name-resolution files and shared libraries
//! loaded lazily by the resolver. Everything else, and any write, is denied
//! once the ruleset is in place. Landlock needs Linux 5.13+; on older
//! kernels the ruleset is reported as not enforced and the worker carries on.

use crate::{Result, SandpitError};
use landlock::{
    ABI, Access, AccessFs, Ruleset, RulesetAttr, RulesetCreatedAttr, RulesetStatus,
    path_beneath_rules,
};
use std::path::PathBuf;

const TARGET_ABI: ABI = ABI::V2;

/// How much of the ruleset the kernel applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforcement {
    Full,
    Partial,
    None,
}

/// Read-only allow-list applied with Landlock
#[derive(Debug, Clone, Default)]
pub struct FsPolicy {
    pub ro_paths: Vec<PathBuf>,
}

impl FsPolicy {
    /// Paths a worker needs for DNS and TLS
    #[must_use]
    pub fn worker_default() -> Self {
        Self::default()
            .ro("/etc")
            .ro("/usr/lib")
            .ro("/lib")
            .ro("/lib64")
            .ro("/usr/share/ca-certificates")
    }

    #[must_use]
    pub fn ro(mut self, path: impl Into<PathBuf>) -> Self {
        self.ro_paths.push(path.into());
        self
    }

    /// Restrict the calling process; irreversible
    pub fn apply(&self) -> Result<Enforcement> {
        // missing directories would fail the whole ruleset
        let existing: Vec<&PathBuf> = self.ro_paths.iter().filter(|p| p.exists()).collect();

        tracing::debug!(ro = existing.len(), "applying landlock rules");

        let status = Ruleset::default()
            .handle_access(AccessFs::from_all(TARGET_ABI))
            .and_then(|r| r.create())
            .and_then(|r| r.add_rules(path_beneath_rules(existing, AccessFs::from_read(TARGET_ABI))))
            .and_then(|r| r.restrict_self())
            .map_err(|e| SandpitError::Worker(format!("landlock: {e}")))?;

        Ok(match status.ruleset {
            RulesetStatus::FullyEnforced => Enforcement::Full,
            RulesetStatus::PartiallyEnforced => Enforcement::Partial,
            RulesetStatus::NotEnforced => Enforcement::None,
        })
    }
}

/// Apply the worker policy, logging instead of failing
pub fn restrict_worker() {
    match FsPolicy::worker_default().apply() {
        Ok(Enforcement::Full) => tracing::info!("landlock restrictions applied"),
        Ok(level) => tracing::warn!(?level, "landlock only partially available"),
        Err(e) => tracing::warn!(error = %e, "landlock not available, continuing without it"),
    }
}
