//! Configuration set before `join`, rejected after (§3, §6 "busy").

use crate::error::{ClusterError, Result};

/// How fork hooks behave around a `fork()`-like duplication of the
/// process. Most host runtimes never call `fork()`, in which case this is
/// a documented irrelevance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForkMode {
    /// Only the child restarts membership; the parent leaves.
    ChildOnly,
    /// Only the parent restarts membership; the child is disarmed.
    ParentOnly,
    /// Both sides restart, the child with a freshly generated instance id.
    #[default]
    Both,
}

/// Configuration for a joined cluster instance.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Worker slots this instance contributes. Must be `>= 1`.
    pub inst_workers: u32,
    /// TTL of a published membership record, in seconds.
    pub ttl_seconds: u64,
    /// Heartbeat period, in seconds. Must be `< ttl_seconds`.
    pub refresh_seconds: u64,
    pub verbose: bool,
    pub fork_mode: ForkMode,
    /// Join for observation only: no workers claimed, no pings sent.
    pub passive: bool,
    /// Static backend only.
    pub static_index: Option<i64>,
    /// Static backend only.
    pub static_total: Option<i64>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            inst_workers: 1,
            ttl_seconds: 120,
            refresh_seconds: 30,
            verbose: false,
            fork_mode: ForkMode::default(),
            passive: false,
            static_index: None,
            static_total: None,
        }
    }
}

impl ClusterConfig {
    /// Validate the refresh/ttl and worker-count relationship required by
    /// §3: `refresh_seconds < ttl_seconds`, `inst_workers >= 1`.
    pub fn validate(&self) -> Result<()> {
        if self.inst_workers < 1 {
            return Err(ClusterError::Invalid(
                "inst_workers must be >= 1".to_string(),
            ));
        }
        if self.refresh_seconds >= self.ttl_seconds {
            return Err(ClusterError::Invalid(format!(
                "refresh_seconds ({}) must be < ttl_seconds ({})",
                self.refresh_seconds, self.ttl_seconds
            )));
        }
        Ok(())
    }

    /// Validate the static-backend bounds described in §4.6: `0 <=
    /// static_index <= static_total - inst_workers`, `static_total >= 1`.
    pub fn validate_static_bounds(&self) -> Result<(i64, i64)> {
        let index = self.static_index.ok_or_else(|| {
            ClusterError::FatalConfig("static_index not set".to_string())
        })?;
        let total = self.static_total.ok_or_else(|| {
            ClusterError::FatalConfig("static_total not set".to_string())
        })?;
        if total < 1 {
            return Err(ClusterError::Invalid(format!(
                "static_total must be >= 1, got {total}"
            )));
        }
        if index < 0 {
            return Err(ClusterError::Invalid(format!(
                "static_index must be >= 0, got {index}"
            )));
        }
        if index + self.inst_workers as i64 > total {
            return Err(ClusterError::Invalid(format!(
                "static_index ({index}) + inst_workers ({}) exceeds static_total ({total})",
                self.inst_workers
            )));
        }
        Ok((index, total))
    }
}
