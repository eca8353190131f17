//! Shared cluster state (§4.3, C3): the fields the two control loops and
//! the lifecycle handle all touch, guarded by a single `RwLock`. Readers
//! (`index()`, `total()`, the ping loop's snapshot before a refresh) vastly
//! outnumber writers (the watch loop's balance pass), which is the same
//! read-heavy access pattern the teacher's concurrent registry is built
//! around.

use crate::assignment::Assignment;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Invoked from the watch loop with `(inst_index, inst_workers,
/// total_workers, passive)` whenever the assignment changes, and once
/// unconditionally after the first balance pass following a join (§4.7),
/// matching the ground-truth `cluster_rebalanced_()`'s `CLUSTERSTATE{index,
/// workers, total, passive}` (`examples/original_source/cluster.c:566-582`,
/// `libcluster.h:42-56`). Never called while any lock in this module is
/// held.
pub type RebalanceCallback = Arc<dyn Fn(i64, i64, i64, bool) + Send + Sync>;

/// Lifecycle phase (§4.7's state machine): `new -> joining -> joined ->
/// leaving -> gone`. `gone` instances may call `join` again, re-entering at
/// `joining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    New,
    Joining,
    Joined,
    Leaving,
    Gone,
}

/// A consistent read of every field at one instant. Matches §6's
/// `state(out)` shape: `{index, workers, total, passive}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateSnapshot {
    pub phase: Phase,
    pub inst_index: i64,
    pub inst_workers: i64,
    pub total_workers: i64,
    pub passive: bool,
}

impl StateSnapshot {
    pub fn is_joined(&self) -> bool {
        self.phase == Phase::Joined
    }
}

struct Inner {
    phase: Phase,
    inst_index: i64,
    inst_workers: i64,
    total_workers: i64,
    passive: bool,
    /// Set the first time a balance pass has completed since `joined`,
    /// per the decision to suppress the rebalance callback until then
    /// (no callback fires on an uncomputed `index == -1`).
    balanced_once: bool,
}

/// The cluster's current view of its own membership, shared between the
/// lifecycle handle and the two background loops via `Arc<ClusterState>`.
pub struct ClusterState {
    inner: RwLock<Inner>,
}

impl ClusterState {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                phase: Phase::New,
                inst_index: -1,
                inst_workers: 0,
                total_workers: 0,
                passive: false,
                balanced_once: false,
            }),
        }
    }

    pub async fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.read().await;
        StateSnapshot {
            phase: inner.phase,
            inst_index: inner.inst_index,
            inst_workers: inner.inst_workers,
            total_workers: inner.total_workers,
            passive: inner.passive,
        }
    }

    pub async fn phase(&self) -> Phase {
        self.inner.read().await.phase
    }

    pub async fn set_phase(&self, phase: Phase) {
        let mut inner = self.inner.write().await;
        inner.phase = phase;
        if phase == Phase::New || phase == Phase::Joining {
            inner.inst_index = -1;
            inner.inst_workers = 0;
            inner.total_workers = 0;
            inner.passive = false;
            inner.balanced_once = false;
        }
    }

    /// Record whether the in-flight join is passive, so `state()`'s
    /// `passive` field (§6, scenario S4) reflects it once joined. Called by
    /// the lifecycle controller right after entering [`Phase::Joining`].
    pub async fn set_passive(&self, passive: bool) {
        self.inner.write().await.passive = passive;
    }

    /// Record this instance's configured worker count, so `state()`'s
    /// `workers` field (§6 `state(out)`) reflects it once joined. Called by
    /// the lifecycle controller right after entering [`Phase::Joining`].
    pub async fn set_inst_workers(&self, inst_workers: i64) {
        self.inner.write().await.inst_workers = inst_workers;
    }

    /// Apply a freshly computed assignment. Returns `true` when either
    /// field actually changed, which the watch loop uses to decide whether
    /// the rebalance callback needs invoking.
    pub async fn apply_assignment(&self, assignment: Assignment) -> bool {
        let mut inner = self.inner.write().await;
        let changed = inner.inst_index != assignment.inst_index || inner.total_workers != assignment.total_workers;
        inner.inst_index = assignment.inst_index;
        inner.total_workers = assignment.total_workers;
        changed
    }

    /// First balance pass after joining: fire the callback once regardless
    /// of whether the assignment differs from the zeroed initial state.
    pub async fn consume_first_balance(&self) -> bool {
        let mut inner = self.inner.write().await;
        if inner.balanced_once {
            false
        } else {
            inner.balanced_once = true;
            true
        }
    }
}

impl Default for ClusterState {
    fn default() -> Self {
        Self::new()
    }
}
