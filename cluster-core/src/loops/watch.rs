//! The Watch/Balance Loop (§4.5, C5): observes the registry snapshot,
//! recomputes this instance's assignment (C6), and invokes the rebalance
//! callback when the assignment changes or on the first pass after join.

use crate::assignment::assign;
use crate::config::ClusterConfig;
use crate::logger::{Logger, Priority};
use crate::registry::{Namespace, RegistryAdapter};
use crate::state::{ClusterState, RebalanceCallback};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// List the namespace, recompute the assignment, and fire the rebalance
/// callback if it changed (or this is the first pass after join). Called
/// once, synchronously, by the Lifecycle Controller before the loops are
/// spawned, and then again at the top of every `run` iteration.
pub async fn balance_once(
    adapter: &Arc<dyn RegistryAdapter>,
    namespace: &Namespace,
    instance_id: &str,
    config: &ClusterConfig,
    state: &ClusterState,
    callback: &RebalanceCallback,
    logger: &Arc<dyn Logger>,
) {
    let snapshot = match adapter.list(namespace).await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            logger.log(Priority::Err, &format!("balance pass failed to list namespace: {err}"));
            Vec::new()
        }
    };

    let assignment = assign(&snapshot, instance_id, config.passive);
    let changed = state.apply_assignment(assignment).await;
    let first_pass = state.consume_first_balance().await;

    if changed || first_pass {
        // Invoked with no lock held, per the rebalance contract.
        callback(assignment.inst_index, config.inst_workers as i64, assignment.total_workers, config.passive);
    }
}

pub async fn run(
    adapter: Arc<dyn RegistryAdapter>,
    namespace: Namespace,
    instance_id: String,
    config: ClusterConfig,
    state: Arc<ClusterState>,
    callback: RebalanceCallback,
    logger: Arc<dyn Logger>,
    cancel: CancellationToken,
) {
    loop {
        let wait = tokio::time::timeout(
            Duration::from_secs(config.ttl_seconds.max(1)),
            adapter.wait_for_change(&namespace),
        );

        let mut backoff_on_error = false;
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = wait => {
                if let Ok(Err(err)) = result {
                    logger.log(Priority::Warning, &format!("watch for changes failed, will retry: {err}"));
                    backoff_on_error = true;
                }
                // A timed-out wait is treated like an observed change: it
                // forces a fresh list + assign pass, which is how a
                // silently expired peer gets noticed even without a push
                // notification (§4.5 step 6).
            }
        }

        if backoff_on_error {
            // §4.5 step 3: "On error: log at warning level, sleep 30 s,
            // continue" -- without this a registry outage spins the loop
            // with zero backoff instead of easing off.
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(30)) => {}
            }
        }

        balance_once(&adapter, &namespace, &instance_id, &config, &state, &callback, &logger).await;
    }
}
