//! The Ping Loop (§4.4, C4): keeps this instance's membership record
//! alive by refreshing its TTL every `refresh_seconds`, and re-registers
//! if a refresh discovers the record was evicted (the registry's TTL
//! elapsed without a timely refresh, e.g. after a long GC pause or a
//! network partition).

use crate::config::ClusterConfig;
use crate::error::Result;
use crate::logger::{Logger, Priority};
use crate::registry::{Namespace, RegistryAdapter};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Backoff between retries after a failed refresh (§4.4 step 5).
const RETRY_BACKOFF_SECONDS: u64 = 5;

/// The first ping, attempted exactly once, synchronously, by the
/// Lifecycle Controller before the loops are spawned (§4.5 "Initial
/// balance"). A no-op for a passive join, which never publishes a record
/// for itself. Unlike a steady-state refresh failure, this one is not
/// retried here -- §7 surfaces any `join`-time adapter error as fatal, so
/// the caller decides whether to abort the join.
pub async fn initial_register(
    adapter: &Arc<dyn RegistryAdapter>,
    namespace: &Namespace,
    instance_id: &str,
    config: &ClusterConfig,
) -> Result<()> {
    if config.passive {
        return Ok(());
    }
    adapter
        .put_with_ttl(namespace, instance_id, config.inst_workers as i64, config.ttl_seconds, false)
        .await
}

pub async fn run(
    adapter: Arc<dyn RegistryAdapter>,
    namespace: Namespace,
    instance_id: String,
    config: ClusterConfig,
    logger: Arc<dyn Logger>,
    cancel: CancellationToken,
) {
    if config.passive {
        // A passive instance observes the cluster but never publishes a
        // record for itself, so there is nothing to refresh (§4.4 note).
        cancel.cancelled().await;
        return;
    }

    let interval = Duration::from_secs(config.refresh_seconds);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }

        let refreshed = adapter
            .put_with_ttl(&namespace, &instance_id, config.inst_workers as i64, config.ttl_seconds, true)
            .await;

        if let Err(err) = refreshed {
            logger.log(
                Priority::Err,
                &format!("heartbeat refresh for '{instance_id}' failed ({err}); re-registering"),
            );
            // A failed refresh means the record may have been evicted
            // (TTL elapsed) or the registry is transiently unreachable;
            // either way fall back to an unconditional put and keep
            // retrying on a short backoff rather than leaving the cluster
            // on a single failure (§4.4 step 5).
            if !retry_until_cancelled(
                &adapter,
                &namespace,
                &instance_id,
                &config,
                false,
                &logger,
                &cancel,
                "re-registration",
            )
            .await
            {
                return;
            }
        }
    }
}

/// Retry `put_with_ttl` every [`RETRY_BACKOFF_SECONDS`] until it succeeds
/// or `cancel` fires. Returns `false` when cancellation won the race.
#[allow(clippy::too_many_arguments)]
async fn retry_until_cancelled(
    adapter: &Arc<dyn RegistryAdapter>,
    namespace: &Namespace,
    instance_id: &str,
    config: &ClusterConfig,
    must_exist: bool,
    logger: &Arc<dyn Logger>,
    cancel: &CancellationToken,
    what: &str,
) -> bool {
    loop {
        let result = adapter
            .put_with_ttl(namespace, instance_id, config.inst_workers as i64, config.ttl_seconds, must_exist)
            .await;
        match result {
            Ok(()) => return true,
            Err(err) => {
                logger.log(Priority::Err, &format!("{what} for '{instance_id}' failed: {err}"));
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    _ = tokio::time::sleep(Duration::from_secs(RETRY_BACKOFF_SECONDS)) => {}
                }
            }
        }
    }
}
