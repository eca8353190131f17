//! The two background control loops (§4.4, §4.5, C4/C5) and the handle
//! that owns their cancellation and shutdown.

pub mod ping;
pub mod watch;

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Join handles for both loops plus the token that stops them. Dropping
/// this without calling [`LoopHandles::shutdown`] leaves the tasks
/// running detached -- always shut down explicitly from `leave`.
pub struct LoopHandles {
    cancel: CancellationToken,
    ping: JoinHandle<()>,
    watch: JoinHandle<()>,
}

impl LoopHandles {
    pub fn new(cancel: CancellationToken, ping: JoinHandle<()>, watch: JoinHandle<()>) -> Self {
        Self { cancel, ping, watch }
    }

    /// Signal cancellation and wait for both loops to notice, bounded by
    /// `ttl_seconds` so `leave` never blocks indefinitely on a wedged
    /// registry call (§4.6).
    pub async fn shutdown(self, ttl_seconds: u64) {
        self.cancel.cancel();
        let bound = Duration::from_secs(ttl_seconds.max(1));
        let joined = tokio::time::timeout(bound, async {
            let _ = self.ping.await;
            let _ = self.watch.await;
        })
        .await;
        if joined.is_err() {
            self.ping.abort();
            self.watch.abort();
        }
    }
}
