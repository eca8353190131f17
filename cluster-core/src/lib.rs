//! Cluster membership and worker-index allocation over a pluggable
//! external registry.
//!
//! A joined [`Cluster`] publishes a heartbeat record of its own worker
//! count to a registry (an etcd-style directory service, a relational
//! database, or nothing at all for a statically-sized deployment), and in
//! return learns a contiguous, disjoint range of worker indices carved out
//! of every live member's published count -- sorted by instance id so
//! every member computes the same partition independently, with no
//! leader election and no cross-member RPC (§4.3, `assignment::assign`).
//!
//! ```no_run
//! use std::sync::Arc;
//! use cluster_core::{ClusterConfig, ClusterIdentity, Cluster};
//!
//! # async fn example() -> cluster_core::Result<()> {
//! let mut identity = ClusterIdentity::new("orders")?;
//! identity.registry_endpoint = Some("http://localhost:2379".to_string());
//!
//! let cluster = Cluster::new(identity, ClusterConfig::default())?;
//! cluster.join(Arc::new(|index, workers, total, passive| {
//!     println!("assigned base index {index} ({workers} workers) of {total} total, passive={passive}");
//! })).await?;
//!
//! let _ = cluster.worker_ids().await;
//! cluster.leave().await?;
//! # Ok(())
//! # }
//! ```

pub mod assignment;
pub mod config;
pub mod error;
pub mod fork;
pub mod identity;
pub mod lifecycle;
pub mod logger;
pub mod loops;
pub mod record;
pub mod registry;
pub mod state;

pub use config::{ClusterConfig, ForkMode};
pub use error::{ClusterError, Result};
pub use fork::ForkSide;
pub use identity::ClusterIdentity;
pub use lifecycle::Cluster;
pub use logger::{Logger, Priority, StderrLogger, TracingLogger};
pub use record::MembershipRecord;
pub use state::{Phase, RebalanceCallback, StateSnapshot};

/// Install a `tracing` subscriber reading `RUST_LOG` (default `info`),
/// matching the default [`TracingLogger`] wiring. Optional: hosts that
/// already run their own `tracing` subscriber should skip this and just
/// construct a [`Cluster`] with `Cluster::with_logger`.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
