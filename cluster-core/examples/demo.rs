//! Joins a statically-sized cluster (no registry configured), prints its
//! assigned worker range, and leaves.
//!
//! Run with a registry instead by setting `identity.registry_endpoint` to
//! an etcd v2-style `http://` URL or a `postgres://`/`sqlite:` DSN, and
//! dropping `static_index`/`static_total` from the config.

use anyhow::Result;
use cluster_core::{Cluster, ClusterConfig, ClusterIdentity};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    cluster_core::init_tracing();

    let identity = ClusterIdentity::new("demo-cluster")?;
    let config = ClusterConfig {
        inst_workers: 2,
        static_index: Some(0),
        static_total: Some(6),
        ..Default::default()
    };

    let cluster = Cluster::new(identity, config)?;
    cluster
        .join(Arc::new(|index, workers, total, passive| {
            println!("rebalanced: base index {index} ({workers} workers) of {total} total, passive={passive}");
        }))
        .await?;

    println!("owned worker ids: {:?}", cluster.worker_ids().await);
    cluster.leave().await?;
    Ok(())
}
