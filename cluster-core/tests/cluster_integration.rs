//! End-to-end tests against an in-memory [`RegistryAdapter`] shared by
//! several [`Cluster`] handles, simulating several processes pointed at
//! the same external registry.

use async_trait::async_trait;
use chrono::Utc;
use cluster_core::registry::{Namespace, RegistryAdapter};
use cluster_core::{Cluster, ClusterConfig, ClusterError, ClusterIdentity, MembershipRecord};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// A registry double backed by an in-process map, standing in for an
/// etcd-style directory or relational database in these tests. TTLs are
/// honored the same way the directory backend's server-side expiry would
/// be: `list` filters out anything past `expires_at`.
struct FakeAdapter {
    records: Mutex<HashMap<String, MembershipRecord>>,
    notify: Notify,
}

impl FakeAdapter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        })
    }
}

#[async_trait]
impl RegistryAdapter for FakeAdapter {
    async fn open_namespace(&self, _namespace: &Namespace) -> cluster_core::Result<()> {
        Ok(())
    }

    async fn put_with_ttl(
        &self,
        _namespace: &Namespace,
        key: &str,
        value: i64,
        ttl_seconds: u64,
        must_exist: bool,
    ) -> cluster_core::Result<()> {
        let mut records = self.records.lock().await;
        if must_exist && !records.contains_key(key) {
            return Err(ClusterError::Adapter(format!("'{key}' missing on refresh")));
        }
        records.insert(
            key.to_string(),
            MembershipRecord::new(key.to_string(), value, Utc::now(), ttl_seconds),
        );
        drop(records);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn delete(&self, _namespace: &Namespace, key: &str) -> cluster_core::Result<()> {
        self.records.lock().await.remove(key);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn list(&self, _namespace: &Namespace) -> cluster_core::Result<Vec<MembershipRecord>> {
        let now = Utc::now();
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|record| !record.is_expired(now))
            .cloned()
            .collect())
    }

    async fn wait_for_change(&self, _namespace: &Namespace) -> cluster_core::Result<()> {
        self.notify.notified().await;
        Ok(())
    }
}

fn fast_config(inst_workers: u32) -> ClusterConfig {
    ClusterConfig {
        inst_workers,
        ttl_seconds: 5,
        refresh_seconds: 1,
        ..Default::default()
    }
}

fn identity(cluster_key: &str) -> ClusterIdentity {
    let mut identity = ClusterIdentity::new(cluster_key).unwrap();
    identity.registry_endpoint = Some("fake://unused".to_string());
    identity
}

/// Poll `predicate` until it holds or the deadline passes, to avoid a
/// fixed sleep racing the watch loop's own poll cadence.
async fn wait_until<F, Fut>(mut predicate: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if predicate().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition did not converge in time");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn two_instances_partition_contiguously_and_fire_the_join_callback() {
    let adapter = FakeAdapter::new();
    let logger = Arc::new(cluster_core::StderrLogger);

    let cluster_a = Cluster::with_adapter(identity("orders"), fast_config(2), logger.clone(), adapter.clone()).unwrap();
    let callback_calls_a = Arc::new(AtomicUsize::new(0));
    let calls_a = callback_calls_a.clone();
    cluster_a
        .join(Arc::new(move |_, _, _, _| {
            calls_a.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();

    assert!(callback_calls_a.load(Ordering::SeqCst) >= 1, "callback must fire at least once on join");

    let cluster_b = Cluster::with_adapter(identity("orders"), fast_config(3), logger, adapter.clone()).unwrap();
    cluster_b.join(Arc::new(|_, _, _, _| {})).await.unwrap();

    wait_until(|| async { cluster_a.total().await.unwrap_or(0) == 5 && cluster_b.total().await.unwrap_or(0) == 5 }).await;

    let a_index = cluster_a.index().await;
    let b_index = cluster_b.index().await;
    assert_ne!(a_index, -1);
    assert_ne!(b_index, -1);

    let mut ranges = vec![
        (a_index, a_index + 2),
        (b_index, b_index + 3),
    ];
    ranges.sort();
    assert_eq!(ranges[0].1, ranges[1].0, "ranges must be contiguous with no gap");
    assert_eq!(ranges[1].1, 5, "ranges must cover the full total");

    cluster_a.leave().await.unwrap();
    cluster_b.leave().await.unwrap();
}

#[tokio::test]
async fn passive_join_observes_totals_but_never_claims_an_index() {
    let adapter = FakeAdapter::new();
    let logger = Arc::new(cluster_core::StderrLogger);

    let active = Cluster::with_adapter(identity("orders"), fast_config(4), logger.clone(), adapter.clone()).unwrap();
    active.join(Arc::new(|_, _, _, _| {})).await.unwrap();

    let observer = Cluster::with_adapter(identity("orders"), fast_config(1), logger, adapter).unwrap();
    observer.join_passive(Arc::new(|_, _, _, _| {})).await.unwrap();

    wait_until(|| async { observer.total().await.unwrap_or(0) == 4 }).await;
    assert_eq!(observer.index().await, -1);
    assert!(observer.worker_ids().await.is_empty());
    assert!(observer.state().await.unwrap().passive);

    active.leave().await.unwrap();
    observer.leave().await.unwrap();
}

#[tokio::test]
async fn departure_is_observed_and_the_remaining_member_absorbs_the_full_total() {
    let adapter = FakeAdapter::new();
    let logger = Arc::new(cluster_core::StderrLogger);

    let cluster_a = Cluster::with_adapter(identity("orders"), fast_config(2), logger.clone(), adapter.clone()).unwrap();
    cluster_a.join(Arc::new(|_, _, _, _| {})).await.unwrap();

    let cluster_b = Cluster::with_adapter(identity("orders"), fast_config(3), logger, adapter).unwrap();
    cluster_b.join(Arc::new(|_, _, _, _| {})).await.unwrap();

    wait_until(|| async { cluster_a.total().await.unwrap_or(0) == 5 }).await;

    cluster_b.leave().await.unwrap();

    wait_until(|| async { cluster_a.total().await.unwrap_or(0) == 2 }).await;
    assert_eq!(cluster_a.index().await, 0);

    cluster_a.leave().await.unwrap();
}

#[tokio::test]
async fn join_is_busy_while_already_joined_and_leave_is_not_joined_before_join() {
    let adapter = FakeAdapter::new();
    let logger = Arc::new(cluster_core::StderrLogger);
    let cluster = Cluster::with_adapter(identity("orders"), fast_config(1), logger, adapter).unwrap();

    cluster.leave().await.unwrap();

    cluster.join(Arc::new(|_, _, _, _| {})).await.unwrap();
    assert!(matches!(cluster.join(Arc::new(|_, _, _, _| {})).await, Err(ClusterError::Busy)));

    cluster.leave().await.unwrap();
}
