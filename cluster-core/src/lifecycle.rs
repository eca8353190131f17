//! The Lifecycle Controller (§4.7, C7): the public handle a host embeds.
//! Owns identity, configuration, shared state, and -- once joined -- the
//! background loops and the adapter they run against.
//!
//! State machine: `new -> joining -> joined -> leaving -> gone`, with
//! `gone` instances free to call `join`/`join_passive` again, re-entering
//! at `joining`. Configuration may only change outside `joined`/`joining`
//! (§6, `Busy`).

use crate::assignment::Assignment;
use crate::config::{ClusterConfig, ForkMode};
use crate::error::{ClusterError, Result};
use crate::fork::{self, ForkSide};
use crate::identity::{self, ClusterIdentity};
use crate::logger::{Logger, StderrLogger};
use crate::loops::{ping, watch, LoopHandles};
use crate::registry::{self, Backend, Namespace, RegistryAdapter};
use crate::state::{ClusterState, Phase, RebalanceCallback, StateSnapshot};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// A joined cluster membership, driving one Ping Loop and one Watch Loop
/// against a single registry namespace.
pub struct Cluster {
    identity: Mutex<ClusterIdentity>,
    config: Mutex<ClusterConfig>,
    /// A plain `std::sync::Mutex` rather than `tokio::sync::Mutex`: swapping
    /// the `Arc` is never held across an `.await`, and it must stay
    /// lock-free of the async runtime so `handle_fork` can replace it in the
    /// child without ever awaiting anything that might already be stuck
    /// (see `handle_fork`).
    state: std::sync::Mutex<Arc<ClusterState>>,
    logger: Mutex<Arc<dyn Logger>>,
    loops: Mutex<Option<LoopHandles>>,
    adapter: Mutex<Option<Arc<dyn RegistryAdapter>>>,
    /// Bypasses `registry_endpoint` URI-scheme selection when set, so a
    /// host (or a test) can supply any [`RegistryAdapter`] directly.
    preconfigured_adapter: Option<Arc<dyn RegistryAdapter>>,
}

impl Cluster {
    /// Build a handle with the default [`StderrLogger`].
    pub fn new(identity: ClusterIdentity, config: ClusterConfig) -> Result<Arc<Self>> {
        Self::with_logger(identity, config, Arc::new(StderrLogger))
    }

    pub fn with_logger(identity: ClusterIdentity, config: ClusterConfig, logger: Arc<dyn Logger>) -> Result<Arc<Self>> {
        Self::build(identity, config, logger, None)
    }

    /// Build a handle wired directly to `adapter`, skipping
    /// `registry_endpoint` URI-scheme selection. For registries without a
    /// `http(s)://`/SQL-DSN transport (e.g. an in-process test double, or
    /// a coordination service not covered by the two built-in backends).
    pub fn with_adapter(
        identity: ClusterIdentity,
        config: ClusterConfig,
        logger: Arc<dyn Logger>,
        adapter: Arc<dyn RegistryAdapter>,
    ) -> Result<Arc<Self>> {
        Self::build(identity, config, logger, Some(adapter))
    }

    fn build(
        identity: ClusterIdentity,
        config: ClusterConfig,
        logger: Arc<dyn Logger>,
        preconfigured_adapter: Option<Arc<dyn RegistryAdapter>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            identity: Mutex::new(identity),
            config: Mutex::new(config),
            state: std::sync::Mutex::new(Arc::new(ClusterState::new())),
            logger: Mutex::new(logger),
            loops: Mutex::new(None),
            adapter: Mutex::new(None),
            preconfigured_adapter,
        }))
    }

    /// The current shared state handle. A cheap, never-awaited pointer
    /// clone -- the lock only ever guards swapping the `Arc` itself
    /// (`handle_fork`), never the state it points to.
    fn state_handle(&self) -> Arc<ClusterState> {
        self.state.lock().expect("cluster state mutex poisoned").clone()
    }

    pub async fn identity(&self) -> ClusterIdentity {
        self.identity.lock().await.clone()
    }

    pub async fn config(&self) -> ClusterConfig {
        self.config.lock().await.clone()
    }

    async fn require_not_joined(&self) -> Result<()> {
        let phase = self.state_handle().phase().await;
        if phase == Phase::Joined || phase == Phase::Joining {
            return Err(ClusterError::Busy);
        }
        Ok(())
    }

    /// Replace the configuration wholesale. Rejected while joined/joining
    /// (§6: `Busy`).
    pub async fn set_config(&self, config: ClusterConfig) -> Result<()> {
        self.require_not_joined().await?;
        config.validate()?;
        *self.config.lock().await = config;
        Ok(())
    }

    /// §6 `set_env`: change the environment sub-scope. Rejected while
    /// joined/joining.
    pub async fn set_environment(&self, environment: impl Into<String>) -> Result<()> {
        self.require_not_joined().await?;
        let environment = environment.into();
        identity::validate_token("environment", &environment)?;
        self.identity.lock().await.environment = environment;
        Ok(())
    }

    /// §6 `set_instance`: override the generated instance id.
    pub async fn set_instance(&self, instance_id: impl Into<String>) -> Result<()> {
        self.require_not_joined().await?;
        let instance_id = instance_id.into();
        identity::validate_token("instance_id", &instance_id)?;
        self.identity.lock().await.instance_id = instance_id;
        Ok(())
    }

    /// §6 `set_partition`: nest the membership namespace one level deeper.
    pub async fn set_partition(&self, partition: Option<String>) -> Result<()> {
        self.require_not_joined().await?;
        if let Some(partition) = &partition {
            identity::validate_token("partition", partition)?;
        }
        self.identity.lock().await.partition = partition;
        Ok(())
    }

    /// §6 `set_registry`: select the backing registry endpoint (and hence
    /// the back-end) at the next `join`.
    pub async fn set_registry(&self, registry_endpoint: Option<String>) -> Result<()> {
        self.require_not_joined().await?;
        self.identity.lock().await.registry_endpoint = registry_endpoint;
        Ok(())
    }

    /// §6 `set_workers`: how many worker slots this instance contributes.
    pub async fn set_workers(&self, inst_workers: u32) -> Result<()> {
        self.require_not_joined().await?;
        let mut config = self.config.lock().await;
        let candidate = ClusterConfig { inst_workers, ..config.clone() };
        candidate.validate()?;
        config.inst_workers = inst_workers;
        Ok(())
    }

    /// §6 `set_fork`: how fork hooks behave around `fork()`.
    pub async fn set_fork(&self, fork_mode: ForkMode) -> Result<()> {
        self.require_not_joined().await?;
        self.config.lock().await.fork_mode = fork_mode;
        Ok(())
    }

    /// §6 `static_set_index`/`static_set_total`: static back-end bounds.
    /// Value range is checked at `join`, not here, since `inst_workers` may
    /// still change before then.
    pub async fn static_set_index(&self, static_index: i64) -> Result<()> {
        self.require_not_joined().await?;
        if static_index < 0 {
            return Err(ClusterError::Invalid(format!(
                "static_index must be >= 0, got {static_index}"
            )));
        }
        self.config.lock().await.static_index = Some(static_index);
        Ok(())
    }

    pub async fn static_set_total(&self, static_total: i64) -> Result<()> {
        self.require_not_joined().await?;
        if static_total < 1 {
            return Err(ClusterError::Invalid(format!(
                "static_total must be >= 1, got {static_total}"
            )));
        }
        self.config.lock().await.static_total = Some(static_total);
        Ok(())
    }

    /// §6 `set_verbose`: may be toggled at any time.
    pub async fn set_verbose(&self, verbose: bool) {
        self.config.lock().await.verbose = verbose;
    }

    /// §6 `set_logger`: may be replaced at any time, including while
    /// joined -- the two loops read the logger through this same `Mutex`
    /// on every log call, so a swap takes effect on their next message.
    pub async fn set_logger(&self, logger: Arc<dyn Logger>) {
        *self.logger.lock().await = logger;
    }

    pub async fn phase(&self) -> Phase {
        self.state_handle().phase().await
    }

    /// §6 `state(out)`: a consistent snapshot of `{index, workers, total,
    /// passive}`. Errors with `NotJoined` outside `joined`, matching the
    /// precondition in the operations table.
    pub async fn state(&self) -> Result<StateSnapshot> {
        if self.state_handle().phase().await != Phase::Joined {
            return Err(ClusterError::NotJoined);
        }
        Ok(self.state_handle().snapshot().await)
    }

    /// Base of this instance's assigned worker range, or `-1` if
    /// unjoined, passive, or not yet balanced. A convenience accessor over
    /// the stricter [`Cluster::state`]; never errors.
    pub async fn index(&self) -> i64 {
        self.state_handle().snapshot().await.inst_index
    }

    /// §6 `index(worker_ordinal)`: the global id of the `worker_ordinal`-th
    /// worker this instance owns (`inst_index + worker_ordinal`).
    pub async fn index_of(&self, worker_ordinal: i64) -> Result<i64> {
        if self.state_handle().phase().await != Phase::Joined {
            return Err(ClusterError::NotJoined);
        }
        let base = self.state_handle().snapshot().await.inst_index;
        Ok(base + worker_ordinal)
    }

    /// §6 `total()`: cluster-wide worker total across every live,
    /// non-passive member. Errors with `NotJoined` outside `joined`,
    /// matching the precondition in the operations table.
    pub async fn total(&self) -> Result<i64> {
        if self.state_handle().phase().await != Phase::Joined {
            return Err(ClusterError::NotJoined);
        }
        Ok(self.state_handle().snapshot().await.total_workers)
    }

    /// §6 `workers()`: how many worker slots this instance itself
    /// contributes (the original's `cluster_workers()`,
    /// `examples/original_source/cluster.c:345-354`). Errors with
    /// `NotJoined` outside `joined`.
    pub async fn workers(&self) -> Result<i64> {
        if self.state_handle().phase().await != Phase::Joined {
            return Err(ClusterError::NotJoined);
        }
        Ok(self.state_handle().snapshot().await.inst_workers)
    }

    /// The global worker ids this instance currently owns:
    /// `[index, index + inst_workers)`. Empty before balance, or while
    /// passive/unjoined. A convenience helper alongside [`Cluster::workers`];
    /// never errors.
    pub async fn worker_ids(&self) -> Vec<i64> {
        let snapshot = self.state_handle().snapshot().await;
        if snapshot.inst_index < 0 {
            return Vec::new();
        }
        let inst_workers = self.config.lock().await.inst_workers as i64;
        (snapshot.inst_index..snapshot.inst_index + inst_workers).collect()
    }

    /// Join as a full participant: claims a worker range and publishes a
    /// heartbeat. `callback` fires once the first balance pass completes
    /// and again on every subsequent assignment change.
    pub async fn join(self: &Arc<Self>, callback: RebalanceCallback) -> Result<()> {
        self.join_inner(false, callback).await
    }

    /// Join for observation only: no worker range is claimed and no
    /// heartbeat is published, but `total()`/`workers()` reflect the rest
    /// of the cluster as it changes. `callback` still fires once the first
    /// balance pass completes and again on every subsequent change to the
    /// cluster's total, exactly as a full join does (§4.7, Testable
    /// Property 4) -- only the instance's own claimed range differs.
    pub async fn join_passive(self: &Arc<Self>, callback: RebalanceCallback) -> Result<()> {
        self.join_inner(true, callback).await
    }

    async fn join_inner(self: &Arc<Self>, passive: bool, callback: RebalanceCallback) -> Result<()> {
        let phase = self.state_handle().phase().await;
        if phase == Phase::Joined || phase == Phase::Joining {
            return Err(ClusterError::Busy);
        }

        let mut config = self.config.lock().await.clone();
        config.passive = passive;
        config.validate()?;

        let identity = self.identity.lock().await.clone();
        let namespace = Namespace::new(
            identity.cluster_key.clone(),
            identity.partition.clone(),
            identity.environment.clone(),
        );

        self.state_handle().set_phase(Phase::Joining).await;
        self.state_handle().set_passive(passive).await;
        self.state_handle().set_inst_workers(config.inst_workers as i64).await;
        fork::arm();

        let adapter = if let Some(adapter) = &self.preconfigured_adapter {
            Some(adapter.clone())
        } else if identity.registry_endpoint.is_some() {
            let backend = registry::select_backend(identity.registry_endpoint.as_deref())?;
            let Backend::Dynamic(adapter) = backend else {
                unreachable!("a Some(registry_endpoint) always selects a Dynamic backend")
            };
            Some(adapter)
        } else {
            None
        };

        let Some(adapter) = adapter else {
            let result = self.join_static(&config, callback).await;
            if result.is_ok() {
                *self.config.lock().await = config;
            } else {
                self.state_handle().set_phase(Phase::New).await;
            }
            return result;
        };
        if let Err(err) = adapter.open_namespace(&namespace).await {
            self.state_handle().set_phase(Phase::New).await;
            return Err(err);
        }

        // §4.4 step 3 / §7: the first ping is attempted once, synchronously,
        // and any failure surfaces straight out of `join` rather than being
        // swallowed by the steady-state loop's retry-and-log behaviour.
        if let Err(err) = ping::initial_register(&adapter, &namespace, &identity.instance_id, &config).await {
            self.state_handle().set_phase(Phase::New).await;
            return Err(err);
        }

        let logger = self.logger.lock().await.clone();
        let state = self.state_handle();

        // §4.5 "Initial balance": one synchronous pass after the first ping
        // and before the loops start, so the rebalance callback is
        // guaranteed to have fired at least once by the time `join` returns
        // (Testable Property 4), rather than racing the watch loop's own
        // first iteration.
        watch::balance_once(
            &adapter,
            &namespace,
            &identity.instance_id,
            &config,
            &state,
            &callback,
            &logger,
        )
        .await;

        let cancel = CancellationToken::new();

        let ping_handle = tokio::spawn(ping::run(
            adapter.clone(),
            namespace.clone(),
            identity.instance_id.clone(),
            config.clone(),
            logger.clone(),
            cancel.clone(),
        ));

        let watch_handle = tokio::spawn(watch::run(
            adapter.clone(),
            namespace.clone(),
            identity.instance_id.clone(),
            config.clone(),
            state,
            callback,
            logger,
            cancel.clone(),
        ));

        *self.adapter.lock().await = Some(adapter);
        *self.loops.lock().await = Some(LoopHandles::new(cancel, ping_handle, watch_handle));
        *self.config.lock().await = config;
        self.state_handle().set_phase(Phase::Joined).await;
        Ok(())
    }

    async fn join_static(&self, config: &ClusterConfig, callback: RebalanceCallback) -> Result<()> {
        let (index, total) = config.validate_static_bounds()?;
        let inst_index = if config.passive { -1 } else { index };
        self.state_handle()
            .apply_assignment(Assignment { inst_index, total_workers: total })
            .await;
        self.state_handle().consume_first_balance().await;
        callback(inst_index, config.inst_workers as i64, total, config.passive);
        self.state_handle().set_phase(Phase::Joined).await;
        Ok(())
    }

    /// Leave the cluster: stops both loops (bounded by `ttl_seconds`),
    /// deletes this instance's record from a dynamic backend, and returns
    /// to `gone`. Idempotent (§6, Testable Property 5): calling `leave`
    /// again on a handle that is not currently `joined` is a no-op rather
    /// than an error -- `destroy` always implicitly `leave`s, so it must
    /// be safe to call on a handle that never joined at all.
    pub async fn leave(&self) -> Result<()> {
        let phase = self.state_handle().phase().await;
        if phase != Phase::Joined {
            return Ok(());
        }
        self.state_handle().set_phase(Phase::Leaving).await;

        let ttl_seconds = self.config.lock().await.ttl_seconds;
        if let Some(loops) = self.loops.lock().await.take() {
            loops.shutdown(ttl_seconds).await;
        }

        if let Some(adapter) = self.adapter.lock().await.take() {
            let identity = self.identity.lock().await.clone();
            let namespace = Namespace::new(
                identity.cluster_key.clone(),
                identity.partition.clone(),
                identity.environment.clone(),
            );
            let _ = adapter.delete(&namespace, &identity.instance_id).await;
        }

        self.state_handle().set_phase(Phase::Gone).await;
        Ok(())
    }

    /// §6 `destroy(h)`: `leave`, then free. In Rust the "free" half is just
    /// dropping the last `Arc`, so this consumes the handle and leaves
    /// first; the caller should drop their clones of the `Arc` afterwards.
    pub async fn destroy(self: Arc<Self>) -> Result<()> {
        self.leave().await
    }

    /// Act on a `fork()` this handle may have just been carried across.
    /// Call this once, right after the host's `fork()` call returns, in
    /// both the parent and the child.
    ///
    /// A `fork()` with threads only carries the calling thread into the
    /// child -- every other thread, including whichever Tokio worker was
    /// driving the ping/watch loops, simply does not exist there anymore.
    /// If one of them held `ClusterState`'s write lock (or the `loops`/
    /// `adapter` mutexes) at the instant of `fork()`, that lock is stuck
    /// forever in the child: nothing will ever release it. So on the child
    /// side this never touches the old locks at all -- `state` is replaced
    /// outright with a freshly constructed `ClusterState` (a plain
    /// synchronous swap, not an await on the old one), and `loops`/
    /// `adapter` are cleared with a non-blocking `try_lock` best effort
    /// rather than `.lock().await`, which could hang on exactly the same
    /// stuck lock. The parent side needs none of this: `fork()` leaves the
    /// parent's own threads and locks untouched.
    ///
    /// The child side always ends this call at [`Phase::New`] (never
    /// `Joined`): its ping/watch tasks are gone along with the threads that
    /// ran them, so membership there always needs a fresh `join`/
    /// `join_passive` call to actually resume -- `handle_fork` only decides
    /// what that next call should look like. When `fork_mode` says this
    /// side should not keep membership at all, it moves to [`Phase::Gone`]
    /// instead. Either way, the host is expected to build a fresh
    /// [`ClusterIdentity`] (see [`ClusterIdentity::regenerate_instance_id`],
    /// applied automatically here for `ForkMode::Both`'s child) and call
    /// `join` again to rejoin. The parent side, by contrast, never loses its
    /// threads or locks to `fork()`, so a parent kept by `fork_mode` is left
    /// running exactly as it was, still `Joined`, with no action needed. A
    /// no-op when no fork has happened since the last call.
    pub async fn handle_fork(self: &Arc<Self>) -> Result<()> {
        let Some(side) = fork::take_pending() else {
            return Ok(());
        };

        if side == ForkSide::Child {
            *self.state.lock().expect("cluster state mutex poisoned") = Arc::new(ClusterState::new());
            if let Ok(mut loops) = self.loops.try_lock() {
                *loops = None;
            }
            if let Ok(mut adapter) = self.adapter.try_lock() {
                *adapter = None;
            }
        }

        let mode = self.config.lock().await.fork_mode;
        let should_drop = matches!(
            (mode, side),
            (ForkMode::ChildOnly, ForkSide::Parent) | (ForkMode::ParentOnly, ForkSide::Child)
        );
        if should_drop {
            *self.loops.lock().await = None;
            *self.adapter.lock().await = None;
            self.state_handle().set_phase(Phase::Gone).await;
        }
        if mode == ForkMode::Both && side == ForkSide::Child {
            self.identity.lock().await.regenerate_instance_id();
        }
        Ok(())
    }
}
