//! Provisioner — drives clusters from request to a terminal state.
//!
//! A request reserves a block, stores a `Provisioning` descriptor and spawns
//! a detached task that launches the services and observes readiness until
//! the cluster is `Ready` or `Failed`. Polls only read the registry, except
//! that a descriptor past its deadline is failed on the spot.
//!
//! All writes for one namespace happen under that namespace's async lock;
//! unrelated namespaces never wait on each other. On failure the order is
//! always: stop processes, release the block, then record `Failed`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use nsgrid_core::{PortBlock, is_default_namespace, validate_namespace};
use nsgrid_health::{ProbeTarget, ReadinessAggregator};
use nsgrid_ports::PortAllocator;
use nsgrid_state::{
    ApiKeyRecord, ClusterDescriptor, ComponentReadiness, ProvisioningState, StateStore,
};
use nsgrid_supervisor::{ClusterHandle, Supervisor};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ProvisionError, ProvisionResult};
use crate::keys::KeyIssuer;
use crate::machine::{ProvisionEvent, apply, transition};

/// Provisioning timing knobs.
#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    /// Time from kickoff after which an unready cluster is failed.
    pub deadline: Duration,
    /// Pause between readiness observations.
    pub probe_interval: Duration,
    /// Host the services bind to and are probed on.
    pub host: String,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(600),
            probe_interval: Duration::from_secs(2),
            host: "127.0.0.1".to_string(),
        }
    }
}

/// What a provisioning request found or started.
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionOutcome {
    /// The default namespace: served by the shared cluster.
    Shared,
    /// The namespace's cluster is ready.
    Ready(ClusterDescriptor),
    /// An attempt is already running.
    InFlight(ClusterDescriptor),
    /// This request kicked off a new attempt.
    Started(ClusterDescriptor),
}

/// Background task of one attempt.
struct AttemptTask {
    cluster_id: String,
    abort: AbortHandle,
}

#[derive(Clone)]
pub struct Provisioner {
    registry: StateStore,
    ports: Arc<PortAllocator>,
    supervisor: Arc<Supervisor>,
    readiness: Arc<ReadinessAggregator>,
    settings: Arc<ProvisionSettings>,
    /// Per-namespace write locks.
    locks: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
    /// Running attempts: namespace → task.
    tasks: Arc<Mutex<HashMap<String, AttemptTask>>>,
}

impl Provisioner {
    pub fn new(
        registry: StateStore,
        ports: Arc<PortAllocator>,
        supervisor: Arc<Supervisor>,
        readiness: ReadinessAggregator,
        settings: ProvisionSettings,
    ) -> Self {
        Self {
            registry,
            ports,
            supervisor,
            readiness: Arc::new(readiness),
            settings: Arc::new(settings),
            locks: Arc::new(Mutex::new(HashMap::new())),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &StateStore {
        &self.registry
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    async fn lock_namespace(&self, namespace: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(namespace.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// Make sure `namespace` has (or is getting) a cluster.
    ///
    /// Never waits for readiness: a new attempt returns as soon as the block
    /// is reserved and the launch task is spawned.
    pub async fn ensure_cluster(&self, namespace: &str) -> ProvisionResult<ProvisionOutcome> {
        validate_namespace(namespace)?;
        if is_default_namespace(namespace) {
            return Ok(ProvisionOutcome::Shared);
        }

        let _guard = self.lock_namespace(namespace).await;

        let previous = match self.registry.get_cluster(namespace)? {
            Some(cluster) if cluster.state == ProvisioningState::Ready => {
                return Ok(ProvisionOutcome::Ready(cluster));
            }
            Some(cluster) if cluster.state == ProvisioningState::Provisioning => {
                if !cluster.deadline_elapsed(now_ms()) {
                    return Ok(ProvisionOutcome::InFlight(cluster));
                }
                Some(self.expire_locked(cluster)?)
            }
            other => other,
        };

        let cluster = self.start_attempt(namespace, previous)?;
        Ok(ProvisionOutcome::Started(cluster))
    }

    /// Issue `wallet`'s key for `namespace` if the namespace is servable.
    ///
    /// Runs under the namespace lock, so a deprovision cannot slip in between
    /// the readiness check and the insert and leave a key behind.
    pub async fn issue_key(
        &self,
        keys: &KeyIssuer,
        namespace: &str,
        wallet: &str,
    ) -> ProvisionResult<ApiKeyRecord> {
        validate_namespace(namespace)?;
        if is_default_namespace(namespace) {
            return keys.issue(namespace, wallet);
        }

        let _guard = self.lock_namespace(namespace).await;
        match self.registry.get_cluster(namespace)? {
            Some(cluster) if cluster.state == ProvisioningState::Ready => {
                keys.issue(namespace, wallet)
            }
            Some(cluster) => Err(ProvisionError::NotReady {
                namespace: namespace.to_string(),
                state: cluster.state,
            }),
            None => Err(ProvisionError::UnknownCluster(namespace.to_string())),
        }
    }

    /// Reserve a block, store the new descriptor and spawn the attempt.
    /// Caller holds the namespace lock.
    fn start_attempt(
        &self,
        namespace: &str,
        previous: Option<ClusterDescriptor>,
    ) -> ProvisionResult<ClusterDescriptor> {
        let (state, attempt) = match &previous {
            Some(prev) => {
                // A failed attempt has already released its block; this
                // covers a descriptor that failed without doing so.
                if let Some(stale) = self.ports.release(namespace) {
                    warn!(%namespace, slot = stale.slot, "released stale port block before retry");
                }
                (
                    transition(prev.state, &ProvisionEvent::Retry)?,
                    prev.attempt + 1,
                )
            }
            None => (
                transition(ProvisioningState::Pending, &ProvisionEvent::Kickoff)?,
                1,
            ),
        };

        let block = self.ports.reserve(namespace)?;

        let now = now_ms();
        let cluster = ClusterDescriptor {
            namespace: namespace.to_string(),
            cluster_id: Uuid::new_v4().to_string(),
            port_block: Some(block),
            state,
            readiness: ComponentReadiness::default(),
            attempt,
            created_at: now / 1000,
            updated_at: now / 1000,
            deadline_at_ms: now + self.settings.deadline.as_millis() as u64,
            last_error: None,
        };

        if let Err(e) = self.registry.put_cluster(&cluster) {
            self.ports.release(namespace);
            return Err(e.into());
        }

        {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            let handle = tokio::spawn(self.clone().run_attempt(cluster.clone(), block));
            tasks.insert(
                namespace.to_string(),
                AttemptTask {
                    cluster_id: cluster.cluster_id.clone(),
                    abort: handle.abort_handle(),
                },
            );
        }

        info!(
            %namespace,
            cluster_id = %cluster.cluster_id,
            slot = block.slot,
            base = block.base,
            attempt,
            "provisioning started"
        );
        Ok(cluster)
    }

    /// Launch, then observe readiness until `Ready`, failure, or deadline.
    async fn run_attempt(self, cluster: ClusterDescriptor, block: PortBlock) {
        let namespace = cluster.namespace.clone();
        let cluster_id = cluster.cluster_id.clone();
        let remaining = Duration::from_millis(cluster.deadline_at_ms.saturating_sub(now_ms()));
        let deadline = Instant::now() + remaining;

        let handle = match tokio::time::timeout_at(
            deadline,
            self.supervisor.launch(&namespace, block),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                let reason = ProvisionError::from(e).to_string();
                self.fail_attempt(&cluster_id, &namespace, ProvisionEvent::LaunchFailed(reason), None)
                    .await;
                return;
            }
            Err(_) => {
                let reason = self.timeout_reason(&namespace);
                self.fail_attempt(&cluster_id, &namespace, ProvisionEvent::DeadlineElapsed(reason), None)
                    .await;
                return;
            }
        };

        let target = ProbeTarget::new(&namespace, &self.settings.host, handle.block());
        loop {
            let readiness = self.readiness.observe(&target).await;
            let guard = self.lock_namespace(&namespace).await;

            match self.registry.get_cluster(&namespace) {
                Ok(Some(mut current))
                    if current.cluster_id == cluster_id
                        && current.state == ProvisioningState::Provisioning =>
                {
                    match apply(&mut current, ProvisionEvent::Readiness(readiness), now_secs()) {
                        Ok(ProvisioningState::Ready) => match self.registry.put_cluster(&current) {
                            Ok(()) => {
                                info!(%namespace, %cluster_id, "cluster ready");
                                self.supervisor.watch(handle).await;
                                self.forget_task(&namespace, &cluster_id);
                                return;
                            }
                            Err(e) => warn!(%namespace, error = %e, "failed to record readiness"),
                        },
                        Ok(_) => {
                            if let Err(e) = self.registry.put_cluster(&current) {
                                warn!(%namespace, error = %e, "failed to record readiness");
                            }
                        }
                        Err(e) => error!(%namespace, error = %e, "readiness rejected by state machine"),
                    }
                }
                Ok(_) => {
                    // Deprovisioned, expired elsewhere, or superseded.
                    drop(guard);
                    debug!(%namespace, %cluster_id, "attempt no longer current, stopping services");
                    handle.stop().await;
                    self.forget_task(&namespace, &cluster_id);
                    return;
                }
                Err(e) => warn!(%namespace, error = %e, "failed to read descriptor, will retry"),
            }
            drop(guard);

            if Instant::now() >= deadline {
                let reason = self.timeout_reason(&namespace);
                self.fail_attempt(
                    &cluster_id,
                    &namespace,
                    ProvisionEvent::DeadlineElapsed(reason),
                    Some(handle),
                )
                .await;
                return;
            }
            let next = (Instant::now() + self.settings.probe_interval).min(deadline);
            tokio::time::sleep_until(next).await;
        }
    }

    fn timeout_reason(&self, namespace: &str) -> String {
        ProvisionError::ProvisioningTimeout {
            namespace: namespace.to_string(),
            deadline: self.settings.deadline,
        }
        .to_string()
    }

    /// Record a failed attempt: stop processes, release the block, write
    /// `Failed`. A no-op if the attempt is no longer current.
    async fn fail_attempt(
        &self,
        cluster_id: &str,
        namespace: &str,
        event: ProvisionEvent,
        handle: Option<ClusterHandle>,
    ) {
        if let Some(handle) = handle {
            handle.stop().await;
        }

        let _guard = self.lock_namespace(namespace).await;
        self.forget_task(namespace, cluster_id);

        let mut cluster = match self.registry.get_cluster(namespace) {
            Ok(Some(c))
                if c.cluster_id == cluster_id && c.state == ProvisioningState::Provisioning =>
            {
                c
            }
            Ok(_) => {
                debug!(%namespace, %cluster_id, "attempt already settled");
                return;
            }
            Err(e) => {
                // The sweeper retries from the registry once it is readable.
                error!(%namespace, error = %e, "failed to read descriptor while failing attempt");
                return;
            }
        };

        let released = self.ports.release(namespace);
        let reason = match &event {
            ProvisionEvent::LaunchFailed(r) | ProvisionEvent::DeadlineElapsed(r) => r.clone(),
            _ => String::new(),
        };
        if let Err(e) = apply(&mut cluster, event, now_secs()) {
            error!(%namespace, error = %e, "failure rejected by state machine");
            return;
        }
        if let Err(e) = self.registry.put_cluster(&cluster) {
            error!(%namespace, error = %e, "failed to record failed attempt");
            return;
        }
        warn!(
            %namespace,
            %cluster_id,
            slot = released.map(|b| b.slot),
            %reason,
            "provisioning failed"
        );
    }

    fn forget_task(&self, namespace: &str, cluster_id: &str) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.get(namespace).is_some_and(|t| t.cluster_id == cluster_id) {
            tasks.remove(namespace);
        }
    }

    fn abort_task(&self, namespace: &str) {
        let task = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(namespace);
        if let Some(task) = task {
            task.abort.abort();
            debug!(%namespace, cluster_id = %task.cluster_id, "provisioning task aborted");
        }
    }

    /// Fail an in-flight descriptor whose deadline has passed.
    /// Caller holds the namespace lock.
    fn expire_locked(&self, mut cluster: ClusterDescriptor) -> ProvisionResult<ClusterDescriptor> {
        let namespace = cluster.namespace.clone();
        // Dropping the task drops its child handles, which kills them.
        self.abort_task(&namespace);
        let released = self.ports.release(&namespace);
        apply(
            &mut cluster,
            ProvisionEvent::DeadlineElapsed(self.timeout_reason(&namespace)),
            now_secs(),
        )?;
        self.registry.put_cluster(&cluster)?;
        warn!(
            %namespace,
            cluster_id = %cluster.cluster_id,
            slot = released.map(|b| b.slot),
            "provisioning deadline elapsed"
        );
        Ok(cluster)
    }

    /// Re-read `cluster` under its namespace lock and expire it if it is
    /// still the same in-flight attempt and past its deadline.
    async fn expire_if_elapsed(&self, cluster: ClusterDescriptor) -> ProvisionResult<ClusterDescriptor> {
        if !cluster.deadline_elapsed(now_ms()) {
            return Ok(cluster);
        }
        let _guard = self.lock_namespace(&cluster.namespace).await;
        match self.registry.get_cluster(&cluster.namespace)? {
            Some(current)
                if current.cluster_id == cluster.cluster_id && current.deadline_elapsed(now_ms()) =>
            {
                self.expire_locked(current)
            }
            Some(current) if current.cluster_id == cluster.cluster_id => Ok(current),
            _ => Err(ProvisionError::UnknownCluster(cluster.cluster_id)),
        }
    }

    /// Current descriptor behind a poll handle.
    pub async fn poll(&self, cluster_id: &str) -> ProvisionResult<ClusterDescriptor> {
        let cluster = self
            .registry
            .find_cluster_by_id(cluster_id)?
            .ok_or_else(|| ProvisionError::UnknownCluster(cluster_id.to_string()))?;
        self.expire_if_elapsed(cluster).await
    }

    /// Current descriptor of a namespace.
    pub async fn status(&self, namespace: &str) -> ProvisionResult<ClusterDescriptor> {
        validate_namespace(namespace)?;
        let cluster = self
            .registry
            .get_cluster(namespace)?
            .ok_or_else(|| ProvisionError::UnknownCluster(namespace.to_string()))?;
        self.expire_if_elapsed(cluster).await
    }

    /// Tear down a namespace's cluster and forget it.
    ///
    /// Aborts any running attempt, stops the processes, releases the block,
    /// removes the descriptor, revokes the namespace's keys and deletes its
    /// data directories.
    pub async fn deprovision(&self, namespace: &str) -> ProvisionResult<ClusterDescriptor> {
        validate_namespace(namespace)?;
        if is_default_namespace(namespace) {
            return Err(ProvisionError::Forbidden {
                namespace: namespace.to_string(),
            });
        }

        let _guard = self.lock_namespace(namespace).await;
        let cluster = self
            .registry
            .get_cluster(namespace)?
            .ok_or_else(|| ProvisionError::UnknownCluster(namespace.to_string()))?;

        self.abort_task(namespace);
        self.supervisor.stop(namespace).await;
        let released = self.ports.release(namespace);
        self.registry.delete_cluster(namespace)?;
        let revoked = self.registry.delete_api_keys_in(namespace)?;
        self.registry.delete_dns_route(namespace)?;
        if let Err(e) = self.supervisor.remove_data(namespace).await {
            warn!(%namespace, error = %e, "failed to remove namespace data");
        }

        info!(
            %namespace,
            cluster_id = %cluster.cluster_id,
            slot = released.map(|b| b.slot),
            revoked,
            "cluster deprovisioned"
        );
        Ok(cluster)
    }

    /// Fail every in-flight descriptor past its deadline. Returns how many.
    pub async fn sweep_expired(&self) -> ProvisionResult<u32> {
        let mut expired = 0;
        for cluster in self.registry.list_clusters_in_state(ProvisioningState::Provisioning)? {
            if !cluster.deadline_elapsed(now_ms()) {
                continue;
            }
            match self.expire_if_elapsed(cluster).await {
                Ok(c) if c.state == ProvisioningState::Failed => expired += 1,
                Ok(_) | Err(ProvisionError::UnknownCluster(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    /// Run [`Provisioner::sweep_expired`] every `interval` until shutdown.
    pub async fn run_sweeper(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(?interval, "deadline sweeper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    match self.sweep_expired().await {
                        Ok(0) => {}
                        Ok(n) => info!(expired = n, "sweeper failed overdue clusters"),
                        Err(e) => warn!(error = %e, "deadline sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    debug!("deadline sweeper shutting down");
                    break;
                }
            }
        }
    }

    /// Reconcile the registry after a restart.
    ///
    /// The allocator starts empty and no child process survives the previous
    /// daemon, so every descriptor that is not already `Failed` is failed.
    pub fn recover(&self) -> ProvisionResult<u32> {
        let mut recovered = 0;
        for mut cluster in self.registry.list_clusters()? {
            if cluster.state == ProvisioningState::Failed {
                continue;
            }
            let previous = cluster.state;
            apply(&mut cluster, ProvisionEvent::Orphaned, now_secs())?;
            self.registry.put_cluster(&cluster)?;
            info!(
                namespace = %cluster.namespace,
                cluster_id = %cluster.cluster_id,
                previous = previous.as_str(),
                "cluster from previous run marked failed"
            );
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Stop every background attempt and every running cluster.
    pub async fn shutdown(&self) {
        let tasks: Vec<(String, AttemptTask)> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (namespace, task) in tasks {
            task.abort.abort();
            debug!(%namespace, "provisioning task aborted for shutdown");
        }
        self.supervisor.stop_all().await;
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn now_secs() -> u64 {
    now_ms() / 1000
}
