//! Supervisor — launches a namespace's services and watches them.
//!
//! `launch` is all-or-nothing: either every service is listening within the
//! startup window, or everything that started is stopped again and the call
//! fails with `LaunchFailure`. Once the cluster is ready the handle is moved
//! into a liveness loop with `watch`, which runs until `stop`.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nsgrid_core::{PortBlock, ServiceRole};
use nsgrid_health::{HealthStatus, HealthTracker, ProbeResult};
use serde::Serialize;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{SupervisorError, SupervisorResult};
use crate::launcher::{LaunchContext, ServiceHandle, ServiceLauncher};

/// Timing and placement knobs for the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Address services bind to.
    pub host: String,
    /// Parent of every namespace's data directory.
    pub data_root: PathBuf,
    /// How long all services together have to start listening.
    pub startup_window: Duration,
    /// Pause between listening checks during startup.
    pub startup_poll: Duration,
    /// Base interval of the post-ready liveness loop.
    pub liveness_interval: Duration,
    pub unhealthy_threshold: u32,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            data_root: PathBuf::from("/var/lib/nsgrid/namespaces"),
            startup_window: Duration::from_secs(30),
            startup_poll: Duration::from_millis(250),
            liveness_interval: Duration::from_secs(15),
            unhealthy_threshold: 3,
        }
    }
}

/// Per-service liveness of a watched cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterLiveness {
    pub services: BTreeMap<ServiceRole, HealthStatus>,
    /// Unix timestamp (seconds) of the last check.
    pub checked_at: u64,
}

impl ClusterLiveness {
    fn unknown() -> Self {
        Self {
            services: ServiceRole::ALL
                .into_iter()
                .map(|role| (role, HealthStatus::Unknown))
                .collect(),
            checked_at: 0,
        }
    }

    pub fn status(&self, role: ServiceRole) -> HealthStatus {
        self.services
            .get(&role)
            .copied()
            .unwrap_or(HealthStatus::Unknown)
    }

    pub fn all_healthy(&self) -> bool {
        self.services.values().all(|s| *s == HealthStatus::Healthy)
    }
}

/// The running services of one namespace.
pub struct ClusterHandle {
    namespace: String,
    block: PortBlock,
    services: Vec<(ServiceRole, Box<dyn ServiceHandle>)>,
}

impl ClusterHandle {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn block(&self) -> PortBlock {
        self.block
    }

    pub fn roles(&self) -> Vec<ServiceRole> {
        self.services.iter().map(|(role, _)| *role).collect()
    }

    /// Probe each service once.
    pub async fn probe(&mut self) -> BTreeMap<ServiceRole, ProbeResult> {
        let mut results = BTreeMap::new();
        for (role, service) in &mut self.services {
            let result = if service.has_exited() {
                ProbeResult::Failed
            } else if service.is_listening().await {
                ProbeResult::Healthy
            } else {
                ProbeResult::Failed
            };
            results.insert(*role, result);
        }
        results
    }

    /// Stop every service, last started first.
    pub async fn stop(mut self) {
        stop_services(&self.namespace, &mut self.services).await;
    }
}

async fn stop_services(namespace: &str, services: &mut Vec<(ServiceRole, Box<dyn ServiceHandle>)>) {
    while let Some((role, mut service)) = services.pop() {
        service.stop().await;
        debug!(%namespace, %role, "service stopped");
    }
}

/// A watched cluster: liveness loop plus its latest observation.
struct WatchSlot {
    handle: JoinHandle<ClusterHandle>,
    shutdown_tx: watch::Sender<bool>,
    liveness: Arc<RwLock<ClusterLiveness>>,
}

/// Launches, watches and stops namespace clusters.
pub struct Supervisor {
    launcher: Arc<dyn ServiceLauncher>,
    settings: SupervisorSettings,
    /// Watched clusters: namespace → slot.
    watched: Arc<RwLock<HashMap<String, WatchSlot>>>,
}

impl Supervisor {
    pub fn new(launcher: Arc<dyn ServiceLauncher>, settings: SupervisorSettings) -> Self {
        Self {
            launcher,
            settings,
            watched: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Data directory of one service of one namespace.
    pub fn data_dir(&self, namespace: &str, role: ServiceRole) -> PathBuf {
        self.settings.data_root.join(namespace).join(role.as_str())
    }

    /// Remove everything stored under `namespace`'s data root.
    /// Returns false if there was nothing to remove.
    pub async fn remove_data(&self, namespace: &str) -> SupervisorResult<bool> {
        let path = self.settings.data_root.join(namespace);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                info!(%namespace, ?path, "namespace data removed");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(SupervisorError::DataDir { path, source }),
        }
    }

    /// Start all services of `namespace` on `block` and wait until each is
    /// listening. On failure nothing is left running.
    ///
    /// Every launch starts from empty data directories: state written by an
    /// earlier attempt is bound to that attempt's ports.
    pub async fn launch(&self, namespace: &str, block: PortBlock) -> SupervisorResult<ClusterHandle> {
        self.remove_data(namespace).await?;
        let mut services: Vec<(ServiceRole, Box<dyn ServiceHandle>)> = Vec::new();

        for role in ServiceRole::ALL {
            let data_dir = self.data_dir(namespace, role);
            if let Err(source) = tokio::fs::create_dir_all(&data_dir).await {
                stop_services(namespace, &mut services).await;
                return Err(SupervisorError::DataDir {
                    path: data_dir,
                    source,
                });
            }

            let ctx = LaunchContext {
                namespace: namespace.to_string(),
                role,
                block,
                host: self.settings.host.clone(),
                data_dir,
            };
            match self.launcher.spawn(&ctx) {
                Ok(service) => services.push((role, service)),
                Err(e) => {
                    warn!(%namespace, %role, error = %e, "service spawn failed, rolling back");
                    stop_services(namespace, &mut services).await;
                    return Err(SupervisorError::LaunchFailure {
                        namespace: namespace.to_string(),
                        role,
                        reason: format!("spawn failed: {e}"),
                    });
                }
            }
        }

        if let Err((role, reason)) = self.wait_listening(&mut services).await {
            warn!(%namespace, %role, %reason, "service did not start, rolling back");
            stop_services(namespace, &mut services).await;
            return Err(SupervisorError::LaunchFailure {
                namespace: namespace.to_string(),
                role,
                reason,
            });
        }

        info!(%namespace, base = block.base, "all services listening");
        Ok(ClusterHandle {
            namespace: namespace.to_string(),
            block,
            services,
        })
    }

    async fn wait_listening(
        &self,
        services: &mut [(ServiceRole, Box<dyn ServiceHandle>)],
    ) -> Result<(), (ServiceRole, String)> {
        let deadline = Instant::now() + self.settings.startup_window;
        let mut listening = vec![false; services.len()];

        loop {
            for (i, (role, service)) in services.iter_mut().enumerate() {
                if listening[i] {
                    continue;
                }
                if service.has_exited() {
                    return Err((*role, "exited before listening".to_string()));
                }
                if service.is_listening().await {
                    debug!(%role, "service listening");
                    listening[i] = true;
                }
            }

            if listening.iter().all(|l| *l) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                let (role, _) = services
                    .iter()
                    .zip(&listening)
                    .find(|(_, l)| !**l)
                    .map(|(s, _)| s)
                    .unwrap_or(&services[0]);
                return Err((
                    *role,
                    format!("not listening within {:?}", self.settings.startup_window),
                ));
            }
            tokio::time::sleep(self.settings.startup_poll).await;
        }
    }

    /// Hand a launched cluster to the liveness loop. Replaces (and stops) any
    /// cluster already watched for the same namespace.
    pub async fn watch(&self, cluster: ClusterHandle) {
        let namespace = cluster.namespace.clone();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let liveness = Arc::new(RwLock::new(ClusterLiveness::unknown()));

        // Spawn and insert with no await in between, so a cancelled caller
        // never leaves an unregistered loop behind.
        let old = {
            let mut watched = self.watched.write().await;
            let handle = tokio::spawn(run_liveness_loop(
                cluster,
                self.settings.liveness_interval,
                self.settings.unhealthy_threshold,
                Arc::clone(&liveness),
                shutdown_rx,
            ));
            watched.insert(
                namespace.clone(),
                WatchSlot {
                    handle,
                    shutdown_tx,
                    liveness,
                },
            )
        };
        if let Some(old) = old {
            stop_slot(&namespace, old).await;
        }
        info!(%namespace, "liveness monitor started");
    }

    /// Latest liveness of a watched cluster.
    pub async fn probe(&self, namespace: &str) -> Option<ClusterLiveness> {
        let watched = self.watched.read().await;
        let slot = watched.get(namespace)?;
        let liveness = slot.liveness.read().await.clone();
        Some(liveness)
    }

    pub async fn is_watching(&self, namespace: &str) -> bool {
        self.watched.read().await.contains_key(namespace)
    }

    /// Stop a watched cluster's liveness loop and its services.
    /// Returns false if nothing was watched for `namespace`.
    pub async fn stop(&self, namespace: &str) -> bool {
        let slot = self.watched.write().await.remove(namespace);
        match slot {
            Some(slot) => {
                stop_slot(namespace, slot).await;
                info!(%namespace, "cluster stopped");
                true
            }
            None => false,
        }
    }

    /// Stop every watched cluster (for graceful shutdown).
    pub async fn stop_all(&self) {
        let slots: Vec<(String, WatchSlot)> = self.watched.write().await.drain().collect();
        for (namespace, slot) in slots {
            stop_slot(&namespace, slot).await;
        }
        info!("all clusters stopped");
    }
}

async fn stop_slot(namespace: &str, slot: WatchSlot) {
    let _ = slot.shutdown_tx.send(true);
    match slot.handle.await {
        Ok(cluster) => cluster.stop().await,
        Err(e) => warn!(%namespace, error = %e, "liveness loop ended abnormally"),
    }
}

/// Periodically probe every service of a cluster until shutdown, then hand
/// the cluster back so the caller can stop it.
async fn run_liveness_loop(
    mut cluster: ClusterHandle,
    interval: Duration,
    unhealthy_threshold: u32,
    liveness: Arc<RwLock<ClusterLiveness>>,
    mut shutdown: watch::Receiver<bool>,
) -> ClusterHandle {
    let mut trackers: BTreeMap<ServiceRole, HealthTracker> = cluster
        .roles()
        .into_iter()
        .map(|role| (role, HealthTracker::new(interval, unhealthy_threshold)))
        .collect();

    debug!(namespace = %cluster.namespace, "liveness loop starting");

    loop {
        let wait = trackers
            .values()
            .map(HealthTracker::next_interval)
            .min()
            .unwrap_or(interval);

        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                let results = cluster.probe().await;
                let mut snapshot = ClusterLiveness {
                    services: BTreeMap::new(),
                    checked_at: epoch_secs(),
                };
                for (role, result) in results {
                    if let Some(tracker) = trackers.get_mut(&role) {
                        let prev = tracker.status();
                        let status = tracker.record(result);
                        if status != prev && status == HealthStatus::Unhealthy {
                            warn!(namespace = %cluster.namespace, %role, "service unhealthy");
                        }
                        snapshot.services.insert(role, status);
                    }
                }
                *liveness.write().await = snapshot;
            }
            _ = shutdown.changed() => {
                debug!(namespace = %cluster.namespace, "liveness loop shutting down");
                break;
            }
        }
    }

    cluster
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
