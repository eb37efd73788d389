//! Namespace isolation.
//!
//! Every read made on behalf of a credential goes through [`NamespaceGuard`],
//! which filters by namespace equality before anything is returned and routes
//! the `"default"` namespace to the shared cluster.

use nsgrid_core::config::DefaultClusterConfig;
use nsgrid_core::is_default_namespace;
use nsgrid_state::{
    ApiKeyRecord, ClusterDescriptor, ClusterId, Namespaced, ProvisioningState, StateStore,
};
use serde::Serialize;
use tracing::warn;

use crate::error::{ProvisionError, ProvisionResult};

/// The identity behind an API key: always exactly one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub namespace: String,
    pub wallet: String,
}

impl Credential {
    /// Ok only if this credential is bound to `namespace`.
    pub fn authorize(&self, namespace: &str) -> ProvisionResult<()> {
        if self.namespace == namespace {
            Ok(())
        } else {
            warn!(
                bound = %self.namespace,
                requested = %namespace,
                "cross-namespace access denied"
            );
            Err(ProvisionError::Forbidden {
                namespace: namespace.to_string(),
            })
        }
    }
}

/// Keep only the records whose namespace equals `namespace`.
pub fn scoped<T: Namespaced>(namespace: &str, items: Vec<T>) -> Vec<T> {
    items
        .into_iter()
        .filter(|item| item.namespace() == namespace)
        .collect()
}

/// Where a credential's traffic goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClusterRoute {
    /// The pre-existing cluster shared by the default namespace.
    Shared {
        sql_url: String,
        cache_url: String,
        gateway_url: String,
    },
    /// The namespace's own cluster.
    Dedicated {
        namespace: String,
        cluster_id: ClusterId,
        sql_url: String,
        cache_url: String,
        gateway_url: String,
    },
}

/// Scopes registry reads and cluster routing to a credential's namespace.
#[derive(Clone)]
pub struct NamespaceGuard {
    registry: StateStore,
    default_cluster: DefaultClusterConfig,
    host: String,
}

impl NamespaceGuard {
    pub fn new(registry: StateStore, default_cluster: DefaultClusterConfig, host: &str) -> Self {
        Self {
            registry,
            default_cluster,
            host: host.to_string(),
        }
    }

    /// Descriptors visible to `cred`.
    pub fn clusters_for(&self, cred: &Credential) -> ProvisionResult<Vec<ClusterDescriptor>> {
        Ok(scoped(
            &cred.namespace,
            self.registry.list_clusters_in(&cred.namespace)?,
        ))
    }

    /// Keys visible to `cred`.
    pub fn keys_for(&self, cred: &Credential) -> ProvisionResult<Vec<ApiKeyRecord>> {
        Ok(scoped(
            &cred.namespace,
            self.registry.list_api_keys_in(&cred.namespace)?,
        ))
    }

    /// Resolve the cluster `cred` is routed to.
    pub fn route(&self, cred: &Credential) -> ProvisionResult<ClusterRoute> {
        if is_default_namespace(&cred.namespace) {
            return Ok(ClusterRoute::Shared {
                sql_url: self.default_cluster.sql_url.clone(),
                cache_url: self.default_cluster.cache_url.clone(),
                gateway_url: self.default_cluster.gateway_url.clone(),
            });
        }

        let cluster = self
            .registry
            .get_cluster(&cred.namespace)?
            .ok_or_else(|| ProvisionError::UnknownCluster(cred.namespace.clone()))?;

        match (cluster.state, cluster.port_block) {
            (ProvisioningState::Ready, Some(block)) => {
                let url = |port: u16| format!("http://{}:{}", self.host, port);
                Ok(ClusterRoute::Dedicated {
                    namespace: cluster.namespace.clone(),
                    cluster_id: cluster.cluster_id.clone(),
                    sql_url: url(block.sql_http()),
                    cache_url: url(block.cache_http()),
                    gateway_url: url(block.gateway()),
                })
            }
            (state, _) => Err(ProvisionError::NotReady {
                namespace: cluster.namespace,
                state,
            }),
        }
    }
}
