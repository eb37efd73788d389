//! Domain types for the cluster registry.
//!
//! These types represent the persisted state of namespace clusters and the
//! API keys bound to them. All types are serializable to/from JSON for
//! storage in redb tables.

use serde::{Deserialize, Serialize};

use nsgrid_core::PortBlock;

/// Opaque unique identifier of one provisioning attempt's cluster.
pub type ClusterId = String;

/// Records that belong to exactly one namespace.
///
/// Listing paths filter on this before anything leaves the process.
pub trait Namespaced {
    fn namespace(&self) -> &str;
}

// ── Cluster ───────────────────────────────────────────────────────

/// Lifecycle state of a namespace cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningState {
    /// Request is being validated; never persisted.
    Pending,
    Provisioning,
    Ready,
    Failed,
}

impl ProvisioningState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProvisioningState::Pending => "pending",
            ProvisioningState::Provisioning => "provisioning",
            ProvisioningState::Ready => "ready",
            ProvisioningState::Failed => "failed",
        }
    }
}

/// The four readiness flags of a cluster, observed together.
///
/// Fields are private: a value is only ever built from one complete
/// observation, so a reader never sees a mix of old and new flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentReadiness {
    sql: bool,
    cache: bool,
    gateway: bool,
    external_dns: bool,
}

impl ComponentReadiness {
    pub fn new(sql: bool, cache: bool, gateway: bool, external_dns: bool) -> Self {
        Self {
            sql,
            cache,
            gateway,
            external_dns,
        }
    }

    /// All four flags set.
    pub fn all_ready() -> Self {
        Self::new(true, true, true, true)
    }

    pub fn sql(&self) -> bool {
        self.sql
    }

    pub fn cache(&self) -> bool {
        self.cache
    }

    pub fn gateway(&self) -> bool {
        self.gateway
    }

    pub fn external_dns(&self) -> bool {
        self.external_dns
    }

    /// Composite readiness: the AND of all four flags.
    pub fn is_complete(&self) -> bool {
        self.sql && self.cache && self.gateway && self.external_dns
    }

    /// Names of the components still not ready.
    pub fn pending_components(&self) -> Vec<&'static str> {
        [
            ("sql", self.sql),
            ("cache", self.cache),
            ("gateway", self.gateway),
            ("dns", self.external_dns),
        ]
        .into_iter()
        .filter_map(|(name, ready)| (!ready).then_some(name))
        .collect()
    }
}

/// Registry entry for one namespace's dedicated cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    pub namespace: String,
    pub cluster_id: ClusterId,
    /// Owned block; `None` once released.
    pub port_block: Option<PortBlock>,
    pub state: ProvisioningState,
    pub readiness: ComponentReadiness,
    /// Number of provisioning attempts, including the current one.
    pub attempt: u32,
    /// Unix timestamp (seconds) of the current attempt's start.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last change.
    pub updated_at: u64,
    /// Unix timestamp (milliseconds) after which `Provisioning` becomes `Failed`.
    pub deadline_at_ms: u64,
    pub last_error: Option<String>,
}

impl ClusterDescriptor {
    pub fn table_key(&self) -> &str {
        &self.namespace
    }

    /// Whether the provisioning deadline has passed at `now_ms`.
    pub fn deadline_elapsed(&self, now_ms: u64) -> bool {
        self.state == ProvisioningState::Provisioning && now_ms >= self.deadline_at_ms
    }
}

impl Namespaced for ClusterDescriptor {
    fn namespace(&self) -> &str {
        &self.namespace
    }
}

// ── API keys ──────────────────────────────────────────────────────

/// A credential bound to exactly one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub key: String,
    pub namespace: String,
    pub wallet: String,
    /// Unix timestamp (seconds) of issuance.
    pub created_at: u64,
}

impl ApiKeyRecord {
    pub fn table_key(&self) -> &str {
        &self.key
    }

    /// The key with everything but a short prefix hidden.
    pub fn masked(&self) -> String {
        let visible: String = self.key.chars().take(7).collect();
        format!("{visible}…")
    }
}

impl Namespaced for ApiKeyRecord {
    fn namespace(&self) -> &str {
        &self.namespace
    }
}

// ── DNS ───────────────────────────────────────────────────────────

/// Externally published route for a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRoute {
    pub namespace: String,
    pub published: bool,
    pub updated_at: u64,
}
