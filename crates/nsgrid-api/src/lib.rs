//! nsgrid-api — REST API for namespace provisioning.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/v1/namespace/api-keys` | Issue a key, or start provisioning (202) |
//! | GET | `/v1/namespace/status?id=` | Poll a provisioning attempt |
//! | GET | `/v1/namespace/cluster?name=` | Cluster descriptor |
//! | DELETE | `/v1/namespace/cluster?name=` | Deprovision a namespace |
//! | GET | `/v1/namespace/clusters` | List clusters visible to the caller |
//! | GET | `/v1/namespace/keys` | List the caller's namespace keys |
//! | GET | `/v1/namespace/route` | Cluster endpoints for the caller |
//! | POST | `/v1/namespace/dns?name=` | Set the published-route flag |
//! | GET | `/v1/health` | Daemon health |

pub mod auth;
pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use nsgrid_provision::{KeyIssuer, NamespaceGuard, Provisioner};

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub provisioner: Provisioner,
    pub keys: KeyIssuer,
    pub guard: NamespaceGuard,
    /// Prefix for `poll_url`; empty yields relative URLs.
    pub public_url: String,
    pub admin_token: Option<String>,
}

impl ApiState {
    pub(crate) fn poll_url(&self, cluster_id: &str) -> String {
        format!(
            "{}/v1/namespace/status?id={cluster_id}",
            self.public_url.trim_end_matches('/')
        )
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let namespace_routes = Router::new()
        .route("/api-keys", post(handlers::request_api_key))
        .route("/status", get(handlers::poll_status))
        .route(
            "/cluster",
            get(handlers::get_cluster).delete(handlers::delete_cluster),
        )
        .route("/clusters", get(handlers::list_clusters))
        .route("/keys", get(handlers::list_keys))
        .route("/route", get(handlers::get_route))
        .route("/dns", post(handlers::set_dns_route));

    Router::new()
        .nest("/v1/namespace", namespace_routes)
        .route("/v1/health", get(handlers::health))
        .with_state(state)
}
