//! REST API handlers.
//!
//! The key-issuance and poll endpoints answer with the flat bodies of the
//! request/poll protocol; everything else uses the `{success, data, error}`
//! envelope. Errors always use the envelope.

use axum::Json;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use nsgrid_core::{is_default_namespace, validate_namespace};
use nsgrid_provision::{ProvisionError, ProvisionOutcome};
use nsgrid_state::{ClusterDescriptor, DnsRoute, ProvisioningState};
use nsgrid_supervisor::ClusterLiveness;

use crate::ApiState;
use crate::auth::{Caller, authenticate};

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// HTTP status for a provisioning error.
pub fn status_for(err: &ProvisionError) -> StatusCode {
    match err {
        ProvisionError::InvalidNamespace(_) => StatusCode::BAD_REQUEST,
        ProvisionError::Unauthorized => StatusCode::UNAUTHORIZED,
        ProvisionError::Forbidden { .. } => StatusCode::FORBIDDEN,
        ProvisionError::UnknownCluster(_) => StatusCode::NOT_FOUND,
        ProvisionError::NotReady { .. } => StatusCode::CONFLICT,
        ProvisionError::PoolExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn provision_error(err: ProvisionError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        error!(error = %err, status = status.as_u16(), "request failed");
    } else {
        debug!(error = %err, status = status.as_u16(), "request rejected");
    }
    error_response(&err.to_string(), status)
}

fn caller(state: &ApiState, headers: &HeaderMap) -> Result<Caller, Response> {
    authenticate(state, headers).map_err(provision_error)
}

// ── Request / poll protocol ────────────────────────────────────

/// Key request body.
#[derive(Debug, Deserialize)]
pub struct ApiKeyRequest {
    pub wallet: String,
    pub namespace: String,
}

/// `200` body: the namespace is servable and the key is issued.
#[derive(Debug, Serialize)]
pub struct ApiKeyIssued {
    pub api_key: String,
    pub namespace: String,
}

/// `202` body: a cluster is being provisioned.
#[derive(Debug, Serialize)]
pub struct ProvisioningAccepted {
    pub status: &'static str,
    pub poll_url: String,
    pub cluster_id: String,
    pub message: String,
}

/// Body of a poll.
#[derive(Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PollResponse {
    Provisioning {
        sql_ready: bool,
        cache_ready: bool,
        gateway_ready: bool,
        dns_ready: bool,
    },
    Ready {
        namespace: String,
        cluster_id: String,
    },
    Failed {
        error: String,
    },
}

impl From<&ClusterDescriptor> for PollResponse {
    fn from(cluster: &ClusterDescriptor) -> Self {
        match cluster.state {
            ProvisioningState::Ready => PollResponse::Ready {
                namespace: cluster.namespace.clone(),
                cluster_id: cluster.cluster_id.clone(),
            },
            ProvisioningState::Failed => PollResponse::Failed {
                error: cluster
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "provisioning failed".to_string()),
            },
            ProvisioningState::Pending | ProvisioningState::Provisioning => {
                PollResponse::Provisioning {
                    sql_ready: cluster.readiness.sql(),
                    cache_ready: cluster.readiness.cache(),
                    gateway_ready: cluster.readiness.gateway(),
                    dns_ready: cluster.readiness.external_dns(),
                }
            }
        }
    }
}

fn accepted(state: &ApiState, cluster: &ClusterDescriptor, message: &str) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(ProvisioningAccepted {
            status: "provisioning",
            poll_url: state.poll_url(&cluster.cluster_id),
            cluster_id: cluster.cluster_id.clone(),
            message: message.to_string(),
        }),
    )
        .into_response()
}

/// POST /v1/namespace/api-keys
pub async fn request_api_key(
    State(state): State<ApiState>,
    Json(req): Json<ApiKeyRequest>,
) -> Response {
    if req.wallet.trim().is_empty() {
        return error_response("wallet must not be empty", StatusCode::BAD_REQUEST);
    }

    match state.provisioner.ensure_cluster(&req.namespace).await {
        Ok(ProvisionOutcome::Shared) | Ok(ProvisionOutcome::Ready(_)) => {
            match state
                .provisioner
                .issue_key(&state.keys, &req.namespace, &req.wallet)
                .await
            {
                Ok(record) => Json(ApiKeyIssued {
                    api_key: record.key,
                    namespace: record.namespace,
                })
                .into_response(),
                Err(e) => provision_error(e),
            }
        }
        Ok(ProvisionOutcome::Started(cluster)) => {
            accepted(&state, &cluster, "cluster provisioning started")
        }
        Ok(ProvisionOutcome::InFlight(cluster)) => {
            accepted(&state, &cluster, "cluster provisioning in progress")
        }
        Err(e) => provision_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub id: String,
}

/// GET /v1/namespace/status?id=
pub async fn poll_status(State(state): State<ApiState>, Query(q): Query<StatusQuery>) -> Response {
    match state.provisioner.poll(&q.id).await {
        Ok(cluster) => Json(PollResponse::from(&cluster)).into_response(),
        Err(e) => provision_error(e),
    }
}

// ── Clusters ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct NameQuery {
    pub name: String,
}

/// A descriptor plus the supervisor's latest liveness view.
#[derive(Serialize)]
struct ClusterView {
    #[serde(flatten)]
    cluster: ClusterDescriptor,
    #[serde(skip_serializing_if = "Option::is_none")]
    liveness: Option<ClusterLiveness>,
}

/// GET /v1/namespace/cluster?name=
pub async fn get_cluster(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(q): Query<NameQuery>,
) -> Response {
    let caller = match caller(&state, &headers) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if let Err(e) = caller.authorize(&q.name) {
        return provision_error(e);
    }

    if is_default_namespace(&q.name) {
        return ApiResponse::ok(serde_json::json!({
            "namespace": q.name,
            "shared": true,
            "state": ProvisioningState::Ready,
        }))
        .into_response();
    }

    match state.provisioner.status(&q.name).await {
        Ok(cluster) => {
            let liveness = state.provisioner.supervisor().probe(&q.name).await;
            ApiResponse::ok(ClusterView { cluster, liveness }).into_response()
        }
        Err(e) => provision_error(e),
    }
}

/// DELETE /v1/namespace/cluster?name=
pub async fn delete_cluster(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(q): Query<NameQuery>,
) -> Response {
    let caller = match caller(&state, &headers) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    if let Err(e) = caller.authorize(&q.name) {
        return provision_error(e);
    }

    match state.provisioner.deprovision(&q.name).await {
        Ok(cluster) => ApiResponse::ok(serde_json::json!({
            "namespace": cluster.namespace,
            "cluster_id": cluster.cluster_id,
            "status": "deprovisioned",
        }))
        .into_response(),
        Err(e) => provision_error(e),
    }
}

/// GET /v1/namespace/clusters
pub async fn list_clusters(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let caller = match caller(&state, &headers) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let clusters = match &caller {
        Caller::Admin => state
            .provisioner
            .registry()
            .list_clusters()
            .map_err(ProvisionError::from),
        Caller::Tenant(cred) => state.guard.clusters_for(cred),
    };
    match clusters {
        Ok(clusters) => ApiResponse::ok(clusters).into_response(),
        Err(e) => provision_error(e),
    }
}

// ── Credentials and routing ────────────────────────────────────

#[derive(Serialize)]
struct KeyView {
    key: String,
    namespace: String,
    wallet: String,
    created_at: u64,
}

/// GET /v1/namespace/keys
pub async fn list_keys(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let caller = match caller(&state, &headers) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let keys = caller.tenant().and_then(|cred| state.guard.keys_for(cred));
    match keys {
        Ok(keys) => {
            let views: Vec<KeyView> = keys
                .into_iter()
                .map(|k| KeyView {
                    key: k.masked(),
                    namespace: k.namespace,
                    wallet: k.wallet,
                    created_at: k.created_at,
                })
                .collect();
            ApiResponse::ok(views).into_response()
        }
        Err(e) => provision_error(e),
    }
}

/// GET /v1/namespace/route
pub async fn get_route(State(state): State<ApiState>, headers: HeaderMap) -> Response {
    let caller = match caller(&state, &headers) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    match caller.tenant().and_then(|cred| state.guard.route(cred)) {
        Ok(route) => ApiResponse::ok(route).into_response(),
        Err(e) => provision_error(e),
    }
}

// ── DNS ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DnsQuery {
    pub name: String,
    pub published: Option<bool>,
}

/// POST /v1/namespace/dns?name=&published=
pub async fn set_dns_route(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(q): Query<DnsQuery>,
) -> Response {
    match caller(&state, &headers) {
        Ok(Caller::Admin) => {}
        Ok(Caller::Tenant(_)) => {
            return provision_error(ProvisionError::Forbidden {
                namespace: q.name.clone(),
            });
        }
        Err(resp) => return resp,
    }
    if let Err(e) = validate_namespace(&q.name) {
        return provision_error(e.into());
    }

    let route = DnsRoute {
        namespace: q.name.clone(),
        published: q.published.unwrap_or(true),
        updated_at: std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs(),
    };
    match state.provisioner.registry().put_dns_route(&route) {
        Ok(()) => {
            info!(namespace = %route.namespace, published = route.published, "dns route flag set");
            ApiResponse::ok(route).into_response()
        }
        Err(e) => provision_error(e.into()),
    }
}

// ── Health ─────────────────────────────────────────────────────

/// GET /v1/health
pub async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let ports = state.provisioner.ports();
    ApiResponse::ok(serde_json::json!({
        "status": "healthy",
        "ports": {
            "capacity": ports.capacity(),
            "reserved": ports.reserved(),
            "available": ports.available(),
        },
    }))
}
