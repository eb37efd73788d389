use std::time::Duration;

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{ClientError, ClientResult};

const API_KEYS_PATH: &str = "/v1/namespace/api-keys";

/// How long a caller keeps polling before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollBudget {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollBudget {
    fn default() -> Self {
        Self {
            max_attempts: 120,
            interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IssuedKey {
    pub api_key: String,
    pub namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProvisioningTicket {
    pub poll_url: String,
    pub cluster_id: String,
    #[serde(default)]
    pub message: String,
}

/// Outcome of a key request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyResponse {
    Issued(IssuedKey),
    Provisioning(ProvisioningTicket),
}

/// Body of a poll.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PollStatus {
    Provisioning {
        #[serde(default)]
        sql_ready: bool,
        #[serde(default)]
        cache_ready: bool,
        #[serde(default)]
        gateway_ready: bool,
        #[serde(default)]
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

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadyCluster {
    pub namespace: String,
    pub cluster_id: String,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
}

/// HTTP client for an nsgrid daemon.
#[derive(Debug, Clone)]
pub struct ProvisionClient {
    authority: String,
    budget: PollBudget,
    request_timeout: Duration,
}

impl ProvisionClient {
    /// `base_url` is the daemon's `http://host:port`.
    pub fn new(base_url: &str) -> ClientResult<Self> {
        let (authority, _) = split_url(base_url)?;
        Ok(Self {
            authority,
            budget: PollBudget::default(),
            request_timeout: Duration::from_secs(30),
        })
    }

    pub fn with_budget(mut self, budget: PollBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn budget(&self) -> PollBudget {
        self.budget
    }

    /// Ask for a key once; a `202` is not an error.
    pub async fn request_key(&self, wallet: &str, namespace: &str) -> ClientResult<KeyResponse> {
        let body = serde_json::to_vec(&serde_json::json!({
            "wallet": wallet,
            "namespace": namespace,
        }))?;
        let (status, bytes) = self
            .send(&self.authority, Method::POST, API_KEYS_PATH, Some(body))
            .await?;
        match status {
            StatusCode::OK => Ok(KeyResponse::Issued(serde_json::from_slice(&bytes)?)),
            StatusCode::ACCEPTED => Ok(KeyResponse::Provisioning(serde_json::from_slice(&bytes)?)),
            other => Err(unexpected(other, &bytes)),
        }
    }

    /// One poll of `poll_url`, which may be absolute or relative to the daemon.
    pub async fn poll(&self, poll_url: &str) -> ClientResult<PollStatus> {
        let (authority, path) = if poll_url.starts_with('/') {
            (self.authority.clone(), poll_url.to_string())
        } else {
            split_url(poll_url)?
        };
        let (status, bytes) = self.send(&authority, Method::GET, &path, None).await?;
        if status != StatusCode::OK {
            return Err(unexpected(status, &bytes));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Poll until the cluster is ready, it fails, or the budget runs out.
    pub async fn wait_until_ready(&self, poll_url: &str) -> ClientResult<ReadyCluster> {
        let PollBudget {
            max_attempts,
            interval,
        } = self.budget;

        for attempt in 1..=max_attempts {
            match self.poll(poll_url).await? {
                PollStatus::Ready {
                    namespace,
                    cluster_id,
                } => {
                    info!(%namespace, %cluster_id, attempt, "cluster ready");
                    return Ok(ReadyCluster {
                        namespace,
                        cluster_id,
                    });
                }
                PollStatus::Failed { error } => return Err(ClientError::Failed(error)),
                PollStatus::Provisioning {
                    sql_ready,
                    cache_ready,
                    gateway_ready,
                    dns_ready,
                } => {
                    debug!(
                        attempt,
                        max_attempts, sql_ready, cache_ready, gateway_ready, dns_ready,
                        "cluster still provisioning"
                    );
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }

        Err(ClientError::PollTimeout {
            attempts: max_attempts,
            waited: interval * max_attempts.saturating_sub(1),
        })
    }

    /// Request a key, waiting out provisioning if the namespace is new.
    pub async fn obtain_api_key(&self, wallet: &str, namespace: &str) -> ClientResult<IssuedKey> {
        let ticket = match self.request_key(wallet, namespace).await? {
            KeyResponse::Issued(key) => return Ok(key),
            KeyResponse::Provisioning(ticket) => ticket,
        };
        info!(%namespace, cluster_id = %ticket.cluster_id, "waiting for cluster provisioning");
        self.wait_until_ready(&ticket.poll_url).await?;

        match self.request_key(wallet, namespace).await? {
            KeyResponse::Issued(key) => Ok(key),
            KeyResponse::Provisioning(ticket) => Err(ClientError::UnexpectedStatus {
                status: StatusCode::ACCEPTED.as_u16(),
                message: format!("cluster {} still provisioning after ready", ticket.cluster_id),
            }),
        }
    }

    async fn send(
        &self,
        authority: &str,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> ClientResult<(StatusCode, Bytes)> {
        let exchange = async {
            let stream = tokio::net::TcpStream::connect(authority)
                .await
                .map_err(|e| ClientError::Http(format!("connect {authority}: {e}")))?;
            let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
                .await
                .map_err(|e| ClientError::Http(e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "client connection closed with error");
                }
            });

            let mut builder = Request::builder()
                .method(method)
                .uri(path)
                .header(HOST, authority)
                .header(USER_AGENT, "nsgrid-client/0.1");
            if body.is_some() {
                builder = builder.header(CONTENT_TYPE, "application/json");
            }
            let req = builder
                .body(Full::new(Bytes::from(body.unwrap_or_default())))
                .map_err(|e| ClientError::Http(e.to_string()))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| ClientError::Http(e.to_string()))?;
            let status = resp.status();
            let bytes = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| ClientError::Http(e.to_string()))?
                .to_bytes();
            Ok((status, bytes))
        };

        tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| ClientError::Http(format!("request to {authority}{path} timed out")))?
    }
}

/// Split an `http://` URL into authority and path-and-query.
fn split_url(url: &str) -> ClientResult<(String, String)> {
    let uri: Uri = url
        .parse()
        .map_err(|_| ClientError::InvalidUrl(url.to_string()))?;
    if uri.scheme_str() != Some("http") {
        return Err(ClientError::InvalidUrl(url.to_string()));
    }
    let authority = uri
        .authority()
        .ok_or_else(|| ClientError::InvalidUrl(url.to_string()))?
        .to_string();
    let path = uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    Ok((authority, path))
}

fn unexpected(status: StatusCode, body: &[u8]) -> ClientError {
    let message = serde_json::from_slice::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());
    ClientError::UnexpectedStatus {
        status: status.as_u16(),
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Json;
    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode as AxumStatus;
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Scripted daemon: provisioning becomes `outcome` after `polls_needed` polls.
    #[derive(Clone)]
    struct Script {
        polls: Arc<AtomicU32>,
        polls_needed: u32,
        outcome: &'static str,
    }

    async fn api_keys(State(s): State<Script>) -> Response {
        if s.polls.load(Ordering::SeqCst) >= s.polls_needed && s.outcome == "ready" {
            return Json(serde_json::json!({"api_key": "ak_1234", "namespace": "shop-42"}))
                .into_response();
        }
        (
            AxumStatus::ACCEPTED,
            Json(serde_json::json!({
                "status": "provisioning",
                "poll_url": "/v1/namespace/status?id=c-1",
                "cluster_id": "c-1",
                "message": "cluster provisioning started",
            })),
        )
            .into_response()
    }

    async fn status(State(s): State<Script>) -> Json<serde_json::Value> {
        let seen = s.polls.fetch_add(1, Ordering::SeqCst) + 1;
        if seen < s.polls_needed {
            return Json(serde_json::json!({
                "status": "provisioning",
                "sql_ready": true,
                "cache_ready": false,
                "gateway_ready": false,
                "dns_ready": false,
            }));
        }
        match s.outcome {
            "ready" => Json(serde_json::json!({
                "status": "ready", "namespace": "shop-42", "cluster_id": "c-1",
            })),
            "failed" => Json(serde_json::json!({"status": "failed", "error": "gateway exited"})),
            _ => Json(serde_json::json!({"status": "provisioning"})),
        }
    }

    async fn exhausted() -> Response {
        (
            AxumStatus::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({"success": false, "error": "port pool exhausted"})),
        )
            .into_response()
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn scripted(polls_needed: u32, outcome: &'static str) -> (ProvisionClient, Script) {
        let script = Script {
            polls: Arc::new(AtomicU32::new(0)),
            polls_needed,
            outcome,
        };
        let router = Router::new()
            .route(API_KEYS_PATH, post(api_keys))
            .route("/v1/namespace/status", get(status))
            .with_state(script.clone());
        let base = serve(router).await;
        let client = ProvisionClient::new(&base).unwrap().with_budget(PollBudget {
            max_attempts: 5,
            interval: Duration::from_millis(10),
        });
        (client, script)
    }

    #[test]
    fn default_budget_is_ten_minutes() {
        let budget = PollBudget::default();
        assert_eq!(budget.max_attempts, 120);
        assert_eq!(budget.interval * budget.max_attempts, Duration::from_secs(600));
    }

    #[test]
    fn only_plain_http_urls_are_accepted() {
        assert!(ProvisionClient::new("http://127.0.0.1:7400").is_ok());
        assert!(matches!(
            ProvisionClient::new("https://nsgrid.example"),
            Err(ClientError::InvalidUrl(_))
        ));
        assert!(matches!(
            ProvisionClient::new("not a url"),
            Err(ClientError::InvalidUrl(_))
        ));
        assert_eq!(
            split_url("http://h:1/v1/namespace/status?id=x").unwrap(),
            ("h:1".to_string(), "/v1/namespace/status?id=x".to_string())
        );
    }

    #[tokio::test]
    async fn obtains_key_after_polling_to_ready() {
        let (client, script) = scripted(3, "ready").await;
        let key = client.obtain_api_key("0xabc", "shop-42").await.unwrap();
        assert_eq!(key.api_key, "ak_1234");
        assert_eq!(script.polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn failed_provisioning_surfaces_server_error() {
        let (client, _) = scripted(2, "failed").await;
        match client.obtain_api_key("0xabc", "shop-42").await {
            Err(ClientError::Failed(error)) => assert_eq!(error, "gateway exited"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhausted_budget_is_a_poll_timeout() {
        let (client, script) = scripted(u32::MAX, "never").await;
        match client.obtain_api_key("0xabc", "shop-42").await {
            Err(ClientError::PollTimeout { attempts, .. }) => assert_eq!(attempts, 5),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(script.polls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn absolute_poll_urls_are_followed() {
        let script = Script {
            polls: Arc::new(AtomicU32::new(0)),
            polls_needed: 1,
            outcome: "ready",
        };
        let router = Router::new()
            .route("/v1/namespace/status", get(status))
            .with_state(script);
        let base = serve(router).await;

        let client = ProvisionClient::new("http://127.0.0.1:9").unwrap();
        let status = client
            .poll(&format!("{base}/v1/namespace/status?id=c-1"))
            .await
            .unwrap();
        assert_eq!(
            status,
            PollStatus::Ready {
                namespace: "shop-42".to_string(),
                cluster_id: "c-1".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn error_envelope_becomes_unexpected_status() {
        let base = serve(Router::new().route(API_KEYS_PATH, post(exhausted))).await;
        let client = ProvisionClient::new(&base).unwrap();
        match client.request_key("0xabc", "shop-99").await {
            Err(ClientError::UnexpectedStatus { status, message }) => {
                assert_eq!(status, 503);
                assert_eq!(message, "port pool exhausted");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
