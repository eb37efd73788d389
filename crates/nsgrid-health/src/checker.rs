//! Single-shot probes and the liveness tracker built on them.

use std::time::Duration;

use bytes::Bytes;
use http_body_util::Empty;
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Outcome of one probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// 2xx, or an accepted connection for transport probes.
    Healthy,
    /// The service answered with a non-2xx status.
    Unhealthy,
    /// No answer: refused, reset, or timed out.
    Failed,
}

impl ProbeResult {
    pub fn is_healthy(self) -> bool {
        matches!(self, ProbeResult::Healthy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Liveness of one service across successive probes.
///
/// One success marks the service healthy and resets the probe interval.
/// `unhealthy_threshold` failures in a row mark it unhealthy; every failure
/// doubles the interval, capped at one minute.
#[derive(Debug)]
pub struct HealthTracker {
    status: HealthStatus,
    failure_streak: u32,
    unhealthy_threshold: u32,
    interval: Duration,
    base_interval: Duration,
    max_interval: Duration,
}

impl HealthTracker {
    pub fn new(interval: Duration, unhealthy_threshold: u32) -> Self {
        Self {
            status: HealthStatus::Unknown,
            failure_streak: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            interval,
            base_interval: interval,
            max_interval: interval.max(Duration::from_secs(60)),
        }
    }

    /// Fold one probe result in and return the resulting status.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        if result.is_healthy() {
            if self.status == HealthStatus::Unhealthy {
                debug!(after_failures = self.failure_streak, "service healthy again");
            }
            self.failure_streak = 0;
            self.interval = self.base_interval;
            self.status = HealthStatus::Healthy;
            return self.status;
        }

        self.failure_streak += 1;
        self.interval = self.interval.saturating_mul(2).min(self.max_interval);
        if self.failure_streak >= self.unhealthy_threshold && self.status != HealthStatus::Unhealthy {
            warn!(
                failures = self.failure_streak,
                threshold = self.unhealthy_threshold,
                "service unhealthy"
            );
            self.status = HealthStatus::Unhealthy;
        }
        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failure_streak
    }

    /// Delay before the next probe.
    pub fn next_interval(&self) -> Duration {
        self.interval
    }
}

/// `GET http://{address}{path}` over a fresh HTTP/1 connection.
///
/// 2xx is `Healthy`, any other status `Unhealthy`; transport errors and
/// `timeout` are `Failed`.
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, fetch_status(address, path)).await {
        Ok(Ok(status)) if status.is_success() => ProbeResult::Healthy,
        Ok(Ok(status)) => {
            debug!(%address, path, %status, "probe answered non-2xx");
            ProbeResult::Unhealthy
        }
        Ok(Err(reason)) => {
            debug!(%address, path, %reason, "probe failed");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(%address, path, ?timeout, "probe timed out");
            ProbeResult::Failed
        }
    }
}

async fn fetch_status(address: &str, path: &str) -> Result<http::StatusCode, String> {
    let stream = TcpStream::connect(address)
        .await
        .map_err(|e| format!("connect: {e}"))?;
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(|e| format!("handshake: {e}"))?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = http::Request::get(path)
        .header(http::header::HOST, address)
        .header(http::header::USER_AGENT, "nsgrid-health/0.1")
        .body(Empty::<Bytes>::new())
        .map_err(|e| format!("request: {e}"))?;
    let resp = sender
        .send_request(req)
        .await
        .map_err(|e| format!("send: {e}"))?;
    Ok(resp.status())
}

/// `Healthy` if `address` accepts a TCP connection within `timeout`.
pub async fn tcp_probe(address: &str, timeout: Duration) -> ProbeResult {
    match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
        Ok(Ok(_)) => ProbeResult::Healthy,
        Ok(Err(e)) => {
            debug!(%address, error = %e, "tcp probe refused");
            ProbeResult::Failed
        }
        Err(_) => {
            debug!(%address, ?timeout, "tcp probe timed out");
            ProbeResult::Failed
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answer every request with `status`. Returns the listen address.
    pub(crate) async fn serve_status(status: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut request = [0u8; 1024];
                    let _ = socket.read(&mut request).await;
                    let reply =
                        format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                    let _ = socket.write_all(reply.as_bytes()).await;
                });
            }
        });
        addr
    }

    fn tracker() -> HealthTracker {
        HealthTracker::new(Duration::from_secs(1), 3)
    }

    #[test]
    fn unknown_until_first_probe() {
        let t = tracker();
        assert_eq!(t.status(), HealthStatus::Unknown);
        assert_eq!(t.next_interval(), Duration::from_secs(1));
    }

    #[test]
    fn failures_below_threshold_keep_status() {
        let mut t = tracker();
        assert_eq!(t.record(ProbeResult::Healthy), HealthStatus::Healthy);
        assert_eq!(t.record(ProbeResult::Unhealthy), HealthStatus::Healthy);
        assert_eq!(t.record(ProbeResult::Failed), HealthStatus::Healthy);
        assert_eq!(t.consecutive_failures(), 2);
        assert_eq!(t.record(ProbeResult::Failed), HealthStatus::Unhealthy);
    }

    #[test]
    fn one_success_recovers_and_resets_interval() {
        let mut t = tracker();
        for _ in 0..3 {
            t.record(ProbeResult::Failed);
        }
        assert_eq!(t.status(), HealthStatus::Unhealthy);
        assert_eq!(t.next_interval(), Duration::from_secs(8));

        assert_eq!(t.record(ProbeResult::Healthy), HealthStatus::Healthy);
        assert_eq!(t.consecutive_failures(), 0);
        assert_eq!(t.next_interval(), Duration::from_secs(1));
    }

    #[test]
    fn interval_is_capped() {
        let mut t = tracker();
        for _ in 0..20 {
            t.record(ProbeResult::Failed);
        }
        assert_eq!(t.next_interval(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn http_probe_maps_status_classes() {
        let ok = serve_status("204 No Content").await;
        assert_eq!(http_probe(&ok, "/readyz", Duration::from_secs(2)).await, ProbeResult::Healthy);

        let down = serve_status("503 Service Unavailable").await;
        assert_eq!(
            http_probe(&down, "/readyz", Duration::from_secs(2)).await,
            ProbeResult::Unhealthy
        );

        assert_eq!(
            http_probe("127.0.0.1:1", "/readyz", Duration::from_millis(200)).await,
            ProbeResult::Failed
        );
    }

    #[tokio::test]
    async fn tcp_probe_sees_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert_eq!(tcp_probe(&addr, Duration::from_secs(1)).await, ProbeResult::Healthy);

        drop(listener);
        assert_eq!(tcp_probe(&addr, Duration::from_millis(200)).await, ProbeResult::Failed);
    }
}
