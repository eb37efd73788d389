//! Readiness aggregation.
//!
//! Four independent probes (SQL, cache, gateway, published DNS route) are
//! run concurrently and folded into one [`ComponentReadiness`]. The composite
//! is ready only when all four agree in the same observation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use nsgrid_core::{PortBlock, ServiceRole};
use nsgrid_state::ComponentReadiness;
use tracing::debug;

use crate::checker::{http_probe, tcp_probe};
use crate::dns::DnsProbe;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a probe is pointed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub namespace: String,
    pub host: String,
    pub block: PortBlock,
}

impl ProbeTarget {
    pub fn new(namespace: &str, host: &str, block: PortBlock) -> Self {
        Self {
            namespace: namespace.to_string(),
            host: host.to_string(),
            block,
        }
    }

    pub fn address(&self, port: u16) -> String {
        format!("{}:{}", self.host, port)
    }
}

/// A boolean readiness check for one component of a cluster.
pub trait ReadinessProbe: Send + Sync {
    fn check<'a>(&'a self, target: &'a ProbeTarget) -> BoxFuture<'a, bool>;
}

/// Ready when the service's HTTP port answers `path` with 2xx.
pub struct HttpHealthProbe {
    role: ServiceRole,
    path: String,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(role: ServiceRole, path: &str, timeout: Duration) -> Self {
        Self {
            role,
            path: path.to_string(),
            timeout,
        }
    }
}

impl ReadinessProbe for HttpHealthProbe {
    fn check<'a>(&'a self, target: &'a ProbeTarget) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let address = target.address(self.role.http_port(&target.block));
            http_probe(&address, &self.path, self.timeout)
                .await
                .is_healthy()
        })
    }
}

/// Ready when the cache answers its health path, or failing that, when
/// either its HTTP or memberlist port accepts connections.
pub struct CacheReachabilityProbe {
    path: String,
    timeout: Duration,
}

impl CacheReachabilityProbe {
    pub fn new(path: &str, timeout: Duration) -> Self {
        Self {
            path: path.to_string(),
            timeout,
        }
    }
}

impl ReadinessProbe for CacheReachabilityProbe {
    fn check<'a>(&'a self, target: &'a ProbeTarget) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let http = target.address(target.block.cache_http());
            if http_probe(&http, &self.path, self.timeout).await.is_healthy() {
                return true;
            }
            if tcp_probe(&http, self.timeout).await.is_healthy() {
                return true;
            }
            let memberlist = target.address(target.block.cache_memberlist());
            tcp_probe(&memberlist, self.timeout).await.is_healthy()
        })
    }
}

/// Combines the four readiness inputs of a cluster.
#[derive(Clone)]
pub struct ReadinessAggregator {
    sql: Arc<dyn ReadinessProbe>,
    cache: Arc<dyn ReadinessProbe>,
    gateway: Arc<dyn ReadinessProbe>,
    dns: Arc<dyn DnsProbe>,
}

impl ReadinessAggregator {
    pub fn new(
        sql: Arc<dyn ReadinessProbe>,
        cache: Arc<dyn ReadinessProbe>,
        gateway: Arc<dyn ReadinessProbe>,
        dns: Arc<dyn DnsProbe>,
    ) -> Self {
        Self {
            sql,
            cache,
            gateway,
            dns,
        }
    }

    /// Aggregator probing the real service ports.
    pub fn http(
        sql_path: &str,
        cache_path: &str,
        gateway_path: &str,
        timeout: Duration,
        dns: Arc<dyn DnsProbe>,
    ) -> Self {
        Self::new(
            Arc::new(HttpHealthProbe::new(ServiceRole::Sql, sql_path, timeout)),
            Arc::new(CacheReachabilityProbe::new(cache_path, timeout)),
            Arc::new(HttpHealthProbe::new(ServiceRole::Gateway, gateway_path, timeout)),
            dns,
        )
    }

    /// Run all four probes concurrently and return one snapshot.
    pub async fn observe(&self, target: &ProbeTarget) -> ComponentReadiness {
        let (sql, cache, gateway, dns) = tokio::join!(
            self.sql.check(target),
            self.cache.check(target),
            self.gateway.check(target),
            self.dns.is_published(&target.namespace),
        );
        let readiness = ComponentReadiness::new(sql, cache, gateway, dns);
        debug!(
            namespace = %target.namespace,
            sql, cache, gateway, dns,
            complete = readiness.is_complete(),
            "readiness observed"
        );
        readiness
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::tests::serve_status;
    use crate::dns::AssumePublished;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Flag(Arc<AtomicBool>);

    impl ReadinessProbe for Flag {
        fn check<'a>(&'a self, _target: &'a ProbeTarget) -> BoxFuture<'a, bool> {
            let value = self.0.load(Ordering::SeqCst);
            Box::pin(async move { value })
        }
    }

    struct DnsFlag(Arc<AtomicBool>);

    impl DnsProbe for DnsFlag {
        fn is_published<'a>(&'a self, _namespace: &'a str) -> BoxFuture<'a, bool> {
            let value = self.0.load(Ordering::SeqCst);
            Box::pin(async move { value })
        }
    }

    fn target() -> ProbeTarget {
        ProbeTarget::new("shop-42", "127.0.0.1", PortBlock::new(0, 1))
    }

    #[tokio::test]
    async fn composite_requires_every_flag() {
        let flags: Vec<Arc<AtomicBool>> = (0..4).map(|_| Arc::new(AtomicBool::new(false))).collect();
        let aggregator = ReadinessAggregator::new(
            Arc::new(Flag(flags[0].clone())),
            Arc::new(Flag(flags[1].clone())),
            Arc::new(Flag(flags[2].clone())),
            Arc::new(DnsFlag(flags[3].clone())),
        );

        for mask in 0u8..16 {
            for (i, flag) in flags.iter().enumerate() {
                flag.store(mask & (1 << i) != 0, Ordering::SeqCst);
            }
            let observed = aggregator.observe(&target()).await;
            assert_eq!(observed.is_complete(), mask == 15, "mask {mask:04b}");
            assert_eq!(observed.sql(), mask & 1 != 0);
            assert_eq!(observed.external_dns(), mask & 8 != 0);
        }
    }

    #[tokio::test]
    async fn http_probes_against_closed_ports_are_not_ready() {
        let aggregator = ReadinessAggregator::http(
            "/readyz",
            "/health",
            "/v1/health",
            Duration::from_millis(200),
            Arc::new(AssumePublished),
        );
        let observed = aggregator.observe(&target()).await;
        assert!(!observed.sql());
        assert!(!observed.cache());
        assert!(!observed.gateway());
        assert!(observed.external_dns());
        assert!(!observed.is_complete());
    }

    #[tokio::test]
    async fn cache_probe_accepts_plain_reachability() {
        // A 503 on the cache HTTP port still proves the transport is up.
        let addr = serve_status("503 Service Unavailable").await;
        let port: u16 = addr.rsplit(':').next().unwrap().parse().unwrap();
        // Place the block so that offset 2 (cache HTTP) lands on the listener.
        let block = PortBlock::new(0, port - 2);
        let target = ProbeTarget::new("shop-42", "127.0.0.1", block);

        let probe = CacheReachabilityProbe::new("/health", Duration::from_secs(1));
        assert!(probe.check(&target).await);

        let gateway = HttpHealthProbe::new(ServiceRole::Gateway, "/v1/health", Duration::from_millis(200));
        assert!(!gateway.check(&target).await);
    }
}
