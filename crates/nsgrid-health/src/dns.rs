//! Published-route (external DNS) readiness input.
//!
//! Whether a namespace's public route exists is decided outside nsgrid, so
//! the flag comes from a pluggable [`DnsProbe`].

use nsgrid_core::config::{DnsConfig, DnsMode};
use nsgrid_state::StateStore;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::readiness::BoxFuture;

pub trait DnsProbe: Send + Sync {
    fn is_published<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, bool>;
}

/// Treats every route as published.
pub struct AssumePublished;

impl DnsProbe for AssumePublished {
    fn is_published<'a>(&'a self, _namespace: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async { true })
    }
}

/// Published once `{namespace}.{base_domain}` resolves.
pub struct ResolvingDnsProbe {
    base_domain: String,
}

impl ResolvingDnsProbe {
    pub fn new(base_domain: &str) -> Self {
        Self {
            base_domain: base_domain.trim_matches('.').to_string(),
        }
    }

    pub fn hostname(&self, namespace: &str) -> String {
        format!("{namespace}.{}", self.base_domain)
    }
}

impl DnsProbe for ResolvingDnsProbe {
    fn is_published<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let host = self.hostname(namespace);
            match tokio::net::lookup_host((host.as_str(), 443)).await {
                Ok(mut addrs) => addrs.next().is_some(),
                Err(e) => {
                    debug!(%host, error = %e, "route not resolvable yet");
                    false
                }
            }
        })
    }
}

/// Reads the flag an external publisher stored in the registry.
pub struct ManualDnsProbe {
    store: StateStore,
}

impl ManualDnsProbe {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }
}

impl DnsProbe for ManualDnsProbe {
    fn is_published<'a>(&'a self, namespace: &'a str) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            match self.store.dns_published(namespace) {
                Ok(published) => published,
                Err(e) => {
                    warn!(%namespace, error = %e, "failed to read dns route flag");
                    false
                }
            }
        })
    }
}

/// Build the probe selected by `[dns]`.
pub fn dns_probe_for(config: &DnsConfig, store: StateStore) -> Arc<dyn DnsProbe> {
    match config.mode {
        DnsMode::Assume => Arc::new(AssumePublished),
        DnsMode::Resolve => Arc::new(ResolvingDnsProbe::new(&config.base_domain)),
        DnsMode::Manual => Arc::new(ManualDnsProbe::new(store)),
    }
}
