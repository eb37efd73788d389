//! nsgrid-health — health probes and readiness aggregation for nsgrid.
//!
//! Provides HTTP and TCP probes, a consecutive-failure tracker with
//! exponential backoff, and the readiness aggregator that turns four
//! independent probes into one [`ComponentReadiness`] observation.
//!
//! # Architecture
//!
//! ```text
//! ReadinessAggregator::observe(target)
//!   ├── sql      → HttpHealthProbe   (2xx from the SQL HTTP port)
//!   ├── cache    → CacheReachabilityProbe (2xx, or TCP reachable on HTTP/memberlist)
//!   ├── gateway  → HttpHealthProbe   (2xx from the gateway port)
//!   └── dns      → dyn DnsProbe      (assume / resolve / manual flag)
//!                 ⇒ ComponentReadiness (all four, one snapshot)
//! ```
//!
//! The supervisor reuses [`HealthTracker`] for post-ready liveness: a single
//! success resets backoff, `unhealthy_threshold` consecutive failures mark a
//! service unhealthy.
//!
//! [`ComponentReadiness`]: nsgrid_state::ComponentReadiness

pub mod checker;
pub mod dns;
pub mod readiness;

pub use checker::{HealthStatus, HealthTracker, ProbeResult, http_probe, tcp_probe};
pub use dns::{AssumePublished, DnsProbe, ManualDnsProbe, ResolvingDnsProbe, dns_probe_for};
pub use readiness::{
    BoxFuture, CacheReachabilityProbe, HttpHealthProbe, ProbeTarget, ReadinessAggregator,
    ReadinessProbe,
};
