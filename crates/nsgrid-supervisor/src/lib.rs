//! nsgrid-supervisor — child process lifecycle for namespace clusters.
//!
//! Each cluster is three child services (SQL, cache, gateway) bound to the
//! ports of one [`PortBlock`], each with its own data directory under
//! `{data_root}/{namespace}/{role}`.
//!
//! # Lifecycle
//!
//! ```text
//! Supervisor::launch(ns, block)
//!   ├── spawn sql, cache, gateway        (ServiceLauncher)
//!   ├── wait until each is listening     (bounded by startup_window)
//!   └── any failure → stop what started → LaunchFailure
//! Supervisor::watch(handle)              (after the cluster is ready)
//!   └── liveness loop per cluster        (HealthTracker per service)
//! Supervisor::stop(ns) / ClusterHandle::stop()
//! ```
//!
//! [`PortBlock`]: nsgrid_core::PortBlock

pub mod error;
pub mod launcher;
pub mod supervisor;

pub use error::{SupervisorError, SupervisorResult};
pub use launcher::{LaunchContext, ProcessLauncher, ServiceHandle, ServiceLauncher};
pub use supervisor::{ClusterHandle, ClusterLiveness, Supervisor, SupervisorSettings};
