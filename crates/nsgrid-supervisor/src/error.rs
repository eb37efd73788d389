//! Supervisor error types.

use std::path::PathBuf;

use nsgrid_core::ServiceRole;
use thiserror::Error;

/// Errors that can occur while launching or stopping a cluster.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// A service did not reach a listening state; everything that had
    /// started was stopped before this was returned.
    #[error("launch failed for {namespace}/{role}: {reason}")]
    LaunchFailure {
        namespace: String,
        role: ServiceRole,
        reason: String,
    },

    #[error("failed to prepare data directory {path:?}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
