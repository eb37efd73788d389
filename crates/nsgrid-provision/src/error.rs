//! Provisioning error types.

use std::time::Duration;

use nsgrid_core::NamespaceError;
use nsgrid_ports::PortError;
use nsgrid_state::{ProvisioningState, StateError};
use nsgrid_supervisor::SupervisorError;
use thiserror::Error;

use crate::machine::TransitionError;

/// Errors that can occur while provisioning or serving a namespace.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid namespace: {0}")]
    InvalidNamespace(#[from] NamespaceError),

    #[error("port pool exhausted: all {capacity} blocks are in use")]
    PoolExhausted { capacity: u32 },

    #[error("port allocator error: {0}")]
    Ports(PortError),

    #[error("{0}")]
    LaunchFailure(#[from] SupervisorError),

    #[error("provisioning of {namespace} did not complete within {deadline:?}")]
    ProvisioningTimeout { namespace: String, deadline: Duration },

    #[error("unknown cluster: {0}")]
    UnknownCluster(String),

    #[error("cluster for {namespace} is not ready (state: {})", .state.as_str())]
    NotReady {
        namespace: String,
        state: ProvisioningState,
    },

    #[error("credential is not bound to namespace {namespace}")]
    Forbidden { namespace: String },

    #[error("missing or unknown credential")]
    Unauthorized,

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

impl From<PortError> for ProvisionError {
    fn from(err: PortError) -> Self {
        match err {
            PortError::PoolExhausted { capacity } => ProvisionError::PoolExhausted { capacity },
            other => ProvisionError::Ports(other),
        }
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;
