//! Provisioning state machine.
//!
//! ```text
//! Pending ──Kickoff──▶ Provisioning ──Readiness(all four)──▶ Ready
//!                          │  ▲
//!     LaunchFailed /       │  │ Retry
//!     DeadlineElapsed      ▼  │
//!                         Failed
//! ```
//!
//! [`transition`] is the only place a next state is computed; [`apply`]
//! folds an event into a descriptor. Neither touches the registry.

use nsgrid_state::{ClusterDescriptor, ComponentReadiness, ProvisioningState};
use thiserror::Error;

/// Something that happened to a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionEvent {
    /// Block reserved and launch started.
    Kickoff,
    /// One complete observation of the four readiness flags.
    Readiness(ComponentReadiness),
    /// The supervisor gave up starting the services.
    LaunchFailed(String),
    /// The provisioning deadline passed before readiness.
    DeadlineElapsed(String),
    /// A fresh request for a namespace whose last attempt failed.
    Retry,
    /// The daemon restarted and the cluster's processes are gone.
    Orphaned,
}

impl ProvisionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ProvisionEvent::Kickoff => "kickoff",
            ProvisionEvent::Readiness(_) => "readiness",
            ProvisionEvent::LaunchFailed(_) => "launch_failed",
            ProvisionEvent::DeadlineElapsed(_) => "deadline_elapsed",
            ProvisionEvent::Retry => "retry",
            ProvisionEvent::Orphaned => "orphaned",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event} in state {}", .from.as_str())]
pub struct TransitionError {
    pub from: ProvisioningState,
    pub event: &'static str,
}

/// Compute the state that follows `event` in state `from`.
pub fn transition(
    from: ProvisioningState,
    event: &ProvisionEvent,
) -> Result<ProvisioningState, TransitionError> {
    use ProvisioningState::*;

    let next = match (from, event) {
        (Pending, ProvisionEvent::Kickoff) => Provisioning,
        (Failed, ProvisionEvent::Retry) => Provisioning,
        (Provisioning, ProvisionEvent::Readiness(r)) if r.is_complete() => Ready,
        (Provisioning, ProvisionEvent::Readiness(_)) => Provisioning,
        (Provisioning, ProvisionEvent::LaunchFailed(_)) => Failed,
        (Provisioning, ProvisionEvent::DeadlineElapsed(_)) => Failed,
        (Pending | Provisioning | Ready, ProvisionEvent::Orphaned) => Failed,
        _ => {
            return Err(TransitionError {
                from,
                event: event.name(),
            });
        }
    };
    Ok(next)
}

/// Apply `event` to `cluster` at `now` (unix seconds).
///
/// Failure events clear the port block: by the time they are applied the
/// caller has already given it back to the allocator.
pub fn apply(
    cluster: &mut ClusterDescriptor,
    event: ProvisionEvent,
    now: u64,
) -> Result<ProvisioningState, TransitionError> {
    let next = transition(cluster.state, &event)?;

    match event {
        ProvisionEvent::Readiness(readiness) => cluster.readiness = readiness,
        ProvisionEvent::LaunchFailed(reason) | ProvisionEvent::DeadlineElapsed(reason) => {
            cluster.port_block = None;
            cluster.last_error = Some(reason);
        }
        ProvisionEvent::Orphaned => {
            cluster.port_block = None;
            cluster.last_error = Some("orchestrator restarted".to_string());
        }
        ProvisionEvent::Kickoff | ProvisionEvent::Retry => {
            cluster.readiness = ComponentReadiness::default();
            cluster.last_error = None;
        }
    }

    cluster.state = next;
    cluster.updated_at = now;
    Ok(next)
}
