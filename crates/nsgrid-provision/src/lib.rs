//! nsgrid-provision: the provisioning state machine and everything that
//! acts on behalf of a namespace.
//!
//! - `machine`: pure transition function over [`ProvisioningState`]
//! - `provisioner`: reserves blocks, runs launches in the background,
//!   enforces the deadline, retries, deprovisions
//! - `keys`: API key issuance and authentication
//! - `guard`: namespace scoping of every read and route
//!
//! [`ProvisioningState`]: nsgrid_state::ProvisioningState

pub mod error;
pub mod guard;
pub mod keys;
pub mod machine;
pub mod provisioner;

pub use error::{ProvisionError, ProvisionResult};
pub use guard::{ClusterRoute, Credential, NamespaceGuard, scoped};
pub use keys::{KeyIssuer, generate_key};
pub use machine::{ProvisionEvent, TransitionError, apply, transition};
pub use provisioner::{ProvisionOutcome, ProvisionSettings, Provisioner};
