//! nsgrid-client — the caller side of the namespace request/poll protocol.
//!
//! ```text
//! obtain_api_key(wallet, ns)
//!   POST /v1/namespace/api-keys
//!     200 → key
//!     202 → poll poll_url every `interval`, at most `max_attempts` times
//!             ready  → POST again → key
//!             failed → ClientError::Failed
//!             budget exhausted → ClientError::PollTimeout
//! ```

pub mod client;
pub mod error;

pub use client::{
    IssuedKey, KeyResponse, PollBudget, PollStatus, ProvisionClient, ProvisioningTicket,
    ReadyCluster,
};
pub use error::{ClientError, ClientResult};
