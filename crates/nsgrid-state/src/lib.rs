//! nsgrid-state — the cluster registry.
//!
//! Backed by [redb](https://docs.rs/redb), maps each namespace to its
//! [`ClusterDescriptor`] and stores the API keys bound to namespaces. It is
//! the single source of truth for status queries.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Clusters are keyed by namespace (one entry per namespace), API keys by the
//! key itself. Reads run in redb read transactions and never wait on writers,
//! so polling one namespace is not blocked by provisioning another.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and is constructed once at startup, then handed to every component that
//! needs it.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
