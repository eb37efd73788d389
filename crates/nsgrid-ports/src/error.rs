//! Port allocator error types.

use nsgrid_core::PortBlock;
use thiserror::Error;

/// Result type alias for allocator operations.
pub type PortResult<T> = Result<T, PortError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    /// Every block in the range is owned by a namespace.
    #[error("port pool exhausted: all {capacity} blocks are reserved")]
    PoolExhausted { capacity: u32 },

    #[error("namespace {namespace} already holds block at port {}", block.base)]
    AlreadyReserved { namespace: String, block: PortBlock },
}
