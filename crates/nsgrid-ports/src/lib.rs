//! nsgrid-ports — exclusive port block allocation.
//!
//! The host exposes one contiguous port range, carved into blocks of five
//! (`range_start + 5 * slot`). Each active namespace owns exactly one block.
//! Reservation and release are linearizable: both run inside one short
//! critical section over the slot bitmap, so status reads elsewhere are
//! never held up by allocation.

pub mod allocator;
pub mod error;

pub use allocator::PortAllocator;
pub use error::{PortError, PortResult};
