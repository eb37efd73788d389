//! Registry errors.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    /// The database file could not be created or opened.
    #[error("cannot open registry: {0}")]
    Open(String),

    /// A redb transaction, table, or record operation failed.
    #[error("registry storage: {0}")]
    Storage(String),

    /// A stored record did not round-trip through JSON.
    #[error("registry record codec: {0}")]
    Codec(String),
}
