use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("cluster not ready after {attempts} polls ({waited:?})")]
    PollTimeout { attempts: u32, waited: Duration },

    #[error("provisioning failed: {0}")]
    Failed(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unexpected status {status}: {message}")]
    UnexpectedStatus { status: u16, message: String },

    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

pub type ClientResult<T> = Result<T, ClientError>;
