use std::time::Duration;

use thiserror::Error;

use crate::lease::BackendError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("lease identity cannot be empty")]
    EmptyIdentity,

    #[error("retry period must be greater than zero")]
    ZeroRetryPeriod,

    #[error("election controller is already running")]
    AlreadyRunning,

    #[error("lease {namespace}/{name} not found")]
    LeaseNotFound { namespace: String, name: String },

    #[error("lease operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("lease backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Configuration errors are fatal at construction and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::EmptyIdentity | Error::ZeroRetryPeriod)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
