use thiserror::Error;

/// Errors surfaced by the lifecycle engine, independent of any HTTP mapping.
#[derive(Error, Debug)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("missing or invalid credentials")]
    Auth,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("queue already exists: {0}")]
    QueueExists(String),

    #[error("queue still has tasks or workers attached")]
    QueueNotEmpty,

    /// Store-level retryable failure. The engine retries these internally
    /// with backoff before surfacing them.
    #[error("transient store failure: {0}")]
    StoreTransient(String),

    #[error("store failure: {0}")]
    StoreFatal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Error::StoreTransient(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
