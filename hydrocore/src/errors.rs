use thiserror::Error;

/// Failures reported by the message channel client.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("broker connection timed out")]
    ConnectTimeout,

    #[error("broker rejected credentials: {0}")]
    AuthFailed(String),

    #[error("not connected to broker")]
    NotConnected,

    #[error("channel client has been retired")]
    Retired,

    #[error("channel error: {0}")]
    Unknown(String),
}

/// Failures reported by the time-series store client.
///
/// `NotInitialized` is deliberate: reads and writes against a store that has
/// not been opened fail loudly instead of returning fabricated data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store not initialized")]
    NotInitialized,

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store rejected credentials: {0}")]
    Unauthorized(String),

    #[error("store query failed: {0}")]
    QueryFailed(String),

    #[error("store write failed: {0}")]
    WriteFailed(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
