use std::str::Utf8Error;

use packed_struct::PackingError;
use thiserror::Error;

/// When things go awry
#[derive(Debug, Error)]
pub enum HoldfastError {
    /// The wire bytes couldn't be parsed: truncated input, bad label lengths,
    /// pointer loops, that sort of thing. Dropped on UDP, closes a TCP stream.
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("client is over its query budget")]
    RateLimited,
    #[error("all upstreams failed: {0}")]
    AllUpstreamsFailed(String),
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),
    #[error("dnssec validation failed: {0}")]
    ValidationFailure(String),
    #[error("tsig verification failed: {0}")]
    TsigInvalid(String),
    #[error("no zone found for {0}")]
    ZoneNotFound(String),
    #[error("dnssec error: {0}")]
    Dnssec(String),
    #[error("byte packing error: {0}")]
    BytePackingError(String),
    /// Something failed in the start up of the platform
    #[error("startup error: {0}")]
    StartupError(String),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    SqlxError(#[from] sqlx::Error),
    #[error("http error: {0}")]
    ReqwestError(#[from] reqwest::Error),
    #[error("regex error: {0}")]
    Regex(String),
    #[error(transparent)]
    Utf8Error(#[from] Utf8Error),
    /// Failed to send something across a tokio channel
    #[error("channel send error: {0}")]
    SendError(String),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("{0}")]
    InternalError(String),
}

impl From<regex::Error> for HoldfastError {
    fn from(error: regex::Error) -> Self {
        HoldfastError::Regex(error.to_string())
    }
}

impl From<PackingError> for HoldfastError {
    fn from(error: PackingError) -> Self {
        HoldfastError::BytePackingError(error.to_string())
    }
}

impl From<HoldfastError> for std::io::Error {
    fn from(error: HoldfastError) -> Self {
        match error {
            HoldfastError::IoError(err) => err,
            other => std::io::Error::other(other.to_string()),
        }
    }
}
