use thiserror::Error;

use super::responses::Response;
use super::status::StatusCode;

#[derive(Error, Debug)]
pub enum WireRpcError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Frame too large: {size} bytes (max {max} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Unknown status code: {0}")]
    UnknownStatus(i8),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("No provider available")]
    NoProvider,

    #[error("Connection closed")]
    Closed,
}

impl From<std::net::AddrParseError> for WireRpcError {
    fn from(err: std::net::AddrParseError) -> Self {
        WireRpcError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WireRpcError>;

/// Local resolution of a call that never produced a usable response.
///
/// These are expected outcomes under load, so they are plain values with no
/// captured backtrace. The frequent ones are unit variants.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("call timed out")]
    Timeout,

    #[error("call denied by client filter: {0}")]
    Denied(String),

    #[error("connection closed before a response arrived")]
    ConnectionClosed,

    #[error("no provider available")]
    NoProvider,

    #[error("failed to encode request: {0}")]
    Encode(String),

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl CallError {
    /// Status code used when the outcome is reported to metrics.
    pub fn status(&self) -> StatusCode {
        match self {
            CallError::Timeout => StatusCode::Timeout,
            CallError::Denied(_) => StatusCode::ClientFilterDeny,
            CallError::Encode(_) => StatusCode::BadRequest,
            CallError::Decode(_) => StatusCode::BadResponse,
            CallError::ConnectionClosed | CallError::NoProvider => StatusCode::ServerError,
        }
    }
}

/// Final result of a submitted call: a delivered response or a local failure.
pub type CallOutcome = std::result::Result<Response, CallError>;

/// A delivered response whose status is not OK.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("remote call failed with {status}: {message}")]
pub struct RemoteError {
    pub status: StatusCode,
    pub message: String,
}
