//! WireRPC Response Types
//!
//! This module defines the RPC response structure.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::RemoteError;
use super::requests::{RequestId, Tracer};
use super::status::StatusCode;

/// An RPC response returned from a provider to the client.
///
/// # Response Flow
///
/// 1. Provider receives and dispatches a `Request`
/// 2. Provider builds a `Response` carrying the same `request_id`
/// 3. Response is serialized and framed onto the same connection
/// 4. Client looks up the pending call by `request_id` and resolves it
///
/// # Fields
///
/// - `request_id`: Echo of the request's correlation key
/// - `status`: Outcome of the call on the provider side
/// - `tracer`: Tracing identifiers, echoed when present
/// - `result`: Marshalled result on success, UTF-8 error text otherwise
///
/// # Example
///
/// ```
/// use wirerpc_common::{Response, StatusCode};
///
/// let success = Response::ok(123, &b"3.14159"[..]);
/// assert!(success.is_ok());
///
/// let failure = Response::error(123, StatusCode::ServerError, "division by zero");
/// assert_eq!(failure.error_message().as_deref(), Some("division by zero"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response {
    pub request_id: RequestId,
    pub status: StatusCode,
    pub tracer: Option<Tracer>,
    pub result: Bytes,
}

impl Response {
    /// Creates a successful response.
    ///
    /// # Arguments
    ///
    /// * `request_id` - The request identifier (must match the request's id)
    /// * `result` - The marshalled result bytes
    pub fn ok(request_id: RequestId, result: impl Into<Bytes>) -> Self {
        Response {
            request_id,
            status: StatusCode::Ok,
            tracer: None,
            result: result.into(),
        }
    }

    /// Creates a failed response whose result carries a human-readable message.
    ///
    /// # Arguments
    ///
    /// * `request_id` - The request identifier (must match the request's id)
    /// * `status` - A non-OK status code
    /// * `message` - The error message (describing what went wrong)
    pub fn error(request_id: RequestId, status: StatusCode, message: impl Into<String>) -> Self {
        Response {
            request_id,
            status,
            tracer: None,
            result: Bytes::from(message.into()),
        }
    }

    pub fn with_tracer(mut self, tracer: Option<Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    /// Returns the error text of a non-OK response.
    pub fn error_message(&self) -> Option<String> {
        if self.is_ok() {
            None
        } else {
            Some(String::from_utf8_lossy(&self.result).into_owned())
        }
    }

    /// Collapses the response into the result bytes or a [`RemoteError`].
    pub fn into_result(self) -> Result<Bytes, RemoteError> {
        if self.is_ok() {
            Ok(self.result)
        } else {
            Err(RemoteError {
                status: self.status,
                message: String::from_utf8_lossy(&self.result).into_owned(),
            })
        }
    }
}
