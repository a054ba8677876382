use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::WireRpcError;

/// Status carried in every response frame.
///
/// The numeric values are part of the wire format and never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
#[repr(i8)]
pub enum StatusCode {
    Ok = 1,
    NotFound = 2,
    ServerError = 3,
    BadRequest = 4,
    BadResponse = 5,
    Timeout = 6,
    ClientFilterDeny = 7,
    ServerFilterDeny = 8,
}

impl StatusCode {
    pub const ALL: [StatusCode; 8] = [
        StatusCode::Ok,
        StatusCode::NotFound,
        StatusCode::ServerError,
        StatusCode::BadRequest,
        StatusCode::BadResponse,
        StatusCode::Timeout,
        StatusCode::ClientFilterDeny,
        StatusCode::ServerFilterDeny,
    ];

    pub fn as_i8(self) -> i8 {
        self as i8
    }

    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StatusCode::Ok => "ok",
            StatusCode::NotFound => "not_found",
            StatusCode::ServerError => "server_error",
            StatusCode::BadRequest => "bad_request",
            StatusCode::BadResponse => "bad_response",
            StatusCode::Timeout => "timeout",
            StatusCode::ClientFilterDeny => "client_filter_deny",
            StatusCode::ServerFilterDeny => "server_filter_deny",
        }
    }
}

impl TryFrom<i8> for StatusCode {
    type Error = WireRpcError;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(StatusCode::Ok),
            2 => Ok(StatusCode::NotFound),
            3 => Ok(StatusCode::ServerError),
            4 => Ok(StatusCode::BadRequest),
            5 => Ok(StatusCode::BadResponse),
            6 => Ok(StatusCode::Timeout),
            7 => Ok(StatusCode::ClientFilterDeny),
            8 => Ok(StatusCode::ServerFilterDeny),
            other => Err(WireRpcError::UnknownStatus(other)),
        }
    }
}

impl From<StatusCode> for i8 {
    fn from(status: StatusCode) -> Self {
        status.as_i8()
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values_are_stable() {
        assert_eq!(StatusCode::Ok.as_i8(), 1);
        assert_eq!(StatusCode::NotFound.as_i8(), 2);
        assert_eq!(StatusCode::ServerError.as_i8(), 3);
        assert_eq!(StatusCode::BadRequest.as_i8(), 4);
        assert_eq!(StatusCode::BadResponse.as_i8(), 5);
        assert_eq!(StatusCode::Timeout.as_i8(), 6);
        assert_eq!(StatusCode::ClientFilterDeny.as_i8(), 7);
        assert_eq!(StatusCode::ServerFilterDeny.as_i8(), 8);
    }

    #[test]
    fn test_try_from_covers_all_codes() {
        for status in StatusCode::ALL {
            assert_eq!(StatusCode::try_from(status.as_i8()).unwrap(), status);
        }
    }

    #[test]
    fn test_unknown_code_is_rejected() {
        assert!(matches!(
            StatusCode::try_from(0),
            Err(WireRpcError::UnknownStatus(0))
        ));
        assert!(StatusCode::try_from(9).is_err());
        assert!(StatusCode::try_from(-1).is_err());
    }
}
