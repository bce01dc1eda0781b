//! The error taxonomy shared by both endpoints and the wire.
//!
//! A [TsrpcError] is constructed at the peer that detected the condition and
//! reconstructed verbatim on the receiver after wire crossing. The `kind`
//! discriminant tells the caller which side failed and how.

use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Reserved wire codes. ApiError handlers may use any user-defined code.
pub const CODE_INTERNAL_ERR: &str = "INTERNAL_ERR";
pub const CODE_SERVER_TIMEOUT: &str = "SERVER_TIMEOUT";
pub const CODE_NOT_IMPLEMENTED: &str = "NOT_IMPLEMENTED";
pub const CODE_TIMEOUT: &str = "TIMEOUT";
pub const CODE_ECONNREFUSED: &str = "ECONNREFUSED";

/// The `type` discriminant of [TsrpcError].
#[derive(
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Clone,
    Copy,
)]
pub enum ErrorKind {
    /// Domain-level failure produced by a handler; reaches the caller verbatim.
    ApiError,
    /// Transport failure, timeout, connection refused, disconnect mid-call.
    NetworkError,
    /// Handler threw or exceeded the api timeout.
    ServerError,
    /// Client-side encoding failure or schema mismatch.
    ClientError,
    /// The peer sent a malformed frame.
    RemoteError,
    /// Local decoding failure, malformed response.
    LocalError,
}

// strum already customizes Display; keep Debug in sync with it.
impl fmt::Debug for ErrorKind {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// The domain error exchanged end-to-end.
///
/// Wire shape (JSON): `{message, code?, type, info?, innerErr?}`.
#[derive(thiserror::Error, Serialize, Deserialize, Clone, PartialEq)]
pub struct TsrpcError {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    #[serde(rename = "innerErr", skip_serializing_if = "Option::is_none")]
    pub inner_err: Option<String>,
}

impl TsrpcError {
    #[inline]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { message: message.into(), code: None, kind, info: None, inner_err: None }
    }

    /// An `ApiError` as produced by `call.error(...)` in a handler.
    #[inline]
    pub fn api(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ApiError, message)
    }

    #[inline]
    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }

    #[inline]
    pub fn with_info(mut self, info: Value) -> Self {
        self.info = Some(info);
        self
    }

    #[inline]
    pub fn with_inner(mut self, inner: impl Into<String>) -> Self {
        self.inner_err = Some(inner.into());
        self
    }

    /// The client-side timeout for a pending call.
    #[inline]
    pub fn request_timeout() -> Self {
        Self::new(ErrorKind::NetworkError, "Request Timeout").with_code(CODE_TIMEOUT)
    }

    /// All pending calls settle with this when the connection goes away.
    #[inline]
    pub fn conn_disconnected() -> Self {
        Self::new(ErrorKind::NetworkError, "Connection disconnected")
    }

    #[inline]
    pub fn is_network(&self) -> bool {
        self.kind == ErrorKind::NetworkError
    }
}

impl fmt::Display for TsrpcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}/{}] {}", self.kind, code, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}

impl fmt::Debug for TsrpcError {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// The sum type every API call resolves to: `{isSucc: true, res}` or
/// `{isSucc: false, err}`.
#[derive(Clone, PartialEq)]
pub enum ApiReturn {
    Succ(Value),
    Err(TsrpcError),
}

impl ApiReturn {
    #[inline]
    pub fn is_succ(&self) -> bool {
        matches!(self, Self::Succ(_))
    }

    #[inline]
    pub fn res(&self) -> Option<&Value> {
        match self {
            Self::Succ(v) => Some(v),
            Self::Err(_) => None,
        }
    }

    #[inline]
    pub fn err(&self) -> Option<&TsrpcError> {
        match self {
            Self::Succ(_) => None,
            Self::Err(e) => Some(e),
        }
    }

    pub fn into_result(self) -> Result<Value, TsrpcError> {
        match self {
            Self::Succ(v) => Ok(v),
            Self::Err(e) => Err(e),
        }
    }
}

impl fmt::Debug for ApiReturn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Succ(v) => write!(f, "succ({})", v),
            Self::Err(e) => write!(f, "err({})", e),
        }
    }
}

impl From<TsrpcError> for ApiReturn {
    #[inline]
    fn from(e: TsrpcError) -> Self {
        Self::Err(e)
    }
}

#[derive(Serialize, Deserialize)]
struct ApiReturnRepr {
    #[serde(rename = "isSucc")]
    is_succ: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    res: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    err: Option<TsrpcError>,
}

impl serde::Serialize for ApiReturn {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let repr = match self {
            Self::Succ(v) => ApiReturnRepr { is_succ: true, res: Some(v.clone()), err: None },
            Self::Err(e) => ApiReturnRepr { is_succ: false, res: None, err: Some(e.clone()) },
        };
        repr.serialize(serializer)
    }
}

impl<'de> serde::Deserialize<'de> for ApiReturn {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = ApiReturnRepr::deserialize(deserializer)?;
        if repr.is_succ {
            match repr.res {
                Some(v) => Ok(Self::Succ(v)),
                None => Err(serde::de::Error::missing_field("res")),
            }
        } else {
            match repr.err {
                Some(e) => Ok(Self::Err(e)),
                None => Err(serde::de::Error::missing_field("err")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::str::FromStr;

    #[test]
    fn test_error_kind_strings() {
        assert_eq!(ErrorKind::ApiError.as_ref(), "ApiError");
        assert_eq!(ErrorKind::from_str("RemoteError").unwrap(), ErrorKind::RemoteError);
        assert!(ErrorKind::from_str("WeirdError").is_err());
    }

    #[test]
    fn test_error_wire_shape() {
        let e = TsrpcError::api("Test TsrpcError")
            .with_code("CODE_TEST")
            .with_info(json!("ErrInfo Test"));
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(
            v,
            json!({
                "message": "Test TsrpcError",
                "code": "CODE_TEST",
                "type": "ApiError",
                "info": "ErrInfo Test",
            })
        );
        let back: TsrpcError = serde_json::from_value(v).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn test_api_return_wire_shape() {
        let r = ApiReturn::Succ(json!({"reply": "hi"}));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v, json!({"isSucc": true, "res": {"reply": "hi"}}));
        let back: ApiReturn = serde_json::from_value(v).unwrap();
        assert!(back.is_succ());

        let r = ApiReturn::Err(
            TsrpcError::new(ErrorKind::ServerError, "Internal Server Error")
                .with_code(CODE_INTERNAL_ERR)
                .with_inner("Test InnerError"),
        );
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["isSucc"], json!(false));
        assert_eq!(v["err"]["innerErr"], json!("Test InnerError"));
        assert_eq!(v["err"]["type"], json!("ServerError"));
    }
}
