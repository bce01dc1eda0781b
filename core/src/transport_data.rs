//! The tagged wire envelope shared across transports.

use crate::error::TsrpcError;
use crate::service::ProtoInfo;
use bytes::Bytes;
use serde_json::Value;
use std::fmt;

/// Encoding family a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Text,
    Buffer,
}

/// Frame kind tag. The numeric value is the binary box type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataKind {
    Req = 0,
    Res = 1,
    Err = 2,
    Msg = 3,
    Custom = 4,
    Heartbeat = 5,
    Handshake = 6,
}

impl DataKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Req),
            1 => Some(Self::Res),
            2 => Some(Self::Err),
            3 => Some(Self::Msg),
            4 => Some(Self::Custom),
            5 => Some(Self::Heartbeat),
            6 => Some(Self::Handshake),
            _ => None,
        }
    }
}

/// One frame on the wire.
///
/// `Heartbeat` and `Handshake` only occur on duplex transports; a stateless
/// transport never emits them.
#[derive(Clone, PartialEq)]
pub enum TransportData {
    /// client→server API call.
    Req { service_name: String, sn: u32, body: Value, proto_info: Option<ProtoInfo> },
    /// server→client API success.
    Res { service_name: String, sn: u32, body: Value, proto_info: Option<ProtoInfo> },
    /// server→client API failure, correlated by the request's SN.
    Err { sn: u32, err: TsrpcError, proto_info: Option<ProtoInfo> },
    /// One-way message, no SN.
    Msg { service_name: String, body: Value },
    /// Passthrough for user-defined frames; the core neither parses nor
    /// validates the payload.
    Custom { data: Bytes },
    Heartbeat,
    Handshake,
}

impl TransportData {
    #[inline]
    pub fn kind(&self) -> DataKind {
        match self {
            Self::Req { .. } => DataKind::Req,
            Self::Res { .. } => DataKind::Res,
            Self::Err { .. } => DataKind::Err,
            Self::Msg { .. } => DataKind::Msg,
            Self::Custom { .. } => DataKind::Custom,
            Self::Heartbeat => DataKind::Heartbeat,
            Self::Handshake => DataKind::Handshake,
        }
    }

    #[inline]
    pub fn sn(&self) -> Option<u32> {
        match self {
            Self::Req { sn, .. } | Self::Res { sn, .. } | Self::Err { sn, .. } => Some(*sn),
            _ => None,
        }
    }

    #[inline]
    pub fn service_name(&self) -> Option<&str> {
        match self {
            Self::Req { service_name, .. }
            | Self::Res { service_name, .. }
            | Self::Msg { service_name, .. } => Some(service_name),
            _ => None,
        }
    }

    #[inline]
    pub fn proto_info(&self) -> Option<&ProtoInfo> {
        match self {
            Self::Req { proto_info, .. }
            | Self::Res { proto_info, .. }
            | Self::Err { proto_info, .. } => proto_info.as_ref(),
            _ => None,
        }
    }
}

impl fmt::Display for TransportData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Req { service_name, sn, .. } => write!(f, "[req {} sn={}]", service_name, sn),
            Self::Res { service_name, sn, .. } => write!(f, "[res {} sn={}]", service_name, sn),
            Self::Err { sn, err, .. } => write!(f, "[err sn={} {}]", sn, err),
            Self::Msg { service_name, .. } => write!(f, "[msg {}]", service_name),
            Self::Custom { data } => write!(f, "[custom {}B]", data.len()),
            Self::Heartbeat => write!(f, "[heartbeat]"),
            Self::Handshake => write!(f, "[handshake]"),
        }
    }
}

impl fmt::Debug for TransportData {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_round_trip() {
        for tag in 0u8..=6 {
            assert_eq!(DataKind::from_tag(tag).unwrap() as u8, tag);
        }
        assert!(DataKind::from_tag(7).is_none());
    }
}
