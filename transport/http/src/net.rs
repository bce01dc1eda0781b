//! Wire-surface constants and header plumbing shared by client and server.

use tsrpc_core::{DataKind, DataType};

/// Marks a POST body as a one-way message or a user-defined frame.
pub const HEADER_DATA_TYPE: &str = "x-tsrpc-data-type";
/// Opportunistic schema-version advertisement.
pub const HEADER_PROTO_INFO: &str = "x-tsrpc-proto-info";

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const CONTENT_TYPE_OCTET: &str = "application/octet-stream";

pub fn content_type_of(data_type: DataType) -> &'static str {
    match data_type {
        DataType::Text => CONTENT_TYPE_JSON,
        DataType::Buffer => CONTENT_TYPE_OCTET,
    }
}

/// The `X-TSRPC-DATA-TYPE` value for a frame kind, when one applies.
pub fn data_type_header_of(kind: DataKind) -> Option<&'static str> {
    match kind {
        DataKind::Msg => Some("msg"),
        DataKind::Custom => Some("custom"),
        _ => None,
    }
}

pub fn parse_data_type_header(value: &str) -> Option<DataKind> {
    match value {
        "msg" => Some(DataKind::Msg),
        "custom" => Some(DataKind::Custom),
        _ => None,
    }
}

/// Whether a Content-Type means a text (JSON) body.
pub fn is_text_content_type(value: &str) -> bool {
    value.split(';').next().map(str::trim).is_some_and(|t| t.eq_ignore_ascii_case(CONTENT_TYPE_JSON))
}
