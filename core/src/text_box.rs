//! Text box: the JSON-shaped encoding of a [TransportData].
//!
//! A full document looks like `{"serviceName": …, "sn": …, "body": …,
//! "protoInfo": …}` (`err` replaces `body` for error frames). When the
//! transport already conveys the service name and SN out of band (the HTTP
//! URL path and the client's own pending table), `skip_sn` strips them and
//! the document is the bare body; [TextDecodeCtx] re-supplies the missing
//! fields at decode time. Skipping the SN is a property of the transport,
//! never of an individual message.

use crate::codec::Validator;
use crate::error::{ErrorKind, TsrpcError};
use crate::service::{EndpointSide, ProtoInfo, Service, ServiceMap};
use crate::transport_data::{DataKind, TransportData};
use bytes::Bytes;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

const INVALID_SERVICE_NAME: &str = "Invalid service name";
const INVALID_BODY: &str = "Invalid body";

/// Out-of-band context for decoding: the receiving side plus any fields the
/// transport carries outside the document.
#[derive(Clone, Copy, Default)]
pub struct TextDecodeCtx<'a> {
    /// The endpoint doing the decode; `None` defaults to full-document
    /// inference only.
    pub side: Option<EndpointSide>,
    pub service_name: Option<&'a str>,
    pub sn: Option<u32>,
    pub kind: Option<DataKind>,
}

#[derive(Serialize, Deserialize, Default)]
struct TextDoc {
    #[serde(rename = "serviceName", skip_serializing_if = "Option::is_none")]
    service_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sn: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    err: Option<TsrpcError>,
    #[serde(rename = "protoInfo", skip_serializing_if = "Option::is_none")]
    proto_info: Option<ProtoInfo>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    lifecycle: Option<String>,
}

pub fn encode(
    data: &TransportData, map: &ServiceMap, validator: &dyn Validator, skip_sn: bool,
) -> Result<String, TsrpcError> {
    let doc = match data {
        TransportData::Req { service_name, sn, body, proto_info } => {
            validate_api_body(map, service_name, body, validator, true, local_err)?;
            if skip_sn {
                return to_string(body);
            }
            TextDoc {
                service_name: Some(service_name.clone()),
                sn: Some(*sn),
                body: Some(body.clone()),
                proto_info: proto_info.clone(),
                ..Default::default()
            }
        }
        TransportData::Res { service_name, sn, body, proto_info } => {
            validate_api_body(map, service_name, body, validator, false, local_err)?;
            if skip_sn {
                return to_string(body);
            }
            TextDoc {
                service_name: Some(service_name.clone()),
                sn: Some(*sn),
                body: Some(body.clone()),
                proto_info: proto_info.clone(),
                ..Default::default()
            }
        }
        TransportData::Err { sn, err, proto_info } => TextDoc {
            sn: if skip_sn { None } else { Some(*sn) },
            err: Some(err.clone()),
            proto_info: proto_info.clone(),
            ..Default::default()
        },
        TransportData::Msg { service_name, body } => {
            let msg = map
                .get_by_name(service_name)
                .and_then(Service::as_msg)
                .ok_or_else(|| local_err(INVALID_SERVICE_NAME))?;
            validator
                .validate(body, &msg.msg_schema_id)
                .map_err(|_| local_err(INVALID_BODY))?;
            if skip_sn {
                return to_string(body);
            }
            TextDoc {
                service_name: Some(service_name.clone()),
                body: Some(body.clone()),
                ..Default::default()
            }
        }
        TransportData::Custom { data } => {
            return String::from_utf8(data.to_vec())
                .map_err(|_| local_err("Custom frame is not valid UTF-8"));
        }
        TransportData::Heartbeat => {
            TextDoc { lifecycle: Some("heartbeat".to_string()), ..Default::default() }
        }
        TransportData::Handshake => {
            TextDoc { lifecycle: Some("handshake".to_string()), ..Default::default() }
        }
    };
    serde_json::to_string(&doc).map_err(|_| local_err(INVALID_BODY))
}

pub fn decode(
    text: &str, map: &ServiceMap, validator: &dyn Validator, ctx: TextDecodeCtx,
) -> Result<TransportData, TsrpcError> {
    if ctx.kind == Some(DataKind::Custom) {
        return Ok(TransportData::Custom { data: Bytes::copy_from_slice(text.as_bytes()) });
    }
    if let Some(name) = ctx.service_name {
        // skip-SN document: the whole text is the body
        let body: Value =
            serde_json::from_str(text).map_err(|_| remote_err(INVALID_BODY))?;
        return from_supplied(name, body, map, validator, ctx);
    }
    let doc: TextDoc = serde_json::from_str(text).map_err(|_| remote_err(INVALID_BODY))?;
    match doc.lifecycle.as_deref() {
        Some("heartbeat") => return Ok(TransportData::Heartbeat),
        Some("handshake") => return Ok(TransportData::Handshake),
        _ => {}
    }
    if let Some(err) = doc.err {
        return Ok(TransportData::Err {
            sn: doc.sn.or(ctx.sn).unwrap_or(0),
            err,
            proto_info: doc.proto_info,
        });
    }
    let service_name = doc.service_name.ok_or_else(|| remote_err(INVALID_SERVICE_NAME))?;
    let body = doc.body.ok_or_else(|| remote_err(INVALID_BODY))?;
    match doc.sn {
        None => {
            let msg = map
                .get_by_name(&service_name)
                .and_then(Service::as_msg)
                .ok_or_else(|| remote_err(INVALID_SERVICE_NAME))?;
            validator
                .validate(&body, &msg.msg_schema_id)
                .map_err(|_| remote_err(INVALID_BODY))?;
            Ok(TransportData::Msg { service_name, body })
        }
        Some(sn) => {
            let api = map
                .get_by_name(&service_name)
                .and_then(Service::as_api)
                .ok_or_else(|| remote_err(INVALID_SERVICE_NAME))?;
            // inbound on the server is a req, inbound on the client is a res
            let is_req = ctx.side != Some(EndpointSide::Client);
            let schema_id = if is_req { &api.req_schema_id } else { &api.res_schema_id };
            validator.validate(&body, schema_id).map_err(|_| remote_err(INVALID_BODY))?;
            Ok(if is_req {
                TransportData::Req { service_name, sn, body, proto_info: doc.proto_info }
            } else {
                TransportData::Res { service_name, sn, body, proto_info: doc.proto_info }
            })
        }
    }
}

fn from_supplied(
    name: &str, body: Value, map: &ServiceMap, validator: &dyn Validator, ctx: TextDecodeCtx,
) -> Result<TransportData, TsrpcError> {
    let sn = ctx.sn.unwrap_or(0);
    match ctx.kind {
        Some(DataKind::Msg) => {
            let msg = map
                .get_by_name(name)
                .and_then(Service::as_msg)
                .ok_or_else(|| remote_err(INVALID_SERVICE_NAME))?;
            validator
                .validate(&body, &msg.msg_schema_id)
                .map_err(|_| remote_err(INVALID_BODY))?;
            Ok(TransportData::Msg { service_name: name.to_string(), body })
        }
        _ => {
            let is_req = ctx.side != Some(EndpointSide::Client);
            let api = map
                .get_by_name(name)
                .and_then(Service::as_api)
                .ok_or_else(|| remote_err(INVALID_SERVICE_NAME))?;
            let schema_id = if is_req { &api.req_schema_id } else { &api.res_schema_id };
            validator.validate(&body, schema_id).map_err(|_| remote_err(INVALID_BODY))?;
            Ok(if is_req {
                TransportData::Req { service_name: name.to_string(), sn, body, proto_info: None }
            } else {
                TransportData::Res { service_name: name.to_string(), sn, body, proto_info: None }
            })
        }
    }
}

fn validate_api_body(
    map: &ServiceMap, name: &str, body: &Value, validator: &dyn Validator, is_req: bool,
    mk_err: fn(&str) -> TsrpcError,
) -> Result<(), TsrpcError> {
    let api = map
        .get_by_name(name)
        .and_then(Service::as_api)
        .ok_or_else(|| mk_err(INVALID_SERVICE_NAME))?;
    let schema_id = if is_req { &api.req_schema_id } else { &api.res_schema_id };
    validator.validate(body, schema_id).map_err(|_| mk_err(INVALID_BODY))
}

#[inline]
fn to_string(body: &Value) -> Result<String, TsrpcError> {
    serde_json::to_string(body).map_err(|_| local_err(INVALID_BODY))
}

#[inline]
fn local_err(msg: &str) -> TsrpcError {
    TsrpcError::new(ErrorKind::LocalError, msg)
}

#[inline]
fn remote_err(msg: &str) -> TsrpcError {
    TsrpcError::new(ErrorKind::RemoteError, msg)
}
