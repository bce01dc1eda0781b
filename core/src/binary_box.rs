//! Binary box: the compact length-free framing of a [TransportData].
//!
//! Layout: `[service_id: varuint][type_tag: u8][sn: varuint?][payload]`.
//! The SN slot exists only for `req`/`res`/`err`; payload bytes come from
//! the external [Validator] for schema-bound bodies. `err` frames carry
//! service id 0 and a JSON-encoded [TsrpcError] payload. ProtoInfo has no
//! slot here; it travels out-of-band.

use crate::codec::Validator;
use crate::error::{ErrorKind, TsrpcError};
use crate::service::{Service, ServiceMap};
use crate::transport_data::{DataKind, TransportData};
use bytes::{BufMut, Bytes, BytesMut};

const INVALID_SERVICE_NAME: &str = "Invalid service name";
const INVALID_BODY: &str = "Invalid body";

pub fn encode(
    data: &TransportData, map: &ServiceMap, validator: &dyn Validator,
) -> Result<Bytes, TsrpcError> {
    let mut buf = BytesMut::with_capacity(64);
    match data {
        TransportData::Req { service_name, sn, body, .. } => {
            let api = lookup_api(map, service_name)?;
            put_varuint(&mut buf, api.id);
            buf.put_u8(DataKind::Req as u8);
            put_varuint(&mut buf, *sn);
            let payload = validator
                .encode_body(body, &api.req_schema_id)
                .map_err(|_| local_err(INVALID_BODY))?;
            buf.put_slice(&payload);
        }
        TransportData::Res { service_name, sn, body, .. } => {
            let api = lookup_api(map, service_name)?;
            put_varuint(&mut buf, api.id);
            buf.put_u8(DataKind::Res as u8);
            put_varuint(&mut buf, *sn);
            let payload = validator
                .encode_body(body, &api.res_schema_id)
                .map_err(|_| local_err(INVALID_BODY))?;
            buf.put_slice(&payload);
        }
        TransportData::Err { sn, err, .. } => {
            put_varuint(&mut buf, 0);
            buf.put_u8(DataKind::Err as u8);
            put_varuint(&mut buf, *sn);
            let payload = serde_json::to_vec(err).map_err(|_| local_err(INVALID_BODY))?;
            buf.put_slice(&payload);
        }
        TransportData::Msg { service_name, body } => {
            let msg = match map.get_by_name(service_name).and_then(Service::as_msg) {
                Some(m) => m,
                None => return Err(local_err(INVALID_SERVICE_NAME)),
            };
            put_varuint(&mut buf, msg.id);
            buf.put_u8(DataKind::Msg as u8);
            let payload = validator
                .encode_body(body, &msg.msg_schema_id)
                .map_err(|_| local_err(INVALID_BODY))?;
            buf.put_slice(&payload);
        }
        TransportData::Custom { data } => {
            put_varuint(&mut buf, 0);
            buf.put_u8(DataKind::Custom as u8);
            buf.put_slice(data);
        }
        TransportData::Heartbeat => {
            put_varuint(&mut buf, 0);
            buf.put_u8(DataKind::Heartbeat as u8);
        }
        TransportData::Handshake => {
            put_varuint(&mut buf, 0);
            buf.put_u8(DataKind::Handshake as u8);
        }
    }
    Ok(buf.freeze())
}

pub fn decode(
    buf: &[u8], map: &ServiceMap, validator: &dyn Validator,
) -> Result<TransportData, TsrpcError> {
    let mut rest = buf;
    let service_id = get_varuint(&mut rest).ok_or_else(|| remote_err("Invalid frame"))?;
    let tag = take_u8(&mut rest).ok_or_else(|| remote_err("Invalid frame"))?;
    let kind = DataKind::from_tag(tag).ok_or_else(|| remote_err("Invalid frame"))?;
    match kind {
        DataKind::Req | DataKind::Res => {
            let sn = get_varuint(&mut rest).ok_or_else(|| remote_err("Invalid frame"))?;
            let api = match map.get_by_id(service_id).and_then(Service::as_api) {
                Some(a) => a,
                None => return Err(remote_err(INVALID_SERVICE_NAME)),
            };
            let schema_id =
                if kind == DataKind::Req { &api.req_schema_id } else { &api.res_schema_id };
            let body =
                validator.decode_body(rest, schema_id).map_err(|_| remote_err(INVALID_BODY))?;
            let service_name = api.name.clone();
            Ok(if kind == DataKind::Req {
                TransportData::Req { service_name, sn, body, proto_info: None }
            } else {
                TransportData::Res { service_name, sn, body, proto_info: None }
            })
        }
        DataKind::Err => {
            let sn = get_varuint(&mut rest).ok_or_else(|| remote_err("Invalid frame"))?;
            let err: TsrpcError =
                serde_json::from_slice(rest).map_err(|_| remote_err(INVALID_BODY))?;
            Ok(TransportData::Err { sn, err, proto_info: None })
        }
        DataKind::Msg => {
            let msg = match map.get_by_id(service_id).and_then(Service::as_msg) {
                Some(m) => m,
                None => return Err(remote_err(INVALID_SERVICE_NAME)),
            };
            let body = validator
                .decode_body(rest, &msg.msg_schema_id)
                .map_err(|_| remote_err(INVALID_BODY))?;
            Ok(TransportData::Msg { service_name: msg.name.clone(), body })
        }
        DataKind::Custom => Ok(TransportData::Custom { data: Bytes::copy_from_slice(rest) }),
        DataKind::Heartbeat => Ok(TransportData::Heartbeat),
        DataKind::Handshake => Ok(TransportData::Handshake),
    }
}

#[inline]
fn lookup_api<'a>(
    map: &'a ServiceMap, name: &str,
) -> Result<&'a std::sync::Arc<crate::service::ApiService>, TsrpcError> {
    map.get_by_name(name).and_then(Service::as_api).ok_or_else(|| local_err(INVALID_SERVICE_NAME))
}

#[inline]
fn local_err(msg: &str) -> TsrpcError {
    TsrpcError::new(ErrorKind::LocalError, msg)
}

#[inline]
fn remote_err(msg: &str) -> TsrpcError {
    TsrpcError::new(ErrorKind::RemoteError, msg)
}

fn put_varuint(buf: &mut BytesMut, mut v: u32) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

fn get_varuint(rest: &mut &[u8]) -> Option<u32> {
    let mut v: u32 = 0;
    let mut shift = 0u32;
    loop {
        let byte = take_u8(rest)?;
        if shift >= 32 {
            return None;
        }
        v |= ((byte & 0x7f) as u32) << shift;
        if byte & 0x80 == 0 {
            return Some(v);
        }
        shift += 7;
    }
}

#[inline]
fn take_u8(rest: &mut &[u8]) -> Option<u8> {
    let (first, tail) = rest.split_first()?;
    *rest = tail;
    Some(*first)
}
