//! The enumerated flow stages of an endpoint.
//!
//! Each stage is a [Flow] over its own payload shape. Nodes may rewrite the
//! payload (e.g. `pre_call_api` can replace the request body) or abort the
//! surrounding operation.

use crate::call::ApiCall;
use crate::conn::{CallApiOptions, Conn, WireData};
use serde_json::Value;
use std::sync::Arc;
use tsrpc_core::error::ApiReturn;
use tsrpc_core::{Flow, TransportData};

pub struct ConnFlowData {
    pub conn: Arc<Conn>,
}

pub struct DisconnectFlowData {
    pub conn: Arc<Conn>,
    pub reason: String,
    pub is_manual: bool,
}

pub struct CallApiFlowData {
    pub api_name: String,
    pub req: Value,
    pub options: CallApiOptions,
}

pub struct CallApiReturnFlowData {
    pub api_name: String,
    pub req: Value,
    pub ret: ApiReturn,
}

pub struct ApiCallFlowData {
    pub call: ApiCall,
}

pub struct ApiCallReturnFlowData {
    pub call: ApiCall,
    pub ret: ApiReturn,
}

pub struct MsgFlowData {
    pub msg_name: String,
    pub msg: Value,
    pub conn: Arc<Conn>,
}

/// `conn` is the sending connection; a broadcast sets `conns` instead and
/// runs once per dataType partition. `transport_data` is the decoded form of
/// `data`; rewriting the raw bytes is what affects the wire.
pub struct SendDataFlowData {
    pub data: WireData,
    pub transport_data: TransportData,
    pub conn: Option<Arc<Conn>>,
    pub conns: Option<Vec<Arc<Conn>>>,
}

pub struct RecvDataFlowData {
    pub data: WireData,
    pub conn: Arc<Conn>,
}

pub struct BroadcastMsgFlowData {
    pub msg_name: String,
    pub msg: Value,
    pub conns: Vec<Arc<Conn>>,
}

/// All stages of one endpoint. Shared by every connection of a server.
pub struct Flows {
    pub pre_connect: Flow<ConnFlowData>,
    pub post_connect: Flow<ConnFlowData>,
    pub post_disconnect: Flow<DisconnectFlowData>,
    pub pre_call_api: Flow<CallApiFlowData>,
    pub pre_call_api_return: Flow<CallApiReturnFlowData>,
    pub pre_api_call: Flow<ApiCallFlowData>,
    pub pre_api_call_return: Flow<ApiCallReturnFlowData>,
    pub pre_send_msg: Flow<MsgFlowData>,
    pub pre_recv_msg: Flow<MsgFlowData>,
    pub pre_send_data: Flow<SendDataFlowData>,
    pub post_send_data: Flow<SendDataFlowData>,
    pub pre_recv_data: Flow<RecvDataFlowData>,
    pub pre_broadcast_msg: Flow<BroadcastMsgFlowData>,
}

impl Flows {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pre_connect: Flow::new("preConnect"),
            post_connect: Flow::new("postConnect"),
            post_disconnect: Flow::new("postDisconnect"),
            pre_call_api: Flow::new("preCallApi"),
            pre_call_api_return: Flow::new("preCallApiReturn"),
            pre_api_call: Flow::new("preApiCall"),
            pre_api_call_return: Flow::new("preApiCallReturn"),
            pre_send_msg: Flow::new("preSendMsg"),
            pre_recv_msg: Flow::new("preRecvMsg"),
            pre_send_data: Flow::new("preSendData"),
            post_send_data: Flow::new("postSendData"),
            pre_recv_data: Flow::new("preRecvData"),
            pre_broadcast_msg: Flow::new("preBroadcastMsg"),
        })
    }
}
