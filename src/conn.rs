//! The shared connection state machine.
//!
//! A [Conn] is one endpoint of a transport channel. Clients drive it through
//! [Conn::call_api] and [Conn::send_msg]; servers dispatch inbound frames
//! through it. The transport itself is pluggable behind [ConnTransport]: a
//! duplex channel keeps one long-lived [Conn], a stateless transport (HTTP)
//! builds a transient one per exchange on the server side and a logically
//! always-connected one on the client side.

use crate::flows::{
    CallApiFlowData, CallApiReturnFlowData, DisconnectFlowData, Flows, MsgFlowData,
    RecvDataFlowData, SendDataFlowData,
};
use crate::pending::PendingRegistry;
use crate::server::{ApiHandler, Server};
use bytes::Bytes;
use captains_log::filter::LogFilter;
use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tsrpc_core::error::{ApiReturn, ErrorKind, TsrpcError};
use tsrpc_core::text_box::TextDecodeCtx;
use tsrpc_core::{
    binary_box, text_box, Aborted, DataKind, DataType, EndpointSide, FlowControl, OpResult,
    ProtoInfo, ServiceMap, TransportData, Validator,
};

pub use tsrpc_core::DecodeReturnText;

/// One encoded frame, ready for (or fresh off) the wire.
#[derive(Clone)]
pub enum WireData {
    Text(String),
    Binary(Bytes),
}

impl WireData {
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        match self {
            Self::Text(_) => DataType::Text,
            Self::Binary(_) => DataType::Buffer,
        }
    }
}

impl fmt::Debug for WireData {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Text(s) => write!(f, "text({}B)", s.len()),
            Self::Binary(b) => write!(f, "buffer({}B)", b.len()),
        }
    }
}

/// Transport seam under a [Conn].
pub trait ConnTransport: Send + Sync + 'static {
    fn data_type(&self) -> DataType;

    /// Whether this transport leaves the SN (and service name) off the wire
    /// and re-supplies them out of band. A transport property, never a
    /// per-message one; symmetric binary transports keep the SN on the wire.
    fn encode_skip_sn(&self) -> bool {
        false
    }

    /// One exchange per call, no connection lifecycle.
    fn is_stateless(&self) -> bool {
        false
    }

    /// Peer address for logs, if known.
    fn remote(&self) -> Option<String> {
        None
    }

    /// Hand one encoded frame to the wire. Resolves when the bytes are
    /// handed off, not when the peer received them. A stateless transport
    /// resolves with the exchange's reply data. `td` is the decoded form of
    /// `data`, for transports that carry parts of it out of band.
    fn send_data(
        &self, data: WireData, td: &TransportData,
    ) -> BoxFuture<'static, Result<Option<WireData>, TsrpcError>>;

    fn close(&self, code: Option<u16>, reason: &str) -> BoxFuture<'static, ()>;
}

/// Connection lifecycle. Transitions only move forward; `Connecting` may
/// only be re-entered after `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

#[derive(Clone, Default)]
pub struct CallApiOptions {
    /// Overrides the connection-level callApi timeout.
    pub timeout: Option<Duration>,
}

pub struct MsgNotify {
    pub msg_name: String,
    pub msg: Value,
    pub conn: Arc<Conn>,
}

pub type MsgListener = Arc<dyn Fn(&MsgNotify) + Send + Sync>;

struct MsgListenerEntry {
    listener: MsgListener,
    once: bool,
}

/// Per-name listener table, shared in shape between a connection and a
/// server (server-level listeners observe every connection).
pub(crate) struct MsgListenerTable {
    listeners: Mutex<FxHashMap<String, Vec<MsgListenerEntry>>>,
}

impl MsgListenerTable {
    pub(crate) fn new() -> Self {
        Self { listeners: Mutex::new(FxHashMap::default()) }
    }

    pub(crate) fn on(&self, name: &str, listener: MsgListener, once: bool) {
        self.listeners
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push(MsgListenerEntry { listener, once });
    }

    pub(crate) fn off(&self, name: &str, listener: Option<&MsgListener>) {
        let mut table = self.listeners.lock().unwrap();
        match listener {
            None => {
                table.remove(name);
            }
            Some(l) => {
                if let Some(entries) = table.get_mut(name) {
                    entries.retain(|e| !Arc::ptr_eq(&e.listener, l));
                }
            }
        }
    }

    /// Fire listeners in registration order; `once` entries self-remove.
    pub(crate) fn emit(&self, notify: &MsgNotify) {
        let fired: Vec<MsgListener> = {
            let mut table = self.listeners.lock().unwrap();
            match table.get_mut(&notify.msg_name) {
                None => return,
                Some(entries) => {
                    let fired = entries.iter().map(|e| e.listener.clone()).collect();
                    entries.retain(|e| !e.once);
                    fired
                }
            }
        };
        for listener in fired {
            listener(notify);
        }
    }
}

pub struct ConnOptions {
    pub id: u32,
    pub side: EndpointSide,
    pub service_map: Arc<ServiceMap>,
    pub validator: Arc<dyn Validator>,
    pub flows: Arc<Flows>,
    pub logger: Arc<LogFilter>,
    pub transport: Box<dyn ConnTransport>,
    pub call_api_timeout: Option<Duration>,
    pub decode_return_text: Option<DecodeReturnText>,
    pub server: Option<Weak<Server>>,
    pub initial_state: ConnState,
}

pub struct Conn {
    pub id: u32,
    side: EndpointSide,
    state: Mutex<ConnState>,
    closed: std::sync::atomic::AtomicBool,
    service_map: Arc<ServiceMap>,
    validator: Arc<dyn Validator>,
    flows: Arc<Flows>,
    pending: Arc<PendingRegistry>,
    msg_listeners: MsgListenerTable,
    duplex_handlers: Mutex<FxHashMap<String, ApiHandler>>,
    logger: Arc<LogFilter>,
    transport: Box<dyn ConnTransport>,
    call_api_timeout: Option<Duration>,
    decode_return_text: Option<DecodeReturnText>,
    server: Option<Weak<Server>>,
    remote: Option<String>,
}

impl Conn {
    pub fn new(opts: ConnOptions) -> Arc<Self> {
        let remote = opts.transport.remote();
        Arc::new(Self {
            id: opts.id,
            side: opts.side,
            state: Mutex::new(opts.initial_state),
            closed: std::sync::atomic::AtomicBool::new(false),
            service_map: opts.service_map,
            validator: opts.validator,
            flows: opts.flows,
            pending: PendingRegistry::new(opts.logger.clone()),
            msg_listeners: MsgListenerTable::new(),
            duplex_handlers: Mutex::new(FxHashMap::default()),
            logger: opts.logger,
            transport: opts.transport,
            call_api_timeout: opts.call_api_timeout,
            decode_return_text: opts.decode_return_text,
            server: opts.server,
            remote,
        })
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        if self.transport.is_stateless() && self.side == EndpointSide::Client {
            // a stateless client is logically always connected
            return ConnState::Connected;
        }
        *self.state.lock().unwrap()
    }

    #[inline]
    pub fn side(&self) -> EndpointSide {
        self.side
    }

    #[inline]
    pub fn data_type(&self) -> DataType {
        self.transport.data_type()
    }

    #[inline]
    pub fn logger(&self) -> &Arc<LogFilter> {
        &self.logger
    }

    #[inline]
    pub fn service_map(&self) -> &Arc<ServiceMap> {
        &self.service_map
    }

    #[inline]
    pub fn flows(&self) -> &Arc<Flows> {
        &self.flows
    }

    /// Number of calls awaiting a response.
    #[inline]
    pub fn pending_call_num(&self) -> usize {
        self.pending.len()
    }

    /// SN assigned to the most recent callApi on this connection.
    #[inline]
    pub fn last_sn(&self) -> u32 {
        self.pending.last_sn()
    }

    /// Abort a pending call. The caller's future never resolves.
    pub fn abort(&self, sn: u32) {
        self.pending.abort(sn);
    }

    pub fn abort_all(&self) {
        self.pending.abort_all();
    }

    /// Call a remote API and await its [ApiReturn].
    pub async fn call_api(
        self: &Arc<Self>, api_name: &str, req: Value, options: CallApiOptions,
    ) -> OpResult<ApiReturn> {
        let flowed = match self
            .flows
            .pre_call_api
            .exec(CallApiFlowData { api_name: api_name.to_string(), req, options })
            .await
        {
            FlowControl::Continue(d) => d,
            FlowControl::Abort => return Err(Aborted),
        };
        let CallApiFlowData { api_name, req, options } = flowed;
        let ret = self.do_call_api(&api_name, req.clone(), &options).await?;
        match self
            .flows
            .pre_call_api_return
            .exec(CallApiReturnFlowData { api_name, req, ret })
            .await
        {
            FlowControl::Continue(d) => Ok(d.ret),
            FlowControl::Abort => Err(Aborted),
        }
    }

    /// Typed convenience over [Conn::call_api].
    pub async fn call<Req, Res>(
        self: &Arc<Self>, api_name: &str, req: &Req, options: CallApiOptions,
    ) -> OpResult<Result<Res, TsrpcError>>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        let body = match serde_json::to_value(req) {
            Ok(v) => v,
            Err(e) => {
                return Ok(Err(TsrpcError::new(ErrorKind::LocalError, e.to_string())));
            }
        };
        let ret = self.call_api(api_name, body, options).await?;
        Ok(ret.into_result().and_then(|res| {
            serde_json::from_value(res)
                .map_err(|e| TsrpcError::new(ErrorKind::LocalError, e.to_string()))
        }))
    }

    async fn do_call_api(
        self: &Arc<Self>, api_name: &str, req: Value, options: &CallApiOptions,
    ) -> OpResult<ApiReturn> {
        if self.state() != ConnState::Connected {
            return Ok(ApiReturn::Err(TsrpcError::new(
                ErrorKind::NetworkError,
                "Connection is not connected",
            )));
        }
        let timeout = options.timeout.or(self.call_api_timeout);
        let (abort_handle, abort_reg) = futures::future::AbortHandle::new_pair();
        let on_abort: Box<dyn FnOnce() + Send> = {
            let abort_handle = abort_handle.clone();
            Box::new(move || abort_handle.abort())
        };
        let (sn, reply) = self.pending.register(api_name, timeout, Some(on_abort));
        logger_debug!(self.logger, "{:?} callApi {} sn={}", self, api_name, sn);
        let td = TransportData::Req {
            service_name: api_name.to_string(),
            sn,
            body: req,
            proto_info: self.service_map.version().cloned(),
        };
        let data = match self.encode_data(&td) {
            Ok(d) => d,
            Err(e) => {
                // no wire transmission happened; resolve locally
                self.pending.settle(sn, ApiReturn::Err(e));
                return Ok(reply.wait().await);
            }
        };
        let flowed = match self
            .flows
            .pre_send_data
            .exec(SendDataFlowData {
                data,
                transport_data: td,
                conn: Some(self.clone()),
                conns: None,
            })
            .await
        {
            FlowControl::Continue(d) => d,
            FlowControl::Abort => {
                self.pending.abort(sn);
                return Err(Aborted);
            }
        };
        let conn = self.clone();
        let exchange = futures::future::Abortable::new(
            async move {
                conn.run_exchange(sn, flowed.data, flowed.transport_data).await;
            },
            abort_reg,
        );
        tokio::spawn(exchange);
        Ok(reply.wait().await)
    }

    async fn run_exchange(self: Arc<Self>, sn: u32, data: WireData, td: TransportData) {
        match self.transport.send_data(data.clone(), &td).await {
            Err(e) => {
                logger_warn!(self.logger, "{:?} send sn={} failed: {}", self, sn, e);
                self.pending.settle(sn, ApiReturn::Err(e));
            }
            Ok(reply) => {
                let _ = self
                    .flows
                    .post_send_data
                    .exec(SendDataFlowData {
                        data,
                        transport_data: td,
                        conn: Some(self.clone()),
                        conns: None,
                    })
                    .await;
                if let Some(reply) = reply {
                    self.handle_exchange_reply(sn, reply).await;
                }
            }
        }
    }

    /// Process the reply of a stateless exchange, correlating it to `sn`.
    pub async fn handle_exchange_reply(self: &Arc<Self>, sn: u32, data: WireData) {
        if self.transport.encode_skip_sn() {
            if let WireData::Text(_) = &data {
                let flowed = match self
                    .flows
                    .pre_recv_data
                    .exec(RecvDataFlowData { data, conn: self.clone() })
                    .await
                {
                    FlowControl::Continue(d) => d.data,
                    FlowControl::Abort => return,
                };
                if let WireData::Text(text) = flowed {
                    self.settle_text_return(sn, &text);
                }
                return;
            }
        }
        self.recv_data_supplied(data, None, Some(sn), None).await;
    }

    /// Parse a skip-SN text reply (`decodeReturnText ?? JSON.parse`).
    fn settle_text_return(self: &Arc<Self>, sn: u32, text: &str) {
        let parsed: Result<ApiReturn, String> = match &self.decode_return_text {
            Some(hook) => hook(text),
            None => serde_json::from_str(text).map_err(|e| e.to_string()),
        };
        match parsed {
            Ok(ret) => {
                self.pending.settle(sn, ret);
            }
            Err(e) => {
                logger_warn!(self.logger, "{:?} bad return body: {}", self, e);
                let mut message = String::from("Response body is not a valid JSON.");
                if !self.flows.pre_recv_data.is_empty() {
                    message.push_str(" Check the registered preRecvData flow nodes.");
                }
                self.pending
                    .settle(sn, ApiReturn::Err(TsrpcError::new(ErrorKind::LocalError, message)));
            }
        }
    }

    /// Send a one-way message. Resolves when the bytes are handed off.
    pub async fn send_msg(
        self: &Arc<Self>, msg_name: &str, msg: Value,
    ) -> OpResult<Result<(), TsrpcError>> {
        let flowed = match self
            .flows
            .pre_send_msg
            .exec(MsgFlowData { msg_name: msg_name.to_string(), msg, conn: self.clone() })
            .await
        {
            FlowControl::Continue(d) => d,
            FlowControl::Abort => return Err(Aborted),
        };
        let td = TransportData::Msg { service_name: flowed.msg_name, body: flowed.msg };
        self.send_transport_data(td).await
    }

    /// Encode and send one frame through the full send pipeline.
    pub async fn send_transport_data(
        self: &Arc<Self>, td: TransportData,
    ) -> OpResult<Result<(), TsrpcError>> {
        let data = match self.encode_data(&td) {
            Ok(d) => d,
            Err(e) => return Ok(Err(e)),
        };
        self.send_encoded(data, td).await
    }

    /// Passthrough for user-defined frames: the payload goes on the wire as
    /// is, without box framing (duplex transports frame it themselves).
    pub async fn send_custom(self: &Arc<Self>, data: WireData) -> OpResult<Result<(), TsrpcError>> {
        let raw = match &data {
            WireData::Binary(b) => b.clone(),
            WireData::Text(t) => Bytes::copy_from_slice(t.as_bytes()),
        };
        self.send_encoded(data, TransportData::Custom { data: raw }).await
    }

    async fn send_encoded(
        self: &Arc<Self>, data: WireData, td: TransportData,
    ) -> OpResult<Result<(), TsrpcError>> {
        let flowed = match self
            .flows
            .pre_send_data
            .exec(SendDataFlowData {
                data,
                transport_data: td,
                conn: Some(self.clone()),
                conns: None,
            })
            .await
        {
            FlowControl::Continue(d) => d,
            FlowControl::Abort => return Err(Aborted),
        };
        match self.transport.send_data(flowed.data.clone(), &flowed.transport_data).await {
            Err(e) => {
                logger_warn!(
                    self.logger,
                    "{:?} send {} failed: {}",
                    self,
                    flowed.transport_data,
                    e
                );
                Ok(Err(e))
            }
            Ok(_reply) => {
                let _ = self
                    .flows
                    .post_send_data
                    .exec(SendDataFlowData {
                        data: flowed.data,
                        transport_data: flowed.transport_data,
                        conn: Some(self.clone()),
                        conns: None,
                    })
                    .await;
                Ok(Ok(()))
            }
        }
    }

    /// Register a message listener. Listeners fire in registration order.
    pub fn on_msg(&self, msg_name: &str, listener: MsgListener) -> Result<(), TsrpcError> {
        if self.transport.is_stateless() && self.side == EndpointSide::Client {
            return Err(TsrpcError::new(
                ErrorKind::LocalError,
                "onMsg is not supported on a stateless client transport",
            ));
        }
        self.msg_listeners.on(msg_name, listener, false);
        Ok(())
    }

    /// Register a listener removed after its first fire.
    pub fn once_msg(&self, msg_name: &str, listener: MsgListener) -> Result<(), TsrpcError> {
        if self.transport.is_stateless() && self.side == EndpointSide::Client {
            return Err(TsrpcError::new(
                ErrorKind::LocalError,
                "onMsg is not supported on a stateless client transport",
            ));
        }
        self.msg_listeners.on(msg_name, listener, true);
        Ok(())
    }

    /// Remove one listener, or all listeners of `msg_name` when None.
    pub fn off_msg(&self, msg_name: &str, listener: Option<&MsgListener>) {
        self.msg_listeners.off(msg_name, listener);
    }

    /// Register an API handler on a duplex client endpoint. Duplicate
    /// registration is an error here (servers overwrite instead).
    pub fn implement_api(&self, api_name: &str, handler: ApiHandler) -> Result<(), TsrpcError> {
        if self.transport.is_stateless() {
            return Err(TsrpcError::new(
                ErrorKind::LocalError,
                "implementApi is not supported on a stateless transport",
            ));
        }
        if self.side == EndpointSide::Server {
            return Err(TsrpcError::new(
                ErrorKind::LocalError,
                "implement handlers on the Server, not its connections",
            ));
        }
        let mut handlers = self.duplex_handlers.lock().unwrap();
        if handlers.contains_key(api_name) {
            return Err(TsrpcError::new(
                ErrorKind::LocalError,
                format!("API {} is already implemented", api_name),
            ));
        }
        handlers.insert(api_name.to_string(), handler);
        Ok(())
    }

    /// Inbound raw data from the transport, in arrival order.
    pub async fn recv_data(self: &Arc<Self>, data: WireData) {
        self.recv_data_supplied(data, None, None, None).await;
    }

    /// Inbound raw data plus the fields the transport carries out of band
    /// (URL-derived service name, the exchange's SN, a data-kind header).
    pub async fn recv_data_supplied(
        self: &Arc<Self>, data: WireData, service_name: Option<&str>, sn: Option<u32>,
        kind: Option<DataKind>,
    ) {
        let flowed = match self
            .flows
            .pre_recv_data
            .exec(RecvDataFlowData { data, conn: self.clone() })
            .await
        {
            FlowControl::Continue(d) => d.data,
            FlowControl::Abort => return,
        };
        let decoded = if kind == Some(DataKind::Custom) {
            // passthrough: never parsed or validated
            Ok(TransportData::Custom {
                data: match &flowed {
                    WireData::Binary(buf) => buf.clone(),
                    WireData::Text(text) => Bytes::copy_from_slice(text.as_bytes()),
                },
            })
        } else {
            match &flowed {
                WireData::Binary(buf) => {
                    binary_box::decode(buf, &self.service_map, self.validator.as_ref())
                }
                WireData::Text(text) => text_box::decode(
                    text,
                    &self.service_map,
                    self.validator.as_ref(),
                    TextDecodeCtx { side: Some(self.side), service_name, sn, kind },
                ),
            }
        };
        let td = match decoded {
            Ok(td) => td,
            Err(e) => {
                logger_warn!(self.logger, "{:?} recv decode failed: {}", self, e);
                match self.side {
                    EndpointSide::Server => {
                        // answer the exchange so the peer is not left hanging
                        let _ = self
                            .send_transport_data(TransportData::Err {
                                sn: sn.unwrap_or(0),
                                err: e,
                                proto_info: None,
                            })
                            .await;
                    }
                    EndpointSide::Client => {
                        if let Some(sn) = sn {
                            self.pending.settle(sn, ApiReturn::Err(e));
                        }
                    }
                }
                return;
            }
        };
        if let Some(peer) = td.proto_info() {
            self.check_peer_proto(peer);
        }
        logger_debug!(self.logger, "{:?} recv {}", self, td);
        match td {
            TransportData::Req { service_name, sn, body, .. } => {
                self.handle_api_req(service_name, sn, body).await;
            }
            TransportData::Res { sn: frame_sn, body, .. } => {
                // a stateless exchange's own SN is authoritative (the peer
                // may not have seen one at all)
                self.pending.settle(sn.unwrap_or(frame_sn), ApiReturn::Succ(body));
            }
            TransportData::Err { sn: frame_sn, err, .. } => {
                self.pending.settle(sn.unwrap_or(frame_sn), ApiReturn::Err(err));
            }
            TransportData::Msg { service_name, body } => {
                self.handle_msg(service_name, body).await;
            }
            TransportData::Custom { data } => {
                logger_debug!(self.logger, "{:?} custom frame {}B passed through", self, data.len());
            }
            TransportData::Heartbeat | TransportData::Handshake => {
                logger_debug!(self.logger, "{:?} lifecycle frame", self);
            }
        }
    }

    async fn handle_api_req(self: &Arc<Self>, api_name: String, sn: u32, body: Value) {
        if let Some(server) = self.server.as_ref().and_then(Weak::upgrade) {
            server.dispatch_api_req(self, api_name, sn, body).await;
        } else if self.side == EndpointSide::Client {
            let handler = self.duplex_handlers.lock().unwrap().get(&api_name).cloned();
            crate::server::run_api_call(self, handler, api_name, sn, body, None, true, None).await;
        } else {
            logger_error!(self.logger, "{:?} req {} but no dispatcher attached", self, api_name);
        }
    }

    async fn handle_msg(self: &Arc<Self>, msg_name: String, msg: Value) {
        let flowed = match self
            .flows
            .pre_recv_msg
            .exec(MsgFlowData { msg_name, msg, conn: self.clone() })
            .await
        {
            FlowControl::Continue(d) => d,
            FlowControl::Abort => return,
        };
        let notify =
            MsgNotify { msg_name: flowed.msg_name, msg: flowed.msg, conn: self.clone() };
        self.msg_listeners.emit(&notify);
        if let Some(server) = self.server.as_ref().and_then(Weak::upgrade) {
            server.emit_msg(&notify);
        }
    }

    /// Log (never act on) schema skew between the peers.
    pub fn check_peer_proto(&self, peer: &ProtoInfo) {
        if let Some(local) = self.service_map.version() {
            if peer.md5 != local.md5 {
                logger_warn!(
                    self.logger,
                    "{:?} proto skew: local md5 {} != peer md5 {} (peer tsrpc {})",
                    self,
                    local.md5,
                    peer.md5,
                    peer.tsrpc,
                );
            }
        }
    }

    pub(crate) fn encode_data(&self, td: &TransportData) -> Result<WireData, TsrpcError> {
        match self.transport.data_type() {
            DataType::Buffer => {
                binary_box::encode(td, &self.service_map, self.validator.as_ref())
                    .map(WireData::Binary)
            }
            DataType::Text => text_box::encode(
                td,
                &self.service_map,
                self.validator.as_ref(),
                self.transport.encode_skip_sn(),
            )
            .map(WireData::Text),
        }
    }

    /// Manual disconnect.
    pub async fn disconnect(self: &Arc<Self>, code: Option<u16>, reason: &str) {
        self.do_disconnect(code, reason, true).await;
    }

    pub(crate) async fn do_disconnect(
        self: &Arc<Self>, code: Option<u16>, reason: &str, is_manual: bool,
    ) {
        // teardown runs exactly once, however many paths race into it
        if self.closed.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        *self.state.lock().unwrap() = ConnState::Disconnecting;
        self.transport.close(code, reason).await;
        *self.state.lock().unwrap() = ConnState::Disconnected;
        self.pending.settle_all(TsrpcError::conn_disconnected());
        if let Some(server) = self.server.as_ref().and_then(Weak::upgrade) {
            server.remove_conn(self.id);
        }
        let _ = self
            .flows
            .post_disconnect
            .exec(DisconnectFlowData {
                conn: self.clone(),
                reason: reason.to_string(),
                is_manual,
            })
            .await;
        logger_debug!(self.logger, "{:?} disconnected: {}", self, reason);
    }

    /// Pre-encoded fan-out path for broadcasts: the flow pipeline already ran
    /// once for the whole partition.
    pub(crate) async fn send_raw(
        &self, data: WireData, td: &TransportData,
    ) -> Result<(), TsrpcError> {
        self.transport.send_data(data, td).await.map(|_| ())
    }

    /// Stop accepting new work; used by the server's graceful stop.
    pub(crate) fn mark_disconnecting(&self) {
        let mut state = self.state.lock().unwrap();
        if *state == ConnState::Connected {
            *state = ConnState::Disconnecting;
        }
    }
}

impl fmt::Display for Conn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.remote {
            Some(remote) => write!(f, "conn#{}({})", self.id, remote),
            None => write!(f, "conn#{}", self.id),
        }
    }
}

impl fmt::Debug for Conn {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
