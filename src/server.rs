//! The server endpoint: owns the connection set, dispatches inbound calls to
//! registered handlers, and implements graceful stop and broadcast.

use crate::call::ApiCall;
use crate::conn::{Conn, ConnOptions, ConnState, ConnTransport, MsgListener, MsgListenerTable, MsgNotify, WireData};
use crate::flows::{ApiCallFlowData, ApiCallReturnFlowData, BroadcastMsgFlowData, ConnFlowData, Flows, SendDataFlowData};
use captains_log::filter::LogFilter;
use futures::future::BoxFuture;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};
use tsrpc_core::error::{
    ApiReturn, ErrorKind, TsrpcError, CODE_INTERNAL_ERR, CODE_NOT_IMPLEMENTED, CODE_SERVER_TIMEOUT,
};
use tsrpc_core::logger::new_logger;
use tsrpc_core::{
    binary_box, text_box, Aborted, Counter, DataType, EndpointSide, FlowControl, OpResult,
    ServerConfig, ServiceMap, ServiceProto, TransportData, Validator,
};

/// An API handler. Resolve the call through [ApiCall::succ] / [ApiCall::error];
/// returning `Err` with an `ApiError` kind forwards it verbatim, any other
/// `Err` becomes `ServerError/INTERNAL_ERR`.
pub type ApiHandler =
    Arc<dyn Fn(ApiCall) -> BoxFuture<'static, Result<(), TsrpcError>> + Send + Sync>;

/// Wrap an async closure into an [ApiHandler].
pub fn api_handler<F, Fut>(f: F) -> ApiHandler
where
    F: Fn(ApiCall) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), TsrpcError>> + Send + 'static,
{
    Arc::new(move |call| Box::pin(f(call)))
}

/// Transport-specific listen/accept machinery under a [Server].
pub trait ServerTransport: Send + Sync + 'static {
    fn start(&self, server: Arc<Server>) -> BoxFuture<'static, Result<(), TsrpcError>>;
    fn stop(&self) -> BoxFuture<'static, ()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// Pluggable source of API handlers for [Server::auto_implement_api].
pub trait HandlerLoader: Send + Sync + 'static {
    fn load(&self, api_dir: &Path, api_name: &str) -> Result<ApiHandler, TsrpcError>;
}

/// Deferred-loading policy for [Server::auto_implement_api].
#[derive(Debug, Clone, Copy)]
pub enum AutoImplDelay {
    /// Install a stub that loads the real handler on first invocation.
    Lazy,
    /// Schedule eager loading after the given delay.
    After(Duration),
}

#[derive(Debug, Default)]
pub struct AutoImplResult {
    pub succ: Vec<String>,
    pub fail: Vec<(String, TsrpcError)>,
    pub delay: Vec<String>,
}

pub struct Server {
    config: ServerConfig,
    state: Mutex<ServerState>,
    conns: Mutex<FxHashMap<u32, Arc<Conn>>>,
    api_handlers: RwLock<FxHashMap<String, ApiHandler>>,
    msg_listeners: MsgListenerTable,
    flows: Arc<Flows>,
    service_map: Arc<ServiceMap>,
    validator: Arc<dyn Validator>,
    logger: Arc<LogFilter>,
    conn_id_counter: Counter,
    pending_api_call_num: Arc<AtomicUsize>,
    transport: Box<dyn ServerTransport>,
}

impl Server {
    pub fn new(
        proto: &ServiceProto, validator: Arc<dyn Validator>, transport: Box<dyn ServerTransport>,
        config: ServerConfig,
    ) -> Result<Arc<Self>, TsrpcError> {
        let service_map = Arc::new(ServiceMap::build(proto, EndpointSide::Server)?);
        let logger = new_logger(config.log_level);
        Ok(Arc::new(Self {
            config,
            state: Mutex::new(ServerState::Stopped),
            conns: Mutex::new(FxHashMap::default()),
            api_handlers: RwLock::new(FxHashMap::default()),
            msg_listeners: MsgListenerTable::new(),
            flows: Flows::new(),
            service_map,
            validator,
            logger,
            conn_id_counter: Counter::new(),
            pending_api_call_num: Arc::new(AtomicUsize::new(0)),
            transport,
        }))
    }

    #[inline]
    pub fn state(&self) -> ServerState {
        *self.state.lock().unwrap()
    }

    #[inline]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[inline]
    pub fn flows(&self) -> &Arc<Flows> {
        &self.flows
    }

    #[inline]
    pub fn service_map(&self) -> &Arc<ServiceMap> {
        &self.service_map
    }

    #[inline]
    pub fn validator(&self) -> &Arc<dyn Validator> {
        &self.validator
    }

    #[inline]
    pub fn logger(&self) -> &Arc<LogFilter> {
        &self.logger
    }

    /// API calls currently inside a handler (graceful stop drains this).
    #[inline]
    pub fn pending_api_call_num(&self) -> usize {
        self.pending_api_call_num.load(Ordering::SeqCst)
    }

    /// Snapshot of the live connections.
    pub fn conns(&self) -> Vec<Arc<Conn>> {
        self.conns.lock().unwrap().values().cloned().collect()
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), TsrpcError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != ServerState::Stopped {
                return Err(TsrpcError::new(
                    ErrorKind::LocalError,
                    format!("Server cannot start from state {:?}", *state),
                ));
            }
            *state = ServerState::Starting;
        }
        match self.transport.start(self.clone()).await {
            Ok(()) => {
                *self.state.lock().unwrap() = ServerState::Started;
                logger_info!(self.logger, "server started (port {})", self.config.port);
                Ok(())
            }
            Err(e) => {
                *self.state.lock().unwrap() = ServerState::Stopped;
                logger_error!(self.logger, "server start failed: {}", e);
                Err(e)
            }
        }
    }

    /// Stop the server. With a grace window, in-flight API calls are drained
    /// first: connections stop accepting new calls, and the hard stop runs
    /// when the handler count hits zero or the window elapses, whichever
    /// comes first.
    pub async fn stop(self: &Arc<Self>, graceful_wait: Option<Duration>) {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                ServerState::Started => *state = ServerState::Stopping,
                _ => return,
            }
        }
        if let Some(grace) = graceful_wait {
            if !grace.is_zero() {
                logger_info!(self.logger, "graceful stop, draining up to {:?}", grace);
                for conn in self.conns() {
                    conn.mark_disconnecting();
                }
                let deadline = Instant::now() + grace;
                while self.pending_api_call_num() > 0 && Instant::now() < deadline {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
        let remaining = {
            let mut conns = self.conns.lock().unwrap();
            conns.drain().map(|(_, c)| c).collect::<Vec<_>>()
        };
        for conn in remaining {
            conn.do_disconnect(None, "Server stopped", true).await;
        }
        self.transport.stop().await;
        *self.state.lock().unwrap() = ServerState::Stopped;
        logger_info!(self.logger, "server stopped");
    }

    /// Register a handler. Duplicate registration overwrites.
    pub fn implement_api(&self, api_name: &str, handler: ApiHandler) {
        let prev = self.api_handlers.write().unwrap().insert(api_name.to_string(), handler);
        if prev.is_some() {
            logger_warn!(self.logger, "API {} handler overwritten", api_name);
        }
    }

    /// Enumerate every local API service and load its handler through the
    /// [HandlerLoader]. Failed loads install a NOT_IMPLEMENTED stub.
    pub fn auto_implement_api(
        self: &Arc<Self>, loader: Arc<dyn HandlerLoader>, api_dir: &Path,
        delay: Option<AutoImplDelay>,
    ) -> AutoImplResult {
        let mut result = AutoImplResult::default();
        let mut names: Vec<String> = self.service_map.local_api().keys().cloned().collect();
        names.sort();
        for name in names {
            match delay {
                None => match loader.load(api_dir, &name) {
                    Ok(handler) => {
                        self.implement_api(&name, handler);
                        result.succ.push(name);
                    }
                    Err(e) => {
                        logger_warn!(self.logger, "load API {} failed: {}", name, e);
                        self.implement_api(&name, not_implemented_stub());
                        result.fail.push((name, e));
                    }
                },
                Some(AutoImplDelay::Lazy) => {
                    self.implement_api(
                        &name,
                        lazy_stub(loader.clone(), api_dir.to_path_buf(), name.clone()),
                    );
                    result.delay.push(name);
                }
                Some(AutoImplDelay::After(d)) => {
                    let server = Arc::downgrade(self);
                    let loader = loader.clone();
                    let dir = api_dir.to_path_buf();
                    let api_name = name.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(d).await;
                        let Some(server) = server.upgrade() else { return };
                        match loader.load(&dir, &api_name) {
                            Ok(handler) => server.implement_api(&api_name, handler),
                            Err(e) => {
                                logger_warn!(
                                    server.logger,
                                    "deferred load of API {} failed: {}",
                                    api_name,
                                    e
                                );
                                server.implement_api(&api_name, not_implemented_stub());
                            }
                        }
                    });
                    result.delay.push(name);
                }
            }
        }
        result
    }

    /// Server-level message listeners observe messages on every connection.
    pub fn on_msg(&self, msg_name: &str, listener: MsgListener) {
        self.msg_listeners.on(msg_name, listener, false);
    }

    pub fn once_msg(&self, msg_name: &str, listener: MsgListener) {
        self.msg_listeners.on(msg_name, listener, true);
    }

    pub fn off_msg(&self, msg_name: &str, listener: Option<&MsgListener>) {
        self.msg_listeners.off(msg_name, listener);
    }

    pub(crate) fn emit_msg(&self, notify: &MsgNotify) {
        self.msg_listeners.emit(notify);
    }

    /// Adopt a freshly-established transport channel as a connection.
    pub async fn accept_conn(self: &Arc<Self>, transport: Box<dyn ConnTransport>) -> Arc<Conn> {
        let id = self.conn_id_counter.next();
        let conn = Conn::new(ConnOptions {
            id,
            side: EndpointSide::Server,
            service_map: self.service_map.clone(),
            validator: self.validator.clone(),
            flows: self.flows.clone(),
            logger: self.logger.clone(),
            transport,
            call_api_timeout: None,
            decode_return_text: None,
            server: Some(Arc::downgrade(self)),
            initial_state: ConnState::Connected,
        });
        self.conns.lock().unwrap().insert(id, conn.clone());
        let _ = self.flows.post_connect.exec(ConnFlowData { conn: conn.clone() }).await;
        conn
    }

    pub(crate) fn remove_conn(&self, id: u32) {
        self.conns.lock().unwrap().remove(&id);
    }

    pub(crate) async fn dispatch_api_req(
        self: &Arc<Self>, conn: &Arc<Conn>, api_name: String, sn: u32, body: Value,
    ) {
        if self.state() != ServerState::Started || conn.state() != ConnState::Connected {
            let _ = conn
                .send_transport_data(TransportData::Err {
                    sn,
                    err: TsrpcError::new(ErrorKind::ServerError, "Server is stopping"),
                    proto_info: None,
                })
                .await;
            return;
        }
        let handler = self.api_handlers.read().unwrap().get(&api_name).cloned();
        run_api_call(
            conn,
            handler,
            api_name,
            sn,
            body,
            self.config.api_timeout,
            self.config.return_inner_error,
            Some(self.pending_api_call_num.clone()),
        )
        .await;
    }

    /// Broadcast a message. The body is encoded once per dataType partition
    /// regardless of the number of target connections, and `preSendData`
    /// runs once per partition.
    pub async fn broadcast_msg(
        self: &Arc<Self>, msg_name: &str, msg: Value, conns: Option<Vec<Arc<Conn>>>,
    ) -> OpResult<Result<(), TsrpcError>> {
        if self.state() != ServerState::Started {
            return Ok(Err(TsrpcError::new(ErrorKind::LocalError, "Server is not started")));
        }
        let targets = conns.unwrap_or_else(|| self.conns());
        if targets.is_empty() {
            return Ok(Ok(()));
        }
        let flowed = match self
            .flows
            .pre_broadcast_msg
            .exec(BroadcastMsgFlowData {
                msg_name: msg_name.to_string(),
                msg,
                conns: targets,
            })
            .await
        {
            FlowControl::Continue(d) => d,
            FlowControl::Abort => return Err(Aborted),
        };
        let td = TransportData::Msg { service_name: flowed.msg_name, body: flowed.msg };

        let mut partitions: FxHashMap<DataType, Vec<Arc<Conn>>> = FxHashMap::default();
        for conn in flowed.conns {
            partitions.entry(conn.data_type()).or_default().push(conn);
        }
        let total = partitions.len();
        let mut aborted = 0usize;
        let mut errors: Vec<String> = Vec::new();
        for (data_type, partition) in partitions {
            // encode once per partition
            let encoded = match data_type {
                DataType::Buffer => {
                    binary_box::encode(&td, &self.service_map, self.validator.as_ref())
                        .map(WireData::Binary)
                }
                DataType::Text => {
                    text_box::encode(&td, &self.service_map, self.validator.as_ref(), false)
                        .map(WireData::Text)
                }
            };
            let data = match encoded {
                Ok(d) => d,
                Err(e) => {
                    errors.push(e.to_string());
                    continue;
                }
            };
            let flowed_data = match self
                .flows
                .pre_send_data
                .exec(SendDataFlowData {
                    data,
                    transport_data: td.clone(),
                    conn: None,
                    conns: Some(partition.clone()),
                })
                .await
            {
                FlowControl::Continue(d) => d.data,
                FlowControl::Abort => {
                    aborted += 1;
                    continue;
                }
            };
            let sends = partition.iter().map(|conn| {
                let data = flowed_data.clone();
                let td = &td;
                async move { (conn.id, conn.send_raw(data, td).await) }
            });
            for (conn_id, sent) in futures::future::join_all(sends).await {
                if let Err(e) = sent {
                    errors.push(format!("conn#{}: {}", conn_id, e));
                }
            }
            let _ = self
                .flows
                .post_send_data
                .exec(SendDataFlowData {
                    data: flowed_data,
                    transport_data: td.clone(),
                    conn: None,
                    conns: Some(partition),
                })
                .await;
        }
        if aborted == total {
            return Err(Aborted);
        }
        if errors.is_empty() {
            Ok(Ok(()))
        } else {
            Ok(Err(TsrpcError::new(ErrorKind::NetworkError, errors.join("; "))))
        }
    }
}

fn not_implemented_stub() -> ApiHandler {
    api_handler(|call: ApiCall| async move {
        call.error(
            TsrpcError::new(ErrorKind::ServerError, "API not implemented")
                .with_code(CODE_NOT_IMPLEMENTED),
        );
        Ok(())
    })
}

fn lazy_stub(loader: Arc<dyn HandlerLoader>, dir: PathBuf, api_name: String) -> ApiHandler {
    let cell: Arc<OnceLock<Result<ApiHandler, TsrpcError>>> = Arc::new(OnceLock::new());
    Arc::new(move |call| {
        let loaded = cell.get_or_init(|| loader.load(&dir, &api_name)).clone();
        Box::pin(async move {
            match loaded {
                Ok(handler) => handler(call).await,
                Err(_) => {
                    call.error(
                        TsrpcError::new(ErrorKind::ServerError, "API not implemented")
                            .with_code(CODE_NOT_IMPLEMENTED),
                    );
                    Ok(())
                }
            }
        })
    })
}

/// Guard keeping the drain counter accurate on every exit path.
struct CallCountGuard(Option<Arc<AtomicUsize>>);

impl CallCountGuard {
    fn new(counter: Option<Arc<AtomicUsize>>) -> Self {
        if let Some(c) = &counter {
            c.fetch_add(1, Ordering::SeqCst);
        }
        Self(counter)
    }
}

impl Drop for CallCountGuard {
    fn drop(&mut self) {
        if let Some(c) = &self.0 {
            c.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Run one inbound API call through flows, handler, timeout guard, and the
/// response send. Shared by server dispatch and duplex client endpoints.
pub(crate) async fn run_api_call(
    conn: &Arc<Conn>, handler: Option<ApiHandler>, api_name: String, sn: u32, body: Value,
    api_timeout: Option<Duration>, return_inner_error: bool, counter: Option<Arc<AtomicUsize>>,
) {
    let _guard = CallCountGuard::new(counter);
    let flows = conn.flows().clone();
    let (reply_tx, reply_rx) = crossfire::mpsc::unbounded_async::<ApiReturn>();
    let call = ApiCall::new(api_name.clone(), sn, body, conn.clone(), reply_tx);
    let call = match flows.pre_api_call.exec(ApiCallFlowData { call }).await {
        FlowControl::Continue(d) => d.call,
        FlowControl::Abort => return,
    };
    match handler {
        None => {
            call.error(
                TsrpcError::new(ErrorKind::ServerError, "API not implemented")
                    .with_code(CODE_NOT_IMPLEMENTED),
            );
        }
        Some(handler) => {
            if let Some(t) = api_timeout {
                let timeout_call = call.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(t).await;
                    let timed_out = timeout_call.error(
                        TsrpcError::new(ErrorKind::ServerError, "Server Timeout")
                            .with_code(CODE_SERVER_TIMEOUT),
                    );
                    if timed_out {
                        logger_warn!(
                            timeout_call.conn.logger(),
                            "{:?} exceeded api timeout {:?}",
                            timeout_call,
                            t
                        );
                    }
                });
            }
            let handler_call = call.clone();
            tokio::spawn(async move {
                match handler(handler_call.clone()).await {
                    Ok(()) => {
                        // a handler that returns without resolving leaves the
                        // exchange dangling; answer for it
                        handler_call.error(
                            TsrpcError::new(ErrorKind::ServerError, "API handler did not reply")
                                .with_code(CODE_INTERNAL_ERR),
                        );
                    }
                    Err(e) => {
                        let err = if e.kind == ErrorKind::ApiError {
                            e
                        } else {
                            let mut wrapped =
                                TsrpcError::new(ErrorKind::ServerError, "Internal Server Error")
                                    .with_code(CODE_INTERNAL_ERR);
                            if return_inner_error {
                                wrapped = wrapped.with_inner(e.message);
                            }
                            wrapped
                        };
                        handler_call.error(err);
                    }
                }
            });
        }
    }
    let ret = match reply_rx.recv().await {
        Ok(ret) => ret,
        Err(_) => {
            logger_warn!(conn.logger(), "{:?} {} sn={} finished without reply", conn, api_name, sn);
            return;
        }
    };
    let ret = match flows
        .pre_api_call_return
        .exec(ApiCallReturnFlowData { call: call.clone(), ret })
        .await
    {
        FlowControl::Continue(d) => d.ret,
        FlowControl::Abort => return,
    };
    let proto_info = conn.service_map().version().cloned();
    let (was_succ, td) = match ret {
        ApiReturn::Succ(res) => {
            (true, TransportData::Res { service_name: api_name, sn, body: res, proto_info })
        }
        ApiReturn::Err(err) => (false, TransportData::Err { sn, err, proto_info }),
    };
    if let Ok(Err(e)) = conn.send_transport_data(td).await {
        if was_succ {
            // the success body would not encode; the caller still deserves
            // an answer
            let _ = conn
                .send_transport_data(TransportData::Err {
                    sn,
                    err: TsrpcError::new(ErrorKind::ServerError, e.message)
                        .with_code(CODE_INTERNAL_ERR),
                    proto_info: None,
                })
                .await;
        }
    }
}
