//! The HTTP server: every inbound request becomes one transient connection.

use crate::net::{
    content_type_of, is_text_content_type, parse_data_type_header, HEADER_DATA_TYPE,
    HEADER_PROTO_INFO,
};
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use bytes::Bytes;
use crossfire::MTx;
use futures::future::BoxFuture;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tsrpc::{
    ApiHandler, AutoImplDelay, AutoImplResult, Conn, ConnTransport, Flows, HandlerLoader,
    MsgListener, Server, ServerState, ServerTransport, WireData,
};
use tsrpc_core::error::{ApiReturn, ErrorKind, TsrpcError};
use tsrpc_core::{
    DataKind, DataType, EncodeReturnText, ProtoInfo, ServerConfig, ServiceProto, TransportData,
    Validator,
};

pub struct HttpServer {
    server: Arc<Server>,
    state: Arc<ServeState>,
}

impl HttpServer {
    pub fn new(
        proto: &ServiceProto, validator: Arc<dyn Validator>, config: ServerConfig,
    ) -> Result<Self, TsrpcError> {
        let state = Arc::new(ServeState::default());
        let transport = HttpServerTransport { state: state.clone() };
        let server = Server::new(proto, validator, Box::new(transport), config)?;
        Ok(Self { server, state })
    }

    #[inline]
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    #[inline]
    pub fn flows(&self) -> &Arc<Flows> {
        self.server.flows()
    }

    #[inline]
    pub fn state(&self) -> ServerState {
        self.server.state()
    }

    /// Address actually bound; differs from the configured port when it is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.state.local_addr.lock().unwrap()
    }

    pub async fn start(&self) -> Result<(), TsrpcError> {
        self.server.start().await
    }

    pub async fn stop(&self, graceful_wait: Option<Duration>) {
        self.server.stop(graceful_wait).await;
    }

    pub fn implement_api(&self, api_name: &str, handler: ApiHandler) {
        self.server.implement_api(api_name, handler);
    }

    pub fn auto_implement_api(
        &self, loader: Arc<dyn HandlerLoader>, api_dir: &Path, delay: Option<AutoImplDelay>,
    ) -> AutoImplResult {
        self.server.auto_implement_api(loader, api_dir, delay)
    }

    pub fn on_msg(&self, msg_name: &str, listener: MsgListener) {
        self.server.on_msg(msg_name, listener);
    }

    pub fn once_msg(&self, msg_name: &str, listener: MsgListener) {
        self.server.once_msg(msg_name, listener);
    }

    pub fn off_msg(&self, msg_name: &str, listener: Option<&MsgListener>) {
        self.server.off_msg(msg_name, listener);
    }

    pub fn pending_api_call_num(&self) -> usize {
        self.server.pending_api_call_num()
    }
}

#[derive(Default)]
struct ServeState {
    cancel: Mutex<Option<CancellationToken>>,
    local_addr: Mutex<Option<SocketAddr>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct HttpServerTransport {
    state: Arc<ServeState>,
}

impl ServerTransport for HttpServerTransport {
    fn start(&self, server: Arc<Server>) -> BoxFuture<'static, Result<(), TsrpcError>> {
        let state = self.state.clone();
        Box::pin(async move {
            let addr = SocketAddr::from(([0, 0, 0, 0], server.config().port));
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| TsrpcError::new(ErrorKind::NetworkError, e.to_string()))?;
            let local = listener
                .local_addr()
                .map_err(|e| TsrpcError::new(ErrorKind::NetworkError, e.to_string()))?;
            *state.local_addr.lock().unwrap() = Some(local);
            let cancel = CancellationToken::new();
            *state.cancel.lock().unwrap() = Some(cancel.clone());
            let app = Router::new()
                .fallback(handle_request)
                .with_state(AppState { server });
            let serve =
                axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                    .with_graceful_shutdown(async move { cancel.cancelled().await });
            let handle = tokio::spawn(async move {
                if let Err(e) = serve.await {
                    log::error!("http serve error: {}", e);
                }
            });
            *state.handle.lock().unwrap() = Some(handle);
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'static, ()> {
        let state = self.state.clone();
        Box::pin(async move {
            if let Some(cancel) = state.cancel.lock().unwrap().take() {
                cancel.cancel();
            }
            let handle = state.handle.lock().unwrap().take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
            *state.local_addr.lock().unwrap() = None;
        })
    }
}

#[derive(Clone)]
struct AppState {
    server: Arc<Server>,
}

/// One exchange's reply, pushed by the transient connection's transport.
struct HttpReply {
    body: Bytes,
    content_type: &'static str,
}

/// Transport half of a transient server connection: the only legal sends are
/// the `res`/`err` answering this exchange.
struct HttpExchangeTransport {
    data_type: DataType,
    reply_tx: Mutex<Option<MTx<HttpReply>>>,
    encode_return_text: Option<EncodeReturnText>,
    remote: String,
}

impl ConnTransport for HttpExchangeTransport {
    fn data_type(&self) -> DataType {
        self.data_type
    }

    fn is_stateless(&self) -> bool {
        true
    }

    fn remote(&self) -> Option<String> {
        Some(self.remote.clone())
    }

    fn send_data(
        &self, data: WireData, td: &TransportData,
    ) -> BoxFuture<'static, Result<Option<WireData>, TsrpcError>> {
        let result = match td.kind() {
            DataKind::Res | DataKind::Err => match self.reply_tx.lock().unwrap().take() {
                None => Err(TsrpcError::new(
                    ErrorKind::LocalError,
                    "HTTP exchange is already answered",
                )),
                Some(tx) => {
                    let payload = match self.data_type {
                        // the text response body is a JSON ApiReturn document
                        DataType::Text => {
                            let ret = match td {
                                TransportData::Res { body, .. } => ApiReturn::Succ(body.clone()),
                                TransportData::Err { err, .. } => ApiReturn::Err(err.clone()),
                                _ => unreachable!(),
                            };
                            let text = match &self.encode_return_text {
                                Some(hook) => hook(&ret),
                                None => serde_json::to_string(&ret).unwrap_or_else(|e| {
                                    format!(
                                        r#"{{"isSucc":false,"err":{{"message":"{}","type":"ServerError"}}}}"#,
                                        e
                                    )
                                }),
                            };
                            Bytes::from(text)
                        }
                        DataType::Buffer => match data {
                            WireData::Binary(b) => b,
                            WireData::Text(t) => Bytes::from(t),
                        },
                    };
                    tx.send(HttpReply { body: payload, content_type: content_type_of(self.data_type) })
                        .map(|_| None)
                        .map_err(|_| TsrpcError::new(ErrorKind::NetworkError, "exchange is gone"))
                }
            },
            _ => Err(TsrpcError::new(
                ErrorKind::LocalError,
                "HTTP cannot push frames outside a request/response exchange",
            )),
        };
        Box::pin(async move { result })
    }

    fn close(&self, _code: Option<u16>, _reason: &str) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

/// Disconnects the transient connection however the exchange ends, including
/// a client that walks away mid-dispatch.
struct ExchangeGuard(Arc<Conn>);

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        let conn = self.0.clone();
        tokio::spawn(async move {
            conn.disconnect(None, "Exchange complete").await;
        });
    }
}

async fn handle_request(
    State(state): State<AppState>, ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let server = state.server;
    let config = server.config().clone();
    let mut headers = HeaderMap::new();
    if let Some(origin) = &config.cors {
        insert_header(&mut headers, "access-control-allow-origin", origin);
    }
    if req.method() == Method::OPTIONS {
        insert_header(&mut headers, "access-control-allow-methods", "POST, OPTIONS");
        insert_header(
            &mut headers,
            "access-control-allow-headers",
            "Content-Type, X-TSRPC-DATA-TYPE, X-TSRPC-PROTO-INFO",
        );
        insert_header(
            &mut headers,
            "access-control-max-age",
            &config.cors_max_age.as_secs().to_string(),
        );
        return respond(StatusCode::OK, headers, Bytes::new());
    }
    if req.method() != Method::POST {
        return respond(StatusCode::METHOD_NOT_ALLOWED, headers, Bytes::new());
    }
    if let Some(version) = server.service_map().version() {
        if let Ok(json) = serde_json::to_string(version) {
            insert_header(&mut headers, HEADER_PROTO_INFO, &json);
        }
    }

    let path = req.uri().path().to_string();
    let is_text = match req.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
        Some(value) => is_text_content_type(value),
        None => config.default_data_type == DataType::Text,
    };
    let kind_hint = req
        .headers()
        .get(HEADER_DATA_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_data_type_header);
    let peer_proto = req
        .headers()
        .get(HEADER_PROTO_INFO)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| serde_json::from_str::<ProtoInfo>(s).ok());
    let body = match axum::body::to_bytes(req.into_body(), usize::MAX).await {
        Ok(b) => b,
        Err(_) => return respond(StatusCode::BAD_REQUEST, headers, Bytes::new()),
    };

    let (reply_tx, reply_rx) = crossfire::mpsc::unbounded_async::<HttpReply>();
    let data_type = if is_text { DataType::Text } else { DataType::Buffer };
    let transport = HttpExchangeTransport {
        data_type,
        reply_tx: Mutex::new(Some(reply_tx)),
        encode_return_text: config.encode_return_text.clone(),
        remote: remote.to_string(),
    };
    let conn = server.accept_conn(Box::new(transport)).await;
    let _guard = ExchangeGuard(conn.clone());
    if let Some(info) = &peer_proto {
        conn.check_peer_proto(info);
    }

    // in text mode the URL carries the service name
    let service_name: Option<String> = if is_text {
        path.strip_prefix(config.json_host_path.as_str())
            .map(|rest| rest.trim_start_matches('/').to_string())
    } else {
        None
    };
    let data = if is_text {
        WireData::Text(String::from_utf8_lossy(&body).into_owned())
    } else {
        WireData::Binary(body)
    };

    let exchange = async move {
        conn.recv_data_supplied(data, service_name.as_deref(), None, kind_hint).await;
        match reply_rx.try_recv() {
            Ok(reply) => Some(reply),
            Err(_) => None,
        }
    };
    let reply = match config.socket_timeout {
        Some(budget) => match tokio::time::timeout(budget, exchange).await {
            Ok(reply) => reply,
            Err(_) => return respond(StatusCode::REQUEST_TIMEOUT, headers, Bytes::new()),
        },
        None => exchange.await,
    };
    match reply {
        Some(reply) => {
            insert_header(&mut headers, "content-type", reply.content_type);
            respond(StatusCode::OK, headers, reply.body)
        }
        None => {
            if matches!(kind_hint, Some(DataKind::Msg) | Some(DataKind::Custom)) {
                // one-way frames are acknowledged with an empty 200
                respond(StatusCode::OK, headers, Bytes::new())
            } else {
                // a flow abort leaves the exchange unanswered until the
                // client gives up, mirroring the duplex behavior
                futures::future::pending().await
            }
        }
    }
}

fn insert_header(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) =
        (name.parse::<HeaderName>(), HeaderValue::from_str(value))
    {
        headers.insert(name, value);
    }
}

fn respond(status: StatusCode, headers: HeaderMap, body: Bytes) -> Response {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}
