//! The stateless HTTP client: each `callApi` maps to one POST exchange.

use crate::net::{
    content_type_of, data_type_header_of, HEADER_DATA_TYPE, HEADER_PROTO_INFO,
};
use bytes::Bytes;
use captains_log::filter::LogFilter;
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::io;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::net::TcpStream;
use tsrpc::{CallApiOptions, Conn, ConnOptions, ConnState, ConnTransport, Flows, WireData};
use tsrpc_core::error::{ApiReturn, ErrorKind, TsrpcError, CODE_ECONNREFUSED};
use tsrpc_core::logger::new_logger;
use tsrpc_core::{
    ClientConfig, Counter, DataType, EndpointSide, OpResult, ProtoInfo, ServiceMap, ServiceProto,
    TransportData, Validator,
};
use url::Url;

static CONN_ID: OnceLock<Counter> = OnceLock::new();

pub struct HttpClient {
    conn: Arc<Conn>,
    peer_proto: Arc<Mutex<Option<ProtoInfo>>>,
    logger: Arc<LogFilter>,
}

impl HttpClient {
    pub fn new(
        proto: &ServiceProto, validator: Arc<dyn Validator>, config: ClientConfig,
    ) -> Result<Self, TsrpcError> {
        let service_map = Arc::new(ServiceMap::build(proto, EndpointSide::Client)?);
        let url = Url::parse(&config.server).map_err(|e| {
            TsrpcError::new(ErrorKind::LocalError, format!("Invalid server URL: {}", e))
        })?;
        if url.scheme() != "http" {
            return Err(TsrpcError::new(
                ErrorKind::LocalError,
                "TLS termination is external; the server URL must be http://",
            ));
        }
        let host = url
            .host_str()
            .ok_or_else(|| TsrpcError::new(ErrorKind::LocalError, "Server URL has no host"))?;
        let addr = format!("{}:{}", host, url.port_or_known_default().unwrap_or(80));
        let host_header = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let mut path_base = url.path().to_string();
        if !path_base.ends_with('/') {
            path_base.push('/');
        }
        let logger = new_logger(config.log_level);
        if config.heartbeat {
            logger_debug!(logger, "heartbeat has no effect on the HTTP transport");
        }
        let proto_info_json = service_map
            .version()
            .and_then(|v| serde_json::to_string(v).ok());
        let peer_proto = Arc::new(Mutex::new(None));
        let transport = HttpClientTransport {
            addr,
            host_header,
            path_base,
            data_type: config.data_type,
            proto_info_json,
            peer_proto: peer_proto.clone(),
            service_map: service_map.clone(),
            logger: logger.clone(),
        };
        let conn = Conn::new(ConnOptions {
            id: CONN_ID.get_or_init(Counter::new).next(),
            side: EndpointSide::Client,
            service_map,
            validator,
            flows: Flows::new(),
            logger: logger.clone(),
            transport: Box::new(transport),
            call_api_timeout: config.call_api_timeout,
            decode_return_text: config.decode_return_text.clone(),
            server: None,
            initial_state: ConnState::Connected,
        });
        Ok(Self { conn, peer_proto, logger })
    }

    #[inline]
    pub fn conn(&self) -> &Arc<Conn> {
        &self.conn
    }

    #[inline]
    pub fn flows(&self) -> &Arc<Flows> {
        self.conn.flows()
    }

    /// Schema version last advertised by the server, if any.
    pub fn peer_proto(&self) -> Option<ProtoInfo> {
        self.peer_proto.lock().unwrap().clone()
    }

    pub fn set_log_level(&self, level: log::Level) {
        self.logger.set_level(level);
    }

    pub async fn call_api(
        &self, api_name: &str, req: Value, options: CallApiOptions,
    ) -> OpResult<ApiReturn> {
        self.conn.call_api(api_name, req, options).await
    }

    pub async fn call<Req, Res>(
        &self, api_name: &str, req: &Req, options: CallApiOptions,
    ) -> OpResult<Result<Res, TsrpcError>>
    where
        Req: Serialize,
        Res: DeserializeOwned,
    {
        self.conn.call(api_name, req, options).await
    }

    pub async fn send_msg(&self, msg_name: &str, msg: Value) -> OpResult<Result<(), TsrpcError>> {
        self.conn.send_msg(msg_name, msg).await
    }

    /// Send a user-defined frame (`X-TSRPC-DATA-TYPE: custom`).
    pub async fn send_custom(&self, data: Bytes) -> OpResult<Result<(), TsrpcError>> {
        self.conn.send_custom(WireData::Binary(data)).await
    }

    /// SN of the most recent callApi, for use with [HttpClient::abort].
    #[inline]
    pub fn last_sn(&self) -> u32 {
        self.conn.last_sn()
    }

    /// Abort a pending call: in-flight transport work is cancelled and the
    /// caller's future never resolves.
    pub fn abort(&self, sn: u32) {
        self.conn.abort(sn);
    }

    pub fn abort_all(&self) {
        self.conn.abort_all();
    }

    #[inline]
    pub fn pending_call_num(&self) -> usize {
        self.conn.pending_call_num()
    }
}

struct HttpClientTransport {
    addr: String,
    host_header: String,
    path_base: String,
    data_type: DataType,
    proto_info_json: Option<String>,
    peer_proto: Arc<Mutex<Option<ProtoInfo>>>,
    service_map: Arc<ServiceMap>,
    logger: Arc<LogFilter>,
}

impl HttpClientTransport {
    fn url_path(&self, td: &TransportData) -> String {
        // the server recovers the service name from the URL in text mode
        match (self.data_type, td.service_name()) {
            (DataType::Text, Some(name)) => format!("{}{}", self.path_base, name),
            _ => self.path_base.clone(),
        }
    }
}

impl ConnTransport for HttpClientTransport {
    fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Text mode leaves the SN off the wire; the pending table already knows
    /// it. Buffer mode keeps the SN in the frame.
    fn encode_skip_sn(&self) -> bool {
        self.data_type == DataType::Text
    }

    fn is_stateless(&self) -> bool {
        true
    }

    fn remote(&self) -> Option<String> {
        Some(self.addr.clone())
    }

    fn send_data(
        &self, data: WireData, td: &TransportData,
    ) -> BoxFuture<'static, Result<Option<WireData>, TsrpcError>> {
        let addr = self.addr.clone();
        let host_header = self.host_header.clone();
        let path = self.url_path(td);
        let content_type = content_type_of(data.data_type());
        let data_type_header = data_type_header_of(td.kind());
        let proto_info_json = self.proto_info_json.clone();
        let peer_proto = self.peer_proto.clone();
        let service_map = self.service_map.clone();
        let logger = self.logger.clone();
        let is_text = self.data_type == DataType::Text;
        let body = match data {
            WireData::Text(s) => Bytes::from(s),
            WireData::Binary(b) => b,
        };
        Box::pin(async move {
            let stream = TcpStream::connect(&addr).await.map_err(io_err)?;
            let io = TokioIo::new(stream);
            let (mut sender, conn_driver) = http1::handshake(io)
                .await
                .map_err(|e| TsrpcError::new(ErrorKind::NetworkError, e.to_string()))?;
            tokio::spawn(async move {
                if let Err(e) = conn_driver.await {
                    logger_debug!(logger, "http conn closed: {}", e);
                }
            });

            let mut builder = Request::builder()
                .method(Method::POST)
                .uri(&path)
                .header(HOST, &host_header)
                .header(CONTENT_TYPE, content_type);
            if let Some(v) = data_type_header {
                builder = builder.header(HEADER_DATA_TYPE, v);
            }
            if let Some(v) = &proto_info_json {
                builder = builder.header(HEADER_PROTO_INFO, v);
            }
            let request = builder
                .body(Full::new(body))
                .map_err(|e| TsrpcError::new(ErrorKind::LocalError, e.to_string()))?;

            let response = sender
                .send_request(request)
                .await
                .map_err(|e| TsrpcError::new(ErrorKind::NetworkError, e.to_string()))?;

            if let Some(value) = response.headers().get(HEADER_PROTO_INFO) {
                match value.to_str().ok().and_then(|s| serde_json::from_str::<ProtoInfo>(s).ok())
                {
                    Some(info) => {
                        if let Some(local) = service_map.version() {
                            if info.md5 != local.md5 {
                                log::warn!(
                                    "proto skew: local md5 {} != server md5 {}",
                                    local.md5,
                                    info.md5
                                );
                            }
                        }
                        *peer_proto.lock().unwrap() = Some(info);
                    }
                    // non-fatal: the exchange itself is fine
                    None => log::warn!("unparseable {} response header", HEADER_PROTO_INFO),
                }
            }

            let bytes = response
                .collect()
                .await
                .map_err(|e| TsrpcError::new(ErrorKind::NetworkError, e.to_string()))?
                .to_bytes();
            Ok(Some(if is_text {
                WireData::Text(String::from_utf8_lossy(&bytes).into_owned())
            } else {
                WireData::Binary(bytes)
            }))
        })
    }

    fn close(&self, _code: Option<u16>, _reason: &str) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

fn io_err(e: io::Error) -> TsrpcError {
    let err = TsrpcError::new(ErrorKind::NetworkError, e.to_string());
    if e.kind() == io::ErrorKind::ConnectionRefused {
        err.with_code(CODE_ECONNREFUSED)
    } else {
        err
    }
}
