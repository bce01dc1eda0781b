//! In-memory transports and fixtures for endpoint tests.

use crossfire::{AsyncRx, MTx};
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tsrpc::core::error::TsrpcError;
use tsrpc::core::{
    DataType, EndpointSide, ServiceDef, ServiceKind, ServiceMap, ServiceProto, ServiceSide,
    TransportData, Validator,
};
use tsrpc::{Conn, ConnOptions, ConnState, ConnTransport, Flows, Server, ServerTransport, WireData};

pub fn test_proto() -> ServiceProto {
    ServiceProto {
        services: vec![
            ServiceDef {
                id: 0,
                name: "Test".to_string(),
                kind: ServiceKind::Api,
                side: ServiceSide::Server,
            },
            ServiceDef {
                id: 1,
                name: "a/b/c/Test".to_string(),
                kind: ServiceKind::Api,
                side: ServiceSide::Server,
            },
            ServiceDef {
                id: 2,
                name: "Chat".to_string(),
                kind: ServiceKind::Msg,
                side: ServiceSide::Both,
            },
        ],
        version: None,
    }
}

/// Validator counting schema encodes; payloads are plain JSON.
pub struct CountingValidator {
    pub encodes: AtomicUsize,
}

impl CountingValidator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { encodes: AtomicUsize::new(0) })
    }
}

impl Validator for CountingValidator {
    fn encode_body(&self, body: &Value, _schema_id: &str) -> Result<Vec<u8>, String> {
        self.encodes.fetch_add(1, Ordering::SeqCst);
        serde_json::to_vec(body).map_err(|e| e.to_string())
    }

    fn decode_body(&self, buf: &[u8], _schema_id: &str) -> Result<Value, String> {
        serde_json::from_slice(buf).map_err(|e| e.to_string())
    }

    fn validate(&self, _body: &Value, _schema_id: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Channel-backed duplex transport half: sends go into `tx`, a pump task
/// delivers them to the peer connection.
pub struct MockConnTransport {
    pub data_type: DataType,
    pub tx: MTx<WireData>,
    pub sent: Arc<AtomicUsize>,
}

impl ConnTransport for MockConnTransport {
    fn data_type(&self) -> DataType {
        self.data_type
    }

    fn send_data(
        &self, data: WireData, _td: &TransportData,
    ) -> BoxFuture<'static, Result<Option<WireData>, TsrpcError>> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        let sent = self
            .tx
            .send(data)
            .map(|_| None)
            .map_err(|_| TsrpcError::conn_disconnected());
        Box::pin(async move { sent })
    }

    fn close(&self, _code: Option<u16>, _reason: &str) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

/// Transport that swallows every frame (for timeout tests).
pub struct BlackholeTransport;

impl ConnTransport for BlackholeTransport {
    fn data_type(&self) -> DataType {
        DataType::Buffer
    }

    fn send_data(
        &self, _data: WireData, _td: &TransportData,
    ) -> BoxFuture<'static, Result<Option<WireData>, TsrpcError>> {
        Box::pin(async { Ok(None) })
    }

    fn close(&self, _code: Option<u16>, _reason: &str) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

/// No-op listen/accept machinery for servers under test.
pub struct MockServerTransport;

impl ServerTransport for MockServerTransport {
    fn start(&self, _server: Arc<Server>) -> BoxFuture<'static, Result<(), TsrpcError>> {
        Box::pin(async { Ok(()) })
    }

    fn stop(&self) -> BoxFuture<'static, ()> {
        Box::pin(async {})
    }
}

fn pump(rx: AsyncRx<WireData>, target: Arc<Conn>) {
    tokio::spawn(async move {
        while let Ok(data) = rx.recv().await {
            target.recv_data(data).await;
        }
    });
}

/// Wire a client connection to a server over in-memory channels.
pub async fn duplex_pair(server: &Arc<Server>, data_type: DataType) -> (Arc<Conn>, Arc<Conn>) {
    let (to_server_tx, to_server_rx) = crossfire::mpsc::unbounded_async::<WireData>();
    let (to_client_tx, to_client_rx) = crossfire::mpsc::unbounded_async::<WireData>();

    let server_conn = server
        .accept_conn(Box::new(MockConnTransport {
            data_type,
            tx: to_client_tx,
            sent: Arc::new(AtomicUsize::new(0)),
        }))
        .await;

    let client_conn = Conn::new(ConnOptions {
        id: 1,
        side: EndpointSide::Client,
        service_map: Arc::new(ServiceMap::build(&test_proto(), EndpointSide::Client).unwrap()),
        validator: server.validator().clone(),
        flows: Flows::new(),
        logger: tsrpc::core::logger::new_logger(log::Level::Warn),
        transport: Box::new(MockConnTransport {
            data_type,
            tx: to_server_tx,
            sent: Arc::new(AtomicUsize::new(0)),
        }),
        call_api_timeout: Some(std::time::Duration::from_secs(3)),
        decode_return_text: None,
        server: None,
        initial_state: ConnState::Connected,
    });

    pump(to_server_rx, server_conn.clone());
    pump(to_client_rx, client_conn.clone());
    (client_conn, server_conn)
}
