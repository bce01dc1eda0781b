//! Shared protocol and endpoint helpers for the end-to-end tests.

use serde_json::json;
use std::sync::Arc;
use tsrpc::{api_handler, TsrpcError};
use tsrpc_core::error::ErrorKind;
use tsrpc_core::{
    ClientConfig, DataType, JsonValidator, ProtoInfo, ServerConfig, ServiceDef, ServiceKind,
    ServiceProto, ServiceSide,
};
use tsrpc_http::{HttpClient, HttpServer};

pub fn service_proto() -> ServiceProto {
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
        version: Some(ProtoInfo::of_build("1700000000000", "d41d8cd98f00b204e9800998ecf8427e")),
    }
}

/// Register the reply handlers the scenarios expect.
pub fn implement_test_apis(server: &HttpServer) {
    server.implement_api(
        "Test",
        api_handler(|call: tsrpc::ApiCall| async move {
            let name = call.req["name"].as_str().unwrap_or_default().to_string();
            call.succ(json!({"reply": format!("Test reply: {}", name)}));
            Ok(())
        }),
    );
    server.implement_api(
        "a/b/c/Test",
        api_handler(|call: tsrpc::ApiCall| async move {
            let name = call.req["name"].as_str().unwrap_or_default().to_string();
            call.succ(json!({"reply": format!("a/b/c/Test reply: {}", name)}));
            Ok(())
        }),
    );
}

/// Start a server on an ephemeral port; returns it with its base URL.
pub async fn start_server(mut config: ServerConfig) -> (HttpServer, String) {
    config.port = 0;
    config.log_level = log::Level::Debug;
    let server = HttpServer::new(&service_proto(), Arc::new(JsonValidator::default()), config)
        .expect("build server");
    implement_test_apis(&server);
    server.start().await.expect("start server");
    let addr = server.local_addr().expect("bound addr");
    (server, format!("http://127.0.0.1:{}", addr.port()))
}

pub fn new_client(server_url: &str, data_type: DataType) -> HttpClient {
    let config = ClientConfig {
        server: server_url.to_string(),
        data_type,
        log_level: log::Level::Debug,
        ..Default::default()
    };
    HttpClient::new(&service_proto(), Arc::new(JsonValidator::default()), config)
        .expect("build client")
}

/// A handler error carrying a plain (non-Api) kind, as a thrown exception
/// would.
pub fn thrown(message: &str) -> TsrpcError {
    TsrpcError::new(ErrorKind::LocalError, message)
}
