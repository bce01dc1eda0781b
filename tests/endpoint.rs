//! Endpoint behavior over in-memory transports: call round-trips, flow
//! aborts, broadcast fan-out, graceful stop.

mod common;

use common::*;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tsrpc::core::error::{ErrorKind, TsrpcError};
use tsrpc::core::{DataType, FlowControl, ServerConfig};
use tsrpc::{api_handler, CallApiOptions, Server, ServerState};

fn test_server(validator: Arc<CountingValidator>) -> Arc<Server> {
    let config = ServerConfig { log_level: log::Level::Warn, ..Default::default() };
    Server::new(&test_proto(), validator, Box::new(MockServerTransport), config).unwrap()
}

fn implement_test_api(server: &Arc<Server>) {
    server.implement_api(
        "Test",
        api_handler(|call: tsrpc::ApiCall| async move {
            let name = call.req["name"].as_str().unwrap_or("").to_string();
            call.succ(json!({"reply": format!("Test reply: {}", name)}));
            Ok(())
        }),
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_call_api_round_trip() {
    let server = test_server(CountingValidator::new());
    server.start().await.unwrap();
    implement_test_api(&server);
    let (client, _server_conn) = duplex_pair(&server, DataType::Buffer).await;

    let ret = client
        .call_api("Test", json!({"name": "Req1"}), CallApiOptions::default())
        .await
        .unwrap();
    assert!(ret.is_succ());
    assert_eq!(ret.res().unwrap()["reply"], json!("Test reply: Req1"));
    assert_eq!(client.pending_call_num(), 0);
    server.stop(None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sn_increases_and_pending_drains() {
    let server = test_server(CountingValidator::new());
    server.start().await.unwrap();
    implement_test_api(&server);
    let (client, _server_conn) = duplex_pair(&server, DataType::Buffer).await;

    let mut last_sn = 0;
    for i in 0..5 {
        let _ = client
            .call_api("Test", json!({"name": format!("n{}", i)}), CallApiOptions::default())
            .await
            .unwrap();
        let sn = client.last_sn();
        assert!(sn > last_sn);
        last_sn = sn;
    }
    assert_eq!(client.pending_call_num(), 0);
    server.stop(None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_handler_error_wrapping() {
    let server = test_server(CountingValidator::new());
    server.start().await.unwrap();
    server.implement_api(
        "Test",
        api_handler(|_call: tsrpc::ApiCall| async move {
            Err(TsrpcError::new(ErrorKind::LocalError, "Test InnerError"))
        }),
    );
    let (client, _server_conn) = duplex_pair(&server, DataType::Buffer).await;

    let ret = client
        .call_api("Test", json!({"name": "x"}), CallApiOptions::default())
        .await
        .unwrap();
    let err = ret.err().unwrap();
    assert_eq!(err.kind, ErrorKind::ServerError);
    assert_eq!(err.message, "Internal Server Error");
    assert_eq!(err.code.as_deref(), Some("INTERNAL_ERR"));
    assert_eq!(err.inner_err.as_deref(), Some("Test InnerError"));
    server.stop(None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_api_error_reaches_caller_verbatim() {
    let server = test_server(CountingValidator::new());
    server.start().await.unwrap();
    server.implement_api(
        "Test",
        api_handler(|call: tsrpc::ApiCall| async move {
            call.error(
                TsrpcError::api("Test TsrpcError")
                    .with_code("CODE_TEST")
                    .with_info(json!("ErrInfo Test")),
            );
            Ok(())
        }),
    );
    let (client, _server_conn) = duplex_pair(&server, DataType::Buffer).await;

    let ret = client
        .call_api("Test", json!({"name": "x"}), CallApiOptions::default())
        .await
        .unwrap();
    let err = ret.err().unwrap();
    assert_eq!(err.kind, ErrorKind::ApiError);
    assert_eq!(err.message, "Test TsrpcError");
    assert_eq!(err.code.as_deref(), Some("CODE_TEST"));
    assert_eq!(err.info, Some(json!("ErrInfo Test")));
    server.stop(None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_flow_abort_blocks_send() {
    let server = test_server(CountingValidator::new());
    server.start().await.unwrap();
    implement_test_api(&server);
    let (client, _server_conn) = duplex_pair(&server, DataType::Buffer).await;

    client.flows().pre_call_api.push(|_d| async move { FlowControl::Abort });
    let out = client.call_api("Test", json!({"name": "x"}), CallApiOptions::default()).await;
    assert!(out.is_err(), "flow abort must yield the aborted sentinel");
    assert_eq!(client.pending_call_num(), 0);
    server.stop(None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_client_timeout() {
    let validator = CountingValidator::new();
    let client = {
        use tsrpc::core::{EndpointSide, ServiceMap};
        use tsrpc::{Conn, ConnOptions, ConnState, Flows};
        Conn::new(ConnOptions {
            id: 1,
            side: EndpointSide::Client,
            service_map: Arc::new(
                ServiceMap::build(&test_proto(), EndpointSide::Client).unwrap(),
            ),
            validator,
            flows: Flows::new(),
            logger: tsrpc::core::logger::new_logger(log::Level::Warn),
            transport: Box::new(BlackholeTransport),
            call_api_timeout: Some(Duration::from_millis(50)),
            decode_return_text: None,
            server: None,
            initial_state: ConnState::Connected,
        })
    };
    let start = Instant::now();
    let ret = client
        .call_api("Test", json!({"name": "x"}), CallApiOptions::default())
        .await
        .unwrap();
    let err = ret.err().unwrap();
    assert_eq!(err.code.as_deref(), Some("TIMEOUT"));
    assert_eq!(err.kind, ErrorKind::NetworkError);
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(client.pending_call_num(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_msg_listeners_order_and_once() {
    let server = test_server(CountingValidator::new());
    server.start().await.unwrap();
    let (client, _server_conn) = duplex_pair(&server, DataType::Buffer).await;

    let seen: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
    let s1 = seen.clone();
    server.on_msg(
        "Chat",
        Arc::new(move |n| {
            s1.lock().unwrap().push(format!("first:{}", n.msg["text"].as_str().unwrap()));
        }),
    );
    let s2 = seen.clone();
    server.once_msg(
        "Chat",
        Arc::new(move |n| {
            s2.lock().unwrap().push(format!("once:{}", n.msg["text"].as_str().unwrap()));
        }),
    );

    client.send_msg("Chat", json!({"text": "a"})).await.unwrap().unwrap();
    client.send_msg("Chat", json!({"text": "b"})).await.unwrap().unwrap();
    // delivery is async to the send resolution
    tokio::time::sleep(Duration::from_millis(100)).await;
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec!["first:a", "once:a", "first:b"]);
    server.stop(None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_broadcast_encodes_once_per_data_type() {
    let validator = CountingValidator::new();
    let server = test_server(validator.clone());
    server.start().await.unwrap();
    let mut senders = Vec::new();
    for _ in 0..3 {
        let (client, server_conn) = duplex_pair(&server, DataType::Buffer).await;
        senders.push((client, server_conn));
    }
    validator.encodes.store(0, Ordering::SeqCst);

    let result = server.broadcast_msg("Chat", json!({"text": "hello"}), None).await.unwrap();
    assert!(result.is_ok());
    // one buffer partition, three connections, one schema encode
    assert_eq!(validator.encodes.load(Ordering::SeqCst), 1);
    server.stop(None).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_broadcast_rejected_when_not_started() {
    let server = test_server(CountingValidator::new());
    let result = server.broadcast_msg("Chat", json!({"text": "x"}), None).await.unwrap();
    assert_eq!(result.unwrap_err().message, "Server is not started");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_graceful_stop_waits_for_handlers() {
    let server = test_server(CountingValidator::new());
    server.start().await.unwrap();
    let finished = Arc::new(AtomicUsize::new(0));
    let f = finished.clone();
    server.implement_api(
        "Test",
        api_handler(move |call: tsrpc::ApiCall| {
            let f = f.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                f.fetch_add(1, Ordering::SeqCst);
                call.succ(json!({"reply": "done"}));
                Ok(())
            }
        }),
    );
    let (client, _server_conn) = duplex_pair(&server, DataType::Buffer).await;

    let call_task = {
        let client = client.clone();
        tokio::spawn(async move {
            client.call_api("Test", json!({"name": "x"}), CallApiOptions::default()).await
        })
    };
    // let the handler start before stopping
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.pending_api_call_num(), 1);
    server.stop(Some(Duration::from_secs(2))).await;
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(finished.load(Ordering::SeqCst), 1, "handler ran to completion");
    assert_eq!(server.pending_api_call_num(), 0);
    let ret = call_task.await.unwrap().unwrap();
    assert!(ret.is_succ());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_graceful_stop_grace_window_elapses() {
    let server = test_server(CountingValidator::new());
    server.start().await.unwrap();
    server.implement_api(
        "Test",
        api_handler(|call: tsrpc::ApiCall| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            call.succ(json!({"reply": "late"}));
            Ok(())
        }),
    );
    let (client, _server_conn) = duplex_pair(&server, DataType::Buffer).await;

    let _call_task = {
        let client = client.clone();
        tokio::spawn(async move {
            client.call_api("Test", json!({"name": "x"}), CallApiOptions::default()).await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let start = Instant::now();
    server.stop(Some(Duration::from_millis(100))).await;
    assert!(start.elapsed() < Duration::from_secs(2), "grace window bounds the stop");
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_auto_implement_api() {
    use std::path::Path;
    use tsrpc::{ApiHandler, HandlerLoader};

    struct MockLoader;
    impl HandlerLoader for MockLoader {
        fn load(&self, _dir: &Path, api_name: &str) -> Result<ApiHandler, TsrpcError> {
            if api_name == "Test" {
                Ok(api_handler(|call: tsrpc::ApiCall| async move {
                    call.succ(json!({"reply": "loaded"}));
                    Ok(())
                }))
            } else {
                Err(TsrpcError::new(ErrorKind::LocalError, "no such handler file"))
            }
        }
    }

    let server = test_server(CountingValidator::new());
    server.start().await.unwrap();
    let result =
        server.auto_implement_api(Arc::new(MockLoader), Path::new("/tmp/api"), None);
    assert_eq!(result.succ, vec!["Test".to_string()]);
    assert_eq!(result.fail.len(), 1);
    assert_eq!(result.fail[0].0, "a/b/c/Test");

    // the failed load leaves a NOT_IMPLEMENTED stub behind
    let (client, _server_conn) = duplex_pair(&server, DataType::Buffer).await;
    let ret = client
        .call_api("a/b/c/Test", json!({"name": "x"}), CallApiOptions::default())
        .await
        .unwrap();
    let err = ret.err().unwrap();
    assert_eq!(err.code.as_deref(), Some("NOT_IMPLEMENTED"));
    assert_eq!(err.kind, ErrorKind::ServerError);
    server.stop(None).await;
}
