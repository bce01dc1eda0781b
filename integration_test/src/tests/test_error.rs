use super::runner;
use crate::service::*;
use crate::TestRunner;
use rstest::rstest;
use serde_json::json;
use tsrpc::{api_handler, CallApiOptions, TsrpcError};
use tsrpc_core::error::ErrorKind;
use tsrpc_core::DataType;

#[rstest]
fn test_handler_throw_returns_inner_error(runner: TestRunner) {
    runner.block_on(async {
        let mut config = tsrpc_core::ServerConfig::default();
        config.return_inner_error = true;
        let (server, url) = start_server(config).await;
        server.implement_api(
            "Test",
            api_handler(|_call: tsrpc::ApiCall| async move { Err(thrown("Test InnerError")) }),
        );
        let client = new_client(&url, DataType::Text);

        let ret = client
            .call_api("Test", json!({"name": "x"}), CallApiOptions::default())
            .await
            .unwrap();
        let err = ret.err().unwrap();
        assert_eq!(err.message, "Internal Server Error");
        assert_eq!(err.code.as_deref(), Some("INTERNAL_ERR"));
        assert_eq!(err.kind, ErrorKind::ServerError);
        assert_eq!(err.inner_err.as_deref(), Some("Test InnerError"));
        server.stop(None).await;
    });
}

#[rstest]
fn test_inner_error_sanitized_in_production(runner: TestRunner) {
    runner.block_on(async {
        let mut config = tsrpc_core::ServerConfig::default();
        config.return_inner_error = false;
        let (server, url) = start_server(config).await;
        server.implement_api(
            "Test",
            api_handler(|_call: tsrpc::ApiCall| async move { Err(thrown("secret detail")) }),
        );
        let client = new_client(&url, DataType::Text);

        let ret = client
            .call_api("Test", json!({"name": "x"}), CallApiOptions::default())
            .await
            .unwrap();
        let err = ret.err().unwrap();
        assert_eq!(err.message, "Internal Server Error");
        assert!(err.inner_err.is_none(), "sanitized on the wire");
        server.stop(None).await;
    });
}

#[rstest]
fn test_api_error_verbatim(runner: TestRunner) {
    runner.block_on(async {
        let (server, url) = start_server(Default::default()).await;
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
        let client = new_client(&url, DataType::Text);

        let ret = client
            .call_api("Test", json!({"name": "x"}), CallApiOptions::default())
            .await
            .unwrap();
        let err = ret.err().unwrap();
        assert_eq!(err.message, "Test TsrpcError");
        assert_eq!(err.code.as_deref(), Some("CODE_TEST"));
        assert_eq!(err.kind, ErrorKind::ApiError);
        assert_eq!(err.info, Some(json!("ErrInfo Test")));
        server.stop(None).await;
    });
}

#[rstest]
fn test_unknown_service_fails_locally(runner: TestRunner) {
    runner.block_on(async {
        let (server, url) = start_server(Default::default()).await;
        let client = new_client(&url, DataType::Text);

        let ret = client
            .call_api("NoSuchApi", json!({}), CallApiOptions::default())
            .await
            .unwrap();
        let err = ret.err().unwrap();
        assert_eq!(err.kind, ErrorKind::LocalError);
        assert_eq!(err.message, "Invalid service name");
        server.stop(None).await;
    });
}

#[rstest]
fn test_not_implemented(runner: TestRunner) {
    runner.block_on(async {
        // a/b/c/Test is deliberately left without a handler
        let mut config = tsrpc_core::ServerConfig::default();
        config.port = 0;
        config.log_level = log::Level::Debug;
        let server = tsrpc_http::HttpServer::new(
            &service_proto(),
            std::sync::Arc::new(tsrpc_core::JsonValidator::default()),
            config,
        )
        .unwrap();
        server.start().await.unwrap();
        let url = format!("http://127.0.0.1:{}", server.local_addr().unwrap().port());
        let client = new_client(&url, DataType::Text);

        let ret = client
            .call_api("Test", json!({"name": "x"}), CallApiOptions::default())
            .await
            .unwrap();
        let err = ret.err().unwrap();
        assert_eq!(err.code.as_deref(), Some("NOT_IMPLEMENTED"));
        assert_eq!(err.kind, ErrorKind::ServerError);
        server.stop(None).await;
    });
}
