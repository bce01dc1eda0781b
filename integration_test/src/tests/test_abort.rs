use super::runner;
use crate::service::*;
use crate::TestRunner;
use rstest::rstest;
use serde_json::json;
use std::time::Duration;
use tsrpc::{api_handler, CallApiOptions};
use tsrpc_core::DataType;

#[rstest]
fn test_abort_never_resolves(runner: TestRunner) {
    runner.block_on(async {
        let (server, url) = start_server(Default::default()).await;
        // slow enough that the abort lands first
        server.implement_api(
            "Test",
            api_handler(|call: tsrpc::ApiCall| async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                call.succ(json!({"reply": "too late"}));
                Ok(())
            }),
        );
        let client = std::sync::Arc::new(new_client(&url, DataType::Text));

        let call_task = {
            let client = client.clone();
            tokio::spawn(async move {
                client.call_api("Test", json!({"name": "x"}), CallApiOptions::default()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let sn = client.last_sn();
        assert!(sn > 0);
        client.abort(sn);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!call_task.is_finished(), "an aborted call must stay unresolved");
        assert_eq!(client.pending_call_num(), 0);
        call_task.abort();
        server.stop(None).await;
    });
}

#[rstest]
fn test_abort_all(runner: TestRunner) {
    runner.block_on(async {
        let (server, url) = start_server(Default::default()).await;
        server.implement_api(
            "Test",
            api_handler(|call: tsrpc::ApiCall| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                call.succ(json!({"reply": "late"}));
                Ok(())
            }),
        );
        let client = std::sync::Arc::new(new_client(&url, DataType::Text));

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                client.call_api("Test", json!({"name": "x"}), CallApiOptions::default()).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(client.pending_call_num(), 3);
        client.abort_all();
        assert_eq!(client.pending_call_num(), 0);

        tokio::time::sleep(Duration::from_millis(250)).await;
        for task in &tasks {
            assert!(!task.is_finished());
        }
        for task in tasks {
            task.abort();
        }
        server.stop(None).await;
    });
}
