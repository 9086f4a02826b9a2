use std::time::Duration;

use anyhow::{Context, Result};
use flowdock_client::test_support::{flow_json, organization_json, user_json};
use flowdock_client::{FlowId, UserId};
use flowdock_config::{ApiConfig, ClientConfig, SessionConfig, SyncConfig};
use flowdock_runtime::{self, ClientServices};
use httpmock::prelude::*;
use serde_json::json;
use tokio::time::{sleep, timeout};

fn build_config(server: &MockServer) -> ClientConfig {
    ClientConfig {
        api: ApiConfig {
            base_url: server.base_url(),
            stream_url: server.base_url(),
            request_timeout_seconds: 2,
            ..ApiConfig::default()
        },
        session: SessionConfig {
            token: Some("runtime-token".into()),
            ..SessionConfig::default()
        },
        sync: SyncConfig {
            update_joined_flows: false,
            update_users: false,
            auto_listen_for_messages: false,
            ..SyncConfig::default()
        },
    }
}

async fn mock_directory(server: &MockServer) {
    server
        .mock_async(|when, then| {
            when.method(GET).path("/organizations");
            then.status(200)
                .header("Flowdock-User", "7")
                .json_body(json!([organization_json(
                    1,
                    "org-1",
                    vec![user_json(7, "Ada"), user_json(8, "Grace")]
                )]));
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/flows/all").query_param("users", "1");
            then.status(200).json_body(json!([
                flow_json("f1", 1, false, true),
                flow_json("f2", 1, true, false),
            ]));
        })
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn initialise_populates_the_client_caches() -> Result<()> {
    let server = MockServer::start_async().await;
    mock_directory(&server).await;
    let config = build_config(&server);

    let services = ClientServices::initialise(&config)
        .await
        .context("failed to initialise client services")?;
    let summary = services.client.summary().await;

    assert_eq!(summary.organizations, 1);
    assert_eq!(summary.flows, 2);
    assert_eq!(summary.users, 2);
    assert_eq!(services.client.self_id(), Some(UserId(7)));
    assert!(services.client.flow(&FlowId::from("f2")).await.is_some());

    services.shutdown().await;
    assert_eq!(services.client.summary().await.flows, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn initialise_reports_missing_credentials() -> Result<()> {
    let server = MockServer::start_async().await;
    let mut config = build_config(&server);
    config.session = SessionConfig::default();

    let error = match ClientServices::initialise(&config).await {
        Ok(_) => panic!("expected construction to fail without credentials"),
        Err(error) => error,
    };
    let message = format!("{error:?}");
    assert!(
        message.contains("failed to construct flowdock client"),
        "expected construction failure context, got {message}"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn initialise_propagates_sync_failures() -> Result<()> {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/organizations");
            then.status(500).body("boom");
        })
        .await;
    let config = build_config(&server);

    let error = match ClientServices::initialise(&config).await {
        Ok(_) => panic!("expected the initial sync to fail"),
        Err(error) => error,
    };
    assert!(
        error.to_string().contains("failed to initialise flowdock client"),
        "sync errors should propagate with context"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn connect_does_not_touch_the_network() -> Result<()> {
    let server = MockServer::start_async().await;
    let anything = server
        .mock_async(|_when, then| {
            then.status(200).json_body(json!([]));
        })
        .await;

    let services = ClientServices::connect(&build_config(&server))?;
    assert_eq!(services.client.summary().await.flows, 0);
    assert_eq!(anything.hits_async().await, 0);
    Ok(())
}

#[test]
fn telemetry_init_tracing_sets_global_subscriber() {
    flowdock_runtime::telemetry::init_tracing().expect("first initialisation should succeed");

    let second = flowdock_runtime::telemetry::init_tracing();
    assert!(
        second.is_err(),
        "initialising telemetry twice should fail with global subscriber already set"
    );
}

#[tokio::test(flavor = "multi_thread")]
#[cfg_attr(not(unix), ignore = "requires Unix signal handling")]
async fn shutdown_signal_completes_on_ctrl_c_notification() -> Result<()> {
    let shutdown_task = tokio::spawn(async { flowdock_runtime::shutdown_signal().await });

    sleep(Duration::from_millis(50)).await;
    #[cfg(unix)]
    unsafe {
        libc::raise(libc::SIGINT);
    }

    timeout(Duration::from_secs(2), shutdown_task).await??;
    Ok(())
}
