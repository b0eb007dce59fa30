//! End-to-end tour of the SDK: lifecycle, typed state, observation,
//! remote logging and RPC, all against the in-memory mock transport so
//! it runs anywhere.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tracing::info;

use stratus_core::transport::mock::MockTransport;
use stratus_core::{Client, ClientConfig, Credentials};
use stratus_services::rpc::RpcStatus;
use stratus_services::{DeviceState, RemoteLog, Rpc};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,stratus_core=debug")),
        )
        .init();

    // The mock stands in for the real DTLS/CoAP codec; keep a handle to
    // play the server side.
    let server = MockTransport::new();

    let config = ClientConfig::new(
        "coaps://coap.example.io",
        Credentials::Psk {
            identity: "device-1@my-project".to_string(),
            key: b"supersecret".to_vec(),
        },
    );
    let client = Arc::new(
        Client::create(config, Box::new(server.clone())).context("creating client")?,
    );

    client.register_event_callback(|event| {
        info!(?event, "client event");
    });

    let timeout = Some(Duration::from_secs(5));
    let state = DeviceState::new(client.clone());

    // Typed state: write, read back, observe a desired value.
    state.set("iteration", 1, timeout).await?;
    let iteration = state.get_int("iteration", timeout).await?;
    info!(iteration, "read back device state");

    state.observe("desired/speed", |_response, path, payload| {
        match stratus_services::state::value_from_payload(payload) {
            Ok(value) => info!(%path, %value, "cloud changed a desired value"),
            Err(error) => info!(%path, %error, "desired value cleared"),
        }
    })?;

    // Remote log upload rides the same request queue.
    let log = RemoteLog::new(client.clone());
    log.info("basics", "demo started")?;

    // RPC: register a method, then let the "server" call it.
    let rpc = Rpc::new(client.clone());
    rpc.register("double", |_method, params| {
        let doubled = params
            .as_array()
            .and_then(|args| args.first())
            .and_then(|arg| arg.as_i64())
            .map(|value| value * 2);
        match doubled {
            Some(value) => (RpcStatus::Ok, Some(json!({ "value": value }))),
            None => (RpcStatus::InvalidArgument, None),
        }
    })?;

    // Give the worker a moment to establish the observations, then act
    // as the cloud: change the desired value and invoke the RPC.
    tokio::time::sleep(Duration::from_millis(300)).await;
    server.push_notification(".d/desired/speed", &b"88"[..]);
    server.push_notification(
        ".rpc/",
        &br#"{"id": "call-1", "method": "double", "params": [21]}"#[..],
    );

    tokio::time::sleep(Duration::from_millis(300)).await;
    if let Some(ack) = server.resource(".rpc/status") {
        info!(ack = %String::from_utf8_lossy(&ack), "rpc ack uploaded");
    }

    info!(
        queued = client.num_items_in_request_queue(),
        connected = client.is_connected(),
        "shutting down"
    );

    match Arc::try_unwrap(client) {
        Ok(client) => client.destroy(),
        Err(client) => drop(client),
    }
    Ok(())
}
