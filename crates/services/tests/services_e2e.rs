//! Service adapters driven end-to-end through the engine and the
//! in-memory transport.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use stratus_core::transport::mock::MockTransport;
use stratus_core::{Client, ClientConfig, Credentials, Error};
use stratus_services::ota::{self, Manifest};
use stratus_services::rpc::RpcStatus;
use stratus_services::{DeviceState, Ota, RemoteLog, Rpc};

const WAIT: Option<Duration> = Some(Duration::from_secs(2));

fn test_config() -> ClientConfig {
    let mut config = ClientConfig::new(
        "coaps://coap.example.io",
        Credentials::Psk {
            identity: "device-1@project".to_string(),
            key: b"secret".to_vec(),
        },
    );
    config.response_timeout = Duration::from_millis(300);
    config.queue_poll_interval = Duration::from_millis(20);
    config.reconnect_cooldown = Duration::from_millis(50);
    config.keepalive_interval = Duration::ZERO;
    config
}

fn client_with(mock: &MockTransport) -> Arc<Client> {
    Arc::new(Client::create(test_config(), Box::new(mock.clone())).expect("client"))
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn state_set_get_delete_round_trip() {
    let mock = MockTransport::new();
    let client = client_with(&mock);
    let state = DeviceState::new(client.clone());

    state.set("counter", 41, WAIT).await.unwrap();
    assert_eq!(state.get_int("counter", WAIT).await.unwrap(), 41);

    state.set("label", "on", WAIT).await.unwrap();
    assert_eq!(state.get_string("label", WAIT).await.unwrap(), "on");

    state.delete("counter", WAIT).await.unwrap();
    assert_eq!(state.get("counter", WAIT).await.err(), Some(Error::Null));
}

#[tokio::test]
async fn state_observation_decodes_changes() {
    let mock = MockTransport::new();
    let client = client_with(&mock);
    let state = DeviceState::new(client.clone());

    let (tx, rx) = mpsc::channel::<Value>();
    state
        .observe("desired", move |_response, _path, payload| {
            if let Ok(value) = stratus_services::state::value_from_payload(payload) {
                let _ = tx.send(value);
            }
        })
        .unwrap();

    wait_until("observation to register", || {
        mock.observed_token(".d/desired").is_some()
    })
    .await;

    assert!(mock.push_notification(".d/desired", &b"7"[..]));
    let value = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(value.as_i64(), Some(7));
}

#[tokio::test]
async fn remote_log_uploads_a_json_record() {
    let mock = MockTransport::new();
    let client = client_with(&mock);
    let log = RemoteLog::new(client.clone());

    log.info("app", "booted").unwrap();

    wait_until("log record to land", || mock.resource("logs").is_some()).await;
    let record: Value = serde_json::from_slice(&mock.resource("logs").unwrap()).unwrap();
    assert_eq!(record["level"], "info");
    assert_eq!(record["module"], "app");
    assert_eq!(record["msg"], "booted");
}

#[tokio::test]
async fn ota_download_reassembles_the_component() {
    let mock = MockTransport::new();
    let client = client_with(&mock);
    let ota = Ota::new(client.clone());

    let source: Vec<u8> = (0..3072u32).map(|i| (i % 251) as u8).collect();
    mock.set_object(".u/c/main@1.2.3", source.clone());

    let component = ota::Component {
        package: "main".to_string(),
        version: "1.2.3".to_string(),
        size: source.len() as u64,
    };

    let mut assembled = Vec::new();
    let received = ota
        .download(&component, WAIT, |_index, block| {
            assembled.extend_from_slice(block);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(received, source.len() as u64);
    assert_eq!(assembled, source);
}

#[tokio::test]
async fn ota_manifest_flows_through_observation() {
    let mock = MockTransport::new();
    let client = client_with(&mock);
    let ota = Ota::new(client.clone());

    let (tx, rx) = mpsc::channel::<Manifest>();
    ota.observe_manifest(Arc::new(move |_response, _path, payload| {
        if let Ok(manifest) = Manifest::from_payload(payload) {
            let _ = tx.send(manifest);
        }
    }))
    .unwrap();

    wait_until("manifest observation", || {
        mock.observed_token(".u/desired").is_some()
    })
    .await;

    let manifest = json!({
        "sequenceNumber": 9,
        "components": [{"package": "main", "version": "2.0.0", "size": 2048}]
    });
    assert!(mock.push_notification(".u/desired", serde_json::to_vec(&manifest).unwrap()));

    let parsed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(parsed.seqnum, 9);
    assert_eq!(parsed.find_component("main").unwrap().version, "2.0.0");
}

#[tokio::test]
async fn rpc_calls_are_dispatched_and_acked() {
    let mock = MockTransport::new();
    let client = client_with(&mock);
    let rpc = Rpc::new(client.clone());

    rpc.register("multiply", |_method, params| {
        let product: i64 = params
            .as_array()
            .map(|args| args.iter().filter_map(Value::as_i64).product())
            .unwrap_or(0);
        (RpcStatus::Ok, Some(json!({ "value": product })))
    })
    .unwrap();

    wait_until("rpc observation", || mock.observed_token(".rpc/").is_some()).await;

    assert!(mock.push_notification(
        ".rpc/",
        &br#"{"id": "call-1", "method": "multiply", "params": [6, 7]}"#[..],
    ));

    wait_until("rpc ack", || mock.resource(".rpc/status").is_some()).await;
    let ack: Value = serde_json::from_slice(&mock.resource(".rpc/status").unwrap()).unwrap();
    assert_eq!(ack["id"], "call-1");
    assert_eq!(ack["statusCode"], 0);
    assert_eq!(ack["detail"]["value"], 42);
}

#[tokio::test]
async fn unknown_rpc_method_acks_unavailable() {
    let mock = MockTransport::new();
    let client = client_with(&mock);
    let rpc = Rpc::new(client.clone());

    rpc.register("known", |_, _| (RpcStatus::Ok, None)).unwrap();
    wait_until("rpc observation", || mock.observed_token(".rpc/").is_some()).await;

    assert!(mock.push_notification(
        ".rpc/",
        &br#"{"id": "call-2", "method": "missing", "params": []}"#[..],
    ));

    wait_until("rpc ack", || mock.resource(".rpc/status").is_some()).await;
    let ack: Value = serde_json::from_slice(&mock.resource(".rpc/status").unwrap()).unwrap();
    assert_eq!(ack["statusCode"], RpcStatus::Unavailable as i64);
}
