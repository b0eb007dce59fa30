//! Engine scenarios driven through the public facade and the in-memory
//! transport: queue backpressure, ageout, reconnection with observation
//! restoration, block-wise transfers, lifecycle gating and sync timeouts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use stratus_core::transport::{content_format, mock::MockTransport, Method};
use stratus_core::{Client, ClientConfig, ClientEvent, Credentials, Error, ServerResponse};

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
    config.request_queue_max_items = 4;
    config
}

fn client_with(mock: &MockTransport, config: ClientConfig) -> Client {
    Client::create(config, Box::new(mock.clone())).expect("client")
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

/// Park the worker outside its session so the queue is not drained.
async fn park_worker(client: &Client) {
    for _ in 0..100 {
        if client.stop().await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("worker did not park");
}

#[tokio::test]
async fn queue_full_surfaces_on_the_extra_submit() {
    let mock = MockTransport::new();
    let client = client_with(&mock, test_config());
    park_worker(&client).await;

    for _ in 0..4 {
        client.empty_async().expect("queue has room");
    }
    assert_eq!(client.empty_async().err(), Some(Error::QueueFull));
    assert_eq!(client.num_items_in_request_queue(), 4);

    // The synchronous variant fails the same way; its completion
    // primitives die with the rejected record.
    assert_eq!(
        client.empty(Some(Duration::from_millis(50))).await.err(),
        Some(Error::QueueFull)
    );

    client.destroy();
}

#[tokio::test]
async fn zero_timeout_requests_age_out_at_dequeue() {
    let mock = MockTransport::new();
    let client = client_with(&mock, test_config());

    let (tx, rx) = mpsc::channel();
    client
        .post_async(
            ".d/",
            "x",
            content_format::JSON,
            b"1",
            Some(Arc::new(move |response: &ServerResponse, _path: &str| {
                let _ = tx.send(response.status);
            })),
            Some(Duration::ZERO),
        )
        .unwrap();

    let status = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(status, Err(Error::Timeout));

    // The aged-out write never reached the wire.
    assert!(!mock
        .sent()
        .iter()
        .any(|pdu| pdu.method == Method::Post && pdu.path == ".d/x"));

    client.destroy();
}

#[tokio::test]
async fn reconnect_restores_observations_with_fresh_tokens() {
    let mock = MockTransport::new();
    let client = client_with(&mock, test_config());

    let hits = Arc::new(AtomicUsize::new(0));
    let seen = hits.clone();
    client
        .observe_async(
            ".d/",
            "desired/x",
            content_format::JSON,
            Arc::new(move |_response, _path, payload| {
                if payload == b"2" {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }),
        )
        .unwrap();

    wait_until("observation to register", || {
        mock.observed_token(".d/desired/x").is_some()
    })
    .await;
    let first_token = mock.observed_token(".d/desired/x").unwrap();

    // Kill the link until the in-flight ping times the session out.
    client.set_packet_loss_percent(100);
    client.empty_async().unwrap();
    wait_until("disconnect", || !client.is_connected()).await;

    client.set_packet_loss_percent(0);
    wait_until("re-established observation", || {
        mock.observed_token(".d/desired/x")
            .is_some_and(|token| token != first_token)
    })
    .await;

    // A server-side change now reaches the original callback without a
    // new observe call.
    assert!(mock.push_notification(".d/desired/x", &b"2"[..]));
    wait_until("notification delivery", || hits.load(Ordering::SeqCst) == 1).await;

    // Exactly one re-dispatch per observation per reconnect.
    let observe_sends = mock
        .sent()
        .iter()
        .filter(|pdu| pdu.observe && pdu.path == ".d/desired/x")
        .count();
    assert_eq!(observe_sends, 2);

    client.destroy();
}

#[tokio::test]
async fn block_wise_download_is_token_stable_and_byte_exact() {
    let mock = MockTransport::new();
    let client = client_with(&mock, test_config());

    let source: Vec<u8> = (0..3072u32).map(|i| (i * 7 % 256) as u8).collect();
    mock.set_object("fw", source.clone());

    let mut assembled = Vec::new();
    for index in 0..3 {
        let block = client
            .get_block("", "fw", content_format::OCTET_STREAM, index, WAIT)
            .await
            .unwrap();
        assembled.extend_from_slice(&block);
    }
    assert_eq!(assembled, source);

    let block_tokens: Vec<_> = mock
        .sent()
        .iter()
        .filter(|pdu| pdu.block2.is_some())
        .map(|pdu| pdu.token)
        .collect();
    assert_eq!(block_tokens.len(), 3);
    assert!(block_tokens.iter().all(|token| *token == block_tokens[0]));

    client.destroy();
}

#[tokio::test]
async fn submits_after_stop_return_invalid_state() {
    let mock = MockTransport::new();
    let client = client_with(&mock, test_config());
    park_worker(&client).await;

    assert!(!client.is_running());
    assert_eq!(
        client.get(".d/", "a", content_format::JSON, WAIT).await.err(),
        Some(Error::InvalidState)
    );
    assert_eq!(
        client
            .post_async(".d/", "a", content_format::JSON, b"1", None, None)
            .err(),
        Some(Error::InvalidState)
    );
    assert_eq!(
        client.delete_async(".d/", "a", None, None).err(),
        Some(Error::InvalidState)
    );
    assert_eq!(
        client
            .observe_async(".d/", "a", content_format::JSON, Arc::new(|_, _, _| {}))
            .err(),
        Some(Error::InvalidState)
    );

    // start() re-arms the submitters.
    client.start();
    assert!(client.is_running());
    client.post(".d/", "a", content_format::JSON, b"1", WAIT).await.unwrap();

    client.destroy();
}

#[tokio::test]
async fn sync_get_times_out_under_packet_loss_then_recovers() {
    let mock = MockTransport::new();
    let client = client_with(&mock, test_config());

    wait_until("initial connect", || client.is_connected()).await;
    mock.set_resource(".d/x", &b"9"[..]);
    client.set_packet_loss_percent(100);

    let started = Instant::now();
    let result = client.get(".d/", "x", content_format::JSON, WAIT).await;
    let elapsed = started.elapsed();
    assert_eq!(result.err(), Some(Error::Timeout));
    // Bounded by the response timeout (300 ms here), not the gate wait.
    assert!(elapsed >= Duration::from_millis(250), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(1), "elapsed {:?}", elapsed);

    client.set_packet_loss_percent(0);
    wait_until("reconnect", || client.is_connected()).await;

    let payload = client.get(".d/", "x", content_format::JSON, WAIT).await.unwrap();
    assert_eq!(payload.as_ref(), b"9");

    client.destroy();
}

#[tokio::test]
async fn requests_dispatch_in_enqueue_order() {
    let mock = MockTransport::new();
    let client = client_with(&mock, test_config());
    park_worker(&client).await;

    let order = Arc::new(Mutex::new(Vec::new()));
    for path in ["a", "b", "c"] {
        let order = order.clone();
        client
            .post_async(
                ".d/",
                path,
                content_format::JSON,
                b"1",
                Some(Arc::new(move |_: &ServerResponse, path: &str| {
                    order.lock().unwrap().push(path.to_string());
                })),
                None,
            )
            .unwrap();
    }

    client.start();
    wait_until("all callbacks", || order.lock().unwrap().len() == 3).await;
    assert_eq!(*order.lock().unwrap(), ["a", "b", "c"]);

    let posts: Vec<_> = mock
        .sent()
        .iter()
        .filter(|pdu| pdu.method == Method::Post)
        .map(|pdu| pdu.path.clone())
        .collect();
    assert_eq!(posts, [".d/a", ".d/b", ".d/c"]);

    client.destroy();
}

#[tokio::test]
async fn callbacks_fire_exactly_once() {
    let mock = MockTransport::new();
    let client = client_with(&mock, test_config());

    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    client
        .get_async(
            ".d/",
            "x",
            content_format::JSON,
            Some(Arc::new(move |_response, _path, _payload| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            None,
        )
        .unwrap();

    wait_until("callback", || count.load(Ordering::SeqCst) > 0).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);

    client.destroy();
}

#[tokio::test]
async fn connectivity_events_fire_once_per_transition() {
    let mock = MockTransport::new();
    let client = client_with(&mock, test_config());

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    client.register_event_callback(move |event| {
        sink.lock().unwrap().push(event);
    });

    wait_until("connect", || client.is_connected()).await;

    client.set_packet_loss_percent(100);
    client.empty_async().unwrap();
    wait_until("disconnect", || !client.is_connected()).await;

    client.set_packet_loss_percent(0);
    wait_until("reconnect", || client.is_connected()).await;

    let seen = events.lock().unwrap().clone();
    let disconnects = seen
        .iter()
        .filter(|event| **event == ClientEvent::Disconnected)
        .count();
    assert_eq!(disconnects, 1);
    assert_eq!(seen.first(), Some(&ClientEvent::Connected));

    client.destroy();
}

#[tokio::test]
async fn keepalive_pings_when_idle() {
    let mock = MockTransport::new();
    let mut config = test_config();
    config.keepalive_interval = Duration::from_millis(100);
    let client = client_with(&mock, config);

    wait_until("connect", || client.is_connected()).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    let pings = mock
        .sent()
        .iter()
        .filter(|pdu| pdu.method == Method::Delete && pdu.path.is_empty())
        .count();
    // The connectivity probe plus at least two idle keepalives.
    assert!(pings >= 3, "got {} pings", pings);

    client.destroy();
}

#[tokio::test]
async fn post_round_trips_through_get_and_delete_yields_null() {
    let mock = MockTransport::new();
    let client = client_with(&mock, test_config());

    client
        .post(".d/", "v", content_format::JSON, b"\"hello\"", WAIT)
        .await
        .unwrap();
    let payload = client.get(".d/", "v", content_format::JSON, WAIT).await.unwrap();
    assert_eq!(payload.as_ref(), b"\"hello\"");

    client.delete(".d/", "v", WAIT).await.unwrap();
    assert_eq!(
        client.get(".d/", "v", content_format::JSON, WAIT).await.err(),
        Some(Error::Null)
    );

    client.destroy();
}

#[tokio::test]
async fn failed_responses_preserve_the_coap_code() {
    let mock = MockTransport::new();
    let client = client_with(&mock, test_config());

    mock.add_response(
        Method::Get,
        ".d/forbidden",
        stratus_core::transport::mock::CannedResponse::error(4, 3),
    );

    let result = client.get(".d/", "forbidden", content_format::JSON, WAIT).await;
    assert_eq!(result.err(), Some(Error::Fail { class: 4, code: 3 }));

    client.destroy();
}
