//! Scriptable in-memory transport
//!
//! A stand-in server for tests and host-side development: canned
//! responses, a tiny resource store for write/read round-trips,
//! injectable observation notifications, connect-failure and packet-loss
//! switches, and a transmit log for assertions. Deterministic token mint.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::{Block2, CoapRequest, CoapTransport, Method, NackReason, ReceivedPdu, TransportEvent};
use crate::config::Credentials;
use crate::error::{Error, Result};
use crate::request::Token;

/// A scripted reply for one (method, path) pair.
#[derive(Debug, Clone)]
pub struct CannedResponse {
    /// Response class
    pub class: u8,
    /// Response detail
    pub code: u8,
    /// Response body
    pub payload: Bytes,
}

impl CannedResponse {
    /// 2.05 Content with the given body.
    pub fn content(payload: impl Into<Bytes>) -> Self {
        Self {
            class: 2,
            code: 5,
            payload: payload.into(),
        }
    }

    /// An arbitrary failure code with an empty body.
    pub fn error(class: u8, code: u8) -> Self {
        Self {
            class,
            code,
            payload: Bytes::new(),
        }
    }
}

#[derive(Default)]
struct Inner {
    connected: bool,
    connect_attempts: usize,
    fail_connect: bool,
    packet_loss_percent: u8,
    token_seed: u64,
    token_counter: u64,
    /// Scripted replies; the last one for a key is sticky.
    canned: HashMap<(Method, String), VecDeque<CannedResponse>>,
    /// Server-side resource values, for post/get/delete round-trips.
    resources: HashMap<String, Bytes>,
    /// Large objects served via BLOCK2 slicing.
    objects: HashMap<String, Bytes>,
    /// Paths the client currently observes, with their session tokens.
    observations: HashMap<String, Token>,
    /// Events waiting for the next drive.
    pending: VecDeque<TransportEvent>,
    /// Nacks queued by tests.
    queued_nacks: VecDeque<NackReason>,
    /// Everything the engine transmitted.
    sent: Vec<CoapRequest>,
}

/// Cloneable handle to the scripted server; move one clone into the
/// client and keep another for assertions.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Mutex<Inner>>,
}

impl MockTransport {
    /// A fresh transport with no scripted behavior.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent `connect` calls fail with [`Error::Io`].
    pub fn fail_connect(&self, fail: bool) {
        self.inner.lock().fail_connect = fail;
    }

    /// Script a reply for `(method, path)`. Queued replies are consumed
    /// in order; the last remaining one answers every further request.
    pub fn add_response(&self, method: Method, path: &str, response: CannedResponse) {
        self.inner
            .lock()
            .canned
            .entry((method, path.to_string()))
            .or_default()
            .push_back(response);
    }

    /// Store a large object served through BLOCK2 GETs.
    pub fn set_object(&self, path: &str, bytes: impl Into<Bytes>) {
        self.inner.lock().objects.insert(path.to_string(), bytes.into());
    }

    /// Seed a resource value directly, as if a writer had posted it.
    pub fn set_resource(&self, path: &str, bytes: impl Into<Bytes>) {
        self.inner
            .lock()
            .resources
            .insert(path.to_string(), bytes.into());
    }

    /// Emit a notification for an observed path. Returns false when the
    /// path has no live observation.
    pub fn push_notification(&self, path: &str, payload: impl Into<Bytes>) -> bool {
        let mut inner = self.inner.lock();
        match inner.observations.get(path).copied() {
            Some(token) => {
                let pdu = ReceivedPdu {
                    token,
                    class: 2,
                    code: 5,
                    payload: payload.into(),
                };
                inner.pending.push_back(TransportEvent::Rx(pdu));
                true
            }
            None => false,
        }
    }

    /// Queue a NACK delivered on the next transmit.
    pub fn push_nack(&self, reason: NackReason) {
        self.inner.lock().queued_nacks.push_back(reason);
    }

    /// Same knob as the trait method, reachable from the test side.
    pub fn set_packet_loss(&self, percent: u8) {
        self.inner.lock().packet_loss_percent = percent;
    }

    /// Number of successful `connect` calls so far.
    pub fn connect_count(&self) -> usize {
        self.inner.lock().connect_attempts
    }

    /// Every PDU the engine has transmitted, in order.
    pub fn sent(&self) -> Vec<CoapRequest> {
        self.inner.lock().sent.clone()
    }

    /// The token currently associated with an observed path.
    pub fn observed_token(&self, path: &str) -> Option<Token> {
        self.inner.lock().observations.get(path).copied()
    }

    /// Current value of a server resource.
    pub fn resource(&self, path: &str) -> Option<Bytes> {
        self.inner.lock().resources.get(path).cloned()
    }

    fn reply_for(inner: &mut Inner, request: &CoapRequest) -> ReceivedPdu {
        let key = (request.method, request.path.clone());
        if let Some(queue) = inner.canned.get_mut(&key) {
            let canned = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            if let Some(canned) = canned {
                return ReceivedPdu {
                    token: request.token,
                    class: canned.class,
                    code: canned.code,
                    payload: canned.payload,
                };
            }
        }

        match request.method {
            Method::Get => {
                if let Some(Block2 { num, .. }) = request.block2 {
                    return Self::block_reply(inner, request, num);
                }
                let payload = inner
                    .resources
                    .get(&request.path)
                    .cloned()
                    .unwrap_or_default();
                ReceivedPdu {
                    token: request.token,
                    class: 2,
                    code: 5,
                    payload,
                }
            }
            Method::Post => {
                inner
                    .resources
                    .insert(request.path.clone(), request.payload.clone());
                ReceivedPdu {
                    token: request.token,
                    class: 2,
                    code: 4,
                    payload: Bytes::new(),
                }
            }
            Method::Delete => {
                inner.resources.remove(&request.path);
                ReceivedPdu {
                    token: request.token,
                    class: 2,
                    code: 2,
                    payload: Bytes::new(),
                }
            }
        }
    }

    fn block_reply(inner: &mut Inner, request: &CoapRequest, num: u32) -> ReceivedPdu {
        match inner.objects.get(&request.path) {
            Some(object) => {
                let start = (num as usize) * super::BLOCK_SIZE;
                let end = (start + super::BLOCK_SIZE).min(object.len());
                let slice = if start < object.len() {
                    object.slice(start..end)
                } else {
                    Bytes::new()
                };
                ReceivedPdu {
                    token: request.token,
                    class: 2,
                    code: 5,
                    payload: slice,
                }
            }
            None => ReceivedPdu {
                token: request.token,
                class: 4,
                code: 4,
                payload: Bytes::new(),
            },
        }
    }
}

#[async_trait]
impl CoapTransport for MockTransport {
    async fn connect(&mut self, _credentials: &Credentials) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_connect {
            return Err(Error::Io);
        }
        inner.connected = true;
        inner.connect_attempts += 1;
        inner.pending.clear();
        Ok(())
    }

    fn seed_tokens(&mut self, seed: u64) {
        self.inner.lock().token_seed = seed;
    }

    fn next_token(&mut self) -> Token {
        let mut inner = self.inner.lock();
        inner.token_counter += 1;
        let value = inner.token_seed ^ inner.token_counter;
        Token::from_bytes(&value.to_be_bytes())
    }

    async fn send(&mut self, request: CoapRequest) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.connected {
            return Err(Error::Io);
        }
        inner.sent.push(request.clone());

        if let Some(reason) = inner.queued_nacks.pop_front() {
            inner.pending.push_back(TransportEvent::Nack(reason));
            return Ok(());
        }

        let loss = inner.packet_loss_percent;
        if loss > 0 && (loss >= 100 || rand::random::<u8>() % 100 < loss) {
            debug!(path = %request.path, "mock transport dropped exchange");
            return Ok(());
        }

        if request.observe {
            inner
                .observations
                .insert(request.path.clone(), request.token);
        }

        let reply = Self::reply_for(&mut inner, &request);
        inner.pending.push_back(TransportEvent::Rx(reply));
        Ok(())
    }

    async fn drive(&mut self, wait: Duration) -> Result<Vec<TransportEvent>> {
        {
            let mut inner = self.inner.lock();
            if !inner.pending.is_empty() {
                return Ok(inner.pending.drain(..).collect());
            }
        }
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        let mut inner = self.inner.lock();
        Ok(inner.pending.drain(..).collect())
    }

    fn set_packet_loss_percent(&mut self, percent: u8) {
        self.inner.lock().packet_loss_percent = percent;
    }

    async fn close(&mut self) {
        let mut inner = self.inner.lock();
        inner.connected = false;
        inner.observations.clear();
        inner.pending.clear();
    }
}
