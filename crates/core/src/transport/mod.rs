//! The codec seam
//!
//! The engine never parses CoAP bytes. It hands structured PDUs to a
//! [`CoapTransport`] implementation, which owns option encoding, DTLS
//! session setup and the event-pumped I/O routine, and it consumes the
//! transport's decoded events. Everything here is the narrow interface
//! between the two.

pub mod mock;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::Credentials;
use crate::error::Result;
use crate::request::Token;

/// CoAP content-format identifiers used by the services layer.
pub mod content_format {
    /// application/octet-stream
    pub const OCTET_STREAM: u32 = 42;
    /// application/json
    pub const JSON: u32 = 50;
    /// application/cbor
    pub const CBOR: u32 = 60;
}

/// Block-wise transfer unit: szx=6 is 1024-byte blocks.
pub const BLOCK_SZX: u8 = 6;

/// Block-wise transfer unit in bytes.
pub const BLOCK_SIZE: usize = 1 << (BLOCK_SZX as usize + 4);

/// CoAP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    /// Read (also carries observe and block options)
    Get,
    /// Write
    Post,
    /// Delete (also the keepalive ping)
    Delete,
}

/// BLOCK2 option in structured form; the codec owns the wire encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block2 {
    /// Zero-based block number
    pub num: u32,
    /// Block size exponent; always [`BLOCK_SZX`] in this SDK
    pub szx: u8,
}

/// One outgoing confirmable PDU, fully described.
#[derive(Debug, Clone)]
pub struct CoapRequest {
    /// Request method
    pub method: Method,
    /// Correlation token
    pub token: Token,
    /// Full URI path; the codec splits it into URI-Path segments. Empty
    /// for the keepalive ping.
    pub path: String,
    /// CoAP content-format option, when the body is typed
    pub content_type: Option<u32>,
    /// Attach the OBSERVE option with the ESTABLISH value
    pub observe: bool,
    /// Attach the BLOCK2 option
    pub block2: Option<Block2>,
    /// Request body; empty for bodyless methods
    pub payload: Bytes,
}

impl CoapRequest {
    /// A bodyless request with only a method and token.
    pub fn new(method: Method, token: Token) -> Self {
        Self {
            method,
            token,
            path: String::new(),
            content_type: None,
            observe: false,
            block2: None,
            payload: Bytes::new(),
        }
    }
}

/// One incoming decoded PDU: a response or an observation notification.
#[derive(Debug, Clone)]
pub struct ReceivedPdu {
    /// Echoed correlation token
    pub token: Token,
    /// Response class (the 2 in 2.05)
    pub class: u8,
    /// Response detail (the 05 in 2.05)
    pub code: u8,
    /// Response body
    pub payload: Bytes,
}

/// Why the codec gave up on a confirmable exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackReason {
    /// DTLS layer failure; usually a credentials problem
    TlsFailed,
    /// Retransmission budget exhausted
    TooManyRetries,
    /// The peer is unreachable
    NotDeliverable,
}

/// Everything the codec can report from one I/O drive.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A decoded response or notification
    Rx(ReceivedPdu),
    /// A confirmable exchange was abandoned
    Nack(NackReason),
    /// A reset message arrived; logged and otherwise ignored
    Reset {
        /// Token of the reset exchange, when present
        token: Token,
    },
}

/// The DTLS/CoAP codec as the engine sees it.
///
/// Implementations own the session, the socket and all CoAP byte-level
/// work. The engine drives every method from its single worker thread, so
/// implementations need `Send` but not `Sync`.
#[async_trait]
pub trait CoapTransport: Send {
    /// Establish (or re-establish) the DTLS session.
    async fn connect(&mut self, credentials: &Credentials) -> Result<()>;

    /// Seed the codec's token generator; called once per session.
    fn seed_tokens(&mut self, seed: u64);

    /// Mint a fresh 1..=8 byte correlation token.
    fn next_token(&mut self) -> Token;

    /// Encode and transmit one confirmable PDU.
    async fn send(&mut self, request: CoapRequest) -> Result<()>;

    /// Pump codec I/O for at most `wait`, returning decoded events.
    ///
    /// A `wait` of zero services only already-pending I/O (ACKs,
    /// retransmits, queued notifications) without sleeping.
    async fn drive(&mut self, wait: Duration) -> Result<Vec<TransportEvent>>;

    /// Test hook: drop roughly `percent` of exchanges. Default: no-op.
    fn set_packet_loss_percent(&mut self, _percent: u8) {}

    /// Release session and context resources.
    async fn close(&mut self);
}
