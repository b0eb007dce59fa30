//! Request records and correlation tokens
//!
//! A [`Request`] describes one pending operation from enqueue to completion.
//! Records are immutable after enqueue apart from the token, which the
//! worker assigns at dispatch time.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;

use crate::completion::CompletionSignal;
use crate::error::ServerResponse;

/// Maximum correlation token length in bytes (RFC 7252)
pub const TOKEN_MAX_LEN: usize = 8;

/// Maximum combined length of `path_prefix` + `path`
pub const MAX_PATH_LEN: usize = 63;

/// A 0..=8 byte CoAP correlation token.
///
/// The empty token means "not yet assigned"; the transport mints 1..=8 byte
/// tokens at dispatch time.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Token {
    bytes: [u8; TOKEN_MAX_LEN],
    len: u8,
}

impl Token {
    /// Build a token from raw bytes. Input longer than
    /// [`TOKEN_MAX_LEN`] is truncated.
    pub fn from_bytes(raw: &[u8]) -> Self {
        let len = raw.len().min(TOKEN_MAX_LEN);
        let mut bytes = [0u8; TOKEN_MAX_LEN];
        bytes[..len].copy_from_slice(&raw[..len]);
        Self {
            bytes,
            len: len as u8,
        }
    }

    /// The token bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Token length in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether no token has been assigned.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.as_bytes() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Completion callback for get-style requests (get, block get, observe).
///
/// Receives the server response, the request path and the payload bytes.
/// Runs on the worker thread: it must not block, and a re-submit from
/// inside the callback has to use a non-blocking (async) submitter.
pub type GetHandler = Arc<dyn Fn(&ServerResponse, &str, &[u8]) + Send + Sync>;

/// Completion callback for set-style requests (post, delete).
pub type SetHandler = Arc<dyn Fn(&ServerResponse, &str) + Send + Sync>;

/// The operation a request performs, with per-kind fields.
///
/// Payload ownership lives in the `Post` arm alone and moves with the
/// record; the worker releases it after transmit.
#[derive(Clone)]
pub enum RequestKind {
    /// Zero-payload keepalive ping (a confirmable DELETE carrying only a
    /// token)
    Empty,
    /// Read a resource
    Get {
        /// CoAP content-format requested for the body
        content_type: u32,
        /// Completion hook
        handler: Option<GetHandler>,
    },
    /// Read one 1024-byte block of a large resource
    GetBlock {
        /// CoAP content-format requested for the body
        content_type: u32,
        /// Zero-based block number; block 0 mints the token reused by
        /// every continuation
        block_index: u32,
        /// Transfer unit, always [`crate::transport::BLOCK_SIZE`]
        block_size: usize,
        /// Completion hook, invoked once per block
        handler: Option<GetHandler>,
    },
    /// Write a resource
    Post {
        /// CoAP content-format of the payload
        content_type: u32,
        /// Owned body bytes, transferred to the worker on enqueue
        payload: Bytes,
        /// Completion hook
        handler: Option<SetHandler>,
    },
    /// Delete a resource
    Delete {
        /// Completion hook
        handler: Option<SetHandler>,
    },
    /// Establish a long-lived observation
    Observe {
        /// CoAP content-format requested for notifications
        content_type: u32,
        /// Notification sink, invoked for the initial response and every
        /// later notification
        handler: GetHandler,
    },
}

impl RequestKind {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::Empty => "EMPTY",
            RequestKind::Get { .. } => "GET",
            RequestKind::GetBlock { .. } => "GET_BLOCK",
            RequestKind::Post { .. } => "POST",
            RequestKind::Delete { .. } => "DELETE",
            RequestKind::Observe { .. } => "OBSERVE",
        }
    }
}

impl fmt::Debug for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestKind::Empty => f.debug_struct("Empty").finish(),
            RequestKind::Get { content_type, .. } => f
                .debug_struct("Get")
                .field("content_type", content_type)
                .finish_non_exhaustive(),
            RequestKind::GetBlock {
                content_type,
                block_index,
                block_size,
                ..
            } => f
                .debug_struct("GetBlock")
                .field("content_type", content_type)
                .field("block_index", block_index)
                .field("block_size", block_size)
                .finish_non_exhaustive(),
            RequestKind::Post {
                content_type,
                payload,
                ..
            } => f
                .debug_struct("Post")
                .field("content_type", content_type)
                .field("payload", payload)
                .finish_non_exhaustive(),
            RequestKind::Delete { .. } => f.debug_struct("Delete").finish_non_exhaustive(),
            RequestKind::Observe { content_type, .. } => f
                .debug_struct("Observe")
                .field("content_type", content_type)
                .finish_non_exhaustive(),
        }
    }
}

/// One pending operation, as carried by the request queue.
#[derive(Debug)]
pub struct Request {
    /// What to do
    pub kind: RequestKind,
    /// Static path prefix owned by the submitting service (e.g. `".d/"`)
    pub path_prefix: &'static str,
    /// Path below the prefix, copied at submit time
    pub path: String,
    /// Correlation token, assigned by the worker at dispatch
    pub token: Token,
    /// Ageout instant; `None` waits forever (the per-request response
    /// timeout still applies)
    pub deadline: Option<Instant>,
    /// Present for synchronous calls; resolves the caller's wait
    pub completion: Option<CompletionSignal>,
}

impl Request {
    /// Build a record with no deadline and no completion gate.
    pub fn new(kind: RequestKind, path_prefix: &'static str, path: impl Into<String>) -> Self {
        Self {
            kind,
            path_prefix,
            path: path.into(),
            token: Token::default(),
            deadline: None,
            completion: None,
        }
    }

    /// The keepalive / connectivity-probe record.
    pub fn empty() -> Self {
        Self::new(RequestKind::Empty, "", "")
    }

    /// `path_prefix` and `path` concatenated, as sent on the wire.
    pub fn full_path(&self) -> String {
        format!("{}{}", self.path_prefix, self.path)
    }

    /// Whether the caller-supplied ageout has passed.
    pub fn is_aged_out(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now >= deadline)
    }
}
