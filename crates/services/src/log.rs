//! Remote log upload
//!
//! Ships log lines to the cloud's `logs` endpoint as small JSON records.
//! Uploads are fire-and-forget: they ride the request queue like any
//! other write and are dropped with a local warning when the queue is
//! full.

use std::sync::Arc;

use serde::Serialize;

use stratus_core::transport::content_format;
use stratus_core::{Client, Error, Result};

/// Upload path for log records.
pub const LOG_PATH: &str = "logs";

/// Longest message shipped per record; longer input is truncated.
pub const MAX_MESSAGE_LEN: usize = 100;

/// Severity of an uploaded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Errors needing attention
    Error,
    /// Unexpected but recoverable conditions
    Warn,
    /// Normal operational messages
    Info,
    /// Development detail
    Debug,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

#[derive(Serialize)]
struct LogRecord<'a> {
    level: &'a str,
    module: &'a str,
    msg: &'a str,
}

/// Serialize one record, truncating the message to [`MAX_MESSAGE_LEN`].
pub fn encode_record(level: LogLevel, module: &str, message: &str) -> Result<Vec<u8>> {
    let mut end = MAX_MESSAGE_LEN.min(message.len());
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    let record = LogRecord {
        level: level.as_str(),
        module,
        msg: &message[..end],
    };
    serde_json::to_vec(&record).map_err(|_| Error::Serialize)
}

/// Cloud log uploader for one client.
pub struct RemoteLog {
    client: Arc<Client>,
}

impl RemoteLog {
    /// Wrap a client.
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }

    /// Upload an error-level record.
    pub fn error(&self, module: &str, message: &str) -> Result<()> {
        self.push(LogLevel::Error, module, message)
    }

    /// Upload a warn-level record.
    pub fn warn(&self, module: &str, message: &str) -> Result<()> {
        self.push(LogLevel::Warn, module, message)
    }

    /// Upload an info-level record.
    pub fn info(&self, module: &str, message: &str) -> Result<()> {
        self.push(LogLevel::Info, module, message)
    }

    /// Upload a debug-level record.
    pub fn debug(&self, module: &str, message: &str) -> Result<()> {
        self.push(LogLevel::Debug, module, message)
    }

    /// Upload a record at the given level.
    pub fn push(&self, level: LogLevel, module: &str, message: &str) -> Result<()> {
        let payload = encode_record(level, module, message)?;
        self.client
            .post_async("", LOG_PATH, content_format::JSON, &payload, None, None)
    }
}
