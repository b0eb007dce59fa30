//! Typed device-state access
//!
//! The cloud keeps a JSON document per device under the `.d/` prefix and
//! an append-only stream under `.s/`. This adapter encodes and decodes
//! values with `serde_json`; a `"null"` or empty body surfaces as
//! [`Error::Null`], matching a path that was deleted or never written.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use stratus_core::transport::content_format;
use stratus_core::{Client, Error, Result, ServerResponse};

/// Prefix of the persistent device-state document.
pub const STATE_PREFIX: &str = ".d/";

/// Prefix of the time-series stream.
pub const STREAM_PREFIX: &str = ".s/";

/// Decode a state payload, mapping absent values to [`Error::Null`].
pub fn value_from_payload(payload: &[u8]) -> Result<Value> {
    if payload.is_empty() {
        return Err(Error::Null);
    }
    let value: Value = serde_json::from_slice(payload).map_err(|_| Error::InvalidFormat)?;
    if value.is_null() {
        return Err(Error::Null);
    }
    Ok(value)
}

/// Typed state and stream operations for one client.
pub struct DeviceState {
    client: Arc<Client>,
}

impl DeviceState {
    /// Wrap a client.
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }

    /// Write a state value and wait for the server's acknowledgement.
    ///
    /// Accepts anything `serde_json::Value` converts from: integers,
    /// bools, floats, strings (encoded with their JSON quotes) and
    /// composite values.
    pub async fn set(
        &self,
        path: &str,
        value: impl Into<Value>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let payload = encode(value.into())?;
        self.client
            .post(STATE_PREFIX, path, content_format::JSON, &payload, timeout)
            .await
    }

    /// Write a state value without waiting.
    pub fn set_async(&self, path: &str, value: impl Into<Value>) -> Result<()> {
        let payload = encode(value.into())?;
        self.client
            .post_async(STATE_PREFIX, path, content_format::JSON, &payload, None, None)
    }

    /// Read a state value.
    pub async fn get(&self, path: &str, timeout: Option<Duration>) -> Result<Value> {
        let payload = self
            .client
            .get(STATE_PREFIX, path, content_format::JSON, timeout)
            .await?;
        value_from_payload(&payload)
    }

    /// Read an integer state value.
    pub async fn get_int(&self, path: &str, timeout: Option<Duration>) -> Result<i64> {
        self.get(path, timeout)
            .await?
            .as_i64()
            .ok_or(Error::InvalidFormat)
    }

    /// Read a boolean state value.
    pub async fn get_bool(&self, path: &str, timeout: Option<Duration>) -> Result<bool> {
        self.get(path, timeout)
            .await?
            .as_bool()
            .ok_or(Error::InvalidFormat)
    }

    /// Read a float state value.
    pub async fn get_float(&self, path: &str, timeout: Option<Duration>) -> Result<f64> {
        self.get(path, timeout)
            .await?
            .as_f64()
            .ok_or(Error::InvalidFormat)
    }

    /// Read a string state value, without its JSON quotes.
    pub async fn get_string(&self, path: &str, timeout: Option<Duration>) -> Result<String> {
        match self.get(path, timeout).await? {
            Value::String(s) => Ok(s),
            _ => Err(Error::InvalidFormat),
        }
    }

    /// Delete a state path and wait for the acknowledgement.
    pub async fn delete(&self, path: &str, timeout: Option<Duration>) -> Result<()> {
        self.client.delete(STATE_PREFIX, path, timeout).await
    }

    /// Delete a state path without waiting.
    pub fn delete_async(&self, path: &str) -> Result<()> {
        self.client.delete_async(STATE_PREFIX, path, None, None)
    }

    /// Observe a state path. The handler receives the raw payload for
    /// the initial value and every change, across reconnects; decode
    /// with [`value_from_payload`].
    pub fn observe(
        &self,
        path: &str,
        handler: impl Fn(&ServerResponse, &str, &[u8]) + Send + Sync + 'static,
    ) -> Result<()> {
        self.client
            .observe_async(STATE_PREFIX, path, content_format::JSON, Arc::new(handler))
    }

    /// Append a value to the device stream and wait.
    pub async fn stream_push(
        &self,
        path: &str,
        value: impl Into<Value>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let payload = encode(value.into())?;
        self.client
            .post(STREAM_PREFIX, path, content_format::JSON, &payload, timeout)
            .await
    }

    /// Append a value to the device stream without waiting.
    pub fn stream_push_async(&self, path: &str, value: impl Into<Value>) -> Result<()> {
        let payload = encode(value.into())?;
        self.client
            .post_async(STREAM_PREFIX, path, content_format::JSON, &payload, None, None)
    }
}

fn encode(value: Value) -> Result<Vec<u8>> {
    serde_json::to_vec(&value).map_err(|_| Error::Serialize)
}
