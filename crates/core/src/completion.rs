//! Completion gateway for synchronous calls
//!
//! A two-phase hand-off between the worker and a blocking caller: the
//! worker signals the completion event and then waits for the caller's
//! acknowledgement before tearing down its side, so neither end can race
//! the other on destruction. Dropping the caller's gate counts as the
//! acknowledgement of abandonment and releases the worker immediately.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{Error, Result, ServerResponse};

/// What the worker reports through the gateway. The two variants are
/// mutually exclusive per request.
#[derive(Debug)]
pub enum CompletionEvent {
    /// The server answered; the payload is empty for set-style requests.
    ResponseReceived {
        /// Response outcome with the preserved CoAP code
        response: ServerResponse,
        /// Response body
        payload: Bytes,
    },
    /// No response arrived before the response timeout or the ageout.
    ResponseTimeout,
}

/// Worker-side half of the gateway, carried inside the request record.
#[derive(Debug)]
pub struct CompletionSignal {
    event_tx: oneshot::Sender<CompletionEvent>,
    ack_rx: oneshot::Receiver<()>,
}

/// Caller-side half of the gateway.
pub struct CompletionGate {
    event_rx: oneshot::Receiver<CompletionEvent>,
    ack_tx: oneshot::Sender<()>,
}

/// Create a linked signal/gate pair for one synchronous request.
pub fn completion_pair() -> (CompletionSignal, CompletionGate) {
    let (event_tx, event_rx) = oneshot::channel();
    let (ack_tx, ack_rx) = oneshot::channel();
    (
        CompletionSignal { event_tx, ack_rx },
        CompletionGate { event_rx, ack_tx },
    )
}

impl CompletionSignal {
    /// Deliver the event and wait until the caller has observed it.
    ///
    /// Returns once the ack arrives or once the caller has abandoned the
    /// gate (dropped it after a wait timeout); either way the worker may
    /// release transient resources afterwards.
    pub async fn finish(self, event: CompletionEvent) {
        if self.event_tx.send(event).is_err() {
            // Caller already gone; nothing to wait for.
            return;
        }
        let _ = self.ack_rx.await;
    }
}

impl CompletionGate {
    /// Wait for the completion event, acknowledge it, and return it.
    ///
    /// `timeout` of `None` waits forever. Exhausting a finite wait returns
    /// [`Error::Timeout`] and drops the gate; the worker is not told to
    /// cancel, and the in-flight request runs to its own response timeout.
    pub async fn wait(self, timeout: Option<Duration>) -> Result<CompletionEvent> {
        let event = match timeout {
            Some(bound) => tokio::time::timeout(bound, self.event_rx)
                .await
                .map_err(|_| Error::Timeout)?
                .map_err(|_| Error::Timeout)?,
            None => self.event_rx.await.map_err(|_| Error::Timeout)?,
        };
        let _ = self.ack_tx.send(());
        Ok(event)
    }
}
