//! Bounded request queue
//!
//! The single mailbox between application submitters and the worker.
//! Enqueue never blocks; dequeue waits with a bound so the worker can
//! service transport I/O between submissions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::request::Request;

/// Create a linked queue/receiver pair with the given capacity.
pub fn request_queue(capacity: usize) -> (RequestQueue, RequestReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let depth = Arc::new(AtomicUsize::new(0));
    (
        RequestQueue {
            tx,
            depth: depth.clone(),
            capacity: capacity.max(1),
        },
        RequestReceiver { rx, depth },
    )
}

/// Submitter-side handle. Cloneable; enqueue is FIFO across all clones.
#[derive(Clone)]
pub struct RequestQueue {
    tx: mpsc::Sender<Request>,
    depth: Arc<AtomicUsize>,
    capacity: usize,
}

impl RequestQueue {
    /// Enqueue without blocking.
    ///
    /// On a full (or closed) queue the record is handed back so the
    /// submitter can release its payload and completion primitives.
    pub fn try_send(&self, request: Request) -> std::result::Result<(), Request> {
        match self.tx.try_send(request) {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(TrySendError::Full(request)) | Err(TrySendError::Closed(request)) => Err(request),
        }
    }

    /// Number of records currently queued.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Worker-side handle; there is exactly one consumer.
pub struct RequestReceiver {
    rx: mpsc::Receiver<Request>,
    depth: Arc<AtomicUsize>,
}

impl RequestReceiver {
    /// Dequeue the next record, waiting at most `wait`.
    pub async fn recv_timeout(&mut self, wait: Duration) -> Option<Request> {
        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(request)) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                Some(request)
            }
            Ok(None) | Err(_) => None,
        }
    }

    /// Dequeue without waiting; used to drain the queue at teardown.
    pub fn try_recv(&mut self) -> Option<Request> {
        match self.rx.try_recv() {
            Ok(request) => {
                self.depth.fetch_sub(1, Ordering::Relaxed);
                Some(request)
            }
            Err(_) => None,
        }
    }
}
