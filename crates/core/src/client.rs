//! Public client facade
//!
//! [`Client`] owns the worker thread and the bounded queue, and exposes
//! lifecycle control plus per-kind request submitters. Asynchronous
//! submitters enqueue and return; synchronous ones additionally await the
//! completion gateway and hand back the response payload.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::completion::{completion_pair, CompletionEvent};
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::queue::{request_queue, RequestQueue};
use crate::request::{GetHandler, Request, RequestKind, SetHandler, MAX_PATH_LEN};
use crate::session::SessionEngine;
use crate::transport::CoapTransport;

/// How long `stop` waits for the worker to acknowledge.
const STOP_TIMEOUT: Duration = Duration::from_millis(100);

/// Connectivity events reported to the registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// First successful round-trip of a session
    Connected,
    /// The session stopped answering or was torn down
    Disconnected,
}

/// Event callback; runs on the worker thread and must not block.
pub type EventHandler = Arc<dyn Fn(ClientEvent) + Send + Sync>;

/// State shared between the facade and the worker.
pub(crate) struct Shared {
    pub(crate) running: AtomicBool,
    pub(crate) connected: AtomicBool,
    pub(crate) shutdown: AtomicBool,
    pub(crate) packet_loss: AtomicU8,
    pub(crate) event_handler: RwLock<Option<EventHandler>>,
}

impl Shared {
    pub(crate) fn emit(&self, event: ClientEvent) {
        let handler = self.event_handler.read().clone();
        if let Some(handler) = handler {
            handler(event);
        }
    }
}

/// Handle to one device-to-cloud client.
///
/// All submitters may be called from any thread or task. Completion and
/// event callbacks run on the worker thread: they must not block, and a
/// re-submit from inside a callback has to use an `_async` submitter
/// (the queue may be full, and the worker cannot drain it while it is
/// running the callback).
pub struct Client {
    shared: Arc<Shared>,
    queue: RequestQueue,
    run_tx: watch::Sender<bool>,
    active_rx: watch::Receiver<bool>,
    worker: Option<JoinHandle<()>>,
}

impl Client {
    /// Allocate the client and spawn its worker. The client starts
    /// running immediately.
    ///
    /// Fails with [`Error::InvalidFormat`] on a bad server URI and
    /// [`Error::MemAlloc`] when worker resources cannot be acquired.
    pub fn create(config: ClientConfig, transport: Box<dyn CoapTransport>) -> Result<Client> {
        config.validate()?;

        let (queue, receiver) = request_queue(config.request_queue_max_items);
        let shared = Arc::new(Shared {
            running: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            packet_loss: AtomicU8::new(0),
            event_handler: RwLock::new(None),
        });
        let (run_tx, run_rx) = watch::channel(true);
        let (active_tx, active_rx) = watch::channel(false);

        let engine = SessionEngine::new(
            shared.clone(),
            config.clone(),
            transport,
            receiver,
            run_rx,
            active_tx,
        );

        // The worker gets a dedicated OS thread running a single-thread
        // runtime: the transport context never leaves it.
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|_| Error::MemAlloc)?;
        let _task_priority = config.task_priority;
        let worker = std::thread::Builder::new()
            .name("stratus-client".to_string())
            .stack_size(config.task_stack_bytes)
            .spawn(move || {
                #[cfg(feature = "realtime")]
                if let Some(priority) = _task_priority {
                    apply_thread_priority(priority);
                }
                runtime.block_on(engine.run());
            })
            .map_err(|_| Error::MemAlloc)?;

        Ok(Client {
            shared,
            queue,
            run_tx,
            active_rx,
            worker: Some(worker),
        })
    }

    /// Assert the run signal. Idempotent.
    pub fn start(&self) {
        self.shared.running.store(true, Ordering::SeqCst);
        let _ = self.run_tx.send(true);
    }

    /// Clear the run signal and wait briefly for the worker to leave its
    /// session. Idempotent; returns [`Error::Timeout`] when the worker
    /// is still mid-request after the bound (it will still stop).
    pub async fn stop(&self) -> Result<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.run_tx.send(false);

        let mut active = self.active_rx.clone();
        tokio::time::timeout(STOP_TIMEOUT, async move {
            loop {
                if !*active.borrow() {
                    return;
                }
                if active.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .map_err(|_| Error::Timeout)
    }

    /// Stop the worker, drain the queue and release everything.
    ///
    /// Queued requests are dropped: their payloads are freed and any
    /// synchronous callers unblock with [`Error::Timeout`]. Blocks until
    /// the worker thread has exited; the worker notices the shutdown at
    /// its next wait boundary (a drive slice, the queue poll or the
    /// reconnect cooldown).
    pub fn destroy(mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.run_tx.send(false);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }

    /// Whether the run signal is asserted.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Whether the last exchange with the server succeeded.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Number of requests waiting in the queue.
    pub fn num_items_in_request_queue(&self) -> usize {
        self.queue.len()
    }

    /// Register the connectivity event callback, replacing any previous
    /// one.
    pub fn register_event_callback(
        &self,
        handler: impl Fn(ClientEvent) + Send + Sync + 'static,
    ) {
        *self.shared.event_handler.write() = Some(Arc::new(handler));
    }

    /// Worker stack headroom. There is no portable way to measure it.
    pub fn task_stack_min_remaining(&self) -> Result<usize> {
        Err(Error::NotImplemented)
    }

    /// Test hook: ask the transport to drop roughly `percent` of
    /// exchanges. The worker picks the value up before its next
    /// dispatch.
    pub fn set_packet_loss_percent(&self, percent: u8) {
        self.shared.packet_loss.store(percent, Ordering::Relaxed);
    }

    // ---- submitters ----------------------------------------------------

    /// Enqueue a get; the handler receives the payload on the worker.
    pub fn get_async(
        &self,
        path_prefix: &'static str,
        path: &str,
        content_type: u32,
        handler: Option<GetHandler>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.ensure_running()?;
        self.submit(
            RequestKind::Get {
                content_type,
                handler,
            },
            path_prefix,
            path,
            timeout,
            None,
        )
    }

    /// Get and wait for the response payload.
    ///
    /// An empty body maps to [`Error::Null`]; a non-2.xx response to
    /// [`Error::Fail`] with the code preserved.
    pub async fn get(
        &self,
        path_prefix: &'static str,
        path: &str,
        content_type: u32,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        self.ensure_running()?;
        let payload = self
            .submit_sync(
                RequestKind::Get {
                    content_type,
                    handler: None,
                },
                path_prefix,
                path,
                timeout,
            )
            .await?;
        if payload.is_empty() {
            return Err(Error::Null);
        }
        Ok(payload)
    }

    /// Enqueue one block of a block-wise get. The caller iterates
    /// `block_index` from zero; the engine keeps the token stable across
    /// the sequence.
    pub fn get_block_async(
        &self,
        path_prefix: &'static str,
        path: &str,
        content_type: u32,
        block_index: u32,
        handler: Option<GetHandler>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.ensure_running()?;
        self.submit(
            RequestKind::GetBlock {
                content_type,
                block_index,
                block_size: crate::transport::BLOCK_SIZE,
                handler,
            },
            path_prefix,
            path,
            timeout,
            None,
        )
    }

    /// Fetch one block and wait for its bytes.
    pub async fn get_block(
        &self,
        path_prefix: &'static str,
        path: &str,
        content_type: u32,
        block_index: u32,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        self.ensure_running()?;
        self.submit_sync(
            RequestKind::GetBlock {
                content_type,
                block_index,
                block_size: crate::transport::BLOCK_SIZE,
                handler: None,
            },
            path_prefix,
            path,
            timeout,
        )
        .await
    }

    /// Enqueue a write. The payload is copied into an owned buffer whose
    /// ownership passes to the worker on successful enqueue.
    pub fn post_async(
        &self,
        path_prefix: &'static str,
        path: &str,
        content_type: u32,
        payload: &[u8],
        handler: Option<SetHandler>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.ensure_running()?;
        self.submit(
            RequestKind::Post {
                content_type,
                payload: Bytes::copy_from_slice(payload),
                handler,
            },
            path_prefix,
            path,
            timeout,
            None,
        )
    }

    /// Write and wait for the server's acknowledgement.
    pub async fn post(
        &self,
        path_prefix: &'static str,
        path: &str,
        content_type: u32,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.ensure_running()?;
        self.submit_sync(
            RequestKind::Post {
                content_type,
                payload: Bytes::copy_from_slice(payload),
                handler: None,
            },
            path_prefix,
            path,
            timeout,
        )
        .await
        .map(|_| ())
    }

    /// Enqueue a delete.
    pub fn delete_async(
        &self,
        path_prefix: &'static str,
        path: &str,
        handler: Option<SetHandler>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.ensure_running()?;
        self.submit(
            RequestKind::Delete { handler },
            path_prefix,
            path,
            timeout,
            None,
        )
    }

    /// Delete and wait for the server's acknowledgement.
    pub async fn delete(
        &self,
        path_prefix: &'static str,
        path: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.ensure_running()?;
        self.submit_sync(RequestKind::Delete { handler: None }, path_prefix, path, timeout)
            .await
            .map(|_| ())
    }

    /// Establish a long-lived observation. The handler receives the
    /// initial value and every later notification, across reconnects.
    pub fn observe_async(
        &self,
        path_prefix: &'static str,
        path: &str,
        content_type: u32,
        handler: GetHandler,
    ) -> Result<()> {
        self.ensure_running()?;
        self.submit(
            RequestKind::Observe {
                content_type,
                handler,
            },
            path_prefix,
            path,
            None,
            None,
        )
    }

    /// Enqueue a keepalive ping. Deliberately exempt from the running
    /// check: the ping is also the connectivity probe.
    pub fn empty_async(&self) -> Result<()> {
        self.submit(RequestKind::Empty, "", "", None, None)
    }

    /// Ping and wait for the round-trip.
    pub async fn empty(&self, timeout: Option<Duration>) -> Result<()> {
        self.submit_sync(RequestKind::Empty, "", "", timeout)
            .await
            .map(|_| ())
    }

    // ---- internals -----------------------------------------------------

    fn ensure_running(&self) -> Result<()> {
        if !self.is_running() {
            return Err(Error::InvalidState);
        }
        Ok(())
    }

    fn submit(
        &self,
        kind: RequestKind,
        path_prefix: &'static str,
        path: &str,
        timeout: Option<Duration>,
        completion: Option<crate::completion::CompletionSignal>,
    ) -> Result<()> {
        if path_prefix.len() + path.len() > MAX_PATH_LEN {
            warn!(path, "path too long");
            return Err(Error::InvalidFormat);
        }
        let mut request = Request::new(kind, path_prefix, path);
        request.deadline = timeout.map(|t| Instant::now() + t);
        request.completion = completion;
        self.queue.try_send(request).map_err(|rejected| {
            debug!(kind = rejected.kind.name(), "failed to enqueue request, queue full");
            Error::QueueFull
        })
    }

    async fn submit_sync(
        &self,
        kind: RequestKind,
        path_prefix: &'static str,
        path: &str,
        timeout: Option<Duration>,
    ) -> Result<Bytes> {
        let (signal, gate) = completion_pair();
        // An enqueue failure drops both halves of the pair right here,
        // which is all the cleanup the gateway needs.
        self.submit(kind, path_prefix, path, timeout, Some(signal))?;
        match gate.wait(timeout).await? {
            CompletionEvent::ResponseReceived { response, payload } => {
                response.status?;
                Ok(payload)
            }
            CompletionEvent::ResponseTimeout => Err(Error::Timeout),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.run_tx.send(false);
    }
}

#[cfg(feature = "realtime")]
fn apply_thread_priority(priority: u8) {
    use thread_priority::{set_current_thread_priority, ThreadPriority, ThreadPriorityValue};
    match ThreadPriorityValue::try_from(priority) {
        Ok(value) => {
            if let Err(error) = set_current_thread_priority(ThreadPriority::Crossplatform(value)) {
                warn!(?error, "could not apply worker thread priority");
            }
        }
        Err(_) => warn!(priority, "worker thread priority out of range"),
    }
}
