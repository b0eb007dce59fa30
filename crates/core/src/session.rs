//! Session engine
//!
//! The single-threaded worker that owns the transport: it dequeues
//! requests, builds PDUs, correlates responses by token, fans
//! notifications out to the observation registry, sends keepalive pings,
//! and cycles the session through reconnects. All transport I/O happens
//! here; everything else talks to this loop through the bounded queue and
//! the completion gateway.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::client::{ClientEvent, Shared};
use crate::completion::CompletionEvent;
use crate::config::ClientConfig;
use crate::error::{Error, Result, ServerResponse};
use crate::observe::{ObservationRecord, ObservationRegistry};
use crate::queue::RequestReceiver;
use crate::request::{Request, RequestKind, Token};
use crate::transport::{Block2, CoapRequest, CoapTransport, Method, NackReason, TransportEvent, BLOCK_SZX};

/// Upper bound of one transport drive slice while awaiting a response.
const DRIVE_SLICE: Duration = Duration::from_millis(1000);

pub(crate) struct SessionEngine {
    shared: Arc<Shared>,
    config: ClientConfig,
    transport: Box<dyn CoapTransport>,
    receiver: RequestReceiver,
    observations: ObservationRegistry,
    run_rx: watch::Receiver<bool>,
    active_tx: watch::Sender<bool>,
    /// Token minted for block 0 of the current block-wise GET; every
    /// continuation block reuses it so responses keep correlating.
    block_token: Token,
    /// Token of the in-flight request, empty when idle.
    pending_token: Token,
    got_response: bool,
    last_response: Option<(ServerResponse, Bytes)>,
    /// Keepalive reference point; refreshed by every correlated response.
    last_activity: Instant,
    /// Last packet-loss value handed to the transport.
    applied_packet_loss: u8,
}

impl SessionEngine {
    pub(crate) fn new(
        shared: Arc<Shared>,
        config: ClientConfig,
        transport: Box<dyn CoapTransport>,
        receiver: RequestReceiver,
        run_rx: watch::Receiver<bool>,
        active_tx: watch::Sender<bool>,
    ) -> Self {
        let observations = ObservationRegistry::with_capacity(config.observation_capacity);
        Self {
            shared,
            config,
            transport,
            receiver,
            observations,
            run_rx,
            active_tx,
            block_token: Token::default(),
            pending_token: Token::default(),
            got_response: false,
            last_response: None,
            last_activity: Instant::now(),
            applied_packet_loss: 0,
        }
    }

    /// Worker main loop: one iteration per session lifetime.
    pub(crate) async fn run(mut self) {
        loop {
            let _ = self.active_tx.send(false);
            if self.shutdown_requested() {
                break;
            }

            debug!("waiting for the run signal");
            if !self.wait_for_run().await {
                break;
            }
            debug!("run signal received, opening session");

            if let Err(error) = self.transport.connect(&self.config.credentials).await {
                warn!(%error, "session setup failed");
                sleep(self.config.reconnect_cooldown).await;
                continue;
            }
            self.transport.seed_tokens(rand::random());
            self.force_apply_packet_loss();
            let _ = self.active_tx.send(true);
            self.last_activity = Instant::now();

            // Probe the link right away: the codec has no "connected"
            // signal, so a fast Empty round-trip stands in for one.
            let mut session_ok = self.handle_request(Request::empty()).await.is_ok();

            // Re-arm surviving observations with fresh tokens.
            if session_ok {
                session_ok = self.reestablish_observations().await.is_ok();
            }

            info!("entering I/O loop");
            while session_ok {
                if self.shutdown_requested() {
                    break;
                }
                if !*self.run_rx.borrow() {
                    info!("stopping");
                    break;
                }
                self.apply_packet_loss();
                if let Err(error) = self.io_loop_once().await {
                    debug!(%error, "session error");
                    session_ok = false;
                }
            }

            info!("ending session");
            self.transport.close().await;
            self.mark_disconnected();
            let _ = self.active_tx.send(false);

            sleep(self.config.reconnect_cooldown).await;
        }

        self.drain_queue();
        debug!("worker exiting");
    }

    /// Block until the run signal is asserted. Returns false on shutdown.
    async fn wait_for_run(&mut self) -> bool {
        loop {
            if self.shutdown_requested() {
                return false;
            }
            if *self.run_rx.borrow() {
                return true;
            }
            if self.run_rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// One engine iteration: dequeue with a bounded wait, or service
    /// pending transport I/O and the keepalive when no request arrived.
    async fn io_loop_once(&mut self) -> Result<()> {
        match self
            .receiver
            .recv_timeout(self.config.queue_poll_interval)
            .await
        {
            Some(request) => self.handle_request(request).await,
            None => {
                let events = self.transport.drive(Duration::ZERO).await?;
                if self.process_events(events) {
                    return Err(Error::Io);
                }
                self.maybe_keepalive().await
            }
        }
    }

    /// Dispatch one request and await its response.
    async fn handle_request(&mut self, mut request: Request) -> Result<()> {
        let now = Instant::now();
        if request.is_aged_out(now) {
            debug!(
                kind = request.kind.name(),
                path = %request.path,
                "request aged out at dequeue"
            );
            complete_request(request, ServerResponse::timeout(), Bytes::new()).await;
            return Ok(());
        }

        // A loss value set just before this request was enqueued must
        // affect it, so the knob is re-checked at dispatch.
        self.apply_packet_loss();

        let token = self.assign_token(&request.kind);
        request.token = token;
        debug!(
            kind = request.kind.name(),
            path = %request.full_path(),
            token = ?token,
            "dispatch"
        );

        let pdu = build_pdu(&request);
        if let Err(error) = self.transport.send(pdu).await {
            warn!(%error, "transmit failed");
            complete_request(request, ServerResponse::timeout(), Bytes::new()).await;
            return Err(Error::Io);
        }

        if let RequestKind::Observe {
            content_type,
            handler,
        } = &request.kind
        {
            let record = ObservationRecord {
                path_prefix: request.path_prefix,
                path: request.path.clone(),
                content_type: *content_type,
                handler: handler.clone(),
                token,
            };
            if self.observations.insert(record).is_err() {
                error!(path = %request.path, "cannot observe, no free observation slots");
            }
        }

        // Await the response in bounded drive slices. Other I/O
        // (notifications, retransmits) completes in the same slices, so
        // elapsed time is accumulated rather than counted per slice.
        self.pending_token = token;
        self.got_response = false;
        self.last_response = None;

        let response_budget = match request.deadline {
            Some(deadline) => self
                .config
                .response_timeout
                .min(deadline.saturating_duration_since(now)),
            None => self.config.response_timeout,
        };

        let mut spent = Duration::ZERO;
        let mut io_failed = false;
        while spent < response_budget {
            if self.shutdown_requested() {
                break;
            }
            let slice = DRIVE_SLICE.min(response_budget - spent);
            let started = Instant::now();
            match self.transport.drive(slice).await {
                Ok(events) => {
                    if self.process_events(events) {
                        io_failed = true;
                        break;
                    }
                }
                Err(error) => {
                    warn!(%error, "transport I/O failed");
                    io_failed = true;
                    break;
                }
            }
            if self.got_response {
                break;
            }
            spent += started.elapsed();
        }
        self.pending_token = Token::default();

        if io_failed {
            complete_request(request, ServerResponse::timeout(), Bytes::new()).await;
            return Err(Error::Io);
        }

        if !self.got_response {
            warn!(
                kind = request.kind.name(),
                path = %request.full_path(),
                "no response from server"
            );
            complete_request(request, ServerResponse::timeout(), Bytes::new()).await;
            self.mark_disconnected();
            return Err(Error::Timeout);
        }

        let (response, payload) = match self.last_response.take() {
            Some(received) => received,
            None => (ServerResponse::timeout(), Bytes::new()),
        };
        self.mark_connected();
        complete_request(request, response, payload).await;
        Ok(())
    }

    /// Feed decoded transport events through correlation and the
    /// observation registry. Returns true when a NACK ends the session.
    fn process_events(&mut self, events: Vec<TransportEvent>) -> bool {
        for event in events {
            match event {
                TransportEvent::Rx(pdu) => {
                    let response = ServerResponse::from_code(pdu.class, pdu.code);
                    if !self.got_response
                        && !self.pending_token.is_empty()
                        && pdu.token == self.pending_token
                    {
                        trace!(token = ?pdu.token, class = pdu.class, code = pdu.code,
                               "response for in-flight request");
                        self.got_response = true;
                        self.last_activity = Instant::now();
                        self.last_response = Some((response, pdu.payload.clone()));
                    }
                    self.observations.notify(pdu.token, &response, &pdu.payload);
                }
                TransportEvent::Reset { token } => {
                    warn!(token = ?token, "got RST");
                }
                TransportEvent::Nack(reason) => {
                    error!(reason = ?reason, "exchange nacked");
                    if reason == NackReason::TlsFailed {
                        error!("DTLS failure, check PSK or certificate credentials");
                    }
                    return true;
                }
            }
        }
        false
    }

    /// Mint or reuse the correlation token for a dispatch.
    fn assign_token(&mut self, kind: &RequestKind) -> Token {
        match kind {
            RequestKind::GetBlock { block_index, .. } => {
                if *block_index == 0 || self.block_token.is_empty() {
                    let token = self.transport.next_token();
                    self.block_token = token;
                    token
                } else {
                    self.block_token
                }
            }
            _ => self.transport.next_token(),
        }
    }

    /// Re-dispatch every installed observation with a fresh token.
    async fn reestablish_observations(&mut self) -> Result<()> {
        if self.observations.is_empty() {
            return Ok(());
        }
        info!(
            count = self.observations.len(),
            "re-establishing observations"
        );

        let mut pdus = Vec::new();
        for record in self.observations.records_mut() {
            let token = self.transport.next_token();
            record.token = token;
            let mut pdu = CoapRequest::new(Method::Get, token);
            pdu.path = format!("{}{}", record.path_prefix, record.path);
            pdu.content_type = Some(record.content_type);
            pdu.observe = true;
            pdus.push(pdu);
        }
        for pdu in pdus {
            self.transport.send(pdu).await?;
        }
        Ok(())
    }

    /// Send the Empty ping when the link has been idle past the
    /// keepalive interval. Runs from the idle branch only, so the queue
    /// is empty and nothing is in flight.
    async fn maybe_keepalive(&mut self) -> Result<()> {
        let interval = self.config.keepalive_interval;
        if interval.is_zero() || self.last_activity.elapsed() < interval {
            return Ok(());
        }
        debug!("keepalive");
        self.handle_request(Request::empty()).await
    }

    /// Forward the facade's packet-loss knob when it changed, so a value
    /// set directly on a transport (in tests) is not overwritten.
    fn apply_packet_loss(&mut self) {
        let percent = self.shared.packet_loss.load(Ordering::Relaxed);
        if percent != self.applied_packet_loss {
            self.force_apply_packet_loss();
        }
    }

    fn force_apply_packet_loss(&mut self) {
        let percent = self.shared.packet_loss.load(Ordering::Relaxed);
        self.applied_packet_loss = percent;
        self.transport.set_packet_loss_percent(percent);
    }

    fn shutdown_requested(&self) -> bool {
        self.shared.shutdown.load(Ordering::SeqCst)
    }

    fn mark_connected(&self) {
        if !self.shared.connected.swap(true, Ordering::SeqCst) {
            info!("connected to server");
            self.shared.emit(ClientEvent::Connected);
        }
    }

    fn mark_disconnected(&self) {
        if self.shared.connected.swap(false, Ordering::SeqCst) {
            info!("disconnected from server");
            self.shared.emit(ClientEvent::Disconnected);
        }
    }

    /// Release everything still queued at teardown. Dropping a record
    /// frees its payload and resolves its completion gate as abandoned.
    fn drain_queue(&mut self) {
        let mut dropped = 0usize;
        while self.receiver.try_recv().is_some() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!(count = dropped, "dropped queued requests at teardown");
        }
    }
}

/// Invoke the request's completion hook exactly once, then resolve a
/// synchronous caller through the two-phase gateway.
async fn complete_request(request: Request, response: ServerResponse, payload: Bytes) {
    match &request.kind {
        RequestKind::Get { handler, .. } | RequestKind::GetBlock { handler, .. } => {
            if let Some(handler) = handler {
                handler(&response, &request.path, &payload);
            }
        }
        RequestKind::Post { handler, .. } | RequestKind::Delete { handler } => {
            if let Some(handler) = handler {
                handler(&response, &request.path);
            }
        }
        // Observation payloads flow through the registry scan; the
        // keepalive has no hook.
        RequestKind::Observe { .. } | RequestKind::Empty => {}
    }

    if let Some(signal) = request.completion {
        let event = if response.status == Err(Error::Timeout) {
            CompletionEvent::ResponseTimeout
        } else {
            CompletionEvent::ResponseReceived { response, payload }
        };
        signal.finish(event).await;
    }
}

/// Translate a request record into the structured PDU handed to the codec.
fn build_pdu(request: &Request) -> CoapRequest {
    match &request.kind {
        // A confirmable DELETE carrying only a token. Codec-builtin
        // keepalive is avoided: it drops the DTLS session right after
        // the server answers the ping.
        RequestKind::Empty => CoapRequest::new(Method::Delete, request.token),
        RequestKind::Get { content_type, .. } => {
            let mut pdu = CoapRequest::new(Method::Get, request.token);
            pdu.path = request.full_path();
            pdu.content_type = Some(*content_type);
            pdu
        }
        RequestKind::GetBlock {
            content_type,
            block_index,
            ..
        } => {
            let mut pdu = CoapRequest::new(Method::Get, request.token);
            pdu.path = request.full_path();
            pdu.content_type = Some(*content_type);
            pdu.block2 = Some(Block2 {
                num: *block_index,
                szx: BLOCK_SZX,
            });
            pdu
        }
        RequestKind::Post {
            content_type,
            payload,
            ..
        } => {
            let mut pdu = CoapRequest::new(Method::Post, request.token);
            pdu.path = request.full_path();
            pdu.content_type = Some(*content_type);
            pdu.payload = payload.clone();
            pdu
        }
        RequestKind::Delete { .. } => {
            let mut pdu = CoapRequest::new(Method::Delete, request.token);
            pdu.path = request.full_path();
            pdu
        }
        RequestKind::Observe { content_type, .. } => {
            let mut pdu = CoapRequest::new(Method::Get, request.token);
            pdu.path = request.full_path();
            pdu.content_type = Some(*content_type);
            pdu.observe = true;
            pdu
        }
    }
}
