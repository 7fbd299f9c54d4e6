// ── Connection manager ──
//
// Owns the transport link and drives the connection state machine:
//
//   Disconnected → Connecting → Connected → (drop) Reconnecting → Connecting → …
//
// `Closed` is terminal and only reached through `close()`. A connect
// attempt runs in two steps: the transport comes up, then (when a session
// UUID is known) the session is confirmed with a `session-uuid` request.
// Only after both succeed is the state `Connected`.
//
// Background tasks hold a `Weak` reference to the shared state so that
// dropping every `Session` handle tears the connection down. A connect
// attempt holds a strong one only until it settles.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::Utc;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use cogs_api::protocol::{Inbound, parse_inbound};
use cogs_api::{Connector, Frame, KeySet, Request, Response, TransportEvent, TransportLink};

use crate::config::ConnectionOptions;
use crate::correlator::{Delivery, RequestCorrelator, server_error};
use crate::dispatcher::ChannelDispatcher;
use crate::error::PubSubError;
use crate::handlers::{ErrorHandler, Handlers, guarded};

/// Lower bound on the reconnect delay.
pub const BACKOFF_FLOOR: Duration = Duration::from_secs(5);

/// Upper bound on the reconnect delay.
pub const BACKOFF_CEILING: Duration = Duration::from_secs(120);

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

// ── ConnectionState ──────────────────────────────────────────────

/// Connection state observable by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Closed,
}

// ── Backoff ──────────────────────────────────────────────────────

/// Delay before the first reconnect attempt.
pub fn initial_backoff(connect_timeout: Duration) -> Duration {
    connect_timeout.clamp(BACKOFF_FLOOR, BACKOFF_CEILING)
}

/// Delay after a failed attempt: `min(max(current, floor) * 2, ceiling)`.
pub fn next_backoff(current: Duration) -> Duration {
    current
        .max(BACKOFF_FLOOR)
        .saturating_mul(2)
        .min(BACKOFF_CEILING)
}

// ── ConnectionManager ────────────────────────────────────────────

type ConnectAttempt = Shared<BoxFuture<'static, Result<(), PubSubError>>>;

/// Cheaply cloneable handle to the shared connection state.
#[derive(Clone)]
pub(crate) struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    keys: KeySet,
    options: ConnectionOptions,
    connector: Arc<dyn Connector>,
    state: watch::Sender<ConnectionState>,
    session_uuid: ArcSwapOption<Uuid>,
    sequence: AtomicU64,
    correlator: RequestCorrelator,
    dispatcher: ChannelDispatcher,
    handlers: Handlers,
    outbound: ArcSwapOption<mpsc::Sender<Frame>>,
    auto_reconnect: AtomicBool,
    reconnect_delay: Mutex<Duration>,
    in_flight: Mutex<Option<ConnectAttempt>>,
    /// Cancelled by `close()`; every link token is a child of it.
    cancel: CancellationToken,
    link: Mutex<Option<CancellationToken>>,
    link_id: AtomicU64,
    sweeper_started: AtomicBool,
}

impl ConnectionManager {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        keys: KeySet,
        options: ConnectionOptions,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            inner: Arc::new(Inner {
                session_uuid: ArcSwapOption::new(options.session_uuid.map(Arc::new)),
                sequence: AtomicU64::new(options.first_sequence),
                correlator: RequestCorrelator::new(options.request_ttl),
                auto_reconnect: AtomicBool::new(options.auto_reconnect),
                reconnect_delay: Mutex::new(initial_backoff(options.connect_timeout)),
                keys,
                options,
                connector,
                state,
                dispatcher: ChannelDispatcher::new(),
                handlers: Handlers::default(),
                outbound: ArcSwapOption::empty(),
                in_flight: Mutex::new(None),
                cancel: CancellationToken::new(),
                link: Mutex::new(None),
                link_id: AtomicU64::new(0),
                sweeper_started: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn dispatcher(&self) -> &ChannelDispatcher {
        &self.inner.dispatcher
    }

    pub(crate) fn handlers(&self) -> &Handlers {
        &self.inner.handlers
    }

    pub(crate) fn state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub(crate) fn session_uuid(&self) -> Option<Uuid> {
        self.inner.session_uuid.load_full().map(|u| *u)
    }

    pub(crate) fn record_session_uuid(&self, uuid: Uuid) {
        self.inner.session_uuid.store(Some(Arc::new(uuid)));
    }

    /// Take the next sequence number. Unique across all callers.
    pub(crate) fn next_sequence(&self) -> u64 {
        self.inner.next_sequence()
    }

    pub(crate) fn pending_requests(&self) -> usize {
        self.inner.correlator.pending_count()
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Connect, or join the attempt already in flight.
    pub(crate) async fn connect(&self) -> Result<(), PubSubError> {
        self.inner.ensure_sweeper();

        let attempt = {
            let mut slot = self.inner.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match *self.inner.state.borrow() {
                ConnectionState::Closed => return Err(PubSubError::Closed),
                ConnectionState::Connected => return Ok(()),
                _ => {}
            }

            if let Some(existing) = slot.as_ref() {
                debug!("joining in-flight connect attempt");
                existing.clone()
            } else {
                // Spawned: the attempt settles even if every caller stops waiting.
                let inner = Arc::clone(&self.inner);
                let task = tokio::spawn(async move {
                    let result = inner.establish().await;
                    *inner.in_flight.lock().unwrap_or_else(PoisonError::into_inner) = None;
                    result
                });
                let attempt: BoxFuture<'static, Result<(), PubSubError>> = Box::pin(async move {
                    task.await.unwrap_or_else(|e| {
                        Err(PubSubError::Connection {
                            reason: format!("connect task failed: {e}"),
                        })
                    })
                });
                let attempt = attempt.shared();
                *slot = Some(attempt.clone());
                attempt
            }
        };

        attempt.await
    }

    /// Caller-initiated close. Disables reconnects, closes the transport
    /// and moves to `Closed`. Outstanding requests are left to time out.
    pub(crate) fn close(&self) {
        let inner = &self.inner;
        inner.auto_reconnect.store(false, Ordering::SeqCst);
        inner.cancel.cancel();
        inner.teardown_link();

        if !inner.mark_closed() {
            info!("connection closed");
            inner.handlers.fire_close(None);
        }
    }

    // ── Requests ─────────────────────────────────────────────────

    /// Send `request` and wait for its settlement.
    pub(crate) async fn request(&self, request: Request) -> Result<Response, PubSubError> {
        let outbound = self.inner.outbound_or_err()?;
        let pending = self.inner.correlator.send(&outbound, &request).await?;
        drop(outbound);
        pending.await.unwrap_or(Err(PubSubError::Closed))
    }

    /// Send an unacknowledged publish, registering where a later server
    /// error for it should be reported.
    pub(crate) async fn publish(
        &self,
        request: Request,
        handler: Option<ErrorHandler>,
    ) -> Result<u64, PubSubError> {
        let seq = request.seq();
        let outbound = self.inner.outbound_or_err()?;
        self.inner.correlator.register_publish_error(request.clone(), handler);

        match self.inner.correlator.send(&outbound, &request).await {
            Ok(pending) => {
                drop(outbound);
                pending.await.unwrap_or(Err(PubSubError::Closed))?;
                Ok(seq)
            }
            Err(e) => {
                self.inner.correlator.take_publish_error(seq);
                Err(e)
            }
        }
    }
}

impl Inner {
    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn outbound_or_err(&self) -> Result<Arc<mpsc::Sender<Frame>>, PubSubError> {
        if *self.state.borrow() == ConnectionState::Closed {
            return Err(PubSubError::Closed);
        }
        self.outbound.load_full().ok_or(PubSubError::NotConnected)
    }

    /// Move to `next` unless already `Closed`. Returns the prior state.
    fn set_state(&self, next: ConnectionState) -> ConnectionState {
        let mut previous = ConnectionState::Closed;
        self.state.send_if_modified(|current| {
            previous = current.clone();
            if *current == ConnectionState::Closed || *current == next {
                return false;
            }
            trace!(from = ?current, to = ?next, "connection state change");
            *current = next;
            true
        });
        previous
    }

    /// Move to `Reconnecting { attempt }` unless the connection is already
    /// `Connected` or `Closed`. Returns whether the attempt should go ahead.
    fn begin_reconnect_attempt(&self, attempt: u32) -> bool {
        let mut proceed = false;
        self.state.send_if_modified(|current| {
            if matches!(current, ConnectionState::Connected | ConnectionState::Closed) {
                return false;
            }
            proceed = true;
            *current = ConnectionState::Reconnecting { attempt };
            true
        });
        proceed
    }

    /// Move to `Closed`. Returns `true` if it already was.
    fn mark_closed(&self) -> bool {
        let mut was_closed = false;
        self.state.send_if_modified(|current| {
            was_closed = *current == ConnectionState::Closed;
            *current = ConnectionState::Closed;
            !was_closed
        });
        was_closed
    }

    fn reconnect_delay(&self) -> Duration {
        *self.reconnect_delay.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance_backoff(&self) {
        let mut delay = self.reconnect_delay.lock().unwrap_or_else(PoisonError::into_inner);
        *delay = next_backoff(*delay);
    }

    fn reset_backoff(&self) {
        *self.reconnect_delay.lock().unwrap_or_else(PoisonError::into_inner) = BACKOFF_FLOOR;
    }

    fn ensure_sweeper(self: &Arc<Self>) {
        if !self.sweeper_started.swap(true, Ordering::SeqCst) {
            tokio::spawn(sweep_loop(Arc::downgrade(self)));
        }
    }

    /// Stop the current link's tasks and release the transport.
    fn teardown_link(&self) {
        if let Some(token) = self.link.lock().unwrap_or_else(PoisonError::into_inner).take() {
            token.cancel();
        }
        if let Some(outbound) = self.outbound.swap(None) {
            // A full queue is fine: dropping the last sender closes the socket too.
            let _ = outbound.try_send(Frame::Close);
        }
    }

    // ── Connect attempt ──────────────────────────────────────────

    async fn establish(self: &Arc<Self>) -> Result<(), PubSubError> {
        let fallback = self.set_state(ConnectionState::Connecting);

        match self.open_and_confirm().await {
            Ok(()) => Ok(()),
            Err(_) if self.cancel.is_cancelled() => Err(PubSubError::Closed),
            Err(e) => {
                warn!(error = %e, "connect attempt failed");
                self.teardown_link();
                self.set_state(fallback);
                Err(e)
            }
        }
    }

    async fn open_and_confirm(self: &Arc<Self>) -> Result<(), PubSubError> {
        let known_uuid = self.session_uuid.load_full().map(|u| *u);
        let auth = self.keys.sign(known_uuid, Utc::now())?;

        info!(url = %self.options.url, resume = known_uuid.is_some(), "opening connection");
        let open = self.connector.connect(&self.options.url, &auth);
        let timeout = self.options.connect_timeout;
        let opened = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(PubSubError::Closed),
            opened = async {
                if timeout.is_zero() {
                    Ok(open.await)
                } else {
                    tokio::time::timeout(timeout, open).await
                }
            } => opened,
        };
        let TransportLink { outbound, inbound } = match opened {
            Ok(link) => link?,
            Err(_) => {
                return Err(PubSubError::Connection {
                    reason: format!("timed out after {}ms", timeout.as_millis()),
                });
            }
        };

        // Transport is up.
        let link_cancel = self.cancel.child_token();
        let link_id = self.link_id.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(stale) = self
            .link
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(link_cancel.clone())
        {
            stale.cancel();
        }
        self.outbound.store(Some(Arc::new(outbound)));
        tokio::spawn(read_loop(Arc::downgrade(self), inbound, link_cancel.clone(), link_id));

        if let Some(previous) = known_uuid {
            let confirmed = tokio::select! {
                biased;
                () = link_cancel.cancelled() => Err(PubSubError::Connection {
                    reason: "connection lost while confirming session".into(),
                }),
                confirmed = self.fetch_session_uuid() => confirmed,
            };
            let current = confirmed?;
            if current == previous {
                debug!(session = %current, "session resumed");
            } else {
                info!(previous = %previous, current = %current, "server started a new session");
                self.session_uuid.store(Some(Arc::new(current)));
                self.handlers.fire_new_session(current);
            }
        }

        if self.cancel.is_cancelled() {
            return Err(PubSubError::Closed);
        }

        self.set_state(ConnectionState::Connected);
        tokio::spawn(heartbeat(
            Arc::downgrade(self),
            link_cancel,
            self.options.keepalive_interval,
        ));
        info!("connected");
        Ok(())
    }

    async fn fetch_session_uuid(&self) -> Result<Uuid, PubSubError> {
        let outbound = self.outbound_or_err()?;
        let request = Request::SessionUuid {
            seq: self.next_sequence(),
        };
        let pending = self.correlator.send(&outbound, &request).await?;
        drop(outbound);
        let response = pending.await.unwrap_or(Err(PubSubError::Closed))?;
        response
            .uuid()
            .ok_or_else(|| PubSubError::protocol("session-uuid response is missing `uuid`"))
    }

    // ── Inbound traffic ──────────────────────────────────────────

    fn on_message(&self, text: &str) {
        self.handlers.fire_raw_record(text);
        trace!(frame = %text, "received frame");

        match parse_inbound(text) {
            Ok(Inbound::Push(record)) => {
                debug!(channel = %record.channel, id = %record.id, "push message");
                for err in self.dispatcher.dispatch(&record) {
                    self.handlers.report_error(&err, None, Some(&record.channel));
                }
            }
            Ok(Inbound::Response(response)) => self.on_response(response),
            Ok(Inbound::Unsequenced(_)) => {
                let err = PubSubError::protocol(
                    "frame has neither a sequence number nor a push action",
                );
                warn!(error = %err, frame = %text, "protocol violation");
                self.handlers.report_error(&err, None, None);
            }
            Err(e) => {
                let err = PubSubError::from(e);
                warn!(error = %err, frame = %text, "unparseable frame");
                self.handlers.report_error(&err, None, None);
            }
        }
    }

    fn on_response(&self, response: Response) {
        let seq = response.seq;
        let registration = self.correlator.take_publish_error(seq);

        if let Some(registration) = &registration {
            if !response.is_success() {
                let err = server_error(&response);
                let channel = registration.request.channel();
                warn!(seq, code = response.code, channel, "publish rejected by server");
                match &registration.handler {
                    Some(handler) => {
                        let outcome =
                            guarded("publish-error", || handler(&err, Some(seq), channel));
                        if let Err(panic) = outcome {
                            self.handlers.report_error(&panic, Some(seq), channel);
                        }
                    }
                    None => self.handlers.report_error(&err, Some(seq), channel),
                }
            }
        }

        if self.correlator.deliver(response) == Delivery::Unmatched && registration.is_none() {
            let err = PubSubError::protocol(format!("response for unknown sequence {seq}"));
            warn!(seq, "response has no outstanding request");
            self.handlers.report_error(&err, Some(seq), None);
        }
    }

    /// The transport behind link `link_id` went away without being asked to.
    fn on_unplanned_close(self: &Arc<Self>, link_id: u64, error: &PubSubError) {
        if self.link_id.load(Ordering::SeqCst) != link_id {
            return;
        }
        self.teardown_link();

        // A drop during a connect attempt is reported through that attempt.
        if *self.state.borrow() != ConnectionState::Connected {
            return;
        }

        warn!(error = %error, "connection lost");
        self.set_state(ConnectionState::Reconnecting { attempt: 0 });
        self.handlers.fire_close(Some(error));

        if self.auto_reconnect.load(Ordering::SeqCst) {
            tokio::spawn(reconnect_loop(Arc::downgrade(self)));
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Background tasks ─────────────────────────────────────────────

async fn read_loop(
    inner: Weak<Inner>,
    mut inbound: mpsc::Receiver<TransportEvent>,
    link_cancel: CancellationToken,
    link_id: u64,
) {
    let error = loop {
        let event = tokio::select! {
            biased;
            () = link_cancel.cancelled() => return,
            event = inbound.recv() => event,
        };
        let Some(inner) = inner.upgrade() else { return };

        match event {
            Some(TransportEvent::Text(text)) => inner.on_message(&text),
            Some(TransportEvent::Closed(e)) => break PubSubError::from(e),
            None => {
                break PubSubError::Connection {
                    reason: "transport ended without a close event".into(),
                };
            }
        }
    };

    if let Some(inner) = inner.upgrade() {
        inner.on_unplanned_close(link_id, &error);
    }
}

async fn reconnect_loop(weak: Weak<Inner>) {
    let mut attempt: u32 = 0;

    loop {
        let Some(inner) = weak.upgrade() else { return };
        let delay = inner.reconnect_delay();
        let cancel = inner.cancel.clone();
        drop(inner);

        info!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            attempt = attempt + 1,
            "waiting before reconnect"
        );
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }

        let Some(inner) = weak.upgrade() else { return };
        if !inner.auto_reconnect.load(Ordering::SeqCst) {
            return;
        }
        attempt = attempt.saturating_add(1);
        if !inner.begin_reconnect_attempt(attempt) {
            debug!("connection restored elsewhere, stopping reconnect loop");
            return;
        }

        let manager = ConnectionManager { inner };
        match manager.connect().await {
            Ok(()) => {
                info!(attempt, "reconnected");
                manager.inner.reset_backoff();
                manager.inner.handlers.fire_reconnect();
                return;
            }
            Err(PubSubError::Closed) => return,
            Err(e) if e.is_fatal() => {
                error!(error = %e, "reconnect cannot succeed, giving up");
                manager.inner.handlers.report_error(&e, None, None);
                manager.inner.set_state(ConnectionState::Disconnected);
                return;
            }
            Err(e) => {
                warn!(error = %e, attempt, "reconnect attempt failed");
                manager.inner.advance_backoff();
            }
        }
    }
}

async fn heartbeat(weak: Weak<Inner>, link_cancel: CancellationToken, interval: Duration) {
    if interval.is_zero() {
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = link_cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let Some(inner) = weak.upgrade() else { return };
        let Some(outbound) = inner.outbound.load_full() else { return };
        if outbound.is_closed() {
            return;
        }
        if outbound.capacity() == 0 {
            debug!("outbound queue full, skipping keep-alive ping");
            continue;
        }

        inner.handlers.fire_ping();
        if outbound.try_send(Frame::Ping).is_err() {
            debug!("keep-alive ping not queued");
        }
    }
}

async fn sweep_loop(weak: Weak<Inner>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else { return };
        let expired = inner.correlator.expire_stale(Instant::now());
        if expired > 0 {
            debug!(expired, "expired outstanding requests");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
