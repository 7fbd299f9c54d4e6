// ── Session ──
//
// The public handle. Every operation takes the next sequence number,
// sends one correlated request through the connection manager and maps
// the response into a typed result.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

use cogs_api::{Connector, KeySet, MessageRecord, Request, Response, WebSocketConnector};

use crate::config::ConnectionOptions;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::error::PubSubError;
use crate::handlers::ErrorHandler;

/// A Pub/Sub session over one logical connection.
///
/// Cheaply cloneable; all clones share the connection. Register handlers
/// between [`open`](Self::open) and [`connect`](Self::connect) so no
/// traffic is missed.
#[derive(Clone)]
pub struct Session {
    manager: ConnectionManager,
}

impl Session {
    /// Build an unconnected session backed by the WebSocket transport.
    ///
    /// Fails with [`PubSubError::AuthKey`] if the keys do not parse. No
    /// network traffic happens until [`connect`](Self::connect).
    pub fn open<I, S>(keys: I, options: ConnectionOptions) -> Result<Self, PubSubError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::open_with(Arc::new(WebSocketConnector::new()), keys, options)
    }

    /// Like [`open`](Self::open), with a caller-supplied transport.
    pub fn open_with<I, S>(
        connector: Arc<dyn Connector>,
        keys: I,
        options: ConnectionOptions,
    ) -> Result<Self, PubSubError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = KeySet::parse(keys)?;
        debug!(
            identity = keys.identity(),
            permissions = %keys.permissions(),
            "project keys loaded"
        );
        Ok(Self {
            manager: ConnectionManager::new(connector, keys, options),
        })
    }

    /// Open the connection. Concurrent calls share one attempt.
    pub async fn connect(&self) -> Result<(), PubSubError> {
        self.manager.connect().await
    }

    // ── Operations ───────────────────────────────────────────────

    /// Ask the server for this connection's session UUID and remember it
    /// so a later reconnect can try to resume the session.
    pub async fn get_session_uuid(&self) -> Result<Uuid, PubSubError> {
        let response = self
            .manager
            .request(Request::SessionUuid {
                seq: self.manager.next_sequence(),
            })
            .await?;
        let uuid = response.uuid().ok_or_else(|| missing(&response, "uuid"))?;
        self.manager.record_session_uuid(uuid);
        Ok(uuid)
    }

    /// Subscribe to `channel`, routing its messages to `handler`.
    /// Returns every channel this session is subscribed to.
    ///
    /// The handler is installed before the request goes out so no message
    /// can slip past it; a failed subscribe puts the previous handler back.
    pub async fn subscribe<F>(
        &self,
        channel: impl Into<String>,
        handler: F,
    ) -> Result<Vec<String>, PubSubError>
    where
        F: Fn(&MessageRecord) + Send + Sync + 'static,
    {
        let channel = channel.into();
        let dispatcher = self.manager.dispatcher();
        let previous = dispatcher.register(channel.clone(), Arc::new(handler));

        let result = self
            .channels_request(Request::Subscribe {
                seq: self.manager.next_sequence(),
                channel: channel.clone(),
            })
            .await;

        if result.is_err() {
            match previous {
                Some(previous) => {
                    dispatcher.register(channel, previous);
                }
                None => {
                    dispatcher.unregister(&channel);
                }
            }
        }
        result
    }

    /// Unsubscribe from `channel`. Returns the channels still subscribed.
    pub async fn unsubscribe(
        &self,
        channel: impl Into<String>,
    ) -> Result<Vec<String>, PubSubError> {
        let channel = channel.into();
        let remaining = self
            .channels_request(Request::Unsubscribe {
                seq: self.manager.next_sequence(),
                channel: channel.clone(),
            })
            .await?;
        self.manager.dispatcher().unregister(&channel);
        Ok(remaining)
    }

    /// Unsubscribe from every channel. Returns the channels that were dropped.
    pub async fn unsubscribe_all(&self) -> Result<Vec<String>, PubSubError> {
        let dropped = self
            .channels_request(Request::UnsubscribeAll {
                seq: self.manager.next_sequence(),
            })
            .await?;
        self.manager.dispatcher().clear();
        Ok(dropped)
    }

    /// Channels the server has this session subscribed to.
    pub async fn list_subscriptions(&self) -> Result<Vec<String>, PubSubError> {
        self.channels_request(Request::Subscriptions {
            seq: self.manager.next_sequence(),
        })
        .await
    }

    /// Publish without acknowledgement. Resolves with the sequence number
    /// once the frame is handed to the transport; a later server error is
    /// routed to the connection's error handler.
    pub async fn publish(
        &self,
        channel: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<u64, PubSubError> {
        self.send_publish(channel.into(), message.into(), None).await
    }

    /// Publish without acknowledgement, sending a later server error for
    /// this message to `on_error` instead of the connection's error handler.
    pub async fn publish_with_error_handler<F>(
        &self,
        channel: impl Into<String>,
        message: impl Into<String>,
        on_error: F,
    ) -> Result<u64, PubSubError>
    where
        F: Fn(&PubSubError, Option<u64>, Option<&str>) + Send + Sync + 'static,
    {
        self.send_publish(channel.into(), message.into(), Some(Arc::new(on_error)))
            .await
    }

    /// Publish and wait for the server to acknowledge. Returns the id the
    /// server assigned to the message.
    pub async fn publish_with_ack(
        &self,
        channel: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<Uuid, PubSubError> {
        let response = self
            .manager
            .request(Request::Publish {
                seq: self.manager.next_sequence(),
                chan: channel.into(),
                msg: message.into(),
                ack: true,
            })
            .await?;
        response.message_id().ok_or_else(|| missing(&response, "id"))
    }

    /// Unsubscribe from everything, then close the connection. The
    /// connection is closed even if the unsubscribe fails; its result is
    /// returned either way.
    pub async fn close(&self) -> Result<Vec<String>, PubSubError> {
        let result = self.unsubscribe_all().await;
        self.manager.close();
        result
    }

    // ── Handler registration ─────────────────────────────────────

    /// Receive push messages from every subscribed channel, after the
    /// channel's own handler.
    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&MessageRecord) + Send + Sync + 'static,
    {
        self.manager.dispatcher().set_general_handler(Some(Arc::new(handler)));
    }

    pub fn on_reconnect<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.manager.handlers().reconnect.set(Some(Arc::new(handler)));
    }

    /// Called when a reconnect could not resume the previous session.
    pub fn on_new_session<F>(&self, handler: F)
    where
        F: Fn(Uuid) + Send + Sync + 'static,
    {
        self.manager.handlers().new_session.set(Some(Arc::new(handler)));
    }

    pub fn on_raw_record<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.manager.handlers().raw_record.set(Some(Arc::new(handler)));
    }

    /// Called with the error on an unplanned close and `None` after
    /// [`close`](Self::close).
    pub fn on_close<F>(&self, handler: F)
    where
        F: Fn(Option<&PubSubError>) + Send + Sync + 'static,
    {
        self.manager.handlers().close.set(Some(Arc::new(handler)));
    }

    /// Protocol violations, handler panics and unhandled publish errors.
    pub fn on_error<F>(&self, handler: F)
    where
        F: Fn(&PubSubError, Option<u64>, Option<&str>) + Send + Sync + 'static,
    {
        self.manager.handlers().error.set(Some(Arc::new(handler)));
    }

    /// Called immediately before each keep-alive ping.
    pub fn on_ping<F>(&self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.manager.handlers().ping.set(Some(Arc::new(hook)));
    }

    // ── State observation ────────────────────────────────────────

    /// Subscribe to connection state changes.
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.state()
    }

    /// The last session UUID seen, if any.
    pub fn session_uuid(&self) -> Option<Uuid> {
        self.manager.session_uuid()
    }

    /// Requests still waiting for a response.
    pub fn pending_requests(&self) -> usize {
        self.manager.pending_requests()
    }

    // ── Internals ────────────────────────────────────────────────

    async fn channels_request(&self, request: Request) -> Result<Vec<String>, PubSubError> {
        let response = self.manager.request(request).await?;
        response.channels().ok_or_else(|| missing(&response, "channels"))
    }

    async fn send_publish(
        &self,
        channel: String,
        message: String,
        on_error: Option<ErrorHandler>,
    ) -> Result<u64, PubSubError> {
        let request = Request::Publish {
            seq: self.manager.next_sequence(),
            chan: channel,
            msg: message,
            ack: false,
        };
        self.manager.publish(request, on_error).await
    }
}

fn missing(response: &Response, field: &str) -> PubSubError {
    PubSubError::protocol(format!(
        "response to request {} is missing `{field}`",
        response.seq
    ))
}
