// cogs-core: Connection management and the session API for Cogswell Pub/Sub.

pub mod config;
pub mod connection;
mod correlator;
mod dispatcher;
pub mod error;
pub mod handlers;
pub mod session;

use std::sync::Arc;

// ── Primary re-exports ──────────────────────────────────────────────
pub use cogs_api::{Connector, KeySet, MessageRecord, WebSocketConnector};
pub use config::ConnectionOptions;
pub use connection::ConnectionState;
pub use error::PubSubError;
pub use session::Session;

/// Open a session over WebSocket and connect it.
///
/// Use [`Session::open`] followed by [`Session::connect`] instead when the
/// close or new-session handlers must be in place before the first connect.
pub async fn connect<I, S>(keys: I, options: ConnectionOptions) -> Result<Session, PubSubError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    connect_with(Arc::new(WebSocketConnector::new()), keys, options).await
}

/// Open a session over `connector` and connect it.
pub async fn connect_with<I, S>(
    connector: Arc<dyn Connector>,
    keys: I,
    options: ConnectionOptions,
) -> Result<Session, PubSubError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let session = Session::open_with(connector, keys, options)?;
    session.connect().await?;
    Ok(session)
}
