use thiserror::Error;

/// Top-level error type for the `cogs-api` crate.
///
/// Covers key parsing and signing, the WebSocket transport, and frame
/// decoding. `cogs-core` maps these into the connection-level taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    // ── Authentication ──────────────────────────────────────────────
    /// A project key was missing, malformed, or could not be used for signing.
    #[error("Invalid project key: {message}")]
    AuthKey { message: String },

    // ── Transport ───────────────────────────────────────────────────
    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// WebSocket upgrade failed (DNS, TCP, TLS, or the server rejected the auth headers).
    #[error("WebSocket connection failed: {0}")]
    WebSocketConnect(String),

    /// WebSocket closed by the peer or by a broken stream.
    #[error("WebSocket closed (code {code}): {reason}")]
    WebSocketClosed { code: u16, reason: String },

    /// Read or write failure on an established WebSocket.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    // ── Data ────────────────────────────────────────────────────────
    /// JSON (de)serialization failed, with the raw frame for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    pub(crate) fn auth_key(message: impl Into<String>) -> Self {
        Self::AuthKey {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a transient transport error worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::WebSocketConnect(_) | Self::WebSocketClosed { .. } | Self::WebSocket(_)
        )
    }
}
