// ── Core error types ──
//
// The connection-level error taxonomy. Transport-layer errors from
// `cogs-api` are folded into these variants by the `From` impl below.
// `PubSubError` is `Clone` so a single connect outcome can be handed to
// every caller that joined the attempt.

use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Clone, Error)]
pub enum PubSubError {
    // ── Fatal to a connect attempt ───────────────────────────────────
    #[error("Invalid project keys: {message}")]
    AuthKey { message: String },

    // ── Transport ────────────────────────────────────────────────────
    #[error("Connection failed: {reason}")]
    Connection { reason: String },

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    Closed,

    // ── Per-request ──────────────────────────────────────────────────
    #[error("Server rejected request {seq} with code {code}")]
    Server {
        seq: u64,
        code: i64,
        /// The raw response object, error details included.
        response: Arc<Value>,
    },

    #[error("Request {seq} timed out after {timeout_ms}ms")]
    Timeout { seq: u64, timeout_ms: u64 },

    // ── Inbound traffic ──────────────────────────────────────────────
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Handler panicked: {message}")]
    Handler { message: String },
}

impl PubSubError {
    /// Returns `true` for failures the reconnect loop should retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::NotConnected | Self::Timeout { .. })
    }

    /// Returns `true` for failures that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthKey { .. } | Self::Closed)
    }

    /// Server-supplied error text, if this is a server error that has one.
    pub fn server_message(&self) -> Option<&str> {
        match self {
            Self::Server { response, .. } => cogs_api::protocol::error_text(response),
            _ => None,
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<cogs_api::Error> for PubSubError {
    fn from(err: cogs_api::Error) -> Self {
        match err {
            cogs_api::Error::AuthKey { message } => Self::AuthKey { message },
            cogs_api::Error::InvalidUrl(e) => Self::Connection {
                reason: format!("invalid URL: {e}"),
            },
            cogs_api::Error::WebSocketConnect(reason) | cogs_api::Error::WebSocket(reason) => {
                Self::Connection { reason }
            }
            cogs_api::Error::WebSocketClosed { code, reason } => Self::Connection {
                reason: format!("WebSocket closed (code {code}): {reason}"),
            },
            cogs_api::Error::Deserialization { message, body: _ } => Self::Protocol { message },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn api_errors_map_into_taxonomy() {
        let auth: PubSubError = cogs_api::Error::AuthKey {
            message: "bad".into(),
        }
        .into();
        assert!(auth.is_fatal());

        let closed: PubSubError = cogs_api::Error::WebSocketClosed {
            code: 1006,
            reason: "gone".into(),
        }
        .into();
        assert!(closed.is_transient());
        assert!(closed.to_string().contains("1006"));

        let proto: PubSubError = cogs_api::Error::Deserialization {
            message: "eof".into(),
            body: "{".into(),
        }
        .into();
        assert!(matches!(proto, PubSubError::Protocol { .. }));
    }

    #[test]
    fn server_error_exposes_message() {
        let err = PubSubError::Server {
            seq: 3,
            code: 401,
            response: Arc::new(json!({"seq": 3, "code": 401, "message": "Not Authorized"})),
        };
        assert_eq!(err.server_message(), Some("Not Authorized"));
        assert!(!err.is_transient());
        assert!(!err.is_fatal());

        let detailed = PubSubError::Server {
            seq: 4,
            code: 500,
            response: Arc::new(json!({"seq": 4, "code": 500, "details": "internal"})),
        };
        assert_eq!(detailed.server_message(), Some("internal"));
    }
}
