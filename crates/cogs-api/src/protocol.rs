//! JSON frames exchanged with the Pub/Sub server.
//!
//! Outbound frames are [`Request`]s tagged by `action`. Inbound frames are
//! either push messages (`"action": "msg"`, no `seq`) or responses that
//! echo the request's `seq` together with a status `code`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Error;

/// Status code the server uses for success.
pub const SUCCESS_CODE: i64 = 200;

// ── Requests ─────────────────────────────────────────────────────────

/// A correlated request. Serializes to `{"action": ..., "seq": ..., ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action")]
pub enum Request {
    #[serde(rename = "session-uuid")]
    SessionUuid { seq: u64 },

    #[serde(rename = "subscribe")]
    Subscribe { seq: u64, channel: String },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { seq: u64, channel: String },

    #[serde(rename = "unsubscribe-all")]
    UnsubscribeAll { seq: u64 },

    #[serde(rename = "subscriptions")]
    Subscriptions { seq: u64 },

    #[serde(rename = "pub")]
    Publish {
        seq: u64,
        chan: String,
        msg: String,
        ack: bool,
    },
}

impl Request {
    pub fn seq(&self) -> u64 {
        match self {
            Self::SessionUuid { seq }
            | Self::Subscribe { seq, .. }
            | Self::Unsubscribe { seq, .. }
            | Self::UnsubscribeAll { seq }
            | Self::Subscriptions { seq }
            | Self::Publish { seq, .. } => *seq,
        }
    }

    /// The wire name of this request's action.
    pub fn action(&self) -> &'static str {
        match self {
            Self::SessionUuid { .. } => "session-uuid",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::UnsubscribeAll { .. } => "unsubscribe-all",
            Self::Subscriptions { .. } => "subscriptions",
            Self::Publish { .. } => "pub",
        }
    }

    /// The channel this request targets, if any.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::Subscribe { channel, .. } | Self::Unsubscribe { channel, .. } => Some(channel),
            Self::Publish { chan, .. } => Some(chan),
            Self::SessionUuid { .. } | Self::UnsubscribeAll { .. } | Self::Subscriptions { .. } => {
                None
            }
        }
    }

    /// Whether the caller waits for a server response. Only publish
    /// without ack resolves locally.
    pub fn awaits_response(&self) -> bool {
        match self {
            Self::Publish { ack, .. } => *ack,
            _ => true,
        }
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body: String::new(),
        })
    }
}

// ── Responses ────────────────────────────────────────────────────────

/// A response frame. The full JSON object is kept in `body` so error
/// details survive untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub seq: u64,
    pub code: i64,
    pub body: Value,
}

impl Response {
    /// The local acknowledgement used for requests that do not await the
    /// server: `{"seq": seq}`.
    pub fn sent(seq: u64) -> Self {
        Self {
            seq,
            code: SUCCESS_CODE,
            body: serde_json::json!({ "seq": seq }),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == SUCCESS_CODE
    }

    /// `uuid` field of a `session-uuid` response.
    pub fn uuid(&self) -> Option<Uuid> {
        self.uuid_field("uuid")
    }

    /// `id` field of an acknowledged publish.
    pub fn message_id(&self) -> Option<Uuid> {
        self.uuid_field("id")
    }

    /// `channels` field of the subscription-family responses.
    pub fn channels(&self) -> Option<Vec<String>> {
        self.body
            .get("channels")?
            .as_array()?
            .iter()
            .map(|c| c.as_str().map(str::to_owned))
            .collect()
    }

    /// Server-supplied error text, when present.
    pub fn message(&self) -> Option<&str> {
        error_text(&self.body)
    }

    fn uuid_field(&self, name: &str) -> Option<Uuid> {
        self.body.get(name)?.as_str()?.parse().ok()
    }
}

/// Error text from a response object: `message`, falling back to `details`.
pub fn error_text(body: &Value) -> Option<&str> {
    body.get("message")
        .or_else(|| body.get("details"))
        .and_then(Value::as_str)
}

// ── Push messages ────────────────────────────────────────────────────

/// A message published to a channel and pushed to this connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: Uuid,
    #[serde(rename = "chan")]
    pub channel: String,
    #[serde(rename = "msg")]
    pub message: String,
    #[serde(rename = "time")]
    pub timestamp: DateTime<Utc>,
}

// ── Inbound classification ───────────────────────────────────────────

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Push(MessageRecord),
    Response(Response),
    /// Valid JSON that is neither a push message nor carries a `seq`.
    Unsequenced(Value),
}

/// Decode one text frame.
pub fn parse_inbound(text: &str) -> Result<Inbound, Error> {
    let deser_err = |e: serde_json::Error| Error::Deserialization {
        message: e.to_string(),
        body: text.to_owned(),
    };

    let value: Value = serde_json::from_str(text).map_err(deser_err)?;

    if value.get("action").and_then(Value::as_str) == Some("msg") {
        let record = serde_json::from_value(value).map_err(deser_err)?;
        return Ok(Inbound::Push(record));
    }

    let Some(seq_value) = value.get("seq") else {
        return Ok(Inbound::Unsequenced(value));
    };
    let seq = seq_value.as_u64().ok_or_else(|| Error::Deserialization {
        message: format!("sequence number is not an unsigned integer: {seq_value}"),
        body: text.to_owned(),
    })?;
    let code = value.get("code").and_then(Value::as_i64).unwrap_or_default();

    Ok(Inbound::Response(Response {
        seq,
        code,
        body: value,
    }))
}

// ── Tests ────────────────────────────────────────────────────────────
