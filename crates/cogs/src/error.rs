//! CLI error types with miette diagnostics.
//!
//! Maps `PubSubError` and `ConfigError` into user-facing errors with
//! actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use cogs_config::ConfigError;
use cogs_core::PubSubError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────

    #[error("Could not reach the Pub/Sub service: {reason}")]
    #[diagnostic(
        code(cogs::connection_failed),
        help(
            "Check the URL (--url or the profile's url) and your network connection.\n\
             Raise the connect timeout with --timeout <ms>."
        )
    )]
    ConnectionFailed { reason: String },

    #[error("The connection is closed")]
    #[diagnostic(code(cogs::closed))]
    Closed,

    // ── Keys ─────────────────────────────────────────────────────────

    #[error("Invalid project keys: {message}")]
    #[diagnostic(
        code(cogs::invalid_keys),
        help("Keys look like R-<identity>-<hex secret>; all keys must share one identity.")
    )]
    InvalidKeys { message: String },

    #[error("No project keys configured for profile '{profile}'")]
    #[diagnostic(
        code(cogs::no_keys),
        help(
            "Configure keys with: cogs config init\n\
             Or pass --key, or set COGS_KEYS."
        )
    )]
    NoKeys { profile: String },

    // ── Server ───────────────────────────────────────────────────────

    #[error("Server rejected request {seq} ({code}): {message}")]
    #[diagnostic(code(cogs::server_error))]
    Server { seq: u64, code: i64, message: String },

    #[error("Request {seq} timed out after {timeout_ms}ms")]
    #[diagnostic(code(cogs::timeout), help("The server did not answer; try again."))]
    Timeout { seq: u64, timeout_ms: u64 },

    #[error("Protocol error: {message}")]
    #[diagnostic(code(cogs::protocol))]
    Protocol { message: String },

    // ── Configuration ────────────────────────────────────────────────

    #[error("Profile '{name}' not found in configuration")]
    #[diagnostic(
        code(cogs::profile_not_found),
        help(
            "Available profiles: {available}\n\
             Create one with: cogs config init --profile {name}"
        )
    )]
    ProfileNotFound { name: String, available: String },

    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(cogs::validation))]
    Validation { field: String, reason: String },

    #[error(transparent)]
    #[diagnostic(code(cogs::config))]
    Config(ConfigError),

    // ── IO / Serialization ────────────────────────────────────────────

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to encode output: {0}")]
    #[diagnostic(code(cogs::json))]
    Json(#[from] serde_json::Error),
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } | Self::Closed => exit_code::CONNECTION,
            Self::InvalidKeys { .. }
            | Self::NoKeys { .. }
            | Self::Server {
                code: 401 | 403, ..
            } => exit_code::AUTH,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } | Self::ProfileNotFound { .. } => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }
}

// ── PubSubError → CliError mapping ───────────────────────────────────

impl From<PubSubError> for CliError {
    fn from(err: PubSubError) -> Self {
        match err {
            PubSubError::AuthKey { message } => Self::InvalidKeys { message },
            PubSubError::Connection { reason } => Self::ConnectionFailed { reason },
            PubSubError::NotConnected => Self::ConnectionFailed {
                reason: "not connected".into(),
            },
            PubSubError::Closed => Self::Closed,
            ref server @ PubSubError::Server { seq, code, .. } => Self::Server {
                seq,
                code,
                message: server.server_message().unwrap_or("no details").to_owned(),
            },
            PubSubError::Timeout { seq, timeout_ms } => Self::Timeout { seq, timeout_ms },
            PubSubError::Protocol { message } | PubSubError::Handler { message } => {
                Self::Protocol { message }
            }
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NoKeys { profile } => Self::NoKeys { profile },
            ConfigError::Validation { field, reason } => Self::Validation { field, reason },
            other => Self::Config(other),
        }
    }
}
