// ── Handler slots ──
//
// Callbacks registered by application code. An empty slot is a no-op.
// Handlers are cloned out of their slot before being called so no lock
// is held while user code runs, and every call is wrapped in
// `catch_unwind` so a panicking handler cannot take down the read loop.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, error};
use uuid::Uuid;

use cogs_api::MessageRecord;

use crate::error::PubSubError;

/// Receives push messages, per channel or for all channels.
pub type MessageHandler = Arc<dyn Fn(&MessageRecord) + Send + Sync>;

/// Receives connection-level errors, with the sequence number and
/// channel they relate to when known.
pub type ErrorHandler = Arc<dyn Fn(&PubSubError, Option<u64>, Option<&str>) + Send + Sync>;

/// Called when the connection closes. Carries the error for an
/// unplanned close and `None` for a caller-initiated one.
pub type CloseHandler = Arc<dyn Fn(Option<&PubSubError>) + Send + Sync>;

/// Called after a successful automatic reconnect.
pub type ReconnectHandler = Arc<dyn Fn() + Send + Sync>;

/// Called with the new session UUID when the server did not resume the
/// previous session.
pub type NewSessionHandler = Arc<dyn Fn(Uuid) + Send + Sync>;

/// Receives every inbound text frame before it is parsed.
pub type RawRecordHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Called just before each keep-alive ping.
pub type PingHook = Arc<dyn Fn() + Send + Sync>;

// ── Slot ─────────────────────────────────────────────────────────────

/// A replaceable, optional handler.
pub(crate) struct Slot<T: Clone>(RwLock<Option<T>>);

impl<T: Clone> Slot<T> {
    pub(crate) fn set(&self, handler: Option<T>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = handler;
    }

    pub(crate) fn get(&self) -> Option<T> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl<T: Clone> Default for Slot<T> {
    fn default() -> Self {
        Self(RwLock::new(None))
    }
}

/// Run a handler, converting a panic into a `Handler` error.
pub(crate) fn guarded(name: &str, f: impl FnOnce()) -> Result<(), PubSubError> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|payload| {
        let message = format!("{name} handler panicked: {}", panic_message(payload.as_ref()));
        error!(handler = name, "{message}");
        PubSubError::Handler { message }
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

// ── Handlers ─────────────────────────────────────────────────────────

/// Connection-wide handler slots.
#[derive(Default)]
pub(crate) struct Handlers {
    pub error: Slot<ErrorHandler>,
    pub close: Slot<CloseHandler>,
    pub reconnect: Slot<ReconnectHandler>,
    pub new_session: Slot<NewSessionHandler>,
    pub raw_record: Slot<RawRecordHandler>,
    pub ping: Slot<PingHook>,
}

impl Handlers {
    /// Route an error to the error handler. Dropped after logging if no
    /// handler is registered.
    pub(crate) fn report_error(&self, err: &PubSubError, seq: Option<u64>, channel: Option<&str>) {
        match self.error.get() {
            Some(handler) => {
                // A panicking error handler has nowhere left to report to.
                let _ = guarded("error", || handler(err, seq, channel));
            }
            None => debug!(error = %err, ?seq, channel, "no error handler registered, dropping"),
        }
    }

    pub(crate) fn fire_close(&self, err: Option<&PubSubError>) {
        if let Some(handler) = self.close.get() {
            self.report_panic(guarded("close", || handler(err)));
        }
    }

    pub(crate) fn fire_reconnect(&self) {
        if let Some(handler) = self.reconnect.get() {
            self.report_panic(guarded("reconnect", || handler()));
        }
    }

    pub(crate) fn fire_new_session(&self, uuid: Uuid) {
        if let Some(handler) = self.new_session.get() {
            self.report_panic(guarded("new-session", || handler(uuid)));
        }
    }

    pub(crate) fn fire_raw_record(&self, text: &str) {
        if let Some(handler) = self.raw_record.get() {
            self.report_panic(guarded("raw-record", || handler(text)));
        }
    }

    pub(crate) fn fire_ping(&self) {
        if let Some(hook) = self.ping.get() {
            self.report_panic(guarded("ping", || hook()));
        }
    }

    fn report_panic(&self, result: Result<(), PubSubError>) {
        if let Err(err) = result {
            self.report_error(&err, None, None);
        }
    }
}
