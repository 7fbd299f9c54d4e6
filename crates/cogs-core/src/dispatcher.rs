// ── Channel dispatcher ──
//
// Routes push messages to the handler registered for their channel and
// then to the general handler. Both calls are isolated: a panic in one
// does not skip the other, and nothing propagates into the read loop.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::trace;

use cogs_api::MessageRecord;

use crate::error::PubSubError;
use crate::handlers::{MessageHandler, Slot, guarded};

/// Per-channel and general message handlers.
#[derive(Default)]
pub(crate) struct ChannelDispatcher {
    channels: DashMap<String, MessageHandler>,
    general: Slot<MessageHandler>,
}

impl ChannelDispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Install `handler` for `channel`. Returns the handler it replaced.
    pub(crate) fn register(
        &self,
        channel: impl Into<String>,
        handler: MessageHandler,
    ) -> Option<MessageHandler> {
        self.channels.insert(channel.into(), handler)
    }

    /// Remove the handler for `channel`. Returns `true` if one existed.
    pub(crate) fn unregister(&self, channel: &str) -> bool {
        self.channels.remove(channel).is_some()
    }

    pub(crate) fn set_general_handler(&self, handler: Option<MessageHandler>) {
        self.general.set(handler);
    }

    /// Drop every per-channel handler. The general handler stays.
    pub(crate) fn clear(&self) {
        self.channels.clear();
    }

    /// Channels with a registered handler, sorted.
    #[cfg(test)]
    fn channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        channels.sort();
        channels
    }

    /// Deliver `record` to its channel handler, then to the general
    /// handler. Returns the failures of handlers that panicked.
    pub(crate) fn dispatch(&self, record: &MessageRecord) -> Vec<PubSubError> {
        // Clone out of the map so the shard lock is released before user code runs.
        let channel_handler = self.channels.get(&record.channel).map(|h| Arc::clone(h.value()));
        let general_handler = self.general.get();

        if channel_handler.is_none() && general_handler.is_none() {
            trace!(channel = %record.channel, "no handler for push message");
        }

        [channel_handler, general_handler]
            .into_iter()
            .flatten()
            .filter_map(|handler| guarded("message", || handler(record)).err())
            .collect()
    }
}
