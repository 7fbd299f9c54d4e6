// ── Request correlation ──
//
// Outstanding requests are keyed by sequence number. Each one owns a
// oneshot sender that is settled exactly once: by a matching response,
// or by the sweeper with a timeout error once its TTL has elapsed.
//
// Publish-error registrations live in a separate table with the same
// TTL. An unacknowledged publish settles its caller as soon as the frame
// is handed to the transport, yet the server may still answer later with
// an error for that sequence.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use cogs_api::{Frame, Request, Response};

use crate::error::PubSubError;
use crate::handlers::ErrorHandler;

pub(crate) type ResponseResult = Result<Response, PubSubError>;

struct Outstanding {
    tx: oneshot::Sender<ResponseResult>,
    created_at: Instant,
}

/// Where a server error for an unacknowledged publish should go.
pub(crate) struct PublishErrorRegistration {
    pub request: Request,
    /// `None` routes to the connection's error handler.
    pub handler: Option<ErrorHandler>,
    created_at: Instant,
}

/// Outcome of [`RequestCorrelator::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    Resolved,
    Unmatched,
}

pub(crate) struct RequestCorrelator {
    outstanding: DashMap<u64, Outstanding>,
    publish_errors: DashMap<u64, PublishErrorRegistration>,
    ttl: Duration,
}

impl RequestCorrelator {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            outstanding: DashMap::new(),
            publish_errors: DashMap::new(),
            ttl,
        }
    }

    /// Hand `request` to the transport.
    ///
    /// Requests awaiting a response are registered before the frame is
    /// sent so a fast reply cannot miss its entry. Requests that do not
    /// await a response settle with `{"seq": seq}` once the frame is
    /// queued.
    pub(crate) async fn send(
        &self,
        outbound: &mpsc::Sender<Frame>,
        request: &Request,
    ) -> Result<oneshot::Receiver<ResponseResult>, PubSubError> {
        let seq = request.seq();
        let text = request.to_json()?;
        let (tx, rx) = oneshot::channel();

        let awaits_response = request.awaits_response();
        let local_tx = if awaits_response {
            self.outstanding.insert(
                seq,
                Outstanding {
                    tx,
                    created_at: Instant::now(),
                },
            );
            None
        } else {
            Some(tx)
        };

        trace!(seq, action = request.action(), frame = %text, "sending request");
        if outbound.send(Frame::Text(text)).await.is_err() {
            self.outstanding.remove(&seq);
            return Err(PubSubError::NotConnected);
        }

        if let Some(tx) = local_tx {
            let _ = tx.send(Ok(Response::sent(seq)));
        }
        Ok(rx)
    }

    /// Settle the request matching `response.seq`.
    pub(crate) fn deliver(&self, response: Response) -> Delivery {
        let Some((seq, entry)) = self.outstanding.remove(&response.seq) else {
            return Delivery::Unmatched;
        };

        let result = if response.is_success() {
            Ok(response)
        } else {
            Err(server_error(&response))
        };

        if entry.tx.send(result).is_err() {
            debug!(seq, "caller stopped waiting before the response arrived");
        }
        Delivery::Resolved
    }

    pub(crate) fn register_publish_error(&self, request: Request, handler: Option<ErrorHandler>) {
        self.publish_errors.insert(
            request.seq(),
            PublishErrorRegistration {
                request,
                handler,
                created_at: Instant::now(),
            },
        );
    }

    pub(crate) fn take_publish_error(&self, seq: u64) -> Option<PublishErrorRegistration> {
        self.publish_errors.remove(&seq).map(|(_, registration)| registration)
    }

    /// Fail every outstanding request older than the TTL with a timeout
    /// and drop stale publish-error registrations. Returns the number of
    /// requests that timed out.
    pub(crate) fn expire_stale(&self, now: Instant) -> usize {
        let ttl = self.ttl;
        let is_stale = |created_at: Instant| now.saturating_duration_since(created_at) >= ttl;

        let stale: Vec<u64> = self
            .outstanding
            .iter()
            .filter(|entry| is_stale(entry.created_at))
            .map(|entry| *entry.key())
            .collect();

        let timeout_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let mut expired = 0;
        for seq in stale {
            // Re-check under removal; the response may have won the race.
            let removed = self
                .outstanding
                .remove_if(&seq, |_, e| is_stale(e.created_at));
            if let Some((_, entry)) = removed {
                warn!(seq, timeout_ms, "request timed out");
                let _ = entry.tx.send(Err(PubSubError::Timeout { seq, timeout_ms }));
                expired += 1;
            }
        }

        self.publish_errors.retain(|_, r| !is_stale(r.created_at));
        expired
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.outstanding.len()
    }
}

/// Build the error surfaced for a non-200 response.
pub(crate) fn server_error(response: &Response) -> PubSubError {
    PubSubError::Server {
        seq: response.seq,
        code: response.code,
        response: Arc::new(response.body.clone()),
    }
}
