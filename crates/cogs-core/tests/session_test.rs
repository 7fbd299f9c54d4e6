// Integration tests for `Session` against an in-memory Pub/Sub server.
#![allow(clippy::unwrap_used)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use url::Url;
use uuid::Uuid;

use cogs_api::{
    Connector, Error, Frame, MessageRecord, SignedAuth, TransportEvent, TransportLink,
    TransportPeer,
};
use cogs_core::{ConnectionOptions, ConnectionState, PubSubError, Session};

// ── Fake server ─────────────────────────────────────────────────────

const KEY: &str = "A-a1b2c3-00112233445566778899aabbccddeeff";
const SILENT: &str = "silent";
const FORBIDDEN: &str = "forbidden";

#[derive(Default)]
struct ServerState {
    session: Mutex<Uuid>,
    subscriptions: Mutex<BTreeSet<String>>,
    requests: Mutex<Vec<Value>>,
    pings: AtomicUsize,
    closes: AtomicUsize,
    /// Number of upcoming `session-uuid` requests to answer with a 500.
    session_failures: AtomicUsize,
}

impl ServerState {
    fn channels(&self) -> Value {
        json!(self.subscriptions.lock().unwrap().iter().collect::<Vec<_>>())
    }

    fn seen_seqs(&self) -> Vec<u64> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r["seq"].as_u64().unwrap())
            .collect()
    }

    /// Answer one request. `None` means the server stays silent.
    fn answer(&self, request: &Value, inject: &mpsc::Sender<TransportEvent>) -> Option<Value> {
        let seq = request["seq"].clone();
        match request["action"].as_str().unwrap() {
            "session-uuid" => {
                let failing = self
                    .session_failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failing {
                    return Some(json!({
                        "seq": seq, "code": 500, "details": "session store unavailable"
                    }));
                }
                Some(json!({"seq": seq, "code": 200, "uuid": *self.session.lock().unwrap()}))
            }
            "subscribe" => {
                let channel = request["channel"].as_str().unwrap();
                if channel == SILENT {
                    return None;
                }
                self.subscriptions.lock().unwrap().insert(channel.to_owned());
                Some(json!({"seq": seq, "code": 200, "channels": self.channels()}))
            }
            "unsubscribe" => {
                let channel = request["channel"].as_str().unwrap();
                self.subscriptions.lock().unwrap().remove(channel);
                Some(json!({"seq": seq, "code": 200, "channels": self.channels()}))
            }
            "unsubscribe-all" => {
                let dropped = self.channels();
                self.subscriptions.lock().unwrap().clear();
                Some(json!({"seq": seq, "code": 200, "channels": dropped}))
            }
            "subscriptions" => Some(json!({"seq": seq, "code": 200, "channels": self.channels()})),
            "pub" => {
                let channel = request["chan"].as_str().unwrap();
                if channel == FORBIDDEN {
                    return Some(json!({
                        "seq": seq, "code": 401, "action": "pub", "message": "Not Authorized"
                    }));
                }
                let id = Uuid::new_v4();
                if self.subscriptions.lock().unwrap().contains(channel) {
                    let push = json!({
                        "action": "msg",
                        "id": id,
                        "msg": request["msg"],
                        "time": "2024-06-15T10:30:00.123Z",
                        "chan": channel,
                    });
                    inject.try_send(TransportEvent::Text(push.to_string())).unwrap();
                }
                request["ack"]
                    .as_bool()
                    .unwrap()
                    .then(|| json!({"seq": seq, "code": 200, "id": id}))
            }
            other => panic!("unexpected action {other}"),
        }
    }
}

async fn serve(peer: TransportPeer, state: Arc<ServerState>) {
    let TransportPeer {
        outbound: mut frames,
        inbound: inject,
    } = peer;

    while let Some(frame) = frames.recv().await {
        match frame {
            Frame::Ping => {
                state.pings.fetch_add(1, Ordering::SeqCst);
            }
            Frame::Close => {
                state.closes.fetch_add(1, Ordering::SeqCst);
                return;
            }
            Frame::Text(text) => {
                let request: Value = serde_json::from_str(&text).unwrap();
                state.requests.lock().unwrap().push(request.clone());
                if let Some(reply) = state.answer(&request, &inject) {
                    if inject.send(TransportEvent::Text(reply.to_string())).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

// ── Mock connector ──────────────────────────────────────────────────

#[derive(Default)]
struct MockConnector {
    server: Arc<ServerState>,
    calls: AtomicUsize,
    fail_next: AtomicUsize,
    hang: AtomicBool,
    auth: Mutex<Vec<SignedAuth>>,
    links: Mutex<Vec<mpsc::Sender<TransportEvent>>>,
}

impl MockConnector {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Inject an event on the most recent connection.
    async fn inject(&self, event: TransportEvent) {
        let link = self.links.lock().unwrap().last().cloned().unwrap();
        link.send(event).await.unwrap();
    }

    async fn drop_connection(&self) {
        self.inject(TransportEvent::Closed(Error::WebSocketClosed {
            code: 1006,
            reason: "network unreachable".into(),
        }))
        .await;
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        _url: &Url,
        auth: &SignedAuth,
    ) -> BoxFuture<'static, Result<TransportLink, Error>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.auth.lock().unwrap().push(auth.clone());

        if self.hang.load(Ordering::SeqCst) {
            return Box::pin(future::pending());
        }
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            let refused = Error::WebSocketConnect("connection refused".into());
            return Box::pin(future::ready(Err(refused)));
        }

        let (link, peer) = TransportLink::pair(64);
        self.links.lock().unwrap().push(peer.inbound.clone());
        tokio::spawn(serve(peer, Arc::clone(&self.server)));
        Box::pin(future::ready(Ok(link)))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn open(connector: &Arc<MockConnector>, options: ConnectionOptions) -> Session {
    Session::open_with(Arc::clone(connector) as Arc<dyn Connector>, [KEY], options).unwrap()
}

async fn connected(options: ConnectionOptions) -> (Arc<MockConnector>, Session) {
    let connector = Arc::new(MockConnector::default());
    let session = open(&connector, options);
    session.connect().await.unwrap();
    (connector, session)
}

type Events = (mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<String>);

async fn next_event(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    timeout(Duration::from_secs(600), rx.recv()).await.unwrap().unwrap()
}

// ── Subscriptions and push routing ──────────────────────────────────

#[tokio::test]
async fn push_reaches_channel_handler_then_general_handler() {
    let (tx, mut rx): Events = mpsc::unbounded_channel();
    let (_connector, session) = connected(ConnectionOptions::default()).await;

    let general = tx.clone();
    session.on_message(move |r: &MessageRecord| {
        general.send(format!("general:{}", r.message)).unwrap();
    });
    let channels = session
        .subscribe("news", move |r: &MessageRecord| {
            tx.send(format!("news:{}", r.message)).unwrap();
        })
        .await
        .unwrap();
    assert_eq!(channels, vec!["news"]);

    session.publish_with_ack("news", "hello").await.unwrap();

    assert_eq!(next_event(&mut rx).await, "news:hello");
    assert_eq!(next_event(&mut rx).await, "general:hello");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unsubscribe_stops_delivery_to_removed_handler() {
    let (tx, mut rx): Events = mpsc::unbounded_channel();
    let (connector, session) = connected(ConnectionOptions::default()).await;

    let a = tx.clone();
    session
        .subscribe("a", move |r: &MessageRecord| a.send(format!("a:{}", r.message)).unwrap())
        .await
        .unwrap();
    session
        .subscribe("b", move |r: &MessageRecord| tx.send(format!("b:{}", r.message)).unwrap())
        .await
        .unwrap();

    let remaining = session.unsubscribe("a").await.unwrap();
    assert_eq!(remaining, vec!["b"]);
    assert_eq!(session.list_subscriptions().await.unwrap(), vec!["b"]);

    // A late push for "a" still arrives from the wire; only "b" has a handler.
    for channel in ["a", "b"] {
        let push = json!({
            "action": "msg",
            "id": Uuid::new_v4(),
            "msg": "late",
            "time": "2024-06-15T10:30:00Z",
            "chan": channel,
        });
        connector.inject(TransportEvent::Text(push.to_string())).await;
    }

    assert_eq!(next_event(&mut rx).await, "b:late");
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unsubscribe_all_then_list_is_empty() {
    let (_connector, session) = connected(ConnectionOptions::default()).await;
    session.subscribe("a", |_: &MessageRecord| {}).await.unwrap();
    session.subscribe("b", |_: &MessageRecord| {}).await.unwrap();

    let dropped = session.unsubscribe_all().await.unwrap();
    assert_eq!(dropped, vec!["a", "b"]);
    assert!(session.list_subscriptions().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_subscribe_removes_the_handler() {
    let options = ConnectionOptions::default().with_request_ttl(Duration::from_millis(50));
    let (connector, session) = connected(options).await;
    let (tx, mut rx): Events = mpsc::unbounded_channel();

    let err = session
        .subscribe(SILENT, move |r: &MessageRecord| tx.send(r.message.clone()).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, PubSubError::Timeout { .. }));

    let push = json!({
        "action": "msg", "id": Uuid::new_v4(), "msg": "x",
        "time": "2024-06-15T10:30:00Z", "chan": SILENT,
    });
    connector.inject(TransportEvent::Text(push.to_string())).await;
    session.list_subscriptions().await.unwrap();
    assert!(rx.try_recv().is_err());
}

// ── Publishing ──────────────────────────────────────────────────────

#[tokio::test]
async fn publish_without_ack_resolves_with_sequence() {
    let options = ConnectionOptions::default().with_first_sequence(100);
    let (connector, session) = connected(options).await;

    let seq = session.publish("news", "fire and forget").await.unwrap();
    session.list_subscriptions().await.unwrap();

    assert_eq!(seq, 100);
    assert_eq!(connector.server.seen_seqs(), vec![100, 101]);
    assert_eq!(session.pending_requests(), 0);
}

#[tokio::test]
async fn publish_with_ack_returns_message_id() {
    let (_connector, session) = connected(ConnectionOptions::default()).await;
    let id = session.publish_with_ack("news", "hello").await.unwrap();
    assert!(!id.is_nil());
}

#[tokio::test]
async fn rejected_publish_reaches_its_error_handler() {
    let (tx, mut rx): Events = mpsc::unbounded_channel();
    let (_connector, session) = connected(ConnectionOptions::default()).await;

    let general = tx.clone();
    session.on_error(move |err: &PubSubError, _seq: Option<u64>, _channel: Option<&str>| {
        general.send(format!("general:{err}")).unwrap();
    });

    let seq = session
        .publish_with_error_handler(
            FORBIDDEN,
            "nope",
            move |err: &PubSubError, seq: Option<u64>, channel: Option<&str>| {
                let code = match err {
                    PubSubError::Server { code, .. } => *code,
                    _ => 0,
                };
                tx.send(format!("{code}:{}:{}", seq.unwrap(), channel.unwrap()))
                    .unwrap();
            },
        )
        .await
        .unwrap();

    assert_eq!(next_event(&mut rx).await, format!("401:{seq}:{FORBIDDEN}"));
    session.list_subscriptions().await.unwrap();
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn rejected_publish_without_handler_goes_to_error_handler() {
    let (tx, mut rx): Events = mpsc::unbounded_channel();
    let (_connector, session) = connected(ConnectionOptions::default()).await;

    session.on_error(move |err: &PubSubError, seq: Option<u64>, channel: Option<&str>| {
        tx.send(format!("{}:{}:{}", err.server_message().unwrap(), seq.unwrap(), channel.unwrap()))
            .unwrap();
    });

    let seq = session.publish(FORBIDDEN, "nope").await.unwrap();
    assert_eq!(next_event(&mut rx).await, format!("Not Authorized:{seq}:{FORBIDDEN}"));
}

#[tokio::test]
async fn acked_publish_failure_surfaces_to_caller() {
    let (_connector, session) = connected(ConnectionOptions::default()).await;
    let err = session.publish_with_ack(FORBIDDEN, "nope").await.unwrap_err();

    match err {
        PubSubError::Server { code, response, .. } => {
            assert_eq!(code, 401);
            assert_eq!(response["message"], "Not Authorized");
        }
        other => panic!("expected server error, got {other:?}"),
    }
}

// ── Timeouts and sequencing ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out() {
    let (_connector, session) = connected(ConnectionOptions::default()).await;
    let started = Instant::now();

    let err = session
        .subscribe(SILENT, |_: &MessageRecord| {})
        .await
        .unwrap_err();

    assert!(matches!(err, PubSubError::Timeout { timeout_ms: 30_000, .. }));
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert!(started.elapsed() <= Duration::from_secs(32));
    assert_eq!(session.pending_requests(), 0);
}

#[tokio::test]
async fn concurrent_requests_get_unique_sequences() {
    let (connector, session) = connected(ConnectionOptions::default()).await;

    let calls = (0..50).map(|_| {
        let session = session.clone();
        async move { session.list_subscriptions().await.unwrap() }
    });
    future::join_all(calls).await;

    let seqs: BTreeSet<u64> = connector.server.seen_seqs().into_iter().collect();
    assert_eq!(seqs.len(), 50);
}

// ── Inbound robustness ──────────────────────────────────────────────

#[tokio::test]
async fn malformed_frames_are_reported_and_connection_survives() {
    let (tx, mut rx): Events = mpsc::unbounded_channel();
    let (connector, session) = connected(ConnectionOptions::default()).await;

    let raw = tx.clone();
    session.on_raw_record(move |text: &str| raw.send(format!("raw:{text}")).unwrap());
    session.on_error(move |err: &PubSubError, seq: Option<u64>, _channel: Option<&str>| {
        let kind = if matches!(err, PubSubError::Protocol { .. }) { "protocol" } else { "other" };
        tx.send(format!("{kind}:{seq:?}")).unwrap();
    });

    connector.inject(TransportEvent::Text("not json".into())).await;
    connector.inject(TransportEvent::Text(r#"{"code":200}"#.into())).await;
    connector
        .inject(TransportEvent::Text(r#"{"seq":9999,"code":200}"#.into()))
        .await;

    assert_eq!(next_event(&mut rx).await, "raw:not json");
    assert_eq!(next_event(&mut rx).await, "protocol:None");
    assert_eq!(next_event(&mut rx).await, r#"raw:{"code":200}"#);
    assert_eq!(next_event(&mut rx).await, "protocol:None");
    assert_eq!(next_event(&mut rx).await, r#"raw:{"seq":9999,"code":200}"#);
    assert_eq!(next_event(&mut rx).await, "protocol:Some(9999)");

    assert_eq!(*session.connection_state().borrow(), ConnectionState::Connected);
    assert!(session.list_subscriptions().await.unwrap().is_empty());
}

#[tokio::test]
async fn panicking_handler_does_not_break_dispatch() {
    let (tx, mut rx): Events = mpsc::unbounded_channel();
    let (_connector, session) = connected(ConnectionOptions::default()).await;

    let general = tx.clone();
    session.on_message(move |r: &MessageRecord| {
        general.send(format!("general:{}", r.message)).unwrap();
    });
    session.on_error(move |err: &PubSubError, _seq: Option<u64>, channel: Option<&str>| {
        if matches!(err, PubSubError::Handler { .. }) {
            tx.send(format!("handler-error:{}", channel.unwrap())).unwrap();
        }
    });
    session.subscribe("news", explode).await.unwrap();

    session.publish_with_ack("news", "hello").await.unwrap();

    let mut events = vec![next_event(&mut rx).await, next_event(&mut rx).await];
    events.sort();
    assert_eq!(events, vec!["general:hello", "handler-error:news"]);
    assert_eq!(session.list_subscriptions().await.unwrap(), vec!["news"]);
}

fn explode(_: &MessageRecord) {
    panic!("handler bug");
}

// ── Key validation ──────────────────────────────────────────────────

#[tokio::test]
async fn bad_keys_fail_before_any_network_action() {
    let connector = Arc::new(MockConnector::default());

    for keys in [vec![], vec!["X-a1b2c3-00ff"], vec![KEY, "R-a1b2c3"], vec![KEY, "R-other-00ff"]] {
        let result = Session::open_with(
            Arc::clone(&connector) as Arc<dyn Connector>,
            keys,
            ConnectionOptions::default(),
        );
        assert!(matches!(result, Err(PubSubError::AuthKey { .. })));
    }
    assert_eq!(connector.calls(), 0);
}

// ── Connection lifecycle ────────────────────────────────────────────

#[tokio::test]
async fn concurrent_connects_share_one_attempt() {
    let connector = Arc::new(MockConnector::default());
    let session = open(&connector, ConnectionOptions::default());

    let (a, b) = tokio::join!(session.connect(), session.connect());
    a.unwrap();
    b.unwrap();

    assert_eq!(connector.calls(), 1);
    assert_eq!(*session.connection_state().borrow(), ConnectionState::Connected);
}

#[tokio::test]
async fn failed_initial_connect_leaves_disconnected() {
    let connector = Arc::new(MockConnector::default());
    connector.fail_next.store(1, Ordering::SeqCst);
    let session = open(&connector, ConnectionOptions::default());

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, PubSubError::Connection { .. }));
    assert_eq!(*session.connection_state().borrow(), ConnectionState::Disconnected);

    session.connect().await.unwrap();
    assert_eq!(connector.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn hung_transport_open_times_out() {
    let connector = Arc::new(MockConnector::default());
    connector.hang.store(true, Ordering::SeqCst);
    let session = open(
        &connector,
        ConnectionOptions::default().with_connect_timeout(Duration::from_secs(2)),
    );

    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, PubSubError::Connection { ref reason } if reason.contains("timed out")));
    assert_eq!(*session.connection_state().borrow(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn abandoned_connect_still_times_out_and_releases_the_connector() {
    let connector = Arc::new(MockConnector::default());
    connector.hang.store(true, Ordering::SeqCst);
    let session = open(
        &connector,
        ConnectionOptions::default().with_connect_timeout(Duration::from_secs(5)),
    );

    // The caller gives up long before the connect timeout.
    assert!(timeout(Duration::from_secs(1), session.connect()).await.is_err());
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(*session.connection_state().borrow(), ConnectionState::Disconnected);
    assert_eq!(connector.calls(), 1);

    let released = Arc::downgrade(&connector);
    drop(connector);
    drop(session);
    assert!(released.upgrade().is_none(), "connector outlived every Session");
}

#[tokio::test]
async fn close_unsubscribes_then_closes_for_good() {
    let (tx, mut rx): Events = mpsc::unbounded_channel();
    let (connector, session) = connected(ConnectionOptions::default()).await;
    session.on_close(move |err: Option<&PubSubError>| {
        tx.send(format!("close:{}", err.is_some())).unwrap();
    });
    session.subscribe("a", |_: &MessageRecord| {}).await.unwrap();

    let dropped = session.close().await.unwrap();

    assert_eq!(dropped, vec!["a"]);
    assert_eq!(next_event(&mut rx).await, "close:false");
    assert_eq!(*session.connection_state().borrow(), ConnectionState::Closed);
    assert!(matches!(session.list_subscriptions().await, Err(PubSubError::Closed)));
    assert!(matches!(session.connect().await, Err(PubSubError::Closed)));

    // The server sees the close frame; no reconnect follows.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(connector.server.closes.load(Ordering::SeqCst), 1);
    assert_eq!(connector.calls(), 1);

    // A second close is a no-op for the close handler.
    let _ = session.close().await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unplanned_close_without_auto_reconnect_stays_down() {
    let (tx, mut rx): Events = mpsc::unbounded_channel();
    let options = ConnectionOptions::default().with_auto_reconnect(false);
    let (connector, session) = connected(options).await;
    session.on_close(move |err: Option<&PubSubError>| {
        tx.send(format!("close:{}", err.unwrap())).unwrap();
    });

    connector.drop_connection().await;

    let event = next_event(&mut rx).await;
    assert!(event.contains("code 1006"), "{event}");
    let mut state = session.connection_state();
    state
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await
        .unwrap();
    assert!(matches!(session.list_subscriptions().await, Err(PubSubError::NotConnected)));
    assert_eq!(connector.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn unplanned_close_reconnects_and_detects_new_session() {
    let (tx, mut rx): Events = mpsc::unbounded_channel();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    let connector = Arc::new(MockConnector::default());
    *connector.server.session.lock().unwrap() = first;
    let session = open(&connector, ConnectionOptions::default().with_session_uuid(Some(first)));

    let on_close = tx.clone();
    session.on_close(move |err: Option<&PubSubError>| {
        on_close.send(format!("close:{}", err.is_some())).unwrap();
    });
    let on_new = tx.clone();
    session.on_new_session(move |uuid| on_new.send(format!("new-session:{uuid}")).unwrap());
    session.on_reconnect(move || tx.send("reconnect".into()).unwrap());

    session.connect().await.unwrap();
    assert_eq!(session.session_uuid(), Some(first));

    // The server forgets the session while the connection is down.
    *connector.server.session.lock().unwrap() = second;
    let dropped_at = Instant::now();
    connector.drop_connection().await;

    assert_eq!(next_event(&mut rx).await, "close:true");
    assert_eq!(next_event(&mut rx).await, format!("new-session:{second}"));
    assert_eq!(next_event(&mut rx).await, "reconnect");
    assert!(rx.try_recv().is_err());

    // First reconnect waits for the connect timeout (30s).
    assert!(dropped_at.elapsed() >= Duration::from_secs(30));
    assert_eq!(session.session_uuid(), Some(second));
    assert_eq!(connector.calls(), 2);
    assert_eq!(*session.connection_state().borrow(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn failed_session_check_on_reconnect_keeps_retrying() {
    let (tx, mut rx): Events = mpsc::unbounded_channel();
    let uuid = Uuid::new_v4();
    let connector = Arc::new(MockConnector::default());
    *connector.server.session.lock().unwrap() = uuid;
    let session = open(&connector, ConnectionOptions::default().with_session_uuid(Some(uuid)));
    session.on_reconnect(move || tx.send("reconnect".into()).unwrap());
    session.connect().await.unwrap();

    connector.server.session_failures.store(1, Ordering::SeqCst);
    let dropped_at = Instant::now();
    connector.drop_connection().await;

    // The transport comes back at 30s but the session check is refused.
    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(connector.calls(), 2);
    assert_eq!(
        *session.connection_state().borrow(),
        ConnectionState::Reconnecting { attempt: 1 }
    );
    assert!(rx.try_recv().is_err());

    // The next attempt comes 60s later and succeeds.
    assert_eq!(next_event(&mut rx).await, "reconnect");
    assert!(dropped_at.elapsed() >= Duration::from_secs(90));
    assert_eq!(connector.calls(), 3);
    assert_eq!(*session.connection_state().borrow(), ConnectionState::Connected);
    assert_eq!(session.session_uuid(), Some(uuid));
}

#[tokio::test(start_paused = true)]
async fn manual_connect_during_backoff_ends_reconnect_loop_quietly() {
    let (tx, mut rx): Events = mpsc::unbounded_channel();
    let (connector, session) = connected(ConnectionOptions::default()).await;
    session.on_reconnect(move || tx.send("reconnect".into()).unwrap());

    let mut state = session.connection_state();
    connector.drop_connection().await;
    state
        .wait_for(|s| matches!(s, ConnectionState::Reconnecting { .. }))
        .await
        .unwrap();

    session.connect().await.unwrap();
    assert_eq!(connector.calls(), 2);

    // The backoff timer fires into an already connected session.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.calls(), 2);
    assert!(rx.try_recv().is_err());
    assert_eq!(*session.connection_state().borrow(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn failed_reconnects_back_off_exponentially() {
    let (tx, mut rx): Events = mpsc::unbounded_channel();
    let (connector, session) = connected(ConnectionOptions::default()).await;
    session.on_reconnect(move || tx.send("reconnect".into()).unwrap());

    connector.fail_next.store(2, Ordering::SeqCst);
    let dropped_at = Instant::now();
    connector.drop_connection().await;

    assert_eq!(next_event(&mut rx).await, "reconnect");

    // 30s, then 60s, then 120s.
    let elapsed = dropped_at.elapsed();
    assert!(elapsed >= Duration::from_secs(210), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(212), "{elapsed:?}");
    assert_eq!(connector.calls(), 4);
    assert_eq!(*session.connection_state().borrow(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn keepalive_pings_while_connected() {
    let (connector, session) = connected(ConnectionOptions::default()).await;
    let hooks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hooks);
    session.on_ping(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    tokio::time::sleep(Duration::from_secs(65)).await;

    assert_eq!(hooks.load(Ordering::SeqCst), 2);
    assert_eq!(connector.server.pings.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn keepalive_pauses_while_reconnecting_and_resumes_after() {
    let (connector, session) = connected(ConnectionOptions::default()).await;
    let pings = || connector.server.pings.load(Ordering::SeqCst);

    tokio::time::sleep(Duration::from_secs(35)).await;
    assert_eq!(pings(), 1);

    // Reconnect attempts follow at +30s (refused) and +90s.
    connector.fail_next.store(1, Ordering::SeqCst);
    connector.drop_connection().await;
    tokio::time::sleep(Duration::from_secs(80)).await;
    assert_eq!(
        *session.connection_state().borrow(),
        ConnectionState::Reconnecting { attempt: 1 }
    );
    assert_eq!(pings(), 1);

    let mut state = session.connection_state();
    state.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(pings(), 2);
}
