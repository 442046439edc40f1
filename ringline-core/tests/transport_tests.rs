//! Reconnect and delivery behavior of the signaling client, driven
//! through an in-memory connector on a paused clock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use ringline_core::protocol::ClientMessage;
use ringline_core::transport::{
    Connector, ReconnectPolicy, SignalingChannel, SignalingClient, SocketPipe, TransportError,
    TransportEvent,
};
use ringline_core::types::CallId;

/// The far end of one in-memory connection
struct TestSession {
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
}

#[derive(Default)]
struct Inner {
    attempts: AtomicUsize,
    fail: AtomicBool,
    hold: AtomicBool,
    released: tokio::sync::Notify,
    sessions: parking_lot::Mutex<Vec<TestSession>>,
}

#[derive(Clone, Default)]
struct TestConnector(Arc<Inner>);

impl TestConnector {
    fn attempts(&self) -> usize {
        self.0.attempts.load(Ordering::SeqCst)
    }

    fn set_fail(&self, fail: bool) {
        self.0.fail.store(fail, Ordering::SeqCst);
    }

    /// Make the next dial block until [`release`](Self::release)
    fn set_hold(&self, hold: bool) {
        self.0.hold.store(hold, Ordering::SeqCst);
    }

    fn release(&self) {
        self.0.released.notify_one();
    }

    fn take_session(&self) -> TestSession {
        self.0.sessions.lock().pop().expect("no session established")
    }
}

#[async_trait]
impl Connector for TestConnector {
    async fn connect(&self, _url: &Url, _token: &str) -> Result<SocketPipe, TransportError> {
        self.0.attempts.fetch_add(1, Ordering::SeqCst);
        if self.0.hold.load(Ordering::SeqCst) {
            self.0.released.notified().await;
        }
        if self.0.fail.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("scripted dial failure".into()));
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.0.sessions.lock().push(TestSession {
            to_client: in_tx,
            from_client: out_rx,
        });
        Ok(SocketPipe {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

fn client(
    connector: &TestConnector,
    token: &str,
) -> (
    Arc<SignalingClient<TestConnector>>,
    mpsc::UnboundedReceiver<TransportEvent>,
) {
    SignalingClient::new(
        connector.clone(),
        Url::parse("ws://signaling.test/ws").expect("url"),
        token,
        ReconnectPolicy::default(),
    )
}

async fn expect_event(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(30), rx.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("transport event channel closed")
}

#[tokio::test]
async fn test_connect_delivers_opened_and_sends_frames() {
    let connector = TestConnector::default();
    let (client, mut events) = client(&connector, "tok");

    client.connect().await.expect("connect");
    assert!(matches!(expect_event(&mut events).await, TransportEvent::Opened));
    assert!(client.is_open());

    client.send(ClientMessage::Heartbeat {
        call_id: Some(CallId::from("c1")),
    });
    let mut session = connector.take_session();
    let frame = session.from_client.recv().await.expect("frame");
    assert!(frame.contains("\"call.heartbeat\""));
    assert!(frame.contains("\"c1\""));
}

#[tokio::test]
async fn test_double_connect_is_a_noop() {
    let connector = TestConnector::default();
    let (client, mut events) = client(&connector, "tok");

    client.connect().await.expect("connect");
    client.connect().await.expect("second connect");
    assert_eq!(connector.attempts(), 1);
    assert!(matches!(expect_event(&mut events).await, TransportEvent::Opened));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_missing_token_is_rejected_without_dialing() {
    let connector = TestConnector::default();
    let (client, _events) = client(&connector, "");

    let result = client.connect().await;
    assert!(matches!(result, Err(TransportError::MissingToken)));
    assert_eq!(connector.attempts(), 0);
    assert!(!client.is_open());
}

#[tokio::test]
async fn test_inbound_frames_are_classified() {
    let connector = TestConnector::default();
    let (client, mut events) = client(&connector, "tok");
    client.connect().await.expect("connect");
    assert!(matches!(expect_event(&mut events).await, TransportEvent::Opened));
    let session = connector.take_session();

    session
        .to_client
        .send(r#"{"type":"call.heartbeat_ack"}"#.to_string())
        .expect("send");
    assert!(matches!(
        expect_event(&mut events).await,
        TransportEvent::Message(_)
    ));

    // valid JSON with an unknown type is dropped silently
    session
        .to_client
        .send(r#"{"type":"call.totally_new","x":1}"#.to_string())
        .expect("send");

    // non-JSON surfaces as a malformed event
    session
        .to_client
        .send("definitely not json".to_string())
        .expect("send");
    assert!(matches!(
        expect_event(&mut events).await,
        TransportEvent::Malformed
    ));
}

#[tokio::test(start_paused = true)]
async fn test_lost_connection_reconnects_after_delay() {
    let connector = TestConnector::default();
    let (client, mut events) = client(&connector, "tok");
    client.connect().await.expect("connect");
    assert!(matches!(expect_event(&mut events).await, TransportEvent::Opened));

    // server side goes away
    drop(connector.take_session());
    assert!(matches!(expect_event(&mut events).await, TransportEvent::Closed));
    assert!(!client.is_open());

    // one fixed-delay retry brings the link back
    assert!(matches!(expect_event(&mut events).await, TransportEvent::Opened));
    assert_eq!(connector.attempts(), 2);
    assert!(client.is_open());
}

#[tokio::test(start_paused = true)]
async fn test_manual_disconnect_suppresses_reconnect() {
    let connector = TestConnector::default();
    let (client, mut events) = client(&connector, "tok");
    client.connect().await.expect("connect");
    assert!(matches!(expect_event(&mut events).await, TransportEvent::Opened));

    client.disconnect();
    assert!(matches!(expect_event(&mut events).await, TransportEvent::Closed));
    assert!(!client.is_open());

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.attempts(), 1);

    // sends after the disconnect are dropped, not queued
    client.send(ClientMessage::Heartbeat { call_id: None });
    let mut session = connector.take_session();
    assert!(session.from_client.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_failed_dial_arms_single_retry() {
    let connector = TestConnector::default();
    connector.set_fail(true);
    let (client, mut events) = client(&connector, "tok");

    assert!(matches!(
        client.connect().await,
        Err(TransportError::Connect(_))
    ));
    assert_eq!(connector.attempts(), 1);

    connector.set_fail(false);
    assert!(matches!(expect_event(&mut events).await, TransportEvent::Opened));
    assert_eq!(connector.attempts(), 2);
}

#[tokio::test]
async fn test_disconnect_during_dial_keeps_the_link_down() {
    let connector = TestConnector::default();
    connector.set_hold(true);
    let (client, mut events) = client(&connector, "tok");

    let dial = {
        let client = client.clone();
        tokio::spawn(async move { client.connect().await })
    };
    // wait for the dial to park inside the connector
    for _ in 0..100 {
        if connector.attempts() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(connector.attempts(), 1);

    client.disconnect();
    assert!(matches!(expect_event(&mut events).await, TransportEvent::Closed));

    // the dial resolving afterwards must not re-open the link
    connector.release();
    dial.await.expect("dial task").expect("connect");
    assert!(!client.is_open());
    assert!(events.try_recv().is_err());

    // and sends stay dropped
    client.send(ClientMessage::Heartbeat { call_id: None });
    let mut session = connector.take_session();
    assert!(session.from_client.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_can_be_canceled_by_disconnect() {
    let connector = TestConnector::default();
    connector.set_fail(true);
    let (client, mut events) = client(&connector, "tok");
    let _ = client.connect().await;
    assert_eq!(connector.attempts(), 1);

    // disconnect before the timer fires
    client.disconnect();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.attempts(), 1);
    assert!(events.try_recv().is_err());
}
