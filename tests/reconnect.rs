mod common;

use common::{Broker, Handles, WAIT, fast_config, mock_connector};
use resilient_stomp::{AckMode, Client, ClientConfig, ConnectionState, Frame, StompError};
use std::time::Duration;
use tokio::sync::mpsc;

async fn connected(config: ClientConfig, failures: usize) -> (Client, Handles, Broker) {
    let (connector, mut handles) = mock_connector(failures);
    let client = Client::new(config, connector);
    let (res, broker) = tokio::join!(client.connect(None, None), async {
        let mut broker = handles.accept().await;
        broker.handshake("0,0").await;
        broker
    });
    res.expect("connect");
    (client, handles, broker)
}

async fn wait_for_state(client: &Client, want: ConnectionState) {
    let mut changes = client.state_changes();
    tokio::time::timeout(WAIT, changes.wait_for(|s| *s == want))
        .await
        .expect("state not reached")
        .expect("client dropped");
}

#[tokio::test]
async fn subscriptions_registered_before_connect_are_sent_once() {
    let (connector, mut handles) = mock_connector(0);
    let client = Client::new(fast_config(), connector);
    client
        .subscribe_with("/queue/a", AckMode::Auto, |_| async { true })
        .await
        .unwrap();
    client
        .subscribe_with("/queue/b", AckMode::Client, |_| async { true })
        .await
        .unwrap();
    client
        .subscribe_with("/topic/c", AckMode::ClientIndividual, |_| async { true })
        .await
        .unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let (res, mut broker) = tokio::join!(client.connect(Some("guest"), Some("secret")), async {
        let mut broker = handles.accept().await;
        let connect = broker.handshake("0,0").await;
        assert_eq!(connect.get_header("accept-version"), Some("1.1"));
        assert_eq!(connect.get_header("login"), Some("guest"));
        assert_eq!(connect.get_header("passcode"), Some("secret"));
        assert_eq!(connect.get_header("heart-beat"), None);
        broker
    });
    res.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);

    let expected = [
        ("1", "/queue/a", "auto"),
        ("2", "/queue/b", "client"),
        ("3", "/topic/c", "client-individual"),
    ];
    for (id, dest, ack) in expected {
        let sub = broker.expect("SUBSCRIBE").await;
        assert_eq!(sub.get_header("id"), Some(id));
        assert_eq!(sub.get_header("destination"), Some(dest));
        assert_eq!(sub.get_header("ack"), Some(ack));
    }

    client.close().await;
    broker.expect("DISCONNECT").await;
    assert!(broker.next_frame().await.is_none());
}

#[tokio::test]
async fn transient_failures_yield_one_handshake_and_one_subscribe_each() {
    let (connector, mut handles) = mock_connector(3);
    let client = Client::new(fast_config(), connector);
    for dest in ["/queue/a", "/queue/b"] {
        client
            .subscribe_with(dest, AckMode::Auto, |_| async { true })
            .await
            .unwrap();
    }

    let (res, mut broker) = tokio::join!(client.connect(None, None), async {
        let mut broker = handles.accept().await;
        broker.handshake("0,0").await;
        broker
    });
    res.unwrap();
    assert_eq!(handles.attempts(), 4);

    assert_eq!(broker.expect("SUBSCRIBE").await.get_header("id"), Some("1"));
    assert_eq!(broker.expect("SUBSCRIBE").await.get_header("id"), Some("2"));

    client.close().await;
    broker.expect("DISCONNECT").await;
    assert!(broker.next_frame().await.is_none());
    assert!(handles.accepted.try_recv().is_err());
}

#[tokio::test]
async fn dropped_connection_is_restored_with_same_subscription_ids() {
    let (client, mut handles, mut broker) = connected(fast_config(), 0).await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let sub = client
        .subscribe_with("/queue/orders", AckMode::Client, move |frame| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(frame.body);
                true
            }
        })
        .await
        .unwrap();
    let first = broker.expect("SUBSCRIBE").await;
    assert_eq!(first.get_header("id"), Some("1"));

    drop(broker);

    let mut broker = handles.accept().await;
    broker.handshake("0,0").await;
    let replay = broker.expect("SUBSCRIBE").await;
    assert_eq!(replay.get_header("id"), Some(sub.id().to_string().as_str()));
    assert_eq!(replay.get_header("destination"), Some("/queue/orders"));
    wait_for_state(&client, ConnectionState::Connected).await;

    broker.message("1", "m-1", "after reconnect").await;
    let body = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(body, b"after reconnect");
    let ack = broker.expect("ACK").await;
    assert_eq!(ack.get_header("message-id"), Some("m-1"));

    client.close().await;
    assert_eq!(handles.attempts(), 2);
}

#[tokio::test]
async fn initial_connect_gives_up_after_max_attempts() {
    let (connector, handles) = mock_connector(usize::MAX);
    let client = Client::new(fast_config().with_reconnect_max_attempts(3), connector);

    let err = client.connect(None, None).await.unwrap_err();
    assert!(
        matches!(err, StompError::ExceededRetryCount { attempts: 3 }),
        "{err:?}"
    );
    assert_eq!(handles.attempts(), 4);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handles.attempts(), 4);
    assert_eq!(client.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn supervisor_gives_up_and_reports_terminal_error() {
    let config = fast_config().with_reconnect_max_attempts(2);
    let (client, handles, broker) = connected(config, 0).await;

    handles.refuse_next(usize::MAX);
    drop(broker);

    let err = tokio::time::timeout(WAIT, client.closed())
        .await
        .expect("supervisor never gave up")
        .unwrap_err();
    assert!(matches!(err, StompError::ExceededRetryCount { attempts: 2 }));
    // The initial connect, then one try and two retries.
    assert_eq!(handles.attempts(), 4);
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(matches!(
        client.send("/queue/a", "late").await,
        Err(StompError::ExceededRetryCount { .. })
    ));
}

#[tokio::test]
async fn close_stops_reconnecting() {
    let (client, mut handles, mut broker) = connected(fast_config(), 0).await;
    client.close().await;
    broker.expect("DISCONNECT").await;
    assert!(broker.next_frame().await.is_none());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handles.attempts(), 1);
    assert!(handles.accepted.try_recv().is_err());
    assert!(client.closed().await.is_ok());
    assert!(matches!(
        client.send("/queue/a", "x").await,
        Err(StompError::Closed)
    ));
}

#[tokio::test]
async fn close_cancels_backoff_wait() {
    let (connector, handles) = mock_connector(usize::MAX);
    let config = fast_config()
        .with_reconnect_timeout(Duration::from_secs(30))
        .with_reconnect_max_interval(Duration::from_secs(30));
    let client = Client::new(config, connector);

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.connect(None, None).await }
    });
    while handles.attempts() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    client.close().await;

    let res = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap();
    assert!(matches!(res, Err(StompError::Closed)));
    assert_eq!(handles.attempts(), 1);
}

async fn reject(broker: &mut Broker) {
    broker.expect("CONNECT").await;
    broker
        .send(
            Frame::new("ERROR")
                .header("message", "authentication failed")
                .set_body(b"unknown user".to_vec()),
        )
        .await;
}

#[tokio::test]
async fn concurrent_connects_open_one_session() {
    let (connector, mut handles) = mock_connector(0);
    let client = Client::new(fast_config(), connector);
    client
        .subscribe_with("/queue/a", AckMode::Auto, |_| async { true })
        .await
        .unwrap();

    let (first, second, mut broker) = tokio::join!(
        client.connect(None, None),
        client.connect(None, None),
        async {
            let mut broker = handles.accept().await;
            broker.handshake("0,0").await;
            broker
        }
    );
    first.unwrap();
    second.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(broker.expect("SUBSCRIBE").await.get_header("id"), Some("1"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handles.attempts(), 1);
    assert!(handles.accepted.try_recv().is_err());

    client.close().await;
    broker.expect("DISCONNECT").await;
    assert!(broker.next_frame().await.is_none());
}

#[tokio::test]
async fn rejected_initial_handshake_is_retried() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = fast_config().with_error_handler(move |message, _| {
        let _ = tx.send(message.to_string());
    });
    let (connector, mut handles) = mock_connector(0);
    let client = Client::new(config, connector);

    let (res, _broker) = tokio::join!(client.connect(Some("user"), None), async {
        let mut refused = handles.accept().await;
        reject(&mut refused).await;
        let mut broker = handles.accept().await;
        broker.handshake("0,0").await;
        broker
    });
    res.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(handles.attempts(), 2);
    let seen = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(seen, "authentication failed");
    client.close().await;
}

#[tokio::test]
async fn rejection_after_drop_is_retried_and_subscriptions_replayed() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let config = fast_config().with_error_handler(move |message, _| {
        let _ = tx.send(message.to_string());
    });
    let (client, mut handles, mut broker) = connected(config, 0).await;
    let sub = client
        .subscribe_with("/queue/orders", AckMode::Client, |_| async { true })
        .await
        .unwrap();
    broker.expect("SUBSCRIBE").await;

    drop(broker);

    let mut refused = handles.accept().await;
    reject(&mut refused).await;
    let seen = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(seen, "authentication failed");

    let mut broker = handles.accept().await;
    broker.handshake("0,0").await;
    let replay = broker.expect("SUBSCRIBE").await;
    assert_eq!(replay.get_header("id"), Some(sub.id().to_string().as_str()));
    assert_eq!(replay.get_header("destination"), Some("/queue/orders"));
    wait_for_state(&client, ConnectionState::Connected).await;

    assert_eq!(handles.attempts(), 3);
    assert!(client.send("/queue/orders", "still alive").await.is_ok());
    assert_eq!(broker.expect("SEND").await.body, b"still alive");
    client.close().await;
}

#[tokio::test]
async fn retry_delay_restarts_after_successful_connect() {
    let config = fast_config()
        .with_reconnect_timeout(Duration::from_millis(40))
        .with_reconnect_max_interval(Duration::from_secs(2));
    // Three refusals grow the delay to 40, 80 and 160ms.
    let (client, handles, broker) = connected(config, 3).await;
    let stamps = handles.stamps();
    assert_eq!(stamps.len(), 4);
    assert!(stamps[3] - stamps[2] >= Duration::from_millis(160));

    let mut handles = handles;
    handles.refuse_next(1);
    drop(broker);

    let mut broker = handles.accept().await;
    broker.handshake("0,0").await;
    let stamps = handles.stamps();
    assert_eq!(stamps.len(), 6);
    // Without a reset the next delay would have been 320ms.
    let gap = stamps[5] - stamps[4];
    assert!(gap >= Duration::from_millis(40), "{gap:?}");
    assert!(gap < Duration::from_millis(250), "{gap:?}");
    client.close().await;
}

#[tokio::test]
async fn rejected_handshake_fails_fast_when_configured() {
    let (connector, mut handles) = mock_connector(0);
    let client = Client::new(fast_config().with_fail_on_rejection(true), connector);

    let (res, _broker) = tokio::join!(client.connect(Some("bad"), None), async {
        let mut broker = handles.accept().await;
        reject(&mut broker).await;
        broker
    });

    match res {
        Err(StompError::ServerRejected(err)) => {
            assert_eq!(err.message, "authentication failed");
            assert_eq!(err.body, b"unknown user");
        }
        other => panic!("expected rejection, got {other:?}"),
    }
    assert_eq!(handles.attempts(), 1);
}

#[tokio::test]
async fn unsubscribe_sends_frame_and_forgets_entry() {
    let (client, _handles, mut broker) = connected(fast_config(), 0).await;
    let sub = client
        .subscribe_with("/queue/a", AckMode::Auto, |_| async { true })
        .await
        .unwrap();
    broker.expect("SUBSCRIBE").await;

    client.unsubscribe(&sub).await.unwrap();
    let unsub = broker.expect("UNSUBSCRIBE").await;
    assert_eq!(unsub.get_header("id"), Some("1"));
    assert!(client.subscriptions().await.is_empty());

    assert!(matches!(
        client.unsubscribe(&sub).await,
        Err(StompError::Protocol(_))
    ));
    client.close().await;
    assert!(matches!(
        client.unsubscribe(&sub).await,
        Err(StompError::Closed)
    ));
}
