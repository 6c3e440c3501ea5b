#![allow(dead_code)]

use futures::future::BoxFuture;
use resilient_stomp::{
    BoxedTransport, ClientConfig, Connector, Frame, FrameBuffer, HeartbeatConfig, StompItem,
    build_frame,
};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const WAIT: Duration = Duration::from_secs(5);

/// Config with short retry delays and heartbeats off.
pub fn fast_config() -> ClientConfig {
    ClientConfig::default()
        .with_reconnect_timeout(Duration::from_millis(5))
        .with_reconnect_max_interval(Duration::from_millis(20))
        .with_connect_timeout(Duration::from_secs(2))
        .with_heartbeat(HeartbeatConfig::disabled())
}

/// Connector that refuses the first `failures` attempts, then hands out
/// in-memory streams whose far ends arrive on the paired receiver.
pub struct MockConnector {
    failures: Arc<AtomicUsize>,
    attempts: Arc<AtomicUsize>,
    stamps: Arc<Mutex<Vec<Instant>>>,
    accepted: mpsc::UnboundedSender<DuplexStream>,
}

pub struct Handles {
    pub attempts: Arc<AtomicUsize>,
    pub failures: Arc<AtomicUsize>,
    pub stamps: Arc<Mutex<Vec<Instant>>>,
    pub accepted: mpsc::UnboundedReceiver<DuplexStream>,
}

impl Handles {
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// When each connection attempt started, oldest first.
    pub fn stamps(&self) -> Vec<Instant> {
        self.stamps.lock().unwrap().clone()
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Next broker-side stream, as a [`Broker`].
    pub async fn accept(&mut self) -> Broker {
        let stream = tokio::time::timeout(WAIT, self.accepted.recv())
            .await
            .expect("no connection within timeout")
            .expect("connector dropped");
        Broker::new(stream)
    }
}

pub fn mock_connector(failures: usize) -> (MockConnector, Handles) {
    let (tx, rx) = mpsc::unbounded_channel();
    let attempts = Arc::new(AtomicUsize::new(0));
    let failures = Arc::new(AtomicUsize::new(failures));
    let stamps = Arc::new(Mutex::new(Vec::new()));
    let connector = MockConnector {
        failures: failures.clone(),
        attempts: attempts.clone(),
        stamps: stamps.clone(),
        accepted: tx,
    };
    (
        connector,
        Handles {
            attempts,
            failures,
            stamps,
            accepted: rx,
        },
    )
}

impl Connector for MockConnector {
    fn connect(&self) -> BoxFuture<'_, io::Result<BoxedTransport>> {
        Box::pin(async move {
            self.stamps.lock().unwrap().push(Instant::now());
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let refuse = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refuse {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            let (client, broker) = tokio::io::duplex(64 * 1024);
            self.accepted
                .send(broker)
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
            Ok(Box::new(client) as BoxedTransport)
        })
    }
}

/// Broker end of one mock connection.
pub struct Broker {
    stream: DuplexStream,
    buf: FrameBuffer,
    queued: VecDeque<Frame>,
    pub heartbeats: usize,
}

impl Broker {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buf: FrameBuffer::new(),
            queued: VecDeque::new(),
            heartbeats: 0,
        }
    }

    /// Next frame from the client, skipping heartbeats. `None` on EOF.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(f) = self.queued.pop_front() {
                return Some(f);
            }
            let n = tokio::time::timeout(WAIT, self.stream.read(&mut chunk))
                .await
                .expect("client went quiet")
                .ok()?;
            if n == 0 {
                return None;
            }
            self.buf.feed(&chunk[..n]);
            for item in self.buf.pop_frames().expect("client sent garbage") {
                match item {
                    StompItem::Frame(f) => self.queued.push_back(f),
                    StompItem::Heartbeat => self.heartbeats += 1,
                }
            }
        }
    }

    /// Next frame, asserting its command.
    pub async fn expect(&mut self, command: &str) -> Frame {
        let f = self
            .next_frame()
            .await
            .unwrap_or_else(|| panic!("EOF while waiting for {}", command));
        assert_eq!(f.command, command, "unexpected frame: {}", f);
        f
    }

    pub async fn send(&mut self, frame: Frame) {
        let bytes = build_frame(&frame.command, &frame.headers, &frame.body);
        self.send_raw(&bytes).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.expect("client gone");
        self.stream.flush().await.expect("client gone");
    }

    /// Read CONNECT and answer CONNECTED with the given `heart-beat`.
    pub async fn handshake(&mut self, heart_beat: &str) -> Frame {
        let connect = self.expect("CONNECT").await;
        self.send(
            Frame::new("CONNECTED")
                .header("version", "1.1")
                .header("heart-beat", heart_beat),
        )
        .await;
        connect
    }

    pub async fn message(&mut self, subscription: &str, message_id: &str, body: &str) {
        self.send(
            Frame::new("MESSAGE")
                .header("subscription", subscription)
                .header("message-id", message_id)
                .header("destination", "/queue/test")
                .set_body(body.as_bytes().to_vec()),
        )
        .await;
    }
}
