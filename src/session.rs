use futures::{SinkExt, StreamExt};
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{StompCodec, StompItem};
use crate::config::ClientConfig;
use crate::error::{Result, StompError};
use crate::frame::{Frame, command};
use crate::heartbeat::Activity;
use crate::subscription::Subscription;
use crate::transport::{BoxedTransport, Connector};

/// Capacity of the queue between callers and the session's I/O task.
const OUTBOUND_CAPACITY: usize = 64;

/// Upper bound on flushing queued frames once a session is closed.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Optional CONNECT credentials.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub login: Option<String>,
    pub passcode: Option<String>,
}

impl Credentials {
    pub fn new(login: Option<&str>, passcode: Option<&str>) -> Self {
        Self {
            login: login.map(str::to_string),
            passcode: passcode.map(str::to_string),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("login", &self.login)
            .field("passcode", &self.passcode.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Why a session's transport went away.
#[derive(Debug)]
pub enum DisconnectReason {
    /// `close()` was called or the heartbeat watchdog gave up.
    Closed,
    /// The broker closed the stream.
    Eof,
    /// Read, write or decode failure.
    Error(io::Error),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => f.write_str("closed"),
            DisconnectReason::Eof => f.write_str("connection closed by broker"),
            DisconnectReason::Error(e) => write!(f, "{}", e),
        }
    }
}

/// Receiving ends handed to whoever drives a freshly opened session.
#[derive(Debug)]
pub struct SessionEvents {
    /// Every decoded item, frames and heartbeats, in wire order.
    pub inbound: mpsc::UnboundedReceiver<StompItem>,
    /// Resolves once, when the I/O task exits.
    pub disconnected: oneshot::Receiver<DisconnectReason>,
}

/// One physical connection to the broker.
///
/// A background I/O task owns the framed transport. `Session` handles are
/// cheap clones that queue frames for that task.
#[derive(Clone, Debug)]
pub struct Session {
    outbound: mpsc::Sender<StompItem>,
    cancel: CancellationToken,
    activity: Arc<Activity>,
}

/// CONNECT frame for the given configuration and credentials.
pub fn connect_frame(config: &ClientConfig, credentials: &Credentials) -> Frame {
    let mut f = Frame::new(command::CONNECT)
        .header("accept-version", "1.1")
        .header("host", config.host.as_str());
    if let Some(hb) = config.heartbeat.header_value() {
        f = f.header("heart-beat", hb);
    }
    if let Some(login) = &credentials.login {
        f = f.header("login", login.as_str());
    }
    if let Some(passcode) = &credentials.passcode {
        f = f.header("passcode", passcode.as_str());
    }
    f
}

fn ack_frame(cmd: &str, message: &Frame) -> Frame {
    let mut f = Frame::new(cmd);
    for key in ["subscription", "message-id"] {
        if let Some(v) = message.get_header(key) {
            f = f.header(key, v);
        }
    }
    // STOMP 1.2 brokers identify the delivery by the MESSAGE `ack` header.
    if let Some(ack_id) = message.get_header("ack") {
        f = f.header("id", ack_id);
    }
    f
}

impl Session {
    /// Open a transport, write CONNECT and start the I/O task.
    ///
    /// Transport failures are returned as-is. The handshake is not awaited
    /// here: CONNECTED arrives on `SessionEvents::inbound` like any other
    /// frame.
    pub async fn open(
        connector: &dyn Connector,
        config: &ClientConfig,
        credentials: &Credentials,
    ) -> Result<(Session, SessionEvents)> {
        let transport = connector.connect().await?;
        let mut framed = Framed::new(transport, StompCodec::new());
        framed
            .send(StompItem::Frame(connect_frame(config, credentials)))
            .await?;

        let (out_tx, out_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (disc_tx, disc_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let activity = Arc::new(Activity::new());
        activity.mark_sent();

        tokio::spawn(io_loop(
            framed,
            out_rx,
            in_tx,
            cancel.clone(),
            activity.clone(),
            disc_tx,
        ));

        let session = Session {
            outbound: out_tx,
            cancel,
            activity,
        };
        let events = SessionEvents {
            inbound: in_rx,
            disconnected: disc_rx,
        };
        Ok((session, events))
    }

    /// Whether frames can still be queued on this session.
    pub fn is_open(&self) -> bool {
        !self.cancel.is_cancelled() && !self.outbound.is_closed()
    }

    pub async fn send_frame(&self, frame: Frame) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(StompError::Disconnected);
        }
        self.outbound
            .send(StompItem::Frame(frame))
            .await
            .map_err(|_| StompError::Disconnected)
    }

    /// Write a SEND frame with exactly the given headers.
    pub async fn send(&self, headers: Vec<(String, String)>, body: Vec<u8>) -> Result<()> {
        let frame = Frame {
            command: command::SEND.to_string(),
            headers,
            body,
        };
        self.send_frame(frame).await
    }

    pub async fn subscribe(&self, sub: &Subscription) -> Result<()> {
        debug!(id = %sub.id(), destination = sub.destination(), "SUBSCRIBE");
        self.send_frame(sub.subscribe_frame()).await
    }

    pub async fn unsubscribe(&self, sub: &Subscription) -> Result<()> {
        debug!(id = %sub.id(), "UNSUBSCRIBE");
        self.send_frame(sub.unsubscribe_frame()).await
    }

    /// Acknowledge `message`, echoing its `subscription` and `message-id`.
    pub async fn ack(&self, message: &Frame) -> Result<()> {
        self.send_frame(ack_frame(command::ACK, message)).await
    }

    pub async fn nack(&self, message: &Frame) -> Result<()> {
        self.send_frame(ack_frame(command::NACK, message)).await
    }

    /// Send DISCONNECT (best effort) and stop the I/O task. Idempotent.
    pub fn close(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self
            .outbound
            .try_send(StompItem::Frame(Frame::new(command::DISCONNECT)));
        self.cancel.cancel();
    }

    pub(crate) fn outbound(&self) -> mpsc::Sender<StompItem> {
        self.outbound.clone()
    }

    pub(crate) fn activity(&self) -> Arc<Activity> {
        self.activity.clone()
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

async fn flush_queued(
    framed: &mut Framed<BoxedTransport, StompCodec>,
    out_rx: &mut mpsc::Receiver<StompItem>,
) -> io::Result<()> {
    while let Ok(item) = out_rx.try_recv() {
        framed.feed(item).await?;
    }
    framed.flush().await?;
    framed.close().await
}

async fn io_loop(
    mut framed: Framed<BoxedTransport, StompCodec>,
    mut out_rx: mpsc::Receiver<StompItem>,
    in_tx: mpsc::UnboundedSender<StompItem>,
    cancel: CancellationToken,
    activity: Arc<Activity>,
    disconnected: oneshot::Sender<DisconnectReason>,
) {
    let reason = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                match tokio::time::timeout(CLOSE_FLUSH_TIMEOUT, flush_queued(&mut framed, &mut out_rx)).await {
                    Ok(Err(e)) => debug!(error = %e, "flush on close failed"),
                    Err(_) => debug!("flush on close timed out"),
                    Ok(Ok(())) => {}
                }
                break DisconnectReason::Closed;
            }
            maybe = out_rx.recv() => {
                // The session handle keeps a sender alive, so `None` only
                // happens once every handle is gone.
                let Some(item) = maybe else { break DisconnectReason::Closed };
                if let Err(e) = framed.send(item).await {
                    break DisconnectReason::Error(e);
                }
                activity.mark_sent();
            }
            item = framed.next() => {
                match item {
                    Some(Ok(item)) => {
                        activity.mark_received();
                        if in_tx.send(item).is_err() {
                            break DisconnectReason::Closed;
                        }
                    }
                    Some(Err(e)) => break DisconnectReason::Error(e),
                    None => break DisconnectReason::Eof,
                }
            }
        }
    };

    // Handles must observe the session as closed before the report lands.
    drop(out_rx);
    drop(in_tx);
    match &reason {
        DisconnectReason::Closed => info!("session closed"),
        other => warn!(reason = %other, "transport disconnected"),
    }
    let _ = disconnected.send(reason);
}
