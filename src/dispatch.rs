//! The per-session dispatch loop.
//!
//! A single task consumes the session's inbound queue and handles one item
//! at a time, so ACK/NACK frames always go out in delivery order.

use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::codec::StompItem;
use crate::config::{ClientConfig, ErrorHandler, FrameHook};
use crate::error::ServerError;
use crate::frame::{Frame, command};
use crate::heartbeat::{HeartbeatConfig, HeartbeatMonitor};
use crate::session::Session;
use crate::subscription::{Handler, SubscriptionRegistry};

/// How the CONNECT handshake ended, as seen by the dispatch loop.
#[derive(Debug)]
pub enum Handshake {
    Connected,
    Rejected(ServerError),
}

pub struct Dispatcher {
    session: Session,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    heartbeat: HeartbeatConfig,
    error_handler: Option<ErrorHandler>,
    unhandled: Option<FrameHook>,
    nack_orphans: bool,
    handshake: Option<oneshot::Sender<Handshake>>,
    monitor: HeartbeatMonitor,
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Run a message handler, turning a panic into a NACK-worthy `false`.
pub async fn invoke_handler(handler: Handler, frame: Frame) -> bool {
    match AssertUnwindSafe(async move { handler(frame).await })
        .catch_unwind()
        .await
    {
        Ok(ok) => ok,
        Err(payload) => {
            warn!(panic = panic_message(payload.as_ref()), "message handler panicked");
            false
        }
    }
}

impl Dispatcher {
    /// `handshake` is resolved when CONNECTED or ERROR is seen first; it is
    /// dropped unresolved if the session ends before either.
    pub fn new(
        session: Session,
        registry: Arc<Mutex<SubscriptionRegistry>>,
        config: &ClientConfig,
        handshake: oneshot::Sender<Handshake>,
    ) -> Self {
        Self {
            session,
            registry,
            heartbeat: config.heartbeat,
            error_handler: config.error_handler.clone(),
            unhandled: config.unhandled_frame.clone(),
            nack_orphans: config.nack_orphaned_messages,
            handshake: Some(handshake),
            monitor: HeartbeatMonitor::idle(),
        }
    }

    pub fn spawn(self, inbound: mpsc::UnboundedReceiver<StompItem>) -> JoinHandle<()> {
        tokio::spawn(self.run(inbound))
    }

    /// Process items until the queue closes or the session is cancelled.
    /// Cancellation is observed between items, never mid-handler.
    pub async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<StompItem>) {
        let token = self.session.token().clone();
        loop {
            let item = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                item = inbound.recv() => item,
            };
            let Some(item) = item else { break };
            self.dispatch(item).await;
        }
        self.monitor.stop();
        debug!("dispatch loop finished");
    }

    pub async fn dispatch(&mut self, item: StompItem) {
        let frame = match item {
            StompItem::Heartbeat => {
                trace!("heartbeat from broker");
                return;
            }
            StompItem::Frame(frame) => frame,
        };
        match frame.command.as_str() {
            command::MESSAGE => self.on_message(frame).await,
            command::CONNECTED => self.on_connected(&frame),
            command::ERROR => self.on_error(frame),
            _ => self.on_unhandled(&frame),
        }
    }

    async fn on_message(&mut self, frame: Frame) {
        let sub_header = frame.get_header("subscription").unwrap_or_default();
        let target = {
            let registry = self.registry.lock().await;
            registry
                .get_by_header(sub_header)
                .map(|s| (s.id(), s.ack(), s.handler()))
        };

        let Some((id, ack, handler)) = target else {
            warn!(
                subscription = sub_header,
                message_id = frame.get_header("message-id"),
                "MESSAGE for unknown subscription"
            );
            if self.nack_orphans {
                if let Err(e) = self.session.nack(&frame).await {
                    debug!(error = %e, "could not NACK orphaned message");
                }
            }
            return;
        };

        trace!(%id, message_id = frame.get_header("message-id"), "delivering MESSAGE");
        let delivered = invoke_handler(handler, frame.clone()).await;
        if !ack.requires_ack() {
            return;
        }
        let result = if delivered {
            self.session.ack(&frame).await
        } else {
            self.session.nack(&frame).await
        };
        if let Err(e) = result {
            warn!(%id, error = %e, "could not acknowledge message");
        }
    }

    fn on_connected(&mut self, frame: &Frame) {
        let timing = self.heartbeat.negotiate(frame.get_header("heart-beat"));
        self.monitor.stop();
        self.monitor = HeartbeatMonitor::start(
            self.session.outbound(),
            self.session.activity(),
            timing,
            self.session.token(),
        );
        info!(
            version = frame.get_header("version"),
            server = frame.get_header("server"),
            "CONNECTED"
        );
        if let Some(tx) = self.handshake.take() {
            let _ = tx.send(Handshake::Connected);
        }
    }

    fn on_error(&mut self, frame: Frame) {
        let message = frame.get_header("message").unwrap_or_default();
        warn!(broker_message = message, "ERROR frame from broker");
        if let Some(handler) = &self.error_handler {
            let call = std::panic::catch_unwind(AssertUnwindSafe(|| handler(message, &frame.body)));
            if let Err(payload) = call {
                warn!(panic = panic_message(payload.as_ref()), "error handler panicked");
            }
        }
        if let Some(tx) = self.handshake.take() {
            let _ = tx.send(Handshake::Rejected(ServerError::from_frame(frame)));
        }
    }

    fn on_unhandled(&self, frame: &Frame) {
        match &self.unhandled {
            Some(hook) => hook(frame),
            None => debug!(command = %frame.command, "ignoring frame"),
        }
    }
}
