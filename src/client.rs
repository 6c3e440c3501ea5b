use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::ClientConfig;
use crate::dispatch::{Dispatcher, Handshake};
use crate::error::{Result, ServerError, StompError};
use crate::frame::Frame;
use crate::session::{Credentials, DisconnectReason, Session, SessionEvents};
use crate::subscription::{AckMode, Handler, Subscription, SubscriptionRegistry, handler};
use crate::transport::{Connector, TcpConnector};

/// Connection lifecycle as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Per-message options for [`Client::send_with`].
#[derive(Debug, Clone)]
pub struct SendOptions {
    /// Extra headers, written after `destination`.
    pub headers: Vec<(String, String)>,
    /// Add `content-length` when the body is non-empty.
    pub content_length: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            headers: Vec::new(),
            content_length: true,
        }
    }
}

impl SendOptions {
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn without_content_length(mut self) -> Self {
        self.content_length = false;
        self
    }
}

/// Why the client stopped for good without being closed.
#[derive(Debug, Clone)]
enum Failure {
    Exhausted(u32),
    Rejected(ServerError),
}

impl Failure {
    fn from_error(e: &StompError) -> Option<Self> {
        match e {
            StompError::ExceededRetryCount { attempts } => Some(Failure::Exhausted(*attempts)),
            StompError::ServerRejected(err) => Some(Failure::Rejected(err.clone())),
            _ => None,
        }
    }

    fn to_error(&self) -> StompError {
        match self {
            Failure::Exhausted(attempts) => StompError::ExceededRetryCount {
                attempts: *attempts,
            },
            Failure::Rejected(err) => StompError::ServerRejected(err.clone()),
        }
    }
}

struct Inner {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    registry: Arc<Mutex<SubscriptionRegistry>>,
    /// Live session. Always locked before `registry`.
    session: Mutex<Option<Session>>,
    credentials: Mutex<Credentials>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    supervising: AtomicBool,
    /// Held by `connect` until the supervisor owns the connection.
    connecting: Mutex<()>,
    /// Shared retry schedule, reset after every successful connect.
    backoff: std::sync::Mutex<Backoff>,
    failure: std::sync::Mutex<Option<Failure>>,
}

/// STOMP client that keeps one broker connection alive.
///
/// The client owns the subscription registry and at most one [`Session`].
/// When the transport drops it reconnects with exponential backoff and
/// re-issues every registered subscription on the new session. Handles are
/// cheap to clone and share the same connection.
///
/// ```no_run
/// use resilient_stomp::{AckMode, Client, ClientConfig};
///
/// # async fn run() -> resilient_stomp::Result<()> {
/// let client = Client::tcp("127.0.0.1:61613", ClientConfig::default());
/// client
///     .subscribe_with("/queue/orders", AckMode::Client, |frame| async move {
///         println!("{}", String::from_utf8_lossy(&frame.body));
///         true
///     })
///     .await?;
/// client.connect(Some("guest"), Some("guest")).await?;
/// client.send("/queue/orders", "hello").await?;
/// client.close().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new(config: ClientConfig, connector: impl Connector) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let backoff = Backoff::new(
            config.reconnect_timeout,
            config.reconnect_max_interval,
            config.reconnect_max_attempts,
        );
        Self {
            inner: Arc::new(Inner {
                config,
                connector: Arc::new(connector),
                registry: Arc::new(Mutex::new(SubscriptionRegistry::new())),
                session: Mutex::new(None),
                credentials: Mutex::new(Credentials::default()),
                state,
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                supervising: AtomicBool::new(false),
                connecting: Mutex::new(()),
                backoff: std::sync::Mutex::new(backoff),
                failure: std::sync::Mutex::new(None),
            }),
        }
    }

    /// Client for a plain TCP broker at `addr` (`host:port`).
    pub fn tcp(addr: impl Into<String>, config: ClientConfig) -> Self {
        Self::new(config, TcpConnector::new(addr))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Connect, retrying per the configured backoff, and restore every
    /// registered subscription.
    ///
    /// Returns once CONNECTED has been received and the subscriptions have
    /// been written. From then on the client reconnects by itself until
    /// [`close`](Self::close) is called or the retry budget runs out.
    pub async fn connect(&self, login: Option<&str>, passcode: Option<&str>) -> Result<()> {
        self.inner.check_usable()?;
        let _guard = self.inner.connecting.lock().await;
        self.inner.check_usable()?;
        *self.inner.credentials.lock().await = Credentials::new(login, passcode);
        if self.inner.supervising.load(Ordering::SeqCst) {
            debug!("connect called on a supervised client");
            return Ok(());
        }

        let disconnected = self.inner.establish().await?;
        self.inner.supervising.store(true, Ordering::SeqCst);
        tokio::spawn(supervise(self.inner.clone(), disconnected));
        Ok(())
    }

    /// Register a subscription and, when connected, SUBSCRIBE right away.
    ///
    /// Subscriptions registered while disconnected are sent as part of the
    /// next successful connect.
    pub async fn subscribe(
        &self,
        destination: &str,
        ack: AckMode,
        extra_headers: &[(String, String)],
        handler: Handler,
    ) -> Result<Subscription> {
        self.inner.check_usable()?;
        let slot = self.inner.session.lock().await;
        let sub = self
            .inner
            .registry
            .lock()
            .await
            .add(destination, ack, extra_headers, handler);
        if let Some(session) = slot.as_ref().filter(|s| s.is_open()) {
            if let Err(e) = session.subscribe(&sub).await {
                debug!(id = %sub.id(), error = %e, "SUBSCRIBE deferred to next connect");
            }
        }
        Ok(sub)
    }

    /// [`subscribe`](Self::subscribe) with an async closure and no extra headers.
    pub async fn subscribe_with<F, Fut>(
        &self,
        destination: &str,
        ack: AckMode,
        f: F,
    ) -> Result<Subscription>
    where
        F: Fn(Frame) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = bool> + Send + 'static,
    {
        self.subscribe(destination, ack, &[], handler(f)).await
    }

    /// Drop a subscription, sending UNSUBSCRIBE when connected.
    pub async fn unsubscribe(&self, sub: &Subscription) -> Result<()> {
        self.inner.check_usable()?;
        let slot = self.inner.session.lock().await;
        let mut registry = self.inner.registry.lock().await;
        if registry.get(sub.id()).is_none() {
            return Err(StompError::Protocol(format!(
                "subscription {} not found",
                sub.id()
            )));
        }
        if let Some(session) = slot.as_ref().filter(|s| s.is_open()) {
            if let Err(e) = session.unsubscribe(sub).await {
                debug!(id = %sub.id(), error = %e, "UNSUBSCRIBE not sent");
            }
        }
        registry.remove(sub.id());
        Ok(())
    }

    /// Send `body` to `destination` with default [`SendOptions`].
    pub async fn send(&self, destination: &str, body: impl Into<Vec<u8>>) -> Result<()> {
        self.send_with(destination, body, SendOptions::default())
            .await
    }

    /// Send `body` to `destination`.
    ///
    /// Fails with [`StompError::Disconnected`] instead of queueing when no
    /// session is live.
    pub async fn send_with(
        &self,
        destination: &str,
        body: impl Into<Vec<u8>>,
        options: SendOptions,
    ) -> Result<()> {
        self.inner.check_usable()?;
        let session = self
            .inner
            .live_session()
            .await
            .ok_or(StompError::Disconnected)?;
        let body = body.into();

        let mut headers = Vec::with_capacity(options.headers.len() + 2);
        headers.push(("destination".to_string(), destination.to_string()));
        let caller_sets_length = options
            .headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("content-length"));
        headers.extend(options.headers);
        if options.content_length && !body.is_empty() && !caller_sets_length {
            headers.push(("content-length".to_string(), body.len().to_string()));
        }
        session.send(headers, body).await
    }

    /// Close the connection and stop reconnecting. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();
        if let Some(session) = self.inner.session.lock().await.take() {
            session.close();
        }
        self.inner.registry.lock().await.clear();
        self.inner.state.send_replace(ConnectionState::Disconnected);
        info!("client closed");
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Snapshot of the registered subscriptions in creation order.
    pub async fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.registry.lock().await.iter().cloned().collect()
    }

    /// Wait until the client stops for good.
    ///
    /// Resolves to `Ok(())` after [`close`](Self::close), or to the error
    /// that ended reconnection (for example
    /// [`StompError::ExceededRetryCount`]).
    pub async fn closed(&self) -> Result<()> {
        self.inner.shutdown.cancelled().await;
        match self.inner.failure() {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }
}

impl Inner {
    fn failure(&self) -> Option<Failure> {
        self.failure
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn check_usable(&self) -> Result<()> {
        if let Some(failure) = self.failure() {
            return Err(failure.to_error());
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(StompError::Closed);
        }
        Ok(())
    }

    fn give_up(&self, err: &StompError) {
        if let Some(failure) = Failure::from_error(err) {
            *self
                .failure
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(failure);
        }
        self.closed.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    fn backoff(&self) -> std::sync::MutexGuard<'_, Backoff> {
        self.backoff
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether `establish` should try again after `err`.
    fn should_retry(&self, err: &StompError) -> bool {
        match err {
            StompError::ServerRejected(_) => !self.config.fail_on_rejection,
            other => other.is_retryable(),
        }
    }

    async fn live_session(&self) -> Option<Session> {
        self.session
            .lock()
            .await
            .as_ref()
            .filter(|s| s.is_open())
            .cloned()
    }

    /// Connect with retries. On success the new session is installed and
    /// the returned receiver reports its eventual disconnect.
    async fn establish(&self) -> Result<oneshot::Receiver<DisconnectReason>> {
        self.state.send_replace(ConnectionState::Connecting);

        let result = loop {
            if self.closed.load(Ordering::SeqCst) {
                break Err(StompError::Closed);
            }
            let err = match self.attempt().await {
                Ok(disconnected) => break Ok(disconnected),
                Err(e) if !self.should_retry(&e) => break Err(e),
                Err(e) => e,
            };
            let (next, retries) = {
                let mut backoff = self.backoff();
                (backoff.next_delay(), backoff.attempts())
            };
            let Some(delay) = next else {
                error!(error = %err, retries, "giving up on broker");
                break Err(StompError::ExceededRetryCount { attempts: retries });
            };
            warn!(error = %err, retry = retries, ?delay, "connect attempt failed");
            tokio::select! {
                _ = self.shutdown.cancelled() => break Err(StompError::Closed),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        if !matches!(result, Err(StompError::Closed)) {
            self.backoff().reset();
        }
        let next = if result.is_ok() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        };
        self.state.send_replace(next);
        result
    }

    /// One connection attempt: transport, CONNECT/CONNECTED, resubscribe.
    async fn attempt(&self) -> Result<oneshot::Receiver<DisconnectReason>> {
        let credentials = self.credentials.lock().await.clone();
        let (session, events) =
            Session::open(self.connector.as_ref(), &self.config, &credentials).await?;
        let SessionEvents {
            inbound,
            disconnected,
        } = events;

        let (handshake_tx, handshake_rx) = oneshot::channel();
        Dispatcher::new(
            session.clone(),
            self.registry.clone(),
            &self.config,
            handshake_tx,
        )
        .spawn(inbound);

        let timeout = self.config.connect_timeout;
        let handshake = tokio::select! {
            _ = self.shutdown.cancelled() => Err(StompError::Closed),
            outcome = tokio::time::timeout(timeout, handshake_rx) => match outcome {
                Ok(Ok(Handshake::Connected)) => Ok(()),
                Ok(Ok(Handshake::Rejected(err))) => Err(StompError::ServerRejected(err)),
                Ok(Err(_)) => Err(StompError::Protocol(
                    "connection closed before CONNECTED".into(),
                )),
                Err(_) => Err(StompError::ConnectTimeout(timeout)),
            },
        };
        if let Err(e) = handshake {
            session.close();
            return Err(e);
        }

        let mut slot = self.session.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            session.close();
            return Err(StompError::Closed);
        }
        let restored = {
            let registry = self.registry.lock().await;
            for sub in registry.iter() {
                if let Err(e) = session.subscribe(sub).await {
                    session.close();
                    return Err(e);
                }
            }
            registry.len()
        };
        if let Some(stale) = slot.replace(session) {
            stale.close();
        }
        info!(subscriptions = restored, "connected to broker");
        Ok(disconnected)
    }
}

/// Watch the live session and reconnect whenever it drops.
async fn supervise(inner: Arc<Inner>, mut disconnected: oneshot::Receiver<DisconnectReason>) {
    loop {
        let reason = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            reason = &mut disconnected => reason,
        };
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        match reason {
            Ok(reason) => warn!(%reason, "connection lost, reconnecting"),
            Err(_) => warn!("connection lost, reconnecting"),
        }
        if let Some(stale) = inner.session.lock().await.take() {
            stale.close();
        }
        inner.state.send_replace(ConnectionState::Disconnected);

        match inner.establish().await {
            Ok(next) => disconnected = next,
            Err(StompError::Closed) => break,
            Err(e) => {
                error!(error = %e, "reconnect failed permanently");
                inner.give_up(&e);
                break;
            }
        }
    }
    debug!("supervisor stopped");
}
