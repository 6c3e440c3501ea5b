use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::frame::Frame;
use crate::heartbeat::HeartbeatConfig;

/// Callback for ERROR frames: `(message header, body)`.
pub type ErrorHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Callback for frames the dispatch loop has no route for.
pub type FrameHook = Arc<dyn Fn(&Frame) + Send + Sync>;

/// Client configuration.
///
/// Built with `ClientConfig::default()` and the `with_*` methods:
///
/// ```
/// use resilient_stomp::{ClientConfig, HeartbeatConfig};
/// use std::time::Duration;
///
/// let config = ClientConfig::default()
///     .with_reconnect_max_attempts(5)
///     .with_reconnect_timeout(Duration::from_millis(500))
///     .with_heartbeat(HeartbeatConfig::new(4000, 4000));
/// assert_eq!(config.reconnect_max_attempts, Some(5));
/// ```
#[derive(Clone)]
pub struct ClientConfig {
    /// Virtual host sent in the CONNECT `host` header.
    pub host: String,
    /// Retries allowed after a failed connect; `None` retries forever.
    pub reconnect_max_attempts: Option<u32>,
    /// Initial delay between connection attempts.
    pub reconnect_timeout: Duration,
    /// Ceiling for the growing retry delay.
    pub reconnect_max_interval: Duration,
    /// How long to wait for CONNECTED after the transport opens.
    pub connect_timeout: Duration,
    pub heartbeat: HeartbeatConfig,
    /// NACK MESSAGE frames whose subscription is unknown instead of dropping
    /// them silently.
    pub nack_orphaned_messages: bool,
    /// Stop retrying when the broker answers CONNECT with ERROR. Off by
    /// default, so a rejection is retried like any other failed attempt.
    pub fail_on_rejection: bool,
    pub error_handler: Option<ErrorHandler>,
    pub unhandled_frame: Option<FrameHook>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "/".to_string(),
            reconnect_max_attempts: None,
            reconnect_timeout: Duration::from_secs(1),
            reconnect_max_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            heartbeat: HeartbeatConfig::default(),
            nack_orphaned_messages: false,
            fail_on_rejection: false,
            error_handler: None,
            unhandled_frame: None,
        }
    }
}

impl ClientConfig {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Negative values mean "retry forever".
    pub fn with_reconnect_max_attempts(mut self, attempts: i64) -> Self {
        self.reconnect_max_attempts = u32::try_from(attempts).ok();
        self
    }

    pub fn with_reconnect_timeout(mut self, timeout: Duration) -> Self {
        self.reconnect_timeout = timeout;
        self
    }

    pub fn with_reconnect_max_interval(mut self, ceiling: Duration) -> Self {
        self.reconnect_max_interval = ceiling;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn with_nack_orphaned_messages(mut self, nack: bool) -> Self {
        self.nack_orphaned_messages = nack;
        self
    }

    pub fn with_fail_on_rejection(mut self, fail: bool) -> Self {
        self.fail_on_rejection = fail;
        self
    }

    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &[u8]) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn with_unhandled_frame<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Frame) + Send + Sync + 'static,
    {
        self.unhandled_frame = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("host", &self.host)
            .field("reconnect_max_attempts", &self.reconnect_max_attempts)
            .field("reconnect_timeout", &self.reconnect_timeout)
            .field("reconnect_max_interval", &self.reconnect_max_interval)
            .field("connect_timeout", &self.connect_timeout)
            .field("heartbeat", &self.heartbeat)
            .field("nack_orphaned_messages", &self.nack_orphaned_messages)
            .field("fail_on_rejection", &self.fail_on_rejection)
            .field("error_handler", &self.error_handler.is_some())
            .field("unhandled_frame", &self.unhandled_frame.is_some())
            .finish()
    }
}
