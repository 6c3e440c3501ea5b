use std::time::Duration;
use thiserror::Error;

use crate::frame::Frame;

/// Details of an ERROR frame that rejected the CONNECT handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// The `message` header, or an empty string if the broker sent none.
    pub message: String,
    /// Body of the ERROR frame, usually a longer description.
    pub body: Vec<u8>,
    /// The full ERROR frame as received.
    pub frame: Frame,
}

impl ServerError {
    pub fn from_frame(frame: Frame) -> Self {
        Self {
            message: frame.get_header("message").unwrap_or_default().to_string(),
            body: frame.body.clone(),
            frame,
        }
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.body.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.message, String::from_utf8_lossy(&self.body))
        }
    }
}

/// Errors returned by client and session operations.
#[derive(Error, Debug)]
pub enum StompError {
    /// I/O-level error (transport could not be opened, codec failure)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Protocol-level error
    #[error("protocol error: {0}")]
    Protocol(String),
    /// No live session exists to carry the request.
    #[error("not connected to the broker")]
    Disconnected,
    /// The reconnect policy gave up.
    #[error("gave up reconnecting after {attempts} retries")]
    ExceededRetryCount { attempts: u32 },
    /// The broker answered CONNECT with an ERROR frame.
    #[error("broker rejected connection: {0}")]
    ServerRejected(ServerError),
    /// No CONNECTED frame arrived in time.
    #[error("no CONNECTED frame within {0:?}")]
    ConnectTimeout(Duration),
    /// The client was closed by the application.
    #[error("client closed")]
    Closed,
}

impl StompError {
    /// Whether this is a transport failure worth another attempt.
    /// `ServerRejected` is retried too unless `fail_on_rejection` is set.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StompError::Io(_)
                | StompError::Protocol(_)
                | StompError::Disconnected
                | StompError::ConnectTimeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StompError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_error_uses_message_header_and_body() {
        let frame = Frame::new("ERROR")
            .header("message", "bad login")
            .set_body(b"credentials rejected".to_vec());
        let err = ServerError::from_frame(frame);
        assert_eq!(err.message, "bad login");
        assert_eq!(err.to_string(), "bad login: credentials rejected");
    }

    #[test]
    fn only_transport_failures_are_retryable() {
        let io = StompError::Io(std::io::Error::from(std::io::ErrorKind::ConnectionRefused));
        assert!(io.is_retryable());
        assert!(StompError::ConnectTimeout(Duration::from_secs(1)).is_retryable());
        assert!(StompError::Disconnected.is_retryable());
        assert!(!StompError::Closed.is_retryable());
        let rejected = StompError::ServerRejected(ServerError::from_frame(Frame::new("ERROR")));
        assert!(!rejected.is_retryable());
    }
}
