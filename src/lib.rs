//! Async STOMP 1.1 client that keeps a single broker connection alive.
//!
//! [`Client`] is the entry point: it connects with retries, negotiates
//! heartbeats, routes MESSAGE frames to callback subscriptions with ACK/NACK
//! handling, and transparently reconnects and resubscribes when the
//! transport drops.

pub mod backoff;
pub mod client;
pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod heartbeat;
pub mod parser;
pub mod session;
pub mod subscription;
pub mod transport;

pub use backoff::Backoff;
pub use client::{Client, ConnectionState, SendOptions};
pub use codec::{FrameBuffer, StompCodec, StompItem, build_frame};
pub use config::{ClientConfig, ErrorHandler, FrameHook};
pub use error::{Result, ServerError, StompError};
pub use frame::Frame;
pub use heartbeat::{HeartbeatConfig, HeartbeatTiming, negotiate_heartbeats, parse_heartbeat_header};
pub use session::{Credentials, DisconnectReason, Session};
pub use subscription::{AckMode, Handler, Subscription, SubscriptionId, handler};
pub use transport::{BoxedTransport, Connector, TcpConnector, Transport};
