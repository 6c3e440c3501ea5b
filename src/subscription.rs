use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use crate::frame::{Frame, command};

/// Subscription acknowledgement modes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AckMode {
    #[default]
    Auto,
    Client,
    ClientIndividual,
}

impl AckMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckMode::Auto => "auto",
            AckMode::Client => "client",
            AckMode::ClientIndividual => "client-individual",
        }
    }

    /// Whether MESSAGE frames on this subscription must be ACKed or NACKed.
    pub fn requires_ack(&self) -> bool {
        !matches!(self, AckMode::Auto)
    }
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AckMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto" => Ok(AckMode::Auto),
            "client" => Ok(AckMode::Client),
            "client-individual" => Ok(AckMode::ClientIndividual),
            other => Err(format!("unknown ack mode '{}'", other)),
        }
    }
}

/// Client-side subscription id. Also used as the wire `id` header, so it
/// stays the same across reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubscriptionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(SubscriptionId)
    }
}

pub type HandlerFuture = BoxFuture<'static, bool>;

/// Message callback. Receives the MESSAGE frame (the payload is
/// `frame.body`) and resolves to `true` to ACK or `false` to NACK.
pub type Handler = Arc<dyn Fn(Frame) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure as a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Frame) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = bool> + Send + 'static,
{
    Arc::new(move |frame| -> HandlerFuture { Box::pin(f(frame)) })
}

/// One desired subscription. Owned by the [`SubscriptionRegistry`]; clones
/// handed to the application share the handler.
#[derive(Clone)]
pub struct Subscription {
    id: SubscriptionId,
    destination: String,
    ack: AckMode,
    extra_headers: Vec<(String, String)>,
    handler: Handler,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn ack(&self) -> AckMode {
        self.ack
    }

    pub fn extra_headers(&self) -> &[(String, String)] {
        &self.extra_headers
    }

    pub fn handler(&self) -> Handler {
        self.handler.clone()
    }

    /// SUBSCRIBE frame for this subscription. Extra headers follow the
    /// standard ones, so brokers that read the first occurrence still see our
    /// `id`, `destination` and `ack`.
    pub fn subscribe_frame(&self) -> Frame {
        Frame::new(command::SUBSCRIBE)
            .header("id", self.id.to_string())
            .header("destination", self.destination.as_str())
            .header("ack", self.ack.as_str())
            .headers(self.extra_headers.iter().cloned())
    }

    pub fn unsubscribe_frame(&self) -> Frame {
        Frame::new(command::UNSUBSCRIBE).header("id", self.id.to_string())
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .field("ack", &self.ack)
            .field("extra_headers", &self.extra_headers)
            .finish_non_exhaustive()
    }
}

/// Table of desired subscriptions keyed by client-side id.
///
/// The registry is the source of truth for what should be subscribed; after
/// every reconnect the wire is rebuilt from it. Ids are allocated from 1 and
/// never handed out twice by the same registry.
#[derive(Debug)]
pub struct SubscriptionRegistry {
    next_id: u64,
    entries: HashMap<SubscriptionId, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    pub fn add(
        &mut self,
        destination: &str,
        ack: AckMode,
        extra_headers: &[(String, String)],
        handler: Handler,
    ) -> Subscription {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        let sub = Subscription {
            id,
            destination: destination.to_string(),
            ack,
            extra_headers: extra_headers.to_vec(),
            handler,
        };
        self.entries.insert(id, sub.clone());
        sub
    }

    pub fn remove(&mut self, id: SubscriptionId) -> Option<Subscription> {
        self.entries.remove(&id)
    }

    pub fn get(&self, id: SubscriptionId) -> Option<&Subscription> {
        self.entries.get(&id)
    }

    /// Look up by the raw `subscription` header of a MESSAGE frame.
    pub fn get_by_header(&self, value: &str) -> Option<&Subscription> {
        value.parse().ok().and_then(|id| self.get(id))
    }

    /// Entries in ascending id order, i.e. the order they were created.
    pub fn iter(&self) -> impl Iterator<Item = &Subscription> {
        let mut subs: Vec<_> = self.entries.values().collect();
        subs.sort_by_key(|s| s.id);
        subs.into_iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
