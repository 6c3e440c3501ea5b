use futures::future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::StompItem;

/// Multiple of the negotiated receive interval after which a silent broker
/// is considered gone.
pub const RECEIVE_GRACE_FACTOR: u32 = 2;

/// Local heartbeat preferences, in milliseconds.
///
/// `cx` is how often we promise to send something, `cy` how often we want to
/// hear from the broker. Zero disables that direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub enabled: bool,
    pub cx: u64,
    pub cy: u64,
}

impl HeartbeatConfig {
    pub fn new(cx: u64, cy: u64) -> Self {
        Self {
            enabled: true,
            cx,
            cy,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            cx: 0,
            cy: 0,
        }
    }

    /// Value for the CONNECT `heart-beat` header, or `None` when heartbeats
    /// are disabled and the header must be omitted.
    pub fn header_value(&self) -> Option<String> {
        self.enabled.then(|| format!("{},{}", self.cx, self.cy))
    }

    /// Negotiated timing given the broker's CONNECTED `heart-beat` header.
    pub fn negotiate(&self, server_header: Option<&str>) -> HeartbeatTiming {
        if !self.enabled {
            return HeartbeatTiming::default();
        }
        let (sx, sy) = server_header.map(parse_heartbeat_header).unwrap_or((0, 0));
        let (send, receive) = negotiate_heartbeats(self.cx, self.cy, sx, sy);
        HeartbeatTiming { send, receive }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::new(10_000, 10_000)
    }
}

/// Outcome of heartbeat negotiation. `None` disables a direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatTiming {
    pub send: Option<Duration>,
    pub receive: Option<Duration>,
}

/// Parse the STOMP `heart-beat` header value (format: "cx,cy").
///
/// Missing or unparsable fields default to `0`.
pub fn parse_heartbeat_header(header: &str) -> (u64, u64) {
    let mut parts = header.split(',');
    let mut next = || {
        parts
            .next()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0)
    };
    let cx = next();
    let cy = next();
    (cx, cy)
}

/// Negotiate heartbeat intervals between client and server.
///
/// Returns `(send, receive)`. The send interval is `max(client_out,
/// server_in)` and the receive interval `max(client_in, server_out)`; a zero
/// on either side of a direction disables it.
pub fn negotiate_heartbeats(
    client_out: u64,
    client_in: u64,
    server_out: u64,
    server_in: u64,
) -> (Option<Duration>, Option<Duration>) {
    let pick = |ours: u64, theirs: u64| {
        (ours != 0 && theirs != 0).then(|| Duration::from_millis(ours.max(theirs)))
    };
    (pick(client_out, server_in), pick(client_in, server_out))
}

/// Timestamps of the last bytes written and read on a session.
#[derive(Debug)]
pub struct Activity {
    origin: Instant,
    last_sent: AtomicU64,
    last_received: AtomicU64,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_sent: AtomicU64::new(0),
            last_received: AtomicU64::new(0),
        }
    }

    fn now_millis(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    pub fn mark_sent(&self) {
        self.last_sent.store(self.now_millis(), Ordering::SeqCst);
    }

    pub fn mark_received(&self) {
        self.last_received.store(self.now_millis(), Ordering::SeqCst);
    }

    pub fn since_sent(&self) -> Duration {
        let last = self.last_sent.load(Ordering::SeqCst);
        Duration::from_millis(self.now_millis().saturating_sub(last))
    }

    pub fn since_received(&self) -> Duration {
        let last = self.last_received.load(Ordering::SeqCst);
        Duration::from_millis(self.now_millis().saturating_sub(last))
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a connection alive and notices when the broker goes quiet.
///
/// The monitor runs as its own task. Dropping it, calling [`stop`] or
/// cancelling the session token it was started with all end the task.
///
/// [`stop`]: HeartbeatMonitor::stop
#[derive(Debug, Default)]
pub struct HeartbeatMonitor {
    token: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatMonitor {
    /// A monitor that was never started. Stopping it is a no-op.
    pub fn idle() -> Self {
        Self::default()
    }

    /// Start monitoring with the negotiated `timing`.
    ///
    /// Heartbeats are queued on `outbound`. When the receive watchdog fires
    /// the `session` token is cancelled, which tears the session down like
    /// any other transport failure.
    pub fn start(
        outbound: mpsc::Sender<StompItem>,
        activity: Arc<Activity>,
        timing: HeartbeatTiming,
        session: &CancellationToken,
    ) -> Self {
        if timing.send.is_none() && timing.receive.is_none() {
            debug!("heartbeats disabled in both directions");
            return Self::idle();
        }
        let token = session.child_token();
        let task = tokio::spawn(run(
            outbound,
            activity,
            timing,
            token.clone(),
            session.clone(),
        ));
        Self {
            token: Some(token),
            task: Some(task),
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    pub fn stop(&mut self) {
        if let Some(token) = self.token.take() {
            token.cancel();
        }
        self.task = None;
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn ticker(period: Option<Duration>) -> Option<Interval> {
    period.map(|p| {
        let mut interval = tokio::time::interval(p);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    })
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => future::pending::<()>().await,
    }
}

async fn run(
    outbound: mpsc::Sender<StompItem>,
    activity: Arc<Activity>,
    timing: HeartbeatTiming,
    token: CancellationToken,
    session: CancellationToken,
) {
    debug!(send = ?timing.send, receive = ?timing.receive, "heartbeat monitor started");
    let mut send_tick = ticker(timing.send);
    let mut watch_tick = ticker(timing.receive.map(|d| d / 2));
    let deadline = timing.receive.map(|d| d * RECEIVE_GRACE_FACTOR);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tick(&mut send_tick) => {
                let Some(interval) = timing.send else { continue };
                if activity.since_sent() >= interval
                    && outbound.send(StompItem::Heartbeat).await.is_err()
                {
                    break;
                }
            }
            _ = tick(&mut watch_tick) => {
                let Some(deadline) = deadline else { continue };
                let silent = activity.since_received();
                if silent > deadline {
                    warn!(?silent, "no data from broker, closing session");
                    session.cancel();
                    break;
                }
            }
        }
    }
    debug!("heartbeat monitor stopped");
}
