//! The event bus: a non-blocking fan-out of query records and cache /
//! server notices to whoever subscribes (log sinks, metric exporters,
//! dashboards).
//!
//! Publishing never waits.  A subscriber that falls behind the
//! channel capacity loses the oldest events and sees
//! `RecvError::Lagged(n)` with its personal dropped count - slow
//! observers cannot push back on the resolution hot path.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::resolver::Transport;

/// How many events the bus buffers per subscriber before the oldest
/// fall off.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum Event {
    Query(QueryRecord),
    Cache(CacheNotice),
    Server(ServerNotice),
}

/// One record per completed resolution.
#[derive(Debug, Clone, Serialize)]
pub struct QueryRecord {
    pub timestamp: DateTime<Utc>,
    pub request_id: Uuid,
    pub client: IpAddr,
    pub transport: Transport,
    pub qname: String,
    pub qtype: String,
    pub rcode: String,
    pub answers: usize,
    pub response_time_ms: f64,
    pub cache_hit: bool,
    pub upstream: Option<SocketAddr>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CacheNotice {
    Cleared { count: usize },
    Flushed { count: usize },
    Evicted { count: usize },
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerNotice {
    Started,
    Stopped,
    UpstreamFailed { upstream: SocketAddr },
    UpstreamRecovered { upstream: SocketAddr },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Send an event to all current subscribers.  With no subscribers
    /// the event just evaporates.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}
