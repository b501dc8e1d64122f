//! The upstream resolver table: per-endpoint health, failure
//! counting with exponential cooldown, and latency-ordered selection.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::MUTEX_POISON_MESSAGE;
use std::net::SocketAddr;

/// Consecutive failures before an upstream is taken out of rotation.
pub const FAILURE_THRESHOLD: u32 = 3;

/// Cooldown ceiling for a failed upstream.
pub const COOLDOWN_MAX: Duration = Duration::from_secs(60);

/// Weights for the rolling latency average: `ema = 0.8 * ema + 0.2 *
/// observed`.
const EMA_KEEP: f64 = 0.8;
const EMA_BLEND: f64 = 0.2;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Health {
    Healthy,
    /// Out of cooldown and allowed exactly one in-flight probe query.
    Probing,
    Failed,
}

/// A state change worth telling observers about.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Transition {
    Failed,
    Recovered,
}

#[derive(Debug, Clone)]
pub struct UpstreamState {
    pub address: SocketAddr,
    pub health: Health,
    pub consecutive_failures: u32,
    pub retry_at: Option<Instant>,
    pub latency_ema_ms: f64,
}

impl UpstreamState {
    fn new(address: SocketAddr) -> Self {
        Self {
            address,
            health: Health::Healthy,
            consecutive_failures: 0,
            retry_at: None,
            latency_ema_ms: 0.0,
        }
    }
}

/// A convenience wrapper around an `UpstreamPool` which lets it be
/// shared between tasks.
#[derive(Debug, Clone)]
pub struct SharedUpstreamPool {
    pool: Arc<Mutex<UpstreamPool>>,
}

impl SharedUpstreamPool {
    pub fn new(addresses: &[SocketAddr]) -> Self {
        Self {
            pool: Arc::new(Mutex::new(UpstreamPool::new(addresses))),
        }
    }

    pub fn select(&self, exclude: &[SocketAddr], now: Instant) -> Option<SocketAddr> {
        self.pool
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .select(exclude, now)
    }

    pub fn record_success(&self, address: SocketAddr, latency: Duration) -> Option<Transition> {
        self.pool
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .record_success(address, latency)
    }

    pub fn record_failure(&self, address: SocketAddr, now: Instant) -> Option<Transition> {
        self.pool
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .record_failure(address, now)
    }

    /// Swap in a new upstream list (config reload), keeping the
    /// health and latency state of endpoints that stay.
    pub fn set_upstreams(&self, addresses: &[SocketAddr]) {
        self.pool
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .set_upstreams(addresses)
    }

    pub fn snapshot(&self) -> Vec<UpstreamState> {
        self.pool.lock().expect(MUTEX_POISON_MESSAGE).snapshot()
    }
}

/// The upstream endpoints in declared order.
///
/// You probably want to use `SharedUpstreamPool` instead.
#[derive(Debug, Clone)]
pub struct UpstreamPool {
    upstreams: Vec<UpstreamState>,
}

impl UpstreamPool {
    pub fn new(addresses: &[SocketAddr]) -> Self {
        Self {
            upstreams: addresses.iter().copied().map(UpstreamState::new).collect(),
        }
    }

    /// Pick the next upstream for a query attempt: the healthy
    /// endpoint with the lowest latency average, declared order
    /// breaking ties.  When no healthy endpoint is left, a failed one
    /// whose cooldown has passed may go out as a single probe.
    pub fn select(&mut self, exclude: &[SocketAddr], now: Instant) -> Option<SocketAddr> {
        let mut best: Option<(f64, usize)> = None;
        for (index, upstream) in self.upstreams.iter().enumerate() {
            if upstream.health != Health::Healthy || exclude.contains(&upstream.address) {
                continue;
            }
            // strict less-than keeps the earlier declaration on ties
            if best.is_none_or(|(ema, _)| upstream.latency_ema_ms < ema) {
                best = Some((upstream.latency_ema_ms, index));
            }
        }

        if let Some((_, index)) = best {
            return Some(self.upstreams[index].address);
        }

        for upstream in &mut self.upstreams {
            if upstream.health == Health::Failed
                && !exclude.contains(&upstream.address)
                && upstream.retry_at.is_some_and(|at| at <= now)
            {
                upstream.health = Health::Probing;
                return Some(upstream.address);
            }
        }

        None
    }

    pub fn record_success(&mut self, address: SocketAddr, latency: Duration) -> Option<Transition> {
        let upstream = self.find(address)?;

        let was = upstream.health;
        upstream.health = Health::Healthy;
        upstream.consecutive_failures = 0;
        upstream.retry_at = None;
        upstream.latency_ema_ms =
            EMA_KEEP * upstream.latency_ema_ms + EMA_BLEND * latency.as_secs_f64() * 1000.0;

        (was != Health::Healthy).then_some(Transition::Recovered)
    }

    pub fn record_failure(&mut self, address: SocketAddr, now: Instant) -> Option<Transition> {
        let upstream = self.find(address)?;

        upstream.consecutive_failures += 1;
        if upstream.consecutive_failures < FAILURE_THRESHOLD && upstream.health == Health::Healthy {
            return None;
        }

        let was = upstream.health;
        upstream.health = Health::Failed;
        let cooldown = Duration::from_secs(
            2u64.saturating_pow(upstream.consecutive_failures.min(16)),
        )
        .min(COOLDOWN_MAX);
        upstream.retry_at = Some(now + cooldown);

        (was != Health::Failed).then_some(Transition::Failed)
    }

    pub fn set_upstreams(&mut self, addresses: &[SocketAddr]) {
        let old = std::mem::take(&mut self.upstreams);
        self.upstreams = addresses
            .iter()
            .map(|address| {
                old.iter()
                    .find(|upstream| upstream.address == *address)
                    .cloned()
                    .unwrap_or_else(|| UpstreamState::new(*address))
            })
            .collect();
    }

    pub fn snapshot(&self) -> Vec<UpstreamState> {
        self.upstreams.clone()
    }

    fn find(&mut self, address: SocketAddr) -> Option<&mut UpstreamState> {
        self.upstreams
            .iter_mut()
            .find(|upstream| upstream.address == address)
    }
}
