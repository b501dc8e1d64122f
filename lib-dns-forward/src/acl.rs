//! Client access control: network allow/deny lists and a per-client
//! token-bucket rate limiter.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::settings::SecuritySettings;
use crate::MUTEX_POISON_MESSAGE;

/// Buckets which have not been touched for this long are dropped by
/// `sweep_idle`, so spoofed source addresses cannot grow the map
/// without bound.
pub const BUCKET_IDLE_TTL: Duration = Duration::from_secs(5 * 60);

/// Hard cap on tracked clients; at the cap the stalest bucket is
/// evicted to make room.
const BUCKET_MAX: usize = 65536;

/// Whether a client address passes the network lists: the block list
/// is checked first and any match denies; then the allow list, where
/// a match permits.  With no match the client is denied, unless the
/// allow list is empty, in which case everything not blocked is
/// allowed.
pub fn client_permitted(security: &SecuritySettings, client: IpAddr) -> bool {
    if security
        .blocked_networks
        .iter()
        .any(|net| net.contains(&client))
    {
        return false;
    }

    if security.allowed_networks.is_empty() {
        return true;
    }

    security
        .allowed_networks
        .iter()
        .any(|net| net.contains(&client))
}

/// A convenience wrapper around a `RateLimiter` which lets it be
/// shared between tasks.
#[derive(Debug, Clone, Default)]
pub struct SharedRateLimiter {
    limiter: Arc<Mutex<RateLimiter>>,
}

impl SharedRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spend one token from the client's bucket if it has one.
    pub fn try_consume(&self, client: IpAddr, limit_per_minute: u32, now: Instant) -> bool {
        self.limiter
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .try_consume(client, limit_per_minute, now)
    }

    /// Drop buckets idle for longer than `BUCKET_IDLE_TTL`.  Returns
    /// how many were dropped.
    pub fn sweep_idle(&self, now: Instant) -> usize {
        self.limiter
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .sweep_idle(now)
    }
}

/// Token buckets keyed by client IP.
///
/// Each bucket holds up to `limit_per_minute` tokens and refills at
/// `limit_per_minute / 60` tokens per second, so the limit is a
/// rolling window rather than a calendar minute: a client can burst
/// its full allowance and then sustain one sixtieth of it per second.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: HashMap<IpAddr, TokenBucket>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_consume(&mut self, client: IpAddr, limit_per_minute: u32, now: Instant) -> bool {
        if limit_per_minute == 0 {
            return true;
        }

        let capacity = f64::from(limit_per_minute);

        if self.buckets.len() >= BUCKET_MAX && !self.buckets.contains_key(&client) {
            self.evict_stalest();
        }

        let bucket = self.buckets.entry(client).or_insert(TokenBucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = capacity.min(bucket.tokens + elapsed * capacity / 60.0);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn sweep_idle(&mut self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) <= BUCKET_IDLE_TTL);
        before - self.buckets.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.buckets.len()
    }

    fn evict_stalest(&mut self) {
        if let Some(client) = self
            .buckets
            .iter()
            .min_by_key(|(_, bucket)| bucket.last_refill)
            .map(|(client, _)| *client)
        {
            self.buckets.remove(&client);
        }
    }
}
