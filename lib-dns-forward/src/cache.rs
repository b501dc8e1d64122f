//! The response cache: a TTL-aware, size-bounded LRU over whole DNS
//! responses, including negative (NXDOMAIN / NODATA) answers.

use priority_queue::PriorityQueue;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dns_types::protocol::types::*;

use crate::settings::CacheSettings;
use crate::MUTEX_POISON_MESSAGE;

/// What a cached response is indexed by.  The name is lowercased at
/// parse time, so case-insensitive matching falls out of equality.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct CacheKey {
    pub name: DomainName,
    pub qtype: QueryType,
    pub qclass: QueryClass,
}

impl CacheKey {
    pub fn from_question(question: &Question) -> Self {
        Self {
            name: question.name.clone(),
            qtype: question.qtype,
            qclass: question.qclass,
        }
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.name.to_dotted_string(),
            self.qclass,
            self.qtype
        )
    }
}

/// Counters and gauges describing the cache.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub size_bytes: usize,
}

/// A convenience wrapper around a `Cache` which lets it be shared
/// between tasks.
///
/// Invoking `clone` on a `SharedCache` gives a new instance which
/// refers to the same underlying `Cache` object.
#[derive(Debug, Clone)]
pub struct SharedCache {
    cache: Arc<Mutex<Cache>>,
}

impl SharedCache {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            cache: Arc::new(Mutex::new(Cache::new(settings))),
        }
    }

    /// Get a fresh entry, bumping it to most-recently-used.  The TTLs
    /// in the returned response are decremented by the entry's age.
    pub fn lookup(&self, key: &CacheKey) -> Option<Message> {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .lookup(key, Instant::now())
    }

    /// Insert a response.  Uncacheable responses (zero effective TTL,
    /// or bigger than the whole cache) are ignored.
    pub fn insert(&self, key: &CacheKey, response: &Message) {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .insert(key, response, Instant::now());
    }

    /// Drop all expired entries, returning how many went.
    pub fn remove_expired(&self) -> usize {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .remove_expired(Instant::now())
    }

    /// Drop every entry for the domain or anything under it.
    pub fn flush_domain(&self, name: &DomainName) -> usize {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .invalidate(|key| key.name == *name || key.name.is_subdomain_of(name))
    }

    /// Drop everything.
    pub fn clear(&self) -> usize {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).clear()
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).stats()
    }

    /// Replace the size and TTL limits, e.g. after a config reload.
    /// An over-limit cache shrinks on the next insert or sweep.
    pub fn set_limits(&self, settings: &CacheSettings) {
        self.cache.lock().expect(MUTEX_POISON_MESSAGE).limits = settings.clone();
    }

    /// Write all unexpired entries to `path` as JSON.
    pub fn save(&self, path: &Path) -> io::Result<usize> {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .save(path, Instant::now())
    }

    /// Load entries saved by `save`, dropping any that expired in the
    /// meantime.  Returns how many entries were restored.
    pub fn load(&self, path: &Path) -> io::Result<usize> {
        self.cache
            .lock()
            .expect(MUTEX_POISON_MESSAGE)
            .load(path, Instant::now())
    }
}

/// Caching for whole responses, keyed by question.
///
/// You probably want to use `SharedCache` instead.
///
/// Entries are indexed by a `HashMap` with two priority queues
/// alongside: one ordered by last access (for LRU eviction when the
/// byte budget runs out) and one by expiry time (so sweeps only look
/// at what is actually due).
#[derive(Debug, Clone)]
pub struct Cache {
    /// INVARIANT: the keys here are exactly the keys in both queues.
    entries: HashMap<CacheKey, CacheEntry>,

    access_priority: PriorityQueue<CacheKey, Reverse<Instant>>,
    expiry_priority: PriorityQueue<CacheKey, Reverse<Instant>>,

    /// INVARIANT: the sum of the entries' `size_bytes`.
    size_bytes: usize,

    limits: CacheSettings,

    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    /// The response as the upstream produced it (minus its id, which
    /// is rewritten per waiter).  TTLs are as-inserted; they get
    /// decremented by the entry's age on the way out.
    response: Message,

    inserted_at: Instant,
    expires_at: Instant,
    hits: u64,
    size_bytes: usize,
    negative: bool,
}

impl Cache {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            entries: HashMap::new(),
            access_priority: PriorityQueue::new(),
            expiry_priority: PriorityQueue::new(),
            size_bytes: 0,
            limits: settings.clone(),
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
        }
    }

    /// Get an entry if it is present and fresh, expiring it lazily if
    /// it is present and stale.
    ///
    /// A hit moves the key to most-recently-used and returns the
    /// response with every TTL reduced by the entry's age, so clients
    /// see TTLs count down across repeated hits.
    pub fn lookup(&mut self, key: &CacheKey, now: Instant) -> Option<Message> {
        let expired = match self.entries.get(key) {
            None => {
                self.misses += 1;
                return None;
            }
            Some(entry) => entry.expires_at <= now,
        };

        if expired {
            self.remove_key(key);
            self.expirations += 1;
            self.misses += 1;
            return None;
        }

        self.hits += 1;
        let Some(entry) = self.entries.get_mut(key) else {
            return None;
        };
        entry.hits += 1;

        let mut response = entry.response.clone();
        decrement_ttls(&mut response, age_seconds(entry.inserted_at, now));

        self.access_priority.change_priority(key, Reverse(now));
        Some(response)
    }

    /// Insert a response under a key, replacing any previous entry
    /// and evicting least-recently-used entries until it fits.
    ///
    /// The effective TTL is the smallest answer TTL (every record TTL
    /// having been clamped to the configured range first), or the
    /// negative-caching TTL for NXDOMAIN / NODATA responses.  A zero
    /// effective TTL means no caching.
    pub fn insert(&mut self, key: &CacheKey, response: &Message, now: Instant) {
        let mut response = response.clone();
        response.header.is_truncated = false;
        clamp_ttls(&mut response, self.limits.min_ttl, self.limits.max_ttl);

        let negative = response.answers.is_empty()
            && matches!(
                response.header.rcode,
                Rcode::NameError | Rcode::NoError
            );

        let effective_ttl = if let Some(min_answer) = response.answers.iter().map(|rr| rr.ttl).min()
        {
            min_answer
        } else if negative {
            // RFC 2308: bounded by the SOA MINIMUM when one is present
            match response.soa_minimum() {
                Some(minimum) => minimum.min(self.limits.negative_ttl),
                None => self.limits.negative_ttl,
            }
        } else {
            0
        };

        if effective_ttl == 0 {
            return;
        }

        self.insert_prepared(key, response, u64::from(effective_ttl), negative, now);
    }

    fn insert_prepared(
        &mut self,
        key: &CacheKey,
        response: Message,
        ttl_seconds: u64,
        negative: bool,
        now: Instant,
    ) {
        let size_bytes = match response.clone().into_octets() {
            Ok(octets) => octets.len(),
            Err(_) => return,
        };
        if size_bytes > self.limits.max_size_bytes {
            return;
        }

        // the later writer wins: same key replaces outright
        if self.entries.contains_key(key) {
            self.remove_key(key);
        }

        while self.size_bytes + size_bytes > self.limits.max_size_bytes {
            if !self.remove_least_recently_used() {
                break;
            }
        }

        let entry = CacheEntry {
            response,
            inserted_at: now,
            expires_at: now + Duration::from_secs(ttl_seconds),
            hits: 0,
            size_bytes,
            negative,
        };

        self.access_priority.push(key.clone(), Reverse(now));
        self.expiry_priority
            .push(key.clone(), Reverse(entry.expires_at));
        self.size_bytes += size_bytes;
        self.entries.insert(key.clone(), entry);
    }

    /// Delete all expired entries.  Returns the number deleted.
    pub fn remove_expired(&mut self, now: Instant) -> usize {
        let mut removed = 0;

        while let Some((key, Reverse(expires_at))) = self
            .expiry_priority
            .peek()
            .map(|(key, priority)| (key.clone(), *priority))
        {
            if expires_at > now {
                break;
            }
            self.remove_key(&key);
            removed += 1;
        }

        self.expirations += removed as u64;
        removed
    }

    /// Delete all entries whose key matches the predicate.  Returns
    /// the number deleted.
    pub fn invalidate<F: Fn(&CacheKey) -> bool>(&mut self, predicate: F) -> usize {
        let doomed: Vec<CacheKey> = self
            .entries
            .keys()
            .filter(|key| predicate(key))
            .cloned()
            .collect();

        for key in &doomed {
            self.remove_key(key);
        }

        doomed.len()
    }

    /// Delete everything.  Returns the number deleted.
    pub fn clear(&mut self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        self.access_priority.clear();
        self.expiry_priority.clear();
        self.size_bytes = 0;
        removed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            expirations: self.expirations,
            entries: self.entries.len(),
            size_bytes: self.size_bytes,
        }
    }

    pub fn save(&self, path: &Path, now: Instant) -> io::Result<usize> {
        let mut persisted = Vec::with_capacity(self.entries.len());

        for (key, entry) in &self.entries {
            if entry.expires_at <= now {
                continue;
            }

            // save with TTLs already aged, so a restore behaves like
            // an insert made at load time
            let mut response = entry.response.clone();
            decrement_ttls(&mut response, age_seconds(entry.inserted_at, now));
            let Ok(octets) = response.into_octets() else {
                continue;
            };

            persisted.push(PersistedEntry {
                name: key.name.to_dotted_string(),
                qtype: key.qtype.into(),
                qclass: key.qclass.into(),
                response: octets,
                remaining_ttl: entry.expires_at.duration_since(now).as_secs(),
                negative: entry.negative,
            });
        }

        let count = persisted.len();
        let encoded = serde_json::to_vec(&persisted)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        fs::write(path, encoded)?;
        Ok(count)
    }

    pub fn load(&mut self, path: &Path, now: Instant) -> io::Result<usize> {
        let raw = fs::read(path)?;
        let persisted: Vec<PersistedEntry> = serde_json::from_slice(&raw)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;

        let mut restored = 0;
        for entry in persisted {
            if entry.remaining_ttl == 0 {
                continue;
            }
            let Some(name) = DomainName::from_dotted_string(&entry.name) else {
                continue;
            };
            let Ok(response) = Message::from_octets(&entry.response) else {
                continue;
            };

            let key = CacheKey {
                name,
                qtype: entry.qtype.into(),
                qclass: entry.qclass.into(),
            };
            self.insert_prepared(&key, response, entry.remaining_ttl, entry.negative, now);
            restored += 1;
        }

        Ok(restored)
    }

    /// Remove the least-recently-used entry.  Returns whether there
    /// was one.
    fn remove_least_recently_used(&mut self) -> bool {
        if let Some((key, _)) = self.access_priority.pop() {
            self.expiry_priority.remove(&key);
            if let Some(entry) = self.entries.remove(&key) {
                self.size_bytes -= entry.size_bytes;
            }
            self.evictions += 1;
            true
        } else {
            false
        }
    }

    fn remove_key(&mut self, key: &CacheKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.size_bytes -= entry.size_bytes;
        }
        self.access_priority.remove(key);
        self.expiry_priority.remove(key);
    }
}

/// What one cache entry looks like on disk.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    name: String,
    qtype: u16,
    qclass: u16,
    response: Vec<u8>,
    remaining_ttl: u64,
    negative: bool,
}

fn age_seconds(inserted_at: Instant, now: Instant) -> u32 {
    u32::try_from(now.saturating_duration_since(inserted_at).as_secs()).unwrap_or(u32::MAX)
}

fn clamp_ttls(response: &mut Message, min_ttl: u32, max_ttl: u32) {
    for rr in response
        .answers
        .iter_mut()
        .chain(response.authority.iter_mut())
        .chain(response.additional.iter_mut())
    {
        rr.ttl = rr.ttl.clamp(min_ttl, max_ttl);
    }
}

fn decrement_ttls(response: &mut Message, age: u32) {
    for rr in response
        .answers
        .iter_mut()
        .chain(response.authority.iter_mut())
        .chain(response.additional.iter_mut())
    {
        rr.ttl = rr.ttl.saturating_sub(age);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dns_types::protocol::types::test_util::*;
    use std::net::Ipv4Addr;

    fn limits(max_size_bytes: usize) -> CacheSettings {
        CacheSettings {
            max_size_bytes,
            min_ttl: 0,
            max_ttl: 86400,
            negative_ttl: 300,
            persist_path: None,
        }
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::from_question(&question(name, RecordType::A))
    }

    fn positive_response(name: &str, ttl: u32) -> Message {
        let query = Message::from_question(0, question(name, RecordType::A));
        let mut response = query.make_response();
        let mut rr = a_record(name, Ipv4Addr::new(192, 0, 2, 1));
        rr.ttl = ttl;
        response.answers.push(rr);
        response
    }

    fn nxdomain_response(name: &str, soa_minimum: Option<u32>) -> Message {
        let query = Message::from_question(0, question(name, RecordType::A));
        let mut response = query.make_response();
        response.header.rcode = Rcode::NameError;
        if let Some(minimum) = soa_minimum {
            response.authority.push(soa_record("example.com.", minimum));
        }
        response
    }

    #[test]
    fn cache_put_can_get() {
        let mut cache = Cache::new(&limits(1 << 20));
        let now = Instant::now();

        cache.insert(&key("example.com."), &positive_response("example.com.", 300), now);

        let hit = cache.lookup(&key("example.com."), now).unwrap();
        assert_eq!(1, hit.answers.len());
        assert_eq!(300, hit.answers[0].ttl);
        assert_invariants(&cache);
    }

    #[test]
    fn lookup_decrements_ttls_by_age() {
        let mut cache = Cache::new(&limits(1 << 20));
        let now = Instant::now();

        cache.insert(&key("example.com."), &positive_response("example.com.", 300), now);

        let hit = cache
            .lookup(&key("example.com."), now + Duration::from_secs(100))
            .unwrap();
        assert_eq!(200, hit.answers[0].ttl);

        // still strictly positive right up to the end of life
        let hit = cache
            .lookup(&key("example.com."), now + Duration::from_secs(299))
            .unwrap();
        assert_eq!(1, hit.answers[0].ttl);
    }

    #[test]
    fn expired_entry_is_a_miss_and_is_dropped() {
        let mut cache = Cache::new(&limits(1 << 20));
        let now = Instant::now();

        cache.insert(&key("example.com."), &positive_response("example.com.", 300), now);

        assert_eq!(
            None,
            cache.lookup(&key("example.com."), now + Duration::from_secs(300))
        );
        assert_eq!(0, cache.stats().entries);
        assert_eq!(1, cache.stats().expirations);
        assert_eq!(1, cache.stats().misses);
        assert_invariants(&cache);
    }

    #[test]
    fn zero_ttl_is_not_cached() {
        let mut cache = Cache::new(&limits(1 << 20));
        let now = Instant::now();

        cache.insert(&key("example.com."), &positive_response("example.com.", 0), now);

        assert_eq!(0, cache.stats().entries);
    }

    #[test]
    fn ttls_are_clamped_on_insert() {
        let mut cache = Cache::new(&CacheSettings {
            min_ttl: 60,
            max_ttl: 3600,
            ..limits(1 << 20)
        });
        let now = Instant::now();

        cache.insert(&key("low.example."), &positive_response("low.example.", 1), now);
        cache.insert(&key("high.example."), &positive_response("high.example.", 100_000), now);

        let low = cache.lookup(&key("low.example."), now).unwrap();
        let high = cache.lookup(&key("high.example."), now).unwrap();
        assert_eq!(60, low.answers[0].ttl);
        assert_eq!(3600, high.answers[0].ttl);
    }

    #[test]
    fn nxdomain_uses_soa_minimum_when_lower() {
        let mut cache = Cache::new(&limits(1 << 20));
        let now = Instant::now();

        cache.insert(&key("gone.example.com."), &nxdomain_response("gone.example.com.", Some(60)), now);

        assert!(cache
            .lookup(&key("gone.example.com."), now + Duration::from_secs(59))
            .is_some());
        assert!(cache
            .lookup(&key("gone.example.com."), now + Duration::from_secs(60))
            .is_none());
    }

    #[test]
    fn nxdomain_without_soa_uses_negative_ttl() {
        let mut cache = Cache::new(&limits(1 << 20));
        let now = Instant::now();

        cache.insert(&key("gone.example.com."), &nxdomain_response("gone.example.com.", None), now);

        assert!(cache
            .lookup(&key("gone.example.com."), now + Duration::from_secs(299))
            .is_some());
        assert!(cache
            .lookup(&key("gone.example.com."), now + Duration::from_secs(300))
            .is_none());
    }

    #[test]
    fn nodata_is_cached_negatively() {
        let mut cache = Cache::new(&limits(1 << 20));
        let now = Instant::now();

        // NOERROR with no answers
        let query = Message::from_question(0, question("example.com.", RecordType::AAAA));
        let response = query.make_response();
        let nodata_key = CacheKey::from_question(&query.questions[0]);

        cache.insert(&nodata_key, &response, now);

        let hit = cache.lookup(&nodata_key, now).unwrap();
        assert_eq!(Rcode::NoError, hit.header.rcode);
        assert!(hit.answers.is_empty());
    }

    #[test]
    fn same_key_overwrites_and_refreshes() {
        let mut cache = Cache::new(&limits(1 << 20));
        let now = Instant::now();

        cache.insert(&key("example.com."), &positive_response("example.com.", 10), now);
        cache.insert(
            &key("example.com."),
            &positive_response("example.com.", 600),
            now + Duration::from_secs(5),
        );

        assert_eq!(1, cache.stats().entries);
        let hit = cache
            .lookup(&key("example.com."), now + Duration::from_secs(30))
            .unwrap();
        assert_eq!(575, hit.answers[0].ttl);
        assert_invariants(&cache);
    }

    #[test]
    fn eviction_keeps_size_within_budget() {
        let sample = positive_response("a0.example.com.", 300);
        let sample_size = sample.clone().into_octets().unwrap().len();

        // room for three entries, give or take name-length jitter
        let mut cache = Cache::new(&limits(sample_size * 3));
        let now = Instant::now();

        for i in 0..10 {
            let name = format!("a{i}.example.com.");
            cache.insert(&key(&name), &positive_response(&name, 300), now + Duration::from_secs(i));
        }

        assert!(cache.stats().size_bytes <= sample_size * 3);
        assert!(cache.stats().entries >= 1);
        assert!(cache.stats().evictions >= 7);
        assert_invariants(&cache);
    }

    #[test]
    fn eviction_is_least_recently_used_first() {
        let sample = positive_response("a0.example.com.", 300);
        let sample_size = sample.clone().into_octets().unwrap().len();

        let mut cache = Cache::new(&limits(sample_size * 2 + sample_size / 2));
        let t0 = Instant::now();

        cache.insert(&key("a0.example.com."), &positive_response("a0.example.com.", 300), t0);
        cache.insert(
            &key("a1.example.com."),
            &positive_response("a1.example.com.", 300),
            t0 + Duration::from_secs(1),
        );

        // touch a0 so a1 becomes the LRU
        cache.lookup(&key("a0.example.com."), t0 + Duration::from_secs(2));

        cache.insert(
            &key("a2.example.com."),
            &positive_response("a2.example.com.", 300),
            t0 + Duration::from_secs(3),
        );

        assert!(cache
            .lookup(&key("a0.example.com."), t0 + Duration::from_secs(4))
            .is_some());
        assert!(cache
            .lookup(&key("a1.example.com."), t0 + Duration::from_secs(4))
            .is_none());
        assert_invariants(&cache);
    }

    #[test]
    fn oversized_response_is_not_cached() {
        let mut cache = Cache::new(&limits(16));
        let now = Instant::now();

        cache.insert(&key("example.com."), &positive_response("example.com.", 300), now);

        assert_eq!(0, cache.stats().entries);
        assert_invariants(&cache);
    }

    #[test]
    fn remove_expired_only_touches_the_dead() {
        let mut cache = Cache::new(&limits(1 << 20));
        let now = Instant::now();

        cache.insert(&key("short.example."), &positive_response("short.example.", 10), now);
        cache.insert(&key("long.example."), &positive_response("long.example.", 300), now);

        assert_eq!(1, cache.remove_expired(now + Duration::from_secs(60)));
        assert_eq!(1, cache.stats().entries);
        assert!(cache
            .lookup(&key("long.example."), now + Duration::from_secs(60))
            .is_some());
        assert_invariants(&cache);
    }

    #[test]
    fn flush_domain_takes_subdomains_too() {
        let mut cache = Cache::new(&limits(1 << 20));
        let now = Instant::now();

        for name in ["example.com.", "www.example.com.", "example.org."] {
            cache.insert(&key(name), &positive_response(name, 300), now);
        }

        let apex = domain("example.com.");
        let removed = cache.invalidate(|k| k.name == apex || k.name.is_subdomain_of(&apex));

        assert_eq!(2, removed);
        assert_eq!(1, cache.stats().entries);
        assert!(cache.lookup(&key("example.org."), now).is_some());
        assert_invariants(&cache);
    }

    #[test]
    fn clear_empties_everything() {
        let mut cache = Cache::new(&limits(1 << 20));
        let now = Instant::now();

        for name in ["a.example.", "b.example."] {
            cache.insert(&key(name), &positive_response(name, 300), now);
        }

        assert_eq!(2, cache.clear());
        assert_eq!(0, cache.stats().entries);
        assert_eq!(0, cache.stats().size_bytes);
        assert_invariants(&cache);
    }

    #[test]
    fn save_and_load_roundtrip_discards_expired() {
        let dir = std::env::temp_dir().join(format!("relayed-cache-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("cache.json");

        let mut cache = Cache::new(&limits(1 << 20));
        let now = Instant::now();
        cache.insert(&key("keep.example."), &positive_response("keep.example.", 300), now);
        cache.insert(&key("drop.example."), &positive_response("drop.example.", 30), now);

        // saved 60s in, so drop.example is already dead
        let saved = cache.save(&path, now + Duration::from_secs(60)).unwrap();
        assert_eq!(1, saved);

        let mut restored = Cache::new(&limits(1 << 20));
        let later = now + Duration::from_secs(120);
        assert_eq!(1, restored.load(&path, later).unwrap());

        let hit = restored.lookup(&key("keep.example."), later).unwrap();
        // 60s of age was baked in at save time
        assert_eq!(240, hit.answers[0].ttl);
        assert!(restored.lookup(&key("drop.example."), later).is_none());
        assert_invariants(&restored);

        fs::remove_dir_all(&dir).unwrap();
    }

    fn assert_invariants(cache: &Cache) {
        assert_eq!(
            cache.size_bytes,
            cache.entries.values().map(|e| e.size_bytes).sum::<usize>()
        );

        assert_eq!(cache.entries.len(), cache.access_priority.len());
        assert_eq!(cache.entries.len(), cache.expiry_priority.len());

        for key in cache.entries.keys() {
            assert!(cache.access_priority.get(key).is_some());
            assert!(cache.expiry_priority.get(key).is_some());
        }

        for (key, entry) in &cache.entries {
            assert_eq!(
                Some(Reverse(entry.expires_at)),
                cache.expiry_priority.get(key).map(|(_, p)| *p)
            );
        }
    }
}
