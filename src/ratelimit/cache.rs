use super::source::ClientLimit;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Bounded, TTL'd cache of client limits. A cached `None` records that the
/// client is unlimited.
pub struct LimitCache {
    entries: DashMap<String, CachedLimit>,
    ttl_us: u64,
    max_entries: usize,
}

struct CachedLimit {
    limit: Option<ClientLimit>,
    inserted_us: u64,
    last_access: AtomicU64,
}

impl LimitCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl_us: ttl.as_micros() as u64,
            max_entries: max_entries.max(1),
        }
    }

    /// `Some(entry)` on a fresh hit, `None` on a miss or an expired entry.
    pub fn get(&self, client_id: &str) -> Option<Option<ClientLimit>> {
        let now = now_us();
        let entry = self.entries.get(client_id)?;
        if now.saturating_sub(entry.inserted_us) >= self.ttl_us {
            drop(entry);
            self.entries.remove(client_id);
            return None;
        }
        entry.last_access.store(now, Ordering::Relaxed);
        Some(entry.limit)
    }

    pub fn insert(&self, client_id: &str, limit: Option<ClientLimit>) {
        let now = now_us();
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(client_id) {
            self.evict_expired(now);
            if self.entries.len() >= self.max_entries {
                self.force_evict(now, self.entries.len() + 1 - self.max_entries);
            }
        }
        self.entries.insert(
            client_id.to_string(),
            CachedLimit {
                limit,
                inserted_us: now,
                last_access: AtomicU64::new(now),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries older than the TTL.
    pub fn evict_stale(&self) {
        self.evict_expired(now_us());
    }

    fn evict_expired(&self, now: u64) {
        let ttl = self.ttl_us;
        self.entries
            .retain(|_, v| now.saturating_sub(v.inserted_us) < ttl);
    }

    /// Remove the `count` least recently used entries.
    fn force_evict(&self, now: u64, count: usize) {
        let mut ages: Vec<(String, u64)> = self
            .entries
            .iter()
            .map(|r| {
                let age = now.saturating_sub(r.value().last_access.load(Ordering::Relaxed));
                (r.key().clone(), age)
            })
            .collect();
        ages.sort_unstable_by(|a, b| b.1.cmp(&a.1));
        for (key, _) in ages.into_iter().take(count) {
            self.entries.remove(&key);
        }
    }
}

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}
