pub mod cache;
pub mod source;

pub use cache::LimitCache;
pub use source::{source_from_config, ClientLimit, ClientLimitSource, HttpLimitSource, StaticLimitSource};

use crate::config::RateLimitConfig;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// How often expired limit-cache entries are swept.
const CACHE_GC_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The client has no limit.
    Unlimited,
    Admitted,
    Rejected,
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Admission::Rejected)
    }
}

/// Per-client request counters with a periodic global reset.
///
/// A client is admitted while its counter is `<= requests` for its limit, so
/// a limit of N admits N + 1 requests between resets. The reset replaces the
/// whole counter table with an empty one; in-flight increments against the
/// old table are lost with it.
pub struct RateLimiter {
    counters: ArcSwap<DashMap<String, AtomicI64>>,
    cache: LimitCache,
    source: Arc<dyn ClientLimitSource>,
    reset_interval: Duration,
    last_reset_us: AtomicU64,
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitConfig, source: Arc<dyn ClientLimitSource>) -> Self {
        Self {
            counters: ArcSwap::from_pointee(DashMap::new()),
            cache: LimitCache::new(Duration::from_secs(cfg.cache_ttl_secs), cfg.cache_max_entries),
            source,
            reset_interval: Duration::from_secs(cfg.reset_interval_secs),
            last_reset_us: AtomicU64::new(now_us()),
        }
    }

    /// Limit for `client_id`, from the cache or the source. Lookup failures
    /// admit the request and are not cached.
    async fn limit_for(&self, client_id: &str) -> Option<ClientLimit> {
        if let Some(cached) = self.cache.get(client_id) {
            return cached;
        }
        match self.source.fetch(client_id).await {
            Ok(limit) => {
                self.cache.insert(client_id, limit);
                limit
            }
            Err(e) => {
                tracing::warn!(client = client_id, error = %e, "rate_limit: limit lookup failed, admitting");
                metrics::counter!("portico_rate_limit_lookup_errors_total").increment(1);
                None
            }
        }
    }

    /// Admission decision without counting the request.
    pub async fn is_admitted(&self, client_id: &str) -> Admission {
        let Some(limit) = self.limit_for(client_id).await else {
            return Admission::Unlimited;
        };
        if self.count(client_id) <= limit.requests {
            Admission::Admitted
        } else {
            Admission::Rejected
        }
    }

    /// Count one admitted request for `client_id`.
    pub fn increment(&self, client_id: &str) {
        let table = self.counters.load();
        if let Some(c) = table.get(client_id) {
            c.value().fetch_add(1, Ordering::Relaxed);
            return;
        }
        table
            .entry(client_id.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .value()
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Admission check followed by the increment for admitted requests.
    pub async fn admit(&self, client_id: &str) -> Admission {
        let decision = self.is_admitted(client_id).await;
        match decision {
            Admission::Rejected => {
                metrics::counter!("portico_rate_limit_rejected_total").increment(1);
            }
            _ => {
                self.increment(client_id);
                metrics::counter!("portico_rate_limit_allowed_total").increment(1);
            }
        }
        decision
    }

    pub fn count(&self, client_id: &str) -> i64 {
        self.counters
            .load()
            .get(client_id)
            .map(|c| c.value().load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Drop every client counter at once.
    pub fn reset(&self) {
        self.counters.store(Arc::new(DashMap::new()));
        self.last_reset_us.store(now_us(), Ordering::Relaxed);
    }

    /// Whole seconds until the next scheduled reset, at least 1.
    pub fn seconds_until_reset(&self) -> u64 {
        let elapsed_us = now_us().saturating_sub(self.last_reset_us.load(Ordering::Relaxed));
        let interval_us = self.reset_interval.as_micros() as u64;
        let remaining_us = interval_us.saturating_sub(elapsed_us);
        remaining_us.div_ceil(1_000_000).max(1)
    }

    pub fn tracked_clients(&self) -> usize {
        self.counters.load().len()
    }

    /// Spawn the periodic counter reset. Stops when `shutdown` is notified.
    pub fn start_reset_task(self: &Arc<Self>, shutdown: Arc<Notify>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(limiter.reset_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let clients = limiter.tracked_clients();
                        limiter.reset();
                        tracing::debug!(clients, "rate_limit: counters reset");
                    }
                    _ = shutdown.notified() => break,
                }
            }
        });
    }

    /// Spawn the limit-cache sweeper.
    pub fn start_gc(self: &Arc<Self>, shutdown: Arc<Notify>) {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(CACHE_GC_INTERVAL_SECS));
            loop {
                tokio::select! {
                    _ = interval.tick() => limiter.cache.evict_stale(),
                    _ = shutdown.notified() => break,
                }
            }
        });
    }
}

fn now_us() -> u64 {
    static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_micros() as u64
}
