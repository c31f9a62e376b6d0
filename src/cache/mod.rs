//! # Stage: Tiered Result Cache
//!
//! ## Responsibility
//! Memoise the outcome of every `(fingerprint, tier)` attempt in two levels:
//! a bounded in-process map and an optional [`store::DurableStore`].
//!
//! ## Guarantees
//! - Reads are served from memory first, then lazily from the durable level
//!   (a durable hit is promoted into memory).
//! - An expired entry is a miss and is removed from both levels when seen.
//! - Durable writes run in the background; callers never wait on disk or
//!   network to record an outcome.
//! - [`TieredCache::invalidate_all`] is a barrier: it waits for in-progress
//!   durable writes, bumps the cache generation, and no write captured before
//!   the bump can land afterwards.
//! - Durable failures trip a circuit breaker; while it is open the cache runs
//!   memory-only and reports itself as degraded.
//!
//! ## NOT Responsible For
//! - Choosing which tier to run (that belongs to `orchestrator`)
//! - Deduplicating concurrent computations (that belongs to `inflight`)

use crate::breaker::{CircuitBreaker, CircuitBreakerError, CircuitStatus};
use crate::fingerprint::Fingerprint;
use crate::{Outcome, OutcomeKind, TierId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tracing::{debug, info, warn};

#[cfg(feature = "redis-store")]
pub mod redis_store;
pub mod store;

use store::DurableStore;

/// Cache key: one slot per fingerprint per tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    /// Fingerprint digest.
    pub digest: String,
    /// Tier the outcome belongs to.
    pub tier: TierId,
}

impl CacheKey {
    /// Key for `fp` at `tier`.
    pub fn new(fp: &Fingerprint, tier: TierId) -> Self {
        Self {
            digest: fp.digest().to_string(),
            tier,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.digest, self.tier)
    }
}

/// A memoised tier outcome.
///
/// Persisted as JSON; fields added later must carry `#[serde(default)]` so
/// older documents keep loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Fingerprint digest.
    pub fingerprint: String,
    /// Canonical query text, kept for inspection.
    #[serde(default)]
    pub query: String,
    /// Tier that produced the outcome.
    pub tier: TierId,
    /// The memoised outcome.
    pub outcome: Outcome,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
    /// When the entry stops being valid; `None` never expires.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// Tier the declined cascade started from. Only set on
    /// [`TierId::Declined`] entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_tier: Option<TierId>,
}

impl CacheEntry {
    /// Build an entry created now, expiring after `ttl` (`None` = never).
    pub fn new(fp: &Fingerprint, tier: TierId, outcome: Outcome, ttl: Option<Duration>) -> Self {
        let created_at = Utc::now();
        let expires_at = ttl.and_then(|ttl| {
            chrono::Duration::from_std(ttl)
                .ok()
                .and_then(|d| created_at.checked_add_signed(d))
        });
        Self {
            fingerprint: fp.digest().to_string(),
            query: fp.canonical().to_string(),
            tier,
            outcome,
            created_at,
            expires_at,
            start_tier: None,
        }
    }

    /// Record the tier the cascade started from.
    pub fn with_start_tier(mut self, start: TierId) -> Self {
        self.start_tier = Some(start);
        self
    }

    /// The key this entry is stored under.
    pub fn key(&self) -> CacheKey {
        CacheKey {
            digest: self.fingerprint.clone(),
            tier: self.tier,
        }
    }

    /// Whether the entry is past its expiry at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Lifetime of cached outcomes per tier.
///
/// `None` means the entry never expires. Failures are cached too, with short
/// lifetimes, so a known-bad tier is skipped on repeat queries without
/// pinning a transient outage forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TtlPolicy {
    /// Symbolic outcomes. Deterministic, so forever by default.
    pub symbolic: Option<Duration>,
    /// Computational outcomes.
    pub computational: Option<Duration>,
    /// Reasoning outcomes.
    pub reasoning: Option<Duration>,
    /// The polite decline stored under [`TierId::Declined`].
    pub declined: Option<Duration>,
    /// Any [`Outcome::Unavailable`], whatever the tier.
    pub unavailable: Option<Duration>,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            symbolic: None,
            computational: Some(Duration::from_secs(7 * 24 * 3600)),
            reasoning: Some(Duration::from_secs(24 * 3600)),
            declined: Some(Duration::from_secs(60)),
            unavailable: Some(Duration::from_secs(30)),
        }
    }
}

impl TtlPolicy {
    /// Build a policy from second counts, where `0` means "never expires".
    pub fn from_secs(
        symbolic: u64,
        computational: u64,
        reasoning: u64,
        declined: u64,
        unavailable: u64,
    ) -> Self {
        let ttl = |s: u64| (s > 0).then(|| Duration::from_secs(s));
        Self {
            symbolic: ttl(symbolic),
            computational: ttl(computational),
            reasoning: ttl(reasoning),
            declined: ttl(declined),
            unavailable: ttl(unavailable),
        }
    }

    /// Lifetime of `outcome` produced at `tier`.
    pub fn ttl_for(&self, tier: TierId, outcome: &Outcome) -> Option<Duration> {
        if tier == TierId::Declined {
            return self.declined;
        }
        if outcome.kind() == OutcomeKind::Unavailable {
            return self.unavailable;
        }
        match tier {
            TierId::Symbolic => self.symbolic,
            TierId::Computational => self.computational,
            TierId::Reasoning => self.reasoning,
            TierId::Declined => self.declined,
        }
    }
}

/// Point-in-time cache figures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    /// Entries currently held in memory.
    pub memory_entries: usize,
    /// Entries evicted from memory to respect the capacity bound.
    pub evictions: u64,
    /// Durable-level operations that failed.
    pub store_errors: u64,
    /// `true` while the durable level is bypassed.
    pub degraded: bool,
    /// Durable backend label, or `"memory"` when there is none.
    pub backend: String,
}

struct Slot {
    entry: Arc<CacheEntry>,
    generation: u64,
    last_access: u64,
}

/// Invalidation barrier. Durable writes hold it shared; invalidation holds
/// it exclusively.
struct Gate {
    generation: u64,
    /// Durable entries created before this instant are stale.
    cutoff: Option<DateTime<Utc>>,
}

struct Inner {
    memory: DashMap<CacheKey, Slot>,
    max_memory_entries: usize,
    policy: TtlPolicy,
    store: Option<Arc<dyn DurableStore>>,
    breaker: CircuitBreaker,
    gate: RwLock<Gate>,
    generation: AtomicU64,
    tick: AtomicU64,
    evictions: AtomicU64,
    store_errors: AtomicU64,
    pending_writes: AtomicU64,
    writes_idle: Notify,
}

/// Two-level outcome cache. Cheap to clone; clones share state.
///
/// ## Usage
///
/// ```no_run
/// use tokio_math_cascade::{fingerprint, Outcome, TierId, TieredCache, TtlPolicy};
/// # #[tokio::main]
/// # async fn main() {
/// let cache = TieredCache::memory_only(TtlPolicy::default(), 512);
/// let fp = fingerprint("2+2");
///
/// cache.put(&fp, TierId::Symbolic, Outcome::solved("4", "arithmetic"));
/// assert!(cache.get(&fp, TierId::Symbolic).await.is_some());
/// # }
/// ```
#[derive(Clone)]
pub struct TieredCache {
    inner: Arc<Inner>,
}

impl TieredCache {
    /// A cache without a durable level.
    pub fn memory_only(policy: TtlPolicy, max_memory_entries: usize) -> Self {
        Self::build(policy, max_memory_entries, None, default_breaker())
    }

    /// A cache backed by `store`.
    pub fn with_store(
        policy: TtlPolicy,
        max_memory_entries: usize,
        store: Arc<dyn DurableStore>,
    ) -> Self {
        Self::build(policy, max_memory_entries, Some(store), default_breaker())
    }

    /// A cache backed by `store` with a custom breaker around it.
    pub fn with_store_and_breaker(
        policy: TtlPolicy,
        max_memory_entries: usize,
        store: Arc<dyn DurableStore>,
        breaker: CircuitBreaker,
    ) -> Self {
        Self::build(policy, max_memory_entries, Some(store), breaker)
    }

    fn build(
        policy: TtlPolicy,
        max_memory_entries: usize,
        store: Option<Arc<dyn DurableStore>>,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                memory: DashMap::new(),
                max_memory_entries: max_memory_entries.max(1),
                policy,
                store,
                breaker,
                gate: RwLock::new(Gate {
                    generation: 0,
                    cutoff: None,
                }),
                generation: AtomicU64::new(0),
                tick: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
                store_errors: AtomicU64::new(0),
                pending_writes: AtomicU64::new(0),
                writes_idle: Notify::new(),
            }),
        }
    }

    /// The lifetime policy in force.
    pub fn policy(&self) -> &TtlPolicy {
        &self.inner.policy
    }

    /// Outcome cached for `fp` at `tier`, if any and still valid.
    pub async fn get(&self, fp: &Fingerprint, tier: TierId) -> Option<Outcome> {
        self.lookup(&CacheKey::new(fp, tier)).await
    }

    /// Outcome cached under `key`: memory first, then the durable level.
    pub async fn lookup(&self, key: &CacheKey) -> Option<Outcome> {
        self.lookup_entry(key).await.map(|e| e.outcome.clone())
    }

    /// Cached decline for `fp`, honoured only when the declined cascade
    /// started at or before `start`. A decline from a later start says
    /// nothing about the tiers it skipped.
    pub async fn lookup_decline(&self, fp: &Fingerprint, start: TierId) -> Option<Outcome> {
        let key = CacheKey::new(fp, TierId::Declined);
        let entry = self.lookup_entry(&key).await?;
        match entry.start_tier {
            Some(declined_from) if declined_from <= start => Some(entry.outcome.clone()),
            other => {
                debug!(key = %key, declined_from = ?other, start = %start, "decline does not cover this start");
                None
            }
        }
    }

    async fn lookup_entry(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        if let Some(entry) = self.peek_entry(key) {
            return Some(entry);
        }
        self.load_durable(key).await
    }

    /// Memory-only lookup. Never awaits, so it is safe to call while holding
    /// a synchronous lock.
    pub fn peek_memory(&self, key: &CacheKey) -> Option<Outcome> {
        self.peek_entry(key).map(|e| e.outcome.clone())
    }

    fn peek_entry(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let inner = &self.inner;
        let generation = inner.generation.load(Ordering::SeqCst);

        // `expired` is false when the slot is from an older generation
        let expired = match inner.memory.get_mut(key) {
            None => return None,
            Some(mut slot) => {
                let current = slot.generation == generation;
                if current && !slot.entry.is_expired_at(Utc::now()) {
                    slot.last_access = inner.tick.fetch_add(1, Ordering::Relaxed);
                    return Some(Arc::clone(&slot.entry));
                }
                current
            }
        };

        // a concurrent put may have replaced the slot in between
        inner.memory.remove_if(key, |_, slot| {
            slot.generation != generation || slot.entry.is_expired_at(Utc::now())
        });
        if expired {
            debug!(key = %key, "cache entry expired");
            self.spawn_durable_remove(key.clone());
        }
        None
    }

    /// Record `outcome` for `fp` at `tier`.
    ///
    /// Memory is updated before this returns; the durable write happens in
    /// the background.
    pub fn put(&self, fp: &Fingerprint, tier: TierId, outcome: Outcome) {
        let ttl = self.inner.policy.ttl_for(tier, &outcome);
        self.put_entry(CacheEntry::new(fp, tier, outcome, ttl));
    }

    /// Record the decline of a cascade that started at `start`.
    pub fn put_decline(&self, fp: &Fingerprint, start: TierId, outcome: Outcome) {
        let ttl = self.inner.policy.ttl_for(TierId::Declined, &outcome);
        self.put_entry(CacheEntry::new(fp, TierId::Declined, outcome, ttl).with_start_tier(start));
    }

    fn put_entry(&self, entry: CacheEntry) {
        let ttl = entry.expires_at;
        let entry = Arc::new(entry);
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let key = entry.key();

        self.insert_memory(key.clone(), Arc::clone(&entry), generation);
        debug!(key = %key, expires_at = ?ttl, "cached outcome");

        if self.inner.store.is_some() {
            self.spawn_durable_save(entry, generation);
        }
    }

    /// Drop every entry at both levels.
    ///
    /// Waits for in-progress durable writes to finish first; writes captured
    /// before this call that have not started yet are discarded.
    pub async fn invalidate_all(&self) {
        let inner = &self.inner;
        let mut gate = inner.gate.write().await;
        gate.generation += 1;
        gate.cutoff = Some(Utc::now());
        inner.generation.store(gate.generation, Ordering::SeqCst);
        let dropped = inner.memory.len();
        inner.memory.clear();

        if let Some(store) = &inner.store {
            if let Err(e) = store.clear().await {
                inner.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(backend = store.name(), error = %e, "durable cache clear failed");
            }
        }
        info!(
            generation = gate.generation,
            dropped, "cache invalidated"
        );
    }

    /// Wait until every background durable write issued so far has finished.
    pub async fn flush(&self) {
        loop {
            let idle = self.inner.writes_idle.notified();
            if self.inner.pending_writes.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// `true` while the durable level is bypassed after repeated failures.
    pub fn is_degraded(&self) -> bool {
        self.inner.store.is_some() && self.inner.breaker.status() != CircuitStatus::Closed
    }

    /// Current cache figures.
    pub fn snapshot(&self) -> CacheSnapshot {
        let inner = &self.inner;
        CacheSnapshot {
            memory_entries: inner.memory.len(),
            evictions: inner.evictions.load(Ordering::Relaxed),
            store_errors: inner.store_errors.load(Ordering::Relaxed),
            degraded: self.is_degraded(),
            backend: inner
                .store
                .as_ref()
                .map_or("memory", |s| s.name())
                .to_string(),
        }
    }

    fn insert_memory(&self, key: CacheKey, entry: Arc<CacheEntry>, generation: u64) {
        let inner = &self.inner;
        if !inner.memory.contains_key(&key) && inner.memory.len() >= inner.max_memory_entries {
            // Collect the victim first so no shard guard is held during remove.
            let victim = inner
                .memory
                .iter()
                .min_by_key(|slot| slot.last_access)
                .map(|slot| slot.key().clone());
            if let Some(victim) = victim {
                inner.memory.remove(&victim);
                inner.evictions.fetch_add(1, Ordering::Relaxed);
                debug!(key = %victim, "evicted least recently used entry");
            }
        }
        inner.memory.insert(
            key,
            Slot {
                entry,
                generation,
                last_access: inner.tick.fetch_add(1, Ordering::Relaxed),
            },
        );
    }

    async fn load_durable(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let inner = &self.inner;
        let store = inner.store.as_ref()?;

        let gate = inner.gate.read().await;
        let loaded = inner.breaker.call(|| store.load(key)).await;
        let entry = match loaded {
            Ok(Some(entry)) => entry,
            Ok(None) | Err(CircuitBreakerError::Open) => return None,
            Err(CircuitBreakerError::Failed(e)) => {
                inner.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "durable cache read failed");
                return None;
            }
        };

        let stale = gate.cutoff.is_some_and(|cutoff| entry.created_at < cutoff);
        if stale || entry.is_expired_at(Utc::now()) {
            debug!(key = %key, stale, "discarding durable entry");
            if let Err(e) = store.remove(key).await {
                inner.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "durable cache remove failed");
            }
            return None;
        }

        let entry = Arc::new(entry);
        self.insert_memory(key.clone(), Arc::clone(&entry), gate.generation);
        debug!(key = %key, "promoted durable entry to memory");
        Some(entry)
    }

    fn spawn_durable_save(&self, entry: Arc<CacheEntry>, generation: u64) {
        let cache = self.clone();
        self.spawn_background(async move {
            let inner = &cache.inner;
            let Some(store) = inner.store.as_ref() else {
                return;
            };
            let gate = inner.gate.read().await;
            if gate.generation != generation {
                debug!(key = %entry.key(), "dropping write from before invalidation");
                return;
            }
            match inner.breaker.call(|| store.save(&entry)).await {
                Ok(()) => {}
                Err(CircuitBreakerError::Open) => {
                    debug!(key = %entry.key(), "durable level bypassed (degraded)");
                }
                Err(CircuitBreakerError::Failed(e)) => {
                    inner.store_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %entry.key(), error = %e, "durable cache write failed");
                }
            }
        });
    }

    fn spawn_durable_remove(&self, key: CacheKey) {
        if self.inner.store.is_none() {
            return;
        }
        let cache = self.clone();
        self.spawn_background(async move {
            let inner = &cache.inner;
            let Some(store) = inner.store.as_ref() else {
                return;
            };
            let _gate = inner.gate.read().await;
            if let Err(CircuitBreakerError::Failed(e)) =
                inner.breaker.call(|| store.remove(&key)).await
            {
                inner.store_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "durable cache remove failed");
            }
        });
    }

    /// Run `task` on the current runtime, tracking it for [`TieredCache::flush`].
    fn spawn_background<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("no tokio runtime; skipping durable cache operation");
            return;
        };
        let inner = Arc::clone(&self.inner);
        inner.pending_writes.fetch_add(1, Ordering::SeqCst);
        handle.spawn(async move {
            task.await;
            if inner.pending_writes.fetch_sub(1, Ordering::SeqCst) == 1 {
                inner.writes_idle.notify_waiters();
            }
        });
    }
}

fn default_breaker() -> CircuitBreaker {
    CircuitBreaker::new("durable_store", 3, 0.5, Duration::from_secs(30))
}

impl fmt::Debug for TieredCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TieredCache")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint;

    fn cache(max: usize) -> TieredCache {
        TieredCache::memory_only(TtlPolicy::default(), max)
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let cache = cache(10);
        let fp = fingerprint("2+2");
        cache.put(&fp, TierId::Symbolic, Outcome::solved("4", "t"));

        assert_eq!(
            cache.get(&fp, TierId::Symbolic).await,
            Some(Outcome::solved("4", "t"))
        );
        assert_eq!(cache.get(&fp, TierId::Computational).await, None);
        assert_eq!(cache.get(&fingerprint("2+3"), TierId::Symbolic).await, None);
    }

    #[tokio::test]
    async fn test_equivalent_queries_share_entries() {
        let cache = cache(10);
        cache.put(&fingerprint("2 + 2"), TierId::Symbolic, Outcome::solved("4", "t"));
        assert!(cache.get(&fingerprint("2+2"), TierId::Symbolic).await.is_some());
    }

    #[tokio::test]
    async fn test_expired_entry_is_miss_and_removed() {
        let policy = TtlPolicy {
            reasoning: Some(Duration::from_millis(30)),
            ..TtlPolicy::default()
        };
        let cache = TieredCache::memory_only(policy, 10);
        let fp = fingerprint("why");
        cache.put(&fp, TierId::Reasoning, Outcome::solved("because", "t"));
        assert!(cache.get(&fp, TierId::Reasoning).await.is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.get(&fp, TierId::Reasoning).await, None);
        assert_eq!(cache.snapshot().memory_entries, 0);
    }

    #[tokio::test]
    async fn test_lru_eviction_keeps_recently_used() {
        let cache = cache(2);
        let (a, b, c) = (fingerprint("a"), fingerprint("b"), fingerprint("c"));
        cache.put(&a, TierId::Symbolic, Outcome::solved("a", "t"));
        cache.put(&b, TierId::Symbolic, Outcome::solved("b", "t"));
        // touch a so b becomes the eviction victim
        assert!(cache.get(&a, TierId::Symbolic).await.is_some());
        cache.put(&c, TierId::Symbolic, Outcome::solved("c", "t"));

        let snap = cache.snapshot();
        assert_eq!(snap.memory_entries, 2);
        assert_eq!(snap.evictions, 1);
        assert!(cache.get(&a, TierId::Symbolic).await.is_some());
        assert!(cache.get(&b, TierId::Symbolic).await.is_none());
        assert!(cache.get(&c, TierId::Symbolic).await.is_some());
    }

    #[tokio::test]
    async fn test_overwrite_does_not_evict() {
        let cache = cache(1);
        let fp = fingerprint("a");
        cache.put(&fp, TierId::Symbolic, Outcome::unavailable("x"));
        cache.put(&fp, TierId::Symbolic, Outcome::solved("a", "t"));
        assert_eq!(cache.snapshot().evictions, 0);
        assert_eq!(
            cache.get(&fp, TierId::Symbolic).await,
            Some(Outcome::solved("a", "t"))
        );
    }

    #[tokio::test]
    async fn test_invalidate_all_clears_memory() {
        let cache = cache(10);
        let fp = fingerprint("2+2");
        cache.put(&fp, TierId::Symbolic, Outcome::solved("4", "t"));
        cache.invalidate_all().await;
        assert_eq!(cache.get(&fp, TierId::Symbolic).await, None);

        cache.put(&fp, TierId::Symbolic, Outcome::solved("4", "t"));
        assert!(cache.get(&fp, TierId::Symbolic).await.is_some());
    }

    #[test]
    fn test_ttl_policy_by_tier_and_outcome() {
        let p = TtlPolicy::default();
        assert_eq!(p.ttl_for(TierId::Symbolic, &Outcome::solved("1", "t")), None);
        assert_eq!(
            p.ttl_for(TierId::Symbolic, &Outcome::unavailable("x")),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            p.ttl_for(TierId::Reasoning, &Outcome::unsolvable("x")),
            Some(Duration::from_secs(86_400))
        );
        assert_eq!(
            p.ttl_for(TierId::Declined, &Outcome::unsolvable("sorry")),
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_ttl_zero_means_never() {
        let p = TtlPolicy::from_secs(0, 10, 0, 5, 1);
        assert_eq!(p.symbolic, None);
        assert_eq!(p.computational, Some(Duration::from_secs(10)));
        assert_eq!(p.reasoning, None);
    }

    #[test]
    fn test_entry_without_expiry_never_expires() {
        let e = CacheEntry::new(&fingerprint("1"), TierId::Symbolic, Outcome::solved("1", "t"), None);
        let far = Utc::now() + chrono::Duration::days(365 * 100);
        assert!(!e.is_expired_at(far));
    }

    #[test]
    fn test_entry_decodes_without_optional_fields() {
        let json = r#"{
            "fingerprint": "abc",
            "tier": "symbolic",
            "outcome": {"status": "solved", "answer": "4"},
            "created_at": "2026-01-01T00:00:00Z"
        }"#;
        let e: CacheEntry = serde_json::from_str(json).expect("test: decode");
        assert_eq!(e.expires_at, None);
        assert_eq!(e.query, "");
        assert_eq!(e.key().to_string(), "abc:symbolic");
        assert_eq!(e.start_tier, None);
    }

    #[tokio::test]
    async fn test_decline_only_covers_later_or_equal_starts() {
        let cache = cache(10);
        let fp = fingerprint("2+2");
        cache.put_decline(&fp, TierId::Reasoning, Outcome::unsolvable("sorry"));

        assert_eq!(cache.lookup_decline(&fp, TierId::Symbolic).await, None);
        assert_eq!(cache.lookup_decline(&fp, TierId::Computational).await, None);
        assert_eq!(
            cache.lookup_decline(&fp, TierId::Reasoning).await,
            Some(Outcome::unsolvable("sorry"))
        );

        // a full cascade decline covers every start
        cache.put_decline(&fp, TierId::Symbolic, Outcome::unsolvable("sorry"));
        assert!(cache.lookup_decline(&fp, TierId::Symbolic).await.is_some());
        assert!(cache.lookup_decline(&fp, TierId::Reasoning).await.is_some());
    }

    #[tokio::test]
    async fn test_decline_without_start_tier_is_ignored() {
        let cache = cache(10);
        let fp = fingerprint("2+2");
        cache.put(&fp, TierId::Declined, Outcome::unsolvable("sorry"));
        assert_eq!(cache.lookup_decline(&fp, TierId::Reasoning).await, None);
    }

    #[test]
    fn test_put_without_runtime_still_caches_in_memory() {
        let cache = cache(10);
        let fp = fingerprint("1+1");
        cache.put(&fp, TierId::Symbolic, Outcome::solved("2", "t"));
        let key = CacheKey::new(&fp, TierId::Symbolic);
        assert_eq!(cache.peek_memory(&key), Some(Outcome::solved("2", "t")));
    }
}
