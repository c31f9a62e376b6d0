//! # Stage: Cascade Orchestrator
//!
//! ## Responsibility
//! Drive one query through the tiers: fingerprint, classify, consult the
//! cache, join or start the tier computation, fall through on failure and
//! finally decline politely.
//!
//! ```text
//! submit(query)
//!   ├─ fingerprint + classify → starting tier
//!   ├─ declined from this start or earlier? → return the decline
//!   └─ for tier in start..=reasoning
//!        ├─ cache hit?           → outcome
//!        ├─ computation running? → join it
//!        └─ otherwise            → spawn attempt (timeout, panic guard)
//!                                   → cache.put → publish
//!      solved → done, else next tier
//!   all failed → decline, cached under (fp, declined) with its start tier
//! ```
//!
//! ## Guarantees
//! - Tiers are visited in strictly increasing order, one at a time.
//! - At most one execution per `(fingerprint, tier)` runs at any moment.
//! - Every `submit` returns within the sum of the tier budgets.
//! - A caller that stops waiting does not cancel the computation; it still
//!   completes and populates the cache.

use crate::breaker::CircuitBreaker;
use crate::cache::store::FileStore;
use crate::cache::{CacheKey, TieredCache, TtlPolicy};
use crate::classifier::Classifier;
use crate::config::{CascadeConfig, CascadeSection, StoreKind};
use crate::inflight::{InFlightRegistry, Publisher, Registration};
use crate::stats::{SinkSet, StatsCollector, StatsSink, StatsSnapshot};
use crate::tiers::{
    ArithmeticSolver, BudgetSnapshot, ComputationalTier, LlamaCppEngine, ReasoningTier,
    SymbolicTier, TierAdapter, TierSet, UsageBudget, WolframClient,
};
use crate::{fingerprint, CascadeError, Fingerprint, Outcome, OutcomeKind, Query, TierId};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, debug_span, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Decline returned when every tier failed.
pub const DEFAULT_DECLINE_MESSAGE: &str =
    "Sorry, I couldn't solve that one. Try rephrasing it or breaking it into smaller steps.";

const DEFAULT_MEMORY_ENTRIES: usize = 512;

/// Time budget per solving tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierBudgets {
    /// Symbolic tier budget.
    pub symbolic: Duration,
    /// Computational tier budget.
    pub computational: Duration,
    /// Reasoning tier budget.
    pub reasoning: Duration,
}

impl Default for TierBudgets {
    fn default() -> Self {
        Self {
            symbolic: Duration::from_secs(2),
            computational: Duration::from_secs(10),
            reasoning: Duration::from_secs(300),
        }
    }
}

impl TierBudgets {
    /// Budgets from the `[cascade]` config section.
    pub fn from_config(section: &CascadeSection) -> Self {
        Self {
            symbolic: section.budget_for(TierId::Symbolic),
            computational: section.budget_for(TierId::Computational),
            reasoning: section.budget_for(TierId::Reasoning),
        }
    }

    /// Budget for `tier`; zero for [`TierId::Declined`].
    pub fn for_tier(&self, tier: TierId) -> Duration {
        match tier {
            TierId::Symbolic => self.symbolic,
            TierId::Computational => self.computational,
            TierId::Reasoning => self.reasoning,
            TierId::Declined => Duration::ZERO,
        }
    }

    /// Upper bound on one cascade.
    pub fn total(&self) -> Duration {
        self.symbolic + self.computational + self.reasoning
    }

    fn set(&mut self, tier: TierId, budget: Duration) {
        match tier {
            TierId::Symbolic => self.symbolic = budget,
            TierId::Computational => self.computational = budget,
            TierId::Reasoning => self.reasoning = budget,
            TierId::Declined => {}
        }
    }
}

/// One tier visited by a cascade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStep {
    /// The tier.
    pub tier: TierId,
    /// What the tier produced.
    pub outcome: OutcomeKind,
    /// Served from cache instead of executed.
    pub from_cache: bool,
    /// Served by joining a computation another request started.
    pub joined: bool,
    /// Time spent at this tier.
    pub latency_ms: u64,
}

/// Result of [`CascadeOrchestrator::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeReport {
    /// Correlates this request across log lines.
    pub request_id: Uuid,
    /// Fingerprint digest of the query.
    pub fingerprint: String,
    /// Normalised query text the tiers saw.
    pub canonical: String,
    /// Where the cascade started.
    pub initial_tier: TierId,
    /// Where the cascade ended.
    pub final_tier: TierId,
    /// The final outcome.
    pub outcome: Outcome,
    /// Tiers visited, in order.
    pub path: Vec<TierStep>,
    /// The final outcome came from the cache.
    pub from_cache: bool,
    /// Wall time of the whole cascade.
    pub elapsed_ms: u64,
}

impl CascadeReport {
    /// `true` when every tier failed.
    pub fn is_declined(&self) -> bool {
        self.final_tier == TierId::Declined
    }

    /// The answer, if one was found.
    pub fn answer(&self) -> Option<&str> {
        self.outcome.answer()
    }
}

struct Inner {
    classifier: Classifier,
    tiers: TierSet,
    cache: TieredCache,
    inflight: InFlightRegistry,
    budgets: TierBudgets,
    collector: Arc<StatsCollector>,
    sinks: SinkSet,
    decline_message: String,
}

/// The cascade engine. Cheap to clone; clones share caches, registry and
/// statistics.
///
/// ## Usage
///
/// ```rust
/// use std::sync::Arc;
/// use tokio_math_cascade::{CascadeOrchestrator, Outcome, Query, ScriptedTier, TierId};
/// # #[tokio::main]
/// # async fn main() -> Result<(), tokio_math_cascade::CascadeError> {
/// let orchestrator = CascadeOrchestrator::builder()
///     .tier(Arc::new(ScriptedTier::new(TierId::Symbolic, Outcome::solved("4", "script"))))
///     .build();
///
/// let report = orchestrator.submit(Query::new("2+2")).await?;
/// assert_eq!(report.answer(), Some("4"));
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct CascadeOrchestrator {
    inner: Arc<Inner>,
}

impl CascadeOrchestrator {
    /// Start configuring an orchestrator.
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Build an orchestrator wired to the real backends described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`CascadeError::Store`] if the durable cache cannot be opened
    /// and [`CascadeError::ConfigError`] if `config` asks for a backend this
    /// build lacks.
    pub async fn from_config(config: &CascadeConfig) -> Result<Self, CascadeError> {
        Ok(OrchestratorBuilder::from_config(config).await?.build())
    }

    /// Run the cascade for `query`.
    ///
    /// Tier failures are not errors; they end in a decline report.
    ///
    /// # Errors
    ///
    /// Returns [`CascadeError::Invariant`] if a computation this request was
    /// waiting on vanished without an outcome.
    pub async fn submit(&self, query: Query) -> Result<CascadeReport, CascadeError> {
        let request_id = Uuid::new_v4();
        let fp = fingerprint(&query.text);
        let span = info_span!("cascade", %request_id, digest = fp.digest());
        self.run(request_id, fp, query.tier_override)
            .instrument(span)
            .await
    }

    async fn run(
        &self,
        request_id: Uuid,
        fp: Fingerprint,
        tier_override: Option<TierId>,
    ) -> Result<CascadeReport, CascadeError> {
        let started = Instant::now();
        let inner = &self.inner;

        let classification = inner.classifier.explain_normalized(fp.canonical());
        let initial_tier = tier_override.unwrap_or(classification.tier);
        debug!(
            classified = %classification.tier,
            rule = ?classification.rule,
            matched = classification.matched,
            initial = %initial_tier,
            "query classified"
        );

        let mut path = Vec::new();

        // a fresh decline short-circuits the cascade, but only when it covered
        // every tier this run would visit
        if let Some(outcome) = inner.cache.lookup_decline(&fp, initial_tier).await {
            inner.sinks.on_cache_hit(TierId::Declined);
            path.push(TierStep {
                tier: TierId::Declined,
                outcome: outcome.kind(),
                from_cache: true,
                joined: false,
                latency_ms: millis(started.elapsed()),
            });
            return Ok(self.finish(request_id, fp, initial_tier, TierId::Declined, outcome, path, started));
        }

        let mut tier = Some(initial_tier).filter(|t| *t != TierId::Declined);
        while let Some(current) = tier {
            let (outcome, step) = self.run_tier(&fp, current).await?;
            path.push(step);
            if outcome.is_solved() {
                return Ok(self.finish(request_id, fp, initial_tier, current, outcome, path, started));
            }
            debug!(tier = %current, outcome = outcome.kind().as_str(), "falling through");
            tier = current.next().filter(|t| *t != TierId::Declined);
        }

        let decline = Outcome::unsolvable(inner.decline_message.clone());
        inner.cache.put_decline(&fp, initial_tier, decline.clone());
        path.push(TierStep {
            tier: TierId::Declined,
            outcome: decline.kind(),
            from_cache: false,
            joined: false,
            latency_ms: 0,
        });
        Ok(self.finish(request_id, fp, initial_tier, TierId::Declined, decline, path, started))
    }

    /// Resolve one tier: cache, then in-flight join, then execution.
    async fn run_tier(
        &self,
        fp: &Fingerprint,
        tier: TierId,
    ) -> Result<(Outcome, TierStep), CascadeError> {
        let started = Instant::now();
        let inner = &self.inner;
        let step = |outcome: &Outcome, from_cache: bool, joined: bool| TierStep {
            tier,
            outcome: outcome.kind(),
            from_cache,
            joined,
            latency_ms: millis(started.elapsed()),
        };

        let Some(adapter) = inner.tiers.get(tier).cloned() else {
            debug!(tier = %tier, "no adapter registered");
            let outcome = Outcome::unavailable(format!("no adapter registered for the {tier} tier"));
            let s = step(&outcome, false, false);
            return Ok((outcome, s));
        };

        let key = CacheKey::new(fp, tier);
        if let Some(outcome) = inner.cache.lookup(&key).await {
            inner.sinks.on_cache_hit(tier);
            debug!(tier = %tier, "cache hit");
            let s = step(&outcome, true, false);
            return Ok((outcome, s));
        }

        let cache = &inner.cache;
        let registration = inner
            .inflight
            .join_or_register(key.clone(), || cache.peek_memory(&key));
        if let Registration::Cached(_) = registration {
            // landed between the lookup and registration
            inner.sinks.on_cache_hit(tier);
        } else {
            inner.sinks.on_cache_miss(tier);
        }

        match registration {
            Registration::Cached(outcome) => {
                let s = step(&outcome, true, false);
                Ok((outcome, s))
            }
            Registration::Joined(waiter) => {
                inner.sinks.on_inflight_join(tier);
                debug!(tier = %tier, "joined in-flight computation");
                let outcome = waiter.wait().await?;
                let s = step(&outcome, false, true);
                Ok((outcome, s))
            }
            Registration::Leader { publisher, waiter } => {
                self.spawn_attempt(adapter, fp.clone(), tier, publisher);
                let outcome = waiter.wait().await?;
                let s = step(&outcome, false, false);
                Ok((outcome, s))
            }
        }
    }

    /// Execute `adapter` in its own task so the computation outlives any
    /// single waiter.
    fn spawn_attempt(
        &self,
        adapter: Arc<dyn TierAdapter>,
        fp: Fingerprint,
        tier: TierId,
        publisher: Publisher,
    ) {
        let budget = self.inner.budgets.for_tier(tier);
        let cache = self.inner.cache.clone();
        let sinks = self.inner.sinks.clone();
        let span = debug_span!("tier_attempt", tier = %tier, adapter = adapter.name());

        tokio::spawn(
            async move {
                let started = Instant::now();
                let attempt = AssertUnwindSafe(adapter.attempt(fp.canonical(), budget)).catch_unwind();
                let outcome = match tokio::time::timeout(budget, attempt).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_)) => {
                        error!("tier adapter panicked");
                        Outcome::unavailable(format!("{} failed unexpectedly", adapter.name()))
                    }
                    Err(_) => {
                        warn!(budget_ms = millis(budget), "tier budget exceeded");
                        Outcome::unavailable(format!(
                            "{} did not answer within {} ms",
                            adapter.name(),
                            millis(budget)
                        ))
                    }
                };
                let latency = started.elapsed();
                if outcome.kind() == OutcomeKind::Unavailable {
                    warn!(reason = outcome.reason().unwrap_or_default(), "tier unavailable");
                }

                sinks.on_tier_attempt(tier, &outcome, latency);
                // cache before publishing so late arrivals find it there
                cache.put(&fp, tier, outcome.clone());
                publisher.publish(outcome);
            }
            .instrument(span),
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        request_id: Uuid,
        fp: Fingerprint,
        initial_tier: TierId,
        final_tier: TierId,
        outcome: Outcome,
        path: Vec<TierStep>,
        started: Instant,
    ) -> CascadeReport {
        self.inner.sinks.on_cascade_complete(final_tier);
        let from_cache = path.last().map_or(false, |s| s.from_cache || s.joined);
        let elapsed_ms = millis(started.elapsed());
        info!(
            final_tier = %final_tier,
            outcome = outcome.kind().as_str(),
            from_cache,
            elapsed_ms,
            "cascade complete"
        );
        CascadeReport {
            request_id,
            fingerprint: fp.digest().to_string(),
            canonical: fp.canonical().to_string(),
            initial_tier,
            final_tier,
            outcome,
            path,
            from_cache,
            elapsed_ms,
        }
    }

    /// Drop every cached outcome at both levels.
    ///
    /// Computations already running still finish and publish to their
    /// waiters.
    pub async fn invalidate_cache(&self) {
        self.inner.cache.invalidate_all().await;
    }

    /// Aggregated statistics.
    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.inner.collector.snapshot();
        snapshot.computational_usage = self.usage();
        snapshot
    }

    /// Monthly quota figures of the computational tier.
    pub fn usage(&self) -> Option<BudgetSnapshot> {
        self.inner
            .tiers
            .get(TierId::Computational)
            .and_then(|adapter| adapter.usage())
    }

    /// The cache this orchestrator writes to.
    pub fn cache(&self) -> &TieredCache {
        &self.inner.cache
    }

    /// Computations currently running.
    pub fn inflight_len(&self) -> usize {
        self.inner.inflight.len()
    }

    /// Tiers with a registered adapter.
    pub fn registered_tiers(&self) -> Vec<TierId> {
        self.inner.tiers.registered()
    }

    /// Time budgets in force.
    pub fn budgets(&self) -> TierBudgets {
        self.inner.budgets
    }
}

impl std::fmt::Debug for CascadeOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CascadeOrchestrator")
            .field("tiers", &self.inner.tiers)
            .field("budgets", &self.inner.budgets)
            .field("inflight", &self.inner.inflight)
            .finish()
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`CascadeOrchestrator`]. Tiers, cache, sinks and budgets are
/// injected here; nothing is wired implicitly except a memory-only cache.
pub struct OrchestratorBuilder {
    classifier: Classifier,
    tiers: TierSet,
    cache: Option<TieredCache>,
    budgets: TierBudgets,
    sinks: Vec<Arc<dyn StatsSink>>,
    decline_message: String,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    /// Builder with default budgets, no tiers and a memory-only cache.
    pub fn new() -> Self {
        Self {
            classifier: Classifier::new(),
            tiers: TierSet::new(),
            cache: None,
            budgets: TierBudgets::default(),
            sinks: Vec::new(),
            decline_message: DEFAULT_DECLINE_MESSAGE.to_string(),
        }
    }

    /// Builder wired to the backends described by `config`.
    ///
    /// The symbolic tier always uses the built-in arithmetic solver. Disabled
    /// tiers are left unregistered and report `unavailable`.
    ///
    /// # Errors
    ///
    /// Returns [`CascadeError::Store`] if the durable cache cannot be opened
    /// and [`CascadeError::ConfigError`] for a redis store without the
    /// `redis-store` feature.
    pub async fn from_config(config: &CascadeConfig) -> Result<Self, CascadeError> {
        let cache = build_cache(config).await?;

        let mut builder = Self::new()
            .cache(cache)
            .budgets(TierBudgets::from_config(&config.cascade))
            .decline_message(config.cascade.decline_message.clone())
            .tier(Arc::new(SymbolicTier::new(Arc::new(ArithmeticSolver))));

        let computational = &config.computational;
        if computational.enabled {
            let client = WolframClient::from_env(&computational.app_id_env)
                .with_base_url(computational.endpoint.clone());
            if !client.has_credentials() {
                warn!(
                    var = computational.app_id_env.as_str(),
                    "computational app id not set, tier will report unavailable"
                );
            }
            let mut budget = UsageBudget::new(computational.monthly_budget)
                .with_development_limit(computational.development_budget)
                .with_pool(computational.budget_pool);
            if let Some(path) = computational.usage_path.as_deref().filter(|p| !p.trim().is_empty()) {
                budget = budget.persist_to(path);
            }
            let tier = ComputationalTier::new(Arc::new(client), computational.monthly_budget)
                .with_budget(budget)
                .with_rate_limit(computational.requests_per_minute)
                .with_breaker(CircuitBreaker::new(
                    "computational",
                    computational.breaker_threshold as usize,
                    0.5,
                    Duration::from_secs(computational.breaker_cooldown_s),
                ));
            builder = builder.tier(Arc::new(tier));
        }

        let reasoning = &config.reasoning;
        if reasoning.enabled {
            let engine = LlamaCppEngine::new().with_url(reasoning.endpoint.clone());
            let tier = ReasoningTier::new(Arc::new(engine))
                .with_max_tokens(reasoning.max_tokens)
                .with_temperature(reasoning.temperature);
            builder = builder.tier(Arc::new(tier));
        }

        info!(
            tiers = ?builder.tiers.registered(),
            store = ?config.cache.store,
            "orchestrator configured"
        );
        Ok(builder)
    }

    /// Replace the classifier.
    pub fn classifier(mut self, classifier: Classifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Register an adapter under the tier it reports.
    pub fn tier(mut self, adapter: Arc<dyn TierAdapter>) -> Self {
        self.tiers.insert(adapter);
        self
    }

    /// Replace the whole tier set.
    pub fn tiers(mut self, tiers: TierSet) -> Self {
        self.tiers = tiers;
        self
    }

    /// Use `cache` instead of a fresh memory-only cache.
    pub fn cache(mut self, cache: TieredCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace all budgets.
    pub fn budgets(mut self, budgets: TierBudgets) -> Self {
        self.budgets = budgets;
        self
    }

    /// Set the budget for one tier.
    pub fn budget(mut self, tier: TierId, budget: Duration) -> Self {
        self.budgets.set(tier, budget);
        self
    }

    /// Attach an extra statistics sink.
    pub fn sink(mut self, sink: Arc<dyn StatsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Reply used when every tier fails.
    pub fn decline_message(mut self, message: impl Into<String>) -> Self {
        self.decline_message = message.into();
        self
    }

    /// Finish building.
    pub fn build(self) -> CascadeOrchestrator {
        let collector = Arc::new(StatsCollector::new());
        let mut sinks = SinkSet::new();
        sinks.push(Arc::clone(&collector) as Arc<dyn StatsSink>);
        for sink in self.sinks {
            sinks.push(sink);
        }

        let cache = self.cache.unwrap_or_else(|| {
            TieredCache::memory_only(TtlPolicy::default(), DEFAULT_MEMORY_ENTRIES)
        });

        CascadeOrchestrator {
            inner: Arc::new(Inner {
                classifier: self.classifier,
                tiers: self.tiers,
                cache,
                inflight: InFlightRegistry::new(),
                budgets: self.budgets,
                collector,
                sinks,
                decline_message: self.decline_message,
            }),
        }
    }
}

async fn build_cache(config: &CascadeConfig) -> Result<TieredCache, CascadeError> {
    let section = &config.cache;
    let policy = section.ttl_policy();
    let breaker = || {
        CircuitBreaker::new(
            "durable_store",
            section.breaker_threshold as usize,
            0.5,
            Duration::from_secs(section.breaker_cooldown_s),
        )
    };

    match section.store {
        StoreKind::None => Ok(TieredCache::memory_only(policy, section.max_memory_entries)),
        StoreKind::File => {
            let store = FileStore::open(section.path.as_str()).await?;
            Ok(TieredCache::with_store_and_breaker(
                policy,
                section.max_memory_entries,
                Arc::new(store),
                breaker(),
            ))
        }
        #[cfg(feature = "redis-store")]
        StoreKind::Redis => {
            let url = section.redis_url.as_deref().ok_or_else(|| {
                CascadeError::ConfigError("cache.redis_url is required for the redis store".into())
            })?;
            let store = crate::cache::redis_store::RedisStore::connect(url).await?;
            Ok(TieredCache::with_store_and_breaker(
                policy,
                section.max_memory_entries,
                Arc::new(store),
                breaker(),
            ))
        }
        #[cfg(not(feature = "redis-store"))]
        StoreKind::Redis => {
            let _ = breaker;
            Err(CascadeError::ConfigError(
                "cache.store = \"redis\" requires the redis-store feature".into(),
            ))
        }
    }
}
