//! # Stage: Statistics
//!
//! ## Responsibility
//! Observe the cascade without influencing it. The orchestrator reports five
//! kinds of event through the [`StatsSink`] trait; [`StatsCollector`] folds
//! them into lock-free counters and mirrors them to Prometheus.
//!
//! ## Guarantees
//! - Sink calls never block and never fail the request that emitted them.
//! - Counters are per tier; [`StatsCollector::snapshot`] derives totals.
//!
//! [`ChannelSink`] forwards events to an external consumer over a bounded
//! channel, shedding events when the consumer falls behind.

use crate::tiers::BudgetSnapshot;
use crate::{metrics, Outcome, OutcomeKind, TierId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

/// Receiver of cascade events. Every method defaults to a no-op.
///
/// Implementations are called inline on the request path and must return
/// quickly.
pub trait StatsSink: Send + Sync {
    /// A cache lookup at `tier` hit.
    fn on_cache_hit(&self, _tier: TierId) {}

    /// A cache lookup at `tier` missed.
    fn on_cache_miss(&self, _tier: TierId) {}

    /// A request joined a computation already running at `tier`.
    fn on_inflight_join(&self, _tier: TierId) {}

    /// `tier` was executed and produced `outcome` after `latency`.
    fn on_tier_attempt(&self, _tier: TierId, _outcome: &Outcome, _latency: Duration) {}

    /// A cascade finished at `final_tier`.
    fn on_cascade_complete(&self, _final_tier: TierId) {}
}

#[derive(Default)]
struct TierCounters {
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    joins: AtomicU64,
    attempts: AtomicU64,
    solved: AtomicU64,
    unsolvable: AtomicU64,
    unavailable: AtomicU64,
    latency_micros: AtomicU64,
    completions: AtomicU64,
}

/// Aggregating sink with atomic counters per tier.
#[derive(Default)]
pub struct StatsCollector {
    tiers: [TierCounters; 4],
}

/// Per-tier figures in a [`StatsSnapshot`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierStats {
    /// Cache hits at this tier.
    pub cache_hits: u64,
    /// Cache misses at this tier.
    pub cache_misses: u64,
    /// Requests that joined an in-flight computation at this tier.
    pub inflight_joins: u64,
    /// Executions of this tier.
    pub attempts: u64,
    /// Executions that solved.
    pub solved: u64,
    /// Executions that ran and gave up.
    pub unsolvable: u64,
    /// Executions that could not run.
    pub unavailable: u64,
    /// Cascades that finished at this tier.
    pub completions: u64,
    /// Mean execution latency in milliseconds (0 when never executed).
    pub average_latency_ms: f64,
}

/// Point-in-time statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Finished cascades.
    pub total_requests: u64,
    /// Cache hits across tiers.
    pub cache_hits: u64,
    /// Cache misses across tiers.
    pub cache_misses: u64,
    /// `cache_hits / (cache_hits + cache_misses)`, 0 with no lookups.
    pub hit_rate: f64,
    /// Requests served by joining an in-flight computation.
    pub inflight_joins: u64,
    /// Cascades that ended in a decline.
    pub declined: u64,
    /// Figures keyed by tier.
    pub per_tier: BTreeMap<TierId, TierStats>,
    /// Monthly quota of the computational tier, when one is registered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub computational_usage: Option<BudgetSnapshot>,
}

impl StatsCollector {
    /// Zeroed collector.
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, tier: TierId) -> &TierCounters {
        &self.tiers[tier.index()]
    }

    /// Current figures.
    pub fn snapshot(&self) -> StatsSnapshot {
        let mut snap = StatsSnapshot::default();
        for tier in TierId::ALL {
            let c = self.counters(tier);
            let attempts = c.attempts.load(Ordering::Relaxed);
            let latency = c.latency_micros.load(Ordering::Relaxed);
            let stats = TierStats {
                cache_hits: c.cache_hits.load(Ordering::Relaxed),
                cache_misses: c.cache_misses.load(Ordering::Relaxed),
                inflight_joins: c.joins.load(Ordering::Relaxed),
                attempts,
                solved: c.solved.load(Ordering::Relaxed),
                unsolvable: c.unsolvable.load(Ordering::Relaxed),
                unavailable: c.unavailable.load(Ordering::Relaxed),
                completions: c.completions.load(Ordering::Relaxed),
                average_latency_ms: if attempts == 0 {
                    0.0
                } else {
                    latency as f64 / attempts as f64 / 1000.0
                },
            };
            snap.total_requests += stats.completions;
            snap.cache_hits += stats.cache_hits;
            snap.cache_misses += stats.cache_misses;
            snap.inflight_joins += stats.inflight_joins;
            if tier == TierId::Declined {
                snap.declined = stats.completions;
            }
            snap.per_tier.insert(tier, stats);
        }
        let lookups = snap.cache_hits + snap.cache_misses;
        snap.hit_rate = if lookups == 0 {
            0.0
        } else {
            snap.cache_hits as f64 / lookups as f64
        };
        snap
    }
}

impl StatsSink for StatsCollector {
    fn on_cache_hit(&self, tier: TierId) {
        self.counters(tier).cache_hits.fetch_add(1, Ordering::Relaxed);
        metrics::inc_cache_lookup(tier, true);
    }

    fn on_cache_miss(&self, tier: TierId) {
        self.counters(tier).cache_misses.fetch_add(1, Ordering::Relaxed);
        metrics::inc_cache_lookup(tier, false);
    }

    fn on_inflight_join(&self, tier: TierId) {
        self.counters(tier).joins.fetch_add(1, Ordering::Relaxed);
        metrics::inc_inflight_join(tier);
    }

    fn on_tier_attempt(&self, tier: TierId, outcome: &Outcome, latency: Duration) {
        let c = self.counters(tier);
        c.attempts.fetch_add(1, Ordering::Relaxed);
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        c.latency_micros.fetch_add(micros, Ordering::Relaxed);
        match outcome.kind() {
            OutcomeKind::Solved => c.solved.fetch_add(1, Ordering::Relaxed),
            OutcomeKind::Unsolvable => c.unsolvable.fetch_add(1, Ordering::Relaxed),
            OutcomeKind::Unavailable => c.unavailable.fetch_add(1, Ordering::Relaxed),
        };
        metrics::record_tier_attempt(tier, outcome.kind(), latency);
    }

    fn on_cascade_complete(&self, final_tier: TierId) {
        self.counters(final_tier)
            .completions
            .fetch_add(1, Ordering::Relaxed);
        metrics::inc_completion(final_tier);
    }
}

/// Fan-out over several sinks, called in registration order.
#[derive(Clone, Default)]
pub struct SinkSet {
    sinks: Vec<Arc<dyn StatsSink>>,
}

impl SinkSet {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn push(&mut self, sink: Arc<dyn StatsSink>) {
        self.sinks.push(sink);
    }

    /// Number of sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// `true` with no sinks.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl StatsSink for SinkSet {
    fn on_cache_hit(&self, tier: TierId) {
        self.sinks.iter().for_each(|s| s.on_cache_hit(tier));
    }

    fn on_cache_miss(&self, tier: TierId) {
        self.sinks.iter().for_each(|s| s.on_cache_miss(tier));
    }

    fn on_inflight_join(&self, tier: TierId) {
        self.sinks.iter().for_each(|s| s.on_inflight_join(tier));
    }

    fn on_tier_attempt(&self, tier: TierId, outcome: &Outcome, latency: Duration) {
        self.sinks
            .iter()
            .for_each(|s| s.on_tier_attempt(tier, outcome, latency));
    }

    fn on_cascade_complete(&self, final_tier: TierId) {
        self.sinks
            .iter()
            .for_each(|s| s.on_cascade_complete(final_tier));
    }
}

// ============================================================================
// Channel Sink
// ============================================================================

/// A cascade event as delivered by [`ChannelSink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatsEvent {
    /// See [`StatsSink::on_cache_hit`].
    CacheHit {
        /// Tier looked up.
        tier: TierId,
    },
    /// See [`StatsSink::on_cache_miss`].
    CacheMiss {
        /// Tier looked up.
        tier: TierId,
    },
    /// See [`StatsSink::on_inflight_join`].
    InflightJoin {
        /// Tier joined.
        tier: TierId,
    },
    /// See [`StatsSink::on_tier_attempt`].
    TierAttempt {
        /// Tier executed.
        tier: TierId,
        /// Outcome discriminant.
        outcome: OutcomeKind,
        /// Execution latency in milliseconds.
        latency_ms: u64,
    },
    /// See [`StatsSink::on_cascade_complete`].
    CascadeComplete {
        /// Where the cascade ended.
        final_tier: TierId,
    },
}

/// Sink that forwards events over a bounded channel.
///
/// Uses `try_send`: when the consumer falls behind, events are shed and
/// counted rather than applying backpressure to queries.
pub struct ChannelSink {
    tx: mpsc::Sender<StatsEvent>,
    shed: AtomicU64,
}

impl ChannelSink {
    /// A sink and the receiver for its events.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StatsEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                shed: AtomicU64::new(0),
            },
            rx,
        )
    }

    /// Events dropped because the channel was full.
    pub fn shed_count(&self) -> u64 {
        self.shed.load(Ordering::Relaxed)
    }

    fn emit(&self, event: StatsEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                let shed = self.shed.fetch_add(1, Ordering::Relaxed) + 1;
                if shed.is_power_of_two() {
                    warn!(shed, "stats channel full, shedding events");
                }
            }
            // consumer gone; nothing left to notify
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

impl StatsSink for ChannelSink {
    fn on_cache_hit(&self, tier: TierId) {
        self.emit(StatsEvent::CacheHit { tier });
    }

    fn on_cache_miss(&self, tier: TierId) {
        self.emit(StatsEvent::CacheMiss { tier });
    }

    fn on_inflight_join(&self, tier: TierId) {
        self.emit(StatsEvent::InflightJoin { tier });
    }

    fn on_tier_attempt(&self, tier: TierId, outcome: &Outcome, latency: Duration) {
        self.emit(StatsEvent::TierAttempt {
            tier,
            outcome: outcome.kind(),
            latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
        });
    }

    fn on_cascade_complete(&self, final_tier: TierId) {
        self.emit(StatsEvent::CascadeComplete { final_tier });
    }
}
