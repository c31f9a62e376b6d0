//! Tier adapter abstraction and implementations
//!
//! Provides the [`TierAdapter`] trait and the adapters shipped with the crate:
//! - [`symbolic::SymbolicTier`]: offline solver run on the blocking pool
//! - [`computational::ComputationalTier`]: external computational API
//! - [`reasoning::ReasoningTier`]: local language model
//! - [`ScriptedTier`]: deterministic adapter for tests and demos
//!
//! Adapters never return errors. Every failure mode is folded into an
//! [`Outcome`] so the orchestrator can decide whether to fall through.

use crate::{Outcome, TierId};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod computational;
pub mod reasoning;
pub mod symbolic;

pub use computational::{
    BudgetPool, BudgetSnapshot, ComputationalClient, ComputationalTier, UsageBudget, WolframClient,
};
pub use reasoning::{LlamaCppEngine, ReasoningEngine, ReasoningTier};
pub use symbolic::{ArithmeticSolver, SymbolicSolver, SymbolicTier};

/// Uniform interface over one solving tier.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via `Arc<dyn TierAdapter>`.
#[async_trait]
pub trait TierAdapter: Send + Sync {
    /// The tier this adapter serves.
    fn tier(&self) -> TierId;

    /// Backend name recorded in logs and solve metadata.
    fn name(&self) -> &str;

    /// Attempt the canonical query text.
    ///
    /// Must return within roughly `timeout`; a hung backend is reported as
    /// [`Outcome::Unavailable`]. The orchestrator also enforces the budget,
    /// so an adapter that overruns is cut off regardless.
    async fn attempt(&self, query: &str, timeout: Duration) -> Outcome;

    /// Metered usage, for adapters that draw on a paid quota.
    fn usage(&self) -> Option<BudgetSnapshot> {
        None
    }
}

/// Lookup table from tier to adapter.
///
/// Holds at most one adapter per solving tier. [`TierId::Declined`] never has
/// an adapter.
#[derive(Clone, Default)]
pub struct TierSet {
    slots: [Option<Arc<dyn TierAdapter>>; 3],
}

impl TierSet {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `adapter` under the tier it reports, replacing any previous
    /// adapter for that tier. Adapters claiming [`TierId::Declined`] are ignored.
    pub fn with(mut self, adapter: Arc<dyn TierAdapter>) -> Self {
        self.insert(adapter);
        self
    }

    /// In-place form of [`TierSet::with`].
    pub fn insert(&mut self, adapter: Arc<dyn TierAdapter>) {
        let tier = adapter.tier();
        if let Some(slot) = self.slots.get_mut(tier.index()) {
            *slot = Some(adapter);
        } else {
            tracing::warn!(adapter = adapter.name(), "ignoring adapter registered for declined tier");
        }
    }

    /// The adapter for `tier`, if one is registered.
    pub fn get(&self, tier: TierId) -> Option<&Arc<dyn TierAdapter>> {
        self.slots.get(tier.index()).and_then(Option::as_ref)
    }

    /// Tiers that have an adapter, in cascade order.
    pub fn registered(&self) -> Vec<TierId> {
        TierId::SOLVING
            .into_iter()
            .filter(|t| self.get(*t).is_some())
            .collect()
    }
}

impl std::fmt::Debug for TierSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<(TierId, &str)> = TierId::SOLVING
            .into_iter()
            .filter_map(|t| self.get(t).map(|a| (t, a.name())))
            .collect();
        f.debug_struct("TierSet").field("adapters", &names).finish()
    }
}

// ============================================================================
// Scripted Tier (Testing)
// ============================================================================

/// Adapter that replays a fixed script of outcomes.
///
/// Each call consumes the next scripted outcome; once the script runs out the
/// last outcome repeats. Counts calls so tests can assert how many times a
/// tier actually executed.
///
/// ## Example
///
/// ```rust
/// use std::sync::Arc;
/// use tokio_math_cascade::{Outcome, ScriptedTier, TierId};
///
/// let tier = Arc::new(ScriptedTier::new(TierId::Symbolic, Outcome::solved("4", "script")));
/// assert_eq!(tier.calls(), 0);
/// ```
pub struct ScriptedTier {
    tier: TierId,
    name: String,
    script: Mutex<VecDeque<Outcome>>,
    last: Mutex<Outcome>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedTier {
    /// Always answer with `outcome`.
    pub fn new(tier: TierId, outcome: Outcome) -> Self {
        Self::with_sequence(tier, vec![outcome])
    }

    /// Answer with each outcome in turn, then keep repeating the last one.
    /// An empty sequence behaves like a tier that is always unavailable.
    pub fn with_sequence(tier: TierId, outcomes: Vec<Outcome>) -> Self {
        let last = outcomes
            .last()
            .cloned()
            .unwrap_or_else(|| Outcome::unavailable("empty script"));
        Self {
            tier,
            name: format!("scripted-{tier}"),
            script: Mutex::new(outcomes.into()),
            last: Mutex::new(last),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Simulate backend latency.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of times `attempt` has been entered.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> Outcome {
        match self.script.lock().pop_front() {
            Some(outcome) => {
                *self.last.lock() = outcome.clone();
                outcome
            }
            None => self.last.lock().clone(),
        }
    }
}

#[async_trait]
impl TierAdapter for ScriptedTier {
    fn tier(&self) -> TierId {
        self.tier
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn attempt(&self, _query: &str, timeout: Duration) -> Outcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero()
            && tokio::time::timeout(timeout, tokio::time::sleep(self.delay))
                .await
                .is_err()
        {
            return Outcome::unavailable(format!("{} timed out", self.name));
        }
        self.next_outcome()
    }
}
