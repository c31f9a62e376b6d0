//! # Cascade Scenario Integration Tests
//!
//! End-to-end behaviour of `CascadeOrchestrator::submit` against scripted
//! tiers: the four reference scenarios, cascade monotonicity, per-tier
//! budgets, panicking adapters and caller cancellation.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_math_cascade::{
    fingerprint, CascadeOrchestrator, Outcome, OutcomeKind, Query, ScriptedTier, TierAdapter,
    TierId,
};

fn scripted(tier: TierId, outcome: Outcome) -> Arc<ScriptedTier> {
    Arc::new(ScriptedTier::new(tier, outcome))
}

fn path_tiers(report: &tokio_math_cascade::CascadeReport) -> Vec<TierId> {
    report.path.iter().map(|s| s.tier).collect()
}

/// Adapter that never answers and ignores its timeout.
struct StuckTier {
    tier: TierId,
    calls: AtomicUsize,
}

impl StuckTier {
    fn new(tier: TierId) -> Arc<Self> {
        Arc::new(Self {
            tier,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl TierAdapter for StuckTier {
    fn tier(&self) -> TierId {
        self.tier
    }

    fn name(&self) -> &str {
        "stuck"
    }

    async fn attempt(&self, _query: &str, _timeout: Duration) -> Outcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        futures::future::pending::<()>().await;
        Outcome::unavailable("unreachable")
    }
}

/// Adapter that panics on every call.
struct PanickingTier;

#[async_trait]
impl TierAdapter for PanickingTier {
    fn tier(&self) -> TierId {
        TierId::Symbolic
    }

    fn name(&self) -> &str {
        "panicking"
    }

    async fn attempt(&self, _query: &str, _timeout: Duration) -> Outcome {
        panic!("solver blew up");
    }
}

// ── Reference scenarios ───────────────────────────────────────────────────

#[tokio::test]
async fn test_scenario_a_symbolic_solve_then_cache_hit() {
    let symbolic = scripted(TierId::Symbolic, Outcome::solved("4", "script"));
    let orchestrator = CascadeOrchestrator::builder()
        .tier(symbolic.clone())
        .build();

    let first = orchestrator.submit(Query::new("2+2")).await.expect("first");
    assert_eq!(first.answer(), Some("4"));
    assert_eq!(first.initial_tier, TierId::Symbolic);
    assert!(!first.from_cache);

    let cached = orchestrator
        .cache()
        .get(&fingerprint("2+2"), TierId::Symbolic)
        .await;
    assert_eq!(cached, Some(Outcome::solved("4", "script")));

    let second = orchestrator.submit(Query::new(" 2 + 2 ")).await.expect("second");
    assert_eq!(second.answer(), Some("4"));
    assert!(second.from_cache);
    assert!(second.path[0].from_cache);
    assert_eq!(symbolic.calls(), 1, "second call must not re-execute the tier");

    let stats = orchestrator.stats();
    assert_eq!(stats.total_requests, 2);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.per_tier[&TierId::Symbolic].attempts, 1);
}

#[tokio::test]
async fn test_scenario_b_reasoning_query_skips_earlier_tiers() {
    let symbolic = scripted(TierId::Symbolic, Outcome::solved("wrong", "script"));
    let computational = scripted(TierId::Computational, Outcome::solved("wrong", "script"));
    let reasoning = scripted(
        TierId::Reasoning,
        Outcome::solved("because it cannot be written as a ratio", "script"),
    );
    let orchestrator = CascadeOrchestrator::builder()
        .tier(symbolic.clone())
        .tier(computational.clone())
        .tier(reasoning.clone())
        .build();

    let report = orchestrator
        .submit(Query::new("explain why pi is irrational"))
        .await
        .expect("submit");

    assert_eq!(report.initial_tier, TierId::Reasoning);
    assert_eq!(report.final_tier, TierId::Reasoning);
    assert_eq!(path_tiers(&report), vec![TierId::Reasoning]);
    assert_eq!(symbolic.calls(), 0);
    assert_eq!(computational.calls(), 0);
    assert_eq!(reasoning.calls(), 1);
}

#[tokio::test]
async fn test_scenario_c_fall_through_and_cached_failures() {
    let symbolic = scripted(TierId::Symbolic, Outcome::unsolvable("not an expression"));
    let computational = scripted(TierId::Computational, Outcome::unavailable("no network"));
    let reasoning = scripted(
        TierId::Reasoning,
        Outcome::solved("a^2 + b^2 = c^2 by similar triangles", "script"),
    );
    let orchestrator = CascadeOrchestrator::builder()
        .tier(symbolic.clone())
        .tier(computational.clone())
        .tier(reasoning.clone())
        .build();
    let query = || Query::new("prove the pythagorean theorem").with_tier(TierId::Symbolic);

    let first = orchestrator.submit(query()).await.expect("first");
    assert_eq!(first.final_tier, TierId::Reasoning);
    assert_eq!(
        path_tiers(&first),
        vec![TierId::Symbolic, TierId::Computational, TierId::Reasoning]
    );
    let kinds: Vec<OutcomeKind> = first.path.iter().map(|s| s.outcome).collect();
    assert_eq!(
        kinds,
        vec![
            OutcomeKind::Unsolvable,
            OutcomeKind::Unavailable,
            OutcomeKind::Solved
        ]
    );

    let fp = fingerprint("prove the pythagorean theorem");
    assert!(orchestrator
        .cache()
        .get(&fp, TierId::Reasoning)
        .await
        .is_some_and(|o| o.is_solved()));

    let second = orchestrator.submit(query()).await.expect("second");
    assert_eq!(second.answer(), first.answer());
    assert!(second.path.iter().all(|s| s.from_cache));
    assert_eq!(path_tiers(&second), path_tiers(&first));
    assert_eq!(symbolic.calls(), 1);
    assert_eq!(computational.calls(), 1);
    assert_eq!(reasoning.calls(), 1);
}

#[tokio::test]
async fn test_scenario_d_decline_is_cached() {
    let symbolic = scripted(TierId::Symbolic, Outcome::unsolvable("no"));
    let computational = scripted(TierId::Computational, Outcome::unavailable("offline"));
    let reasoning = scripted(TierId::Reasoning, Outcome::unsolvable("model gave up"));
    let orchestrator = CascadeOrchestrator::builder()
        .tier(symbolic.clone())
        .tier(computational.clone())
        .tier(reasoning.clone())
        .decline_message("I couldn't solve that one.")
        .build();
    let query = || Query::new("what is 2+").with_tier(TierId::Symbolic);

    let first = orchestrator.submit(query()).await.expect("first");
    assert!(first.is_declined());
    assert_eq!(first.outcome.reason(), Some("I couldn't solve that one."));
    assert_eq!(path_tiers(&first).last(), Some(&TierId::Declined));

    let second = orchestrator.submit(query()).await.expect("second");
    assert!(second.is_declined());
    assert!(second.from_cache);
    assert_eq!(path_tiers(&second), vec![TierId::Declined]);
    assert_eq!(symbolic.calls() + computational.calls() + reasoning.calls(), 3);

    let stats = orchestrator.stats();
    assert_eq!(stats.declined, 2);
    assert_eq!(stats.per_tier[&TierId::Declined].cache_hits, 1);
}

// ── Properties ────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_cascade_is_monotonic_and_never_repeats_a_tier() {
    let orchestrator = CascadeOrchestrator::builder()
        .tier(scripted(TierId::Symbolic, Outcome::unsolvable("no")))
        .tier(scripted(TierId::Computational, Outcome::unsolvable("no")))
        .tier(scripted(TierId::Reasoning, Outcome::unavailable("loading")))
        .build();

    for (text, tier) in [
        ("1+1", None),
        ("mean of 3 and 5", None),
        ("why", None),
        ("x", Some(TierId::Computational)),
        ("y", Some(TierId::Reasoning)),
    ] {
        let mut query = Query::new(text);
        if let Some(tier) = tier {
            query = query.with_tier(tier);
        }
        let report = orchestrator.submit(query).await.expect("submit");
        let tiers = path_tiers(&report);
        assert!(
            tiers.windows(2).all(|w| w[0] < w[1]),
            "path for {text:?} not strictly increasing: {tiers:?}"
        );
        assert_eq!(tiers.first(), Some(&report.initial_tier));
    }
}

#[tokio::test]
async fn test_stuck_tier_is_cut_off_by_budget() {
    let stuck = StuckTier::new(TierId::Symbolic);
    let orchestrator = CascadeOrchestrator::builder()
        .tier(stuck.clone())
        .tier(scripted(TierId::Computational, Outcome::solved("4", "script")))
        .budget(TierId::Symbolic, Duration::from_millis(50))
        .build();

    let started = Instant::now();
    let report = orchestrator.submit(Query::new("2+2")).await.expect("submit");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.final_tier, TierId::Computational);
    assert_eq!(report.path[0].outcome, OutcomeKind::Unavailable);
    assert_eq!(stuck.calls.load(Ordering::SeqCst), 1);
    assert_eq!(orchestrator.inflight_len(), 0);
}

#[tokio::test]
async fn test_every_submit_terminates_within_summed_budgets() {
    let orchestrator = CascadeOrchestrator::builder()
        .tier(StuckTier::new(TierId::Symbolic))
        .tier(StuckTier::new(TierId::Computational))
        .tier(StuckTier::new(TierId::Reasoning))
        .budget(TierId::Symbolic, Duration::from_millis(30))
        .budget(TierId::Computational, Duration::from_millis(30))
        .budget(TierId::Reasoning, Duration::from_millis(30))
        .build();

    let bound = orchestrator.budgets().total() + Duration::from_secs(1);
    let report = tokio::time::timeout(bound, orchestrator.submit(Query::new("2+2")))
        .await
        .expect("submit must finish within the summed budgets")
        .expect("submit");
    assert!(report.is_declined());
}

#[tokio::test]
async fn test_panicking_adapter_becomes_unavailable() {
    let orchestrator = CascadeOrchestrator::builder()
        .tier(Arc::new(PanickingTier))
        .tier(scripted(TierId::Computational, Outcome::solved("4", "script")))
        .build();

    let report = orchestrator.submit(Query::new("2+2")).await.expect("submit");
    assert_eq!(report.answer(), Some("4"));
    assert_eq!(report.path[0].tier, TierId::Symbolic);
    assert_eq!(report.path[0].outcome, OutcomeKind::Unavailable);
    assert_eq!(orchestrator.inflight_len(), 0);
}

#[tokio::test]
async fn test_cancelled_caller_does_not_cancel_computation() {
    let symbolic = Arc::new(
        ScriptedTier::new(TierId::Symbolic, Outcome::solved("4", "script"))
            .with_delay(Duration::from_millis(150)),
    );
    let orchestrator = CascadeOrchestrator::builder()
        .tier(symbolic.clone())
        .build();

    let abandoned =
        tokio::time::timeout(Duration::from_millis(20), orchestrator.submit(Query::new("2+2")))
            .await;
    assert!(abandoned.is_err(), "caller should have given up");

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        orchestrator
            .cache()
            .get(&fingerprint("2+2"), TierId::Symbolic)
            .await,
        Some(Outcome::solved("4", "script"))
    );

    let report = orchestrator.submit(Query::new("2+2")).await.expect("submit");
    assert!(report.from_cache);
    assert_eq!(symbolic.calls(), 1);
}

#[tokio::test]
async fn test_invalidate_cache_forces_recomputation() {
    let symbolic = scripted(TierId::Symbolic, Outcome::solved("4", "script"));
    let orchestrator = CascadeOrchestrator::builder()
        .tier(symbolic.clone())
        .build();

    orchestrator.submit(Query::new("2+2")).await.expect("first");
    orchestrator.invalidate_cache().await;
    let report = orchestrator.submit(Query::new("2+2")).await.expect("second");

    assert!(!report.from_cache);
    assert_eq!(symbolic.calls(), 2);
}

#[tokio::test]
async fn test_symbolic_failure_cached_forever_by_default() {
    let symbolic = scripted(TierId::Symbolic, Outcome::unsolvable("nope"));
    let reasoning = scripted(TierId::Reasoning, Outcome::solved("42", "script"));
    let orchestrator = CascadeOrchestrator::builder()
        .tier(symbolic.clone())
        .tier(reasoning)
        .build();

    orchestrator
        .submit(Query::new("2+2"))
        .await
        .expect("first");
    let entry = orchestrator
        .cache()
        .get(&fingerprint("2+2"), TierId::Symbolic)
        .await;
    assert_eq!(entry, Some(Outcome::unsolvable("nope")));
}
