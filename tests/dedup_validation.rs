//! # Deduplication Validation Integration Tests
//!
//! ## Responsibility
//! Validates that identical concurrent submissions share one tier execution.
//! Twenty equivalent queries (differing only in whitespace) are fired at
//! once against a slow tier; exactly one execution may happen and all twenty
//! callers must see the same outcome.

use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_math_cascade::cache::CacheKey;
use tokio_math_cascade::inflight::{InFlightRegistry, Registration};
use tokio_math_cascade::{
    fingerprint, CascadeOrchestrator, Outcome, Query, ScriptedTier, TierId,
};

fn slow_tier(tier: TierId, outcome: Outcome, delay_ms: u64) -> Arc<ScriptedTier> {
    Arc::new(ScriptedTier::new(tier, outcome).with_delay(Duration::from_millis(delay_ms)))
}

#[tokio::test]
async fn test_dedup_20_identical_queries_execute_once() {
    let symbolic = slow_tier(TierId::Symbolic, Outcome::solved("4", "script"), 100);
    let orchestrator = CascadeOrchestrator::builder()
        .tier(symbolic.clone())
        .build();

    let variants = ["2+2", " 2 + 2", "2 +2 ", "2+ 2"];
    let handles: Vec<_> = (0..20)
        .map(|i| {
            let orchestrator = orchestrator.clone();
            let text = variants[i % variants.len()];
            tokio::spawn(async move { orchestrator.submit(Query::new(text)).await })
        })
        .collect();

    let reports: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.expect("task").expect("submit"))
        .collect();

    assert_eq!(symbolic.calls(), 1, "exactly one tier execution");
    assert!(reports
        .iter()
        .all(|r| r.outcome == Outcome::solved("4", "script")));

    let joined = reports.iter().filter(|r| r.path[0].joined).count();
    let cached = reports.iter().filter(|r| r.path[0].from_cache).count();
    let executed = reports.len() - joined - cached;
    assert_eq!(executed, 1, "one leader, the rest joined or hit the cache");

    let stats = orchestrator.stats();
    assert_eq!(stats.per_tier[&TierId::Symbolic].attempts, 1);
    assert_eq!(stats.inflight_joins as usize, joined);
    assert_eq!(orchestrator.inflight_len(), 0);
}

#[tokio::test]
async fn test_dedup_is_per_tier() {
    // the same fingerprint at two tiers must run both
    let symbolic = slow_tier(TierId::Symbolic, Outcome::unsolvable("no"), 50);
    let computational = slow_tier(TierId::Computational, Outcome::solved("4", "script"), 50);
    let orchestrator = CascadeOrchestrator::builder()
        .tier(symbolic.clone())
        .tier(computational.clone())
        .build();

    let (a, b) = tokio::join!(
        orchestrator.submit(Query::new("2+2")),
        orchestrator.submit(Query::new("2+2").with_tier(TierId::Computational)),
    );
    assert_eq!(a.expect("a").answer(), Some("4"));
    assert_eq!(b.expect("b").answer(), Some("4"));
    assert_eq!(symbolic.calls(), 1);
    assert_eq!(computational.calls(), 1);
}

#[tokio::test]
async fn test_distinct_queries_do_not_share_computation() {
    let symbolic = slow_tier(TierId::Symbolic, Outcome::solved("same", "script"), 30);
    let orchestrator = CascadeOrchestrator::builder()
        .tier(symbolic.clone())
        .build();

    let (a, b) = tokio::join!(
        orchestrator.submit(Query::new("x^2").with_tier(TierId::Symbolic)),
        orchestrator.submit(Query::new("x**2").with_tier(TierId::Symbolic)),
    );
    assert!(a.is_ok() && b.is_ok());
    assert_eq!(symbolic.calls(), 2, "x^2 and x**2 are distinct keys");
}

#[tokio::test]
async fn test_joiner_survives_abandoned_leader() {
    let symbolic = slow_tier(TierId::Symbolic, Outcome::solved("4", "script"), 120);
    let orchestrator = CascadeOrchestrator::builder()
        .tier(symbolic.clone())
        .build();

    let leader = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.submit(Query::new("2+2")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let joiner = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.submit(Query::new("2+2")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    leader.abort();

    let report = joiner.await.expect("task").expect("submit");
    assert_eq!(report.answer(), Some("4"));
    assert!(report.path[0].joined);
    assert_eq!(symbolic.calls(), 1);
}

#[tokio::test]
async fn test_registry_recheck_closes_race_window() {
    let registry = InFlightRegistry::new();
    let key = CacheKey::new(&fingerprint("2+2"), TierId::Symbolic);

    // an outcome that landed between the cache miss and registration
    let reg = registry.join_or_register(key.clone(), || Some(Outcome::solved("4", "cache")));
    assert!(matches!(reg, Registration::Cached(_)));
    assert!(!registry.contains(&key));
}
