//! Prometheus metrics for the cascade.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`inc_cache_lookup`, `record_tier_attempt`, …) are no-ops if `init_metrics`
//! was never called, so the cascade is always safe to run and observability
//! simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `cascade_cache_lookups_total` | Counter | `tier`, `result` |
//! | `cascade_tier_attempts_total` | Counter | `tier`, `outcome` |
//! | `cascade_tier_duration_seconds` | Histogram | `tier` |
//! | `cascade_completions_total` | Counter | `final_tier` |
//! | `cascade_inflight_joins_total` | Counter | `tier` |

use crate::{CascadeError, OutcomeKind, TierId};
use prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

/// Latency buckets spanning a sub-millisecond symbolic solve to a
/// multi-minute model generation.
const DURATION_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the cascade, bundled together so they can be
/// stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Cache lookups per tier and result (`hit` / `miss`).
    pub cache_lookups: CounterVec,
    /// Tier executions per tier and outcome.
    pub tier_attempts: CounterVec,
    /// Tier execution latency.
    pub tier_duration: HistogramVec,
    /// Finished cascades per final tier.
    pub completions: CounterVec,
    /// Requests that joined an in-flight computation.
    pub inflight_joins: CounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

impl Metrics {
    /// Build a bundle with every metric name prefixed by `prefix`, registered
    /// in a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns [`CascadeError::Other`] if a descriptor is invalid or clashes.
    pub fn new(prefix: &str) -> Result<Self, CascadeError> {
        let registry = Registry::new();

        let cache_lookups = register(
            &registry,
            CounterVec::new(
                Opts::new(
                    format!("{prefix}_cache_lookups_total"),
                    "Cache lookups by tier and result",
                ),
                &["tier", "result"],
            ),
        )?;

        let tier_attempts = register(
            &registry,
            CounterVec::new(
                Opts::new(
                    format!("{prefix}_tier_attempts_total"),
                    "Tier executions by outcome",
                ),
                &["tier", "outcome"],
            ),
        )?;

        let tier_duration = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(
                    format!("{prefix}_tier_duration_seconds"),
                    "Tier execution latency",
                )
                .buckets(DURATION_BUCKETS.to_vec()),
                &["tier"],
            ),
        )?;

        let completions = register(
            &registry,
            CounterVec::new(
                Opts::new(
                    format!("{prefix}_completions_total"),
                    "Finished cascades by final tier",
                ),
                &["final_tier"],
            ),
        )?;

        let inflight_joins = register(
            &registry,
            CounterVec::new(
                Opts::new(
                    format!("{prefix}_inflight_joins_total"),
                    "Requests served by joining an in-flight computation",
                ),
                &["tier"],
            ),
        )?;

        Ok(Self {
            registry,
            cache_lookups,
            tier_attempts,
            tier_duration,
            completions,
            inflight_joins,
        })
    }
}

fn register<C>(registry: &Registry, built: prometheus::Result<C>) -> Result<C, CascadeError>
where
    C: Collector + Clone + 'static,
{
    let collector =
        built.map_err(|e| CascadeError::Other(format!("metrics init failed: {e}")))?;
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| CascadeError::Other(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`CascadeError::Other`] if metric construction or registry
/// registration fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), CascadeError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let bundle = Metrics::new("cascade")?;
    // If another thread raced us, the first one wins; descriptors are identical.
    let _ = METRICS.set(bundle);
    Ok(())
}

/// Return a reference to the initialised [`Metrics`], or `None` if
/// [`init_metrics`] has not been called yet.
fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count a cache lookup at `tier`.
///
/// No-op if metrics have not been initialised.
pub fn inc_cache_lookup(tier: TierId, hit: bool) {
    if let Some(m) = metrics() {
        let result = if hit { "hit" } else { "miss" };
        if let Ok(c) = m
            .cache_lookups
            .get_metric_with_label_values(&[tier.as_str(), result])
        {
            c.inc();
        }
    }
}

/// Count one tier execution and observe its latency.
///
/// No-op if metrics have not been initialised.
pub fn record_tier_attempt(tier: TierId, outcome: OutcomeKind, d: Duration) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .tier_attempts
            .get_metric_with_label_values(&[tier.as_str(), outcome.as_str()])
        {
            c.inc();
        }
        if let Ok(h) = m.tier_duration.get_metric_with_label_values(&[tier.as_str()]) {
            h.observe(d.as_secs_f64());
        }
    }
}

/// Count a finished cascade.
///
/// No-op if metrics have not been initialised.
pub fn inc_completion(final_tier: TierId) {
    if let Some(m) = metrics() {
        if let Ok(c) = m
            .completions
            .get_metric_with_label_values(&[final_tier.as_str()])
        {
            c.inc();
        }
    }
}

/// Count a request that joined an in-flight computation.
///
/// No-op if metrics have not been initialised.
pub fn inc_inflight_join(tier: TierId) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.inflight_joins.get_metric_with_label_values(&[tier.as_str()]) {
            c.inc();
        }
    }
}

/// Gather all registered metrics as a raw list of metric families.
///
/// Returns an empty `Vec` if metrics have not been initialised.
pub fn gather() -> Vec<prometheus::proto::MetricFamily> {
    metrics().map_or_else(Vec::new, |m| m.registry.gather())
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let families = gather();
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
