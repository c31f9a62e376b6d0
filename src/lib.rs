//! # tokio-math-cascade
//!
//! A tiered query cascade for math questions over Tokio.
//!
//! ## Architecture
//!
//! Every query is fingerprinted, classified to a starting tier and then walked
//! forward through a fixed tier order until one tier solves it:
//! ```text
//! raw query → Fingerprint → Classifier → [cache? in-flight? attempt] Symbolic
//!                                      → [cache? in-flight? attempt] Computational
//!                                      → [cache? in-flight? attempt] Reasoning
//!                                      → Declined (polite decline, cached briefly)
//! ```
//!
//! Each `(fingerprint, tier)` pair is executed at most once concurrently and
//! its outcome is memoised in a two-level cache (in-process map + durable
//! store) with tier-specific lifetimes.

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod breaker;
pub mod cache;
pub mod classifier;
pub mod config;
pub mod fingerprint;
pub mod inflight;
pub mod metrics;
pub mod orchestrator;
pub mod stats;
pub mod tiers;

#[cfg(feature = "web-api")]
pub mod web_api;

// Re-exports for convenience
pub use cache::{TieredCache, TtlPolicy};
pub use classifier::Classifier;
pub use fingerprint::{fingerprint, normalize, Fingerprint};
pub use orchestrator::{CascadeOrchestrator, CascadeReport, OrchestratorBuilder, TierStep};
pub use stats::{StatsCollector, StatsSink, StatsSnapshot};
pub use tiers::{ScriptedTier, TierAdapter, TierSet};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`CascadeError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```no_run
/// # use tokio_math_cascade::{init_tracing, CascadeError};
/// # fn example() -> Result<(), CascadeError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), CascadeError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| CascadeError::Other(format!("tracing init failed: {e}")))
}

/// Top-level cascade errors.
///
/// Tier failures are never errors: they are modelled as [`Outcome`] values
/// and drive the cascade forward. Only the conditions below surface as `Err`.
#[derive(Error, Debug)]
pub enum CascadeError {
    /// An internal invariant was broken (e.g. an in-flight registration
    /// vanished without publishing an outcome). Aborts the current request only.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// A configuration value is missing or invalid.
    ///
    /// Returned at construction time so misconfiguration surfaces immediately
    /// rather than at the first submitted query.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// The durable cache layer could not be opened.
    #[error("cache store error: {0}")]
    Store(#[from] cache::store::StoreError),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// A raw query as submitted by a caller. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    /// The raw, un-normalised query text.
    pub text: String,
    /// Explicit starting tier chosen by the caller instead of the classifier.
    pub tier_override: Option<TierId>,
}

impl Query {
    /// Create a query that lets the classifier pick the starting tier.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tier_override: None,
        }
    }

    /// Start the cascade at `tier` instead of the classifier's choice.
    pub fn with_tier(mut self, tier: TierId) -> Self {
        self.tier_override = Some(tier);
        self
    }
}

/// The fixed, totally ordered set of cascade tiers.
///
/// The derived `Ord` is the cascade direction: a cascade only ever moves from
/// a lower tier to a higher one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierId {
    /// Offline symbolic/arithmetic solver. Deterministic and cheap.
    Symbolic,
    /// External computational knowledge API. Network bound.
    Computational,
    /// Local language-model reasoning. Slow, most capable.
    Reasoning,
    /// Terminal tier: every solving tier failed.
    Declined,
}

impl TierId {
    /// All tiers in cascade order.
    pub const ALL: [TierId; 4] = [
        TierId::Symbolic,
        TierId::Computational,
        TierId::Reasoning,
        TierId::Declined,
    ];

    /// The tiers that run a solver (everything except [`TierId::Declined`]).
    pub const SOLVING: [TierId; 3] = [TierId::Symbolic, TierId::Computational, TierId::Reasoning];

    /// The tier after this one, or `None` for [`TierId::Declined`].
    pub fn next(self) -> Option<TierId> {
        match self {
            TierId::Symbolic => Some(TierId::Computational),
            TierId::Computational => Some(TierId::Reasoning),
            TierId::Reasoning => Some(TierId::Declined),
            TierId::Declined => None,
        }
    }

    /// Position of this tier in [`TierId::ALL`].
    pub fn index(self) -> usize {
        match self {
            TierId::Symbolic => 0,
            TierId::Computational => 1,
            TierId::Reasoning => 2,
            TierId::Declined => 3,
        }
    }

    /// Stable lowercase label used in keys, logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            TierId::Symbolic => "symbolic",
            TierId::Computational => "computational",
            TierId::Reasoning => "reasoning",
            TierId::Declined => "declined",
        }
    }
}

impl fmt::Display for TierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a string does not name a tier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown tier '{0}' (expected symbolic, computational, reasoning or declined)")]
pub struct ParseTierError(pub String);

impl FromStr for TierId {
    type Err = ParseTierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "symbolic" | "sympy" | "l1" => Ok(TierId::Symbolic),
            "computational" | "wolfram" | "l2" => Ok(TierId::Computational),
            "reasoning" | "llm" | "l3" => Ok(TierId::Reasoning),
            "declined" => Ok(TierId::Declined),
            other => Err(ParseTierError(other.to_string())),
        }
    }
}

/// Provenance attached to a solved outcome.
///
/// Every field is defaulted on deserialisation so persisted entries written by
/// older builds still load after fields are added.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolveMetadata {
    /// Name of the adapter or backend that produced the answer.
    #[serde(default)]
    pub source: String,
    /// Free-form adapter details (tokens generated, API endpoint used, ...).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub detail: BTreeMap<String, String>,
}

impl SolveMetadata {
    /// Metadata naming only the producing source.
    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            detail: BTreeMap::new(),
        }
    }

    /// Attach one detail key/value pair.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }
}

/// Result of attempting one tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// The tier produced an answer.
    Solved {
        /// The answer text.
        answer: String,
        /// Where the answer came from.
        #[serde(default)]
        metadata: SolveMetadata,
    },
    /// The tier ran and determined it cannot answer. The cascade advances.
    Unsolvable {
        /// Why the tier gave up.
        reason: String,
    },
    /// The tier could not run at all (no network, model not loaded, timeout).
    /// The cascade advances; tracked separately for alerting.
    Unavailable {
        /// What was unavailable.
        reason: String,
    },
}

/// Discriminant of an [`Outcome`], used for counters and labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    /// See [`Outcome::Solved`].
    Solved,
    /// See [`Outcome::Unsolvable`].
    Unsolvable,
    /// See [`Outcome::Unavailable`].
    Unavailable,
}

impl OutcomeKind {
    /// Stable lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeKind::Solved => "solved",
            OutcomeKind::Unsolvable => "unsolvable",
            OutcomeKind::Unavailable => "unavailable",
        }
    }
}

impl Outcome {
    /// A solved outcome with metadata naming `source`.
    pub fn solved(answer: impl Into<String>, source: impl Into<String>) -> Self {
        Outcome::Solved {
            answer: answer.into(),
            metadata: SolveMetadata::from_source(source),
        }
    }

    /// An unsolvable outcome.
    pub fn unsolvable(reason: impl Into<String>) -> Self {
        Outcome::Unsolvable {
            reason: reason.into(),
        }
    }

    /// An unavailable outcome.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Outcome::Unavailable {
            reason: reason.into(),
        }
    }

    /// The discriminant of this outcome.
    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Solved { .. } => OutcomeKind::Solved,
            Outcome::Unsolvable { .. } => OutcomeKind::Unsolvable,
            Outcome::Unavailable { .. } => OutcomeKind::Unavailable,
        }
    }

    /// `true` for [`Outcome::Solved`].
    pub fn is_solved(&self) -> bool {
        matches!(self, Outcome::Solved { .. })
    }

    /// The answer text if solved.
    pub fn answer(&self) -> Option<&str> {
        match self {
            Outcome::Solved { answer, .. } => Some(answer),
            _ => None,
        }
    }

    /// The failure reason if not solved.
    pub fn reason(&self) -> Option<&str> {
        match self {
            Outcome::Solved { .. } => None,
            Outcome::Unsolvable { reason } | Outcome::Unavailable { reason } => Some(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_order_is_fixed_and_total() {
        assert!(TierId::Symbolic < TierId::Computational);
        assert!(TierId::Computational < TierId::Reasoning);
        assert!(TierId::Reasoning < TierId::Declined);
        let mut sorted = TierId::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, TierId::ALL.to_vec());
    }

    #[test]
    fn test_tier_next_walks_forward_and_stops() {
        let mut walked = vec![TierId::Symbolic];
        while let Some(next) = walked.last().and_then(|t| t.next()) {
            walked.push(next);
        }
        assert_eq!(walked, TierId::ALL.to_vec());
        assert_eq!(TierId::Declined.next(), None);
    }

    #[test]
    fn test_tier_index_matches_all_position() {
        for (i, tier) in TierId::ALL.iter().enumerate() {
            assert_eq!(tier.index(), i);
        }
    }

    #[test]
    fn test_tier_from_str_accepts_aliases() {
        assert_eq!("sympy".parse::<TierId>(), Ok(TierId::Symbolic));
        assert_eq!("Wolfram".parse::<TierId>(), Ok(TierId::Computational));
        assert_eq!(" llm ".parse::<TierId>(), Ok(TierId::Reasoning));
        assert_eq!("declined".parse::<TierId>(), Ok(TierId::Declined));
        assert!("quantum".parse::<TierId>().is_err());
    }

    #[test]
    fn test_tier_display_matches_serde_name() {
        for tier in TierId::ALL {
            let json = serde_json::to_string(&tier).expect("test: serialize tier");
            assert_eq!(json, format!("\"{tier}\""));
        }
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let outcome = Outcome::solved("4", "arithmetic");
        let value = serde_json::to_value(&outcome).expect("test: serialize outcome");
        assert_eq!(value["status"], "solved");
        assert_eq!(value["answer"], "4");
        assert_eq!(value["metadata"]["source"], "arithmetic");
    }

    #[test]
    fn test_outcome_deserializes_without_metadata_field() {
        let json = r#"{"status":"solved","answer":"42"}"#;
        let outcome: Outcome = serde_json::from_str(json).expect("test: additive field default");
        assert_eq!(outcome.answer(), Some("42"));
        assert_eq!(outcome.kind(), OutcomeKind::Solved);
    }

    #[test]
    fn test_outcome_reason_only_for_failures() {
        assert_eq!(Outcome::unsolvable("no").reason(), Some("no"));
        assert_eq!(Outcome::unavailable("offline").reason(), Some("offline"));
        assert_eq!(Outcome::solved("1", "x").reason(), None);
    }

    #[test]
    fn test_query_with_tier_sets_override() {
        let q = Query::new("2+2").with_tier(TierId::Reasoning);
        assert_eq!(q.tier_override, Some(TierId::Reasoning));
        assert_eq!(Query::new("2+2").tier_override, None);
    }

    #[test]
    fn test_config_error_display_includes_message() {
        let err = CascadeError::ConfigError("WOLFRAM_APP_ID not set".to_string());
        assert!(err.to_string().contains("WOLFRAM_APP_ID not set"));
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        let _ = init_tracing();
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
