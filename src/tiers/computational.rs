//! Computational tier: external computational knowledge API.
//!
//! [`ComputationalTier`] wraps a [`ComputationalClient`] with three guards,
//! checked in order before any network call:
//! 1. a monthly [`UsageBudget`] (the hosted API bills per call),
//! 2. a per-minute rate limit (governor token bucket),
//! 3. a circuit breaker that stops hammering a backend that keeps failing.
//!
//! ## Environment Variables
//!
//! - `WOLFRAM_APP_ID`: application id for [`WolframClient`] (name configurable)

use super::TierAdapter;
use crate::breaker::{CircuitBreaker, CircuitBreakerError};
use crate::{Outcome, SolveMetadata, TierId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Failure modes of a computational backend call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// The backend answered but could not interpret the query.
    #[error("backend did not understand the query: {0}")]
    NotUnderstood(String),

    /// No credentials were configured.
    #[error("no credentials configured for the computational backend")]
    MissingCredentials,

    /// Credentials were rejected.
    #[error("credentials rejected: {0}")]
    Unauthorized(String),

    /// The backend throttled us.
    #[error("rate limited by backend")]
    RateLimited,

    /// Connection-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// The call exceeded its deadline.
    #[error("request timed out")]
    Timeout,

    /// Any other non-success HTTP status.
    #[error("http {status}: {body}")]
    Http {
        /// Status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },
}

impl ClientError {
    /// Whether this failure says something about backend health and should
    /// count toward opening the circuit.
    pub fn is_outage(&self) -> bool {
        match self {
            ClientError::Network(_)
            | ClientError::Timeout
            | ClientError::RateLimited
            | ClientError::Unauthorized(_) => true,
            ClientError::Http { status, .. } => *status >= 500,
            ClientError::NotUnderstood(_) | ClientError::MissingCredentials => false,
        }
    }

    /// Whether the request plausibly reached the backend and was billed.
    fn was_billed(&self) -> bool {
        !matches!(
            self,
            ClientError::MissingCredentials | ClientError::Network(_) | ClientError::Timeout
        )
    }
}

/// Client for a computational knowledge API.
#[async_trait]
pub trait ComputationalClient: Send + Sync {
    /// Backend name recorded in solve metadata.
    fn name(&self) -> &str;

    /// Send `text` and return the plain-text answer.
    async fn query(&self, text: &str, timeout: Duration) -> Result<String, ClientError>;
}

// ============================================================================
// Usage Budget
// ============================================================================

/// Which share of the monthly plan a process draws from.
///
/// The plan is split so development traffic can never eat the calls
/// reserved for production.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPool {
    /// Capped at the development budget.
    Development,
    /// Everything the development budget does not claim.
    #[default]
    Production,
}

impl BudgetPool {
    /// Stable lowercase label.
    pub fn as_str(self) -> &'static str {
        match self {
            BudgetPool::Development => "development",
            BudgetPool::Production => "production",
        }
    }
}

/// Share of a pool that triggers a warning.
const WARNING_RATIO: f64 = 0.9;

/// Calendar-month call budget. Resets when the UTC month changes.
///
/// With [`UsageBudget::persist_to`] the counters are kept in a small JSON
/// document, so restarts do not hand out the month's calls a second time.
/// The document is rewritten through a temp file and a rename after every
/// change.
#[derive(Debug)]
pub struct UsageBudget {
    limit: u32,
    development_limit: u32,
    pool: BudgetPool,
    path: Option<PathBuf>,
    state: Mutex<BudgetState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BudgetState {
    month: String,
    #[serde(default)]
    development_used: u32,
    #[serde(default)]
    production_used: u32,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
}

impl BudgetState {
    fn fresh(month: String) -> Self {
        Self {
            month,
            development_used: 0,
            production_used: 0,
            last_updated: None,
        }
    }

    fn used_mut(&mut self, pool: BudgetPool) -> &mut u32 {
        match pool {
            BudgetPool::Development => &mut self.development_used,
            BudgetPool::Production => &mut self.production_used,
        }
    }

    fn used(&self, pool: BudgetPool) -> u32 {
        match pool {
            BudgetPool::Development => self.development_used,
            BudgetPool::Production => self.production_used,
        }
    }
}

/// Point-in-time budget figures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    /// Calendar month the figures apply to (`YYYY-MM`).
    pub month: String,
    /// Pool this process draws from.
    pub pool: BudgetPool,
    /// Calls used from the pool this month.
    pub used: u32,
    /// Size of the pool.
    pub limit: u32,
    /// Calls used this month across both pools.
    pub total_used: u32,
    /// Whole monthly plan.
    pub monthly_limit: u32,
    /// At or past the warning threshold of the pool.
    pub near_limit: bool,
}

impl BudgetSnapshot {
    /// Calls left in the pool.
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }
}

impl UsageBudget {
    /// A budget of `limit` calls per calendar month, all of it production,
    /// held in memory only.
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            development_limit: 0,
            pool: BudgetPool::Production,
            path: None,
            state: Mutex::new(BudgetState::fresh(current_month())),
        }
    }

    /// Set aside `development_limit` calls of the plan for development.
    /// Clamped to the monthly limit.
    pub fn with_development_limit(mut self, development_limit: u32) -> Self {
        self.development_limit = development_limit.min(self.limit);
        self
    }

    /// Draw from `pool`.
    pub fn with_pool(mut self, pool: BudgetPool) -> Self {
        self.pool = pool;
        self
    }

    /// Keep the counters in the JSON document at `path`, loading what a
    /// previous process recorded. A missing or unreadable document starts
    /// the month from zero.
    pub fn persist_to(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        if let Some(loaded) = load_state(&path) {
            let mut state = loaded;
            roll_over(&mut state, &current_month());
            debug!(
                path = %path.display(),
                month = %state.month,
                development_used = state.development_used,
                production_used = state.production_used,
                "usage budget loaded"
            );
            self.state = Mutex::new(state);
        }
        self.path = Some(path);
        self
    }

    /// Size of the pool this process draws from.
    pub fn pool_limit(&self) -> u32 {
        match self.pool {
            BudgetPool::Development => self.development_limit,
            BudgetPool::Production => self.limit - self.development_limit,
        }
    }

    /// Reserve one call. Returns `false` when the pool is spent for the month.
    pub fn try_reserve(&self) -> bool {
        self.try_reserve_in(&current_month())
    }

    /// Give back a reservation for a call that never reached the backend.
    pub fn release(&self) {
        let mut state = self.state.lock();
        let used = state.used_mut(self.pool);
        *used = used.saturating_sub(1);
        self.save(&mut state);
    }

    /// Current usage.
    pub fn snapshot(&self) -> BudgetSnapshot {
        let mut state = self.state.lock();
        roll_over(&mut state, &current_month());
        self.snapshot_of(&state)
    }

    fn snapshot_of(&self, state: &BudgetState) -> BudgetSnapshot {
        let used = state.used(self.pool);
        let limit = self.pool_limit();
        BudgetSnapshot {
            month: state.month.clone(),
            pool: self.pool,
            used,
            limit,
            total_used: state.development_used + state.production_used,
            monthly_limit: self.limit,
            near_limit: used >= warning_threshold(limit),
        }
    }

    fn try_reserve_in(&self, month: &str) -> bool {
        let mut state = self.state.lock();
        roll_over(&mut state, month);
        let limit = self.pool_limit();
        let used = state.used_mut(self.pool);
        if *used >= limit {
            return false;
        }
        *used += 1;
        let used = *used;

        if used == warning_threshold(limit) {
            warn!(
                pool = self.pool.as_str(),
                used,
                limit,
                "computational budget nearly spent"
            );
        }
        self.save(&mut state);
        true
    }

    /// Rewrite the document. Runs under the state lock so saves never land
    /// out of order.
    fn save(&self, state: &mut BudgetState) {
        let Some(path) = &self.path else {
            return;
        };
        state.last_updated = Some(Utc::now());
        if let Err(e) = write_state(path, state) {
            warn!(path = %path.display(), error = %e, "usage budget not persisted");
        }
    }
}

fn warning_threshold(limit: u32) -> u32 {
    (f64::from(limit) * WARNING_RATIO).ceil() as u32
}

fn roll_over(state: &mut BudgetState, month: &str) {
    if state.month != month {
        debug!(from = %state.month, to = month, "usage budget: new month, counter reset");
        *state = BudgetState::fresh(month.to_string());
    }
}

fn current_month() -> String {
    Utc::now().format("%Y-%m").to_string()
}

fn load_state(path: &Path) -> Option<BudgetState> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "usage budget unreadable, starting fresh");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(state) => Some(state),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "usage budget corrupt, starting fresh");
            None
        }
    }
}

fn write_state(path: &Path, state: &BudgetState) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_vec_pretty(state)?;
    let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp, &body)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

// ============================================================================
// Computational Tier
// ============================================================================

type DirectLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Adapter for the computational tier.
pub struct ComputationalTier {
    client: Arc<dyn ComputationalClient>,
    budget: UsageBudget,
    limiter: Option<DirectLimiter>,
    breaker: CircuitBreaker,
}

impl ComputationalTier {
    /// Wrap `client` with a monthly budget and a default breaker
    /// (5 consecutive outages, 60 s cooldown). No per-minute limit.
    pub fn new(client: Arc<dyn ComputationalClient>, monthly_budget: u32) -> Self {
        Self {
            client,
            budget: UsageBudget::new(monthly_budget),
            limiter: None,
            breaker: CircuitBreaker::new("computational", 5, 0.5, Duration::from_secs(60)),
        }
    }

    /// Allow at most `per_minute` calls per minute. Zero disables the limit.
    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.limiter = NonZeroU32::new(per_minute)
            .map(|n| GovernorRateLimiter::direct(Quota::per_minute(n)));
        self
    }

    /// Replace the usage budget.
    pub fn with_budget(mut self, budget: UsageBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Replace the circuit breaker.
    pub fn with_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = breaker;
        self
    }

    /// Current budget figures.
    pub fn budget(&self) -> BudgetSnapshot {
        self.budget.snapshot()
    }
}

#[async_trait]
impl TierAdapter for ComputationalTier {
    fn tier(&self) -> TierId {
        TierId::Computational
    }

    fn name(&self) -> &str {
        self.client.name()
    }

    fn usage(&self) -> Option<BudgetSnapshot> {
        Some(self.budget.snapshot())
    }

    async fn attempt(&self, query: &str, timeout: Duration) -> Outcome {
        if !self.budget.try_reserve() {
            let snap = self.budget.snapshot();
            warn!(used = snap.used, limit = snap.limit, "computational budget exhausted");
            return Outcome::unavailable(format!(
                "monthly computational budget exhausted ({}/{})",
                snap.used, snap.limit
            ));
        }

        if let Some(limiter) = &self.limiter {
            if limiter.check().is_err() {
                self.budget.release();
                debug!("computational rate limit reached");
                return Outcome::unavailable("computational rate limit reached");
            }
        }

        let client = Arc::clone(&self.client);
        let result = self
            .breaker
            .call(|| async move {
                match client.query(query, timeout).await {
                    Err(e) if e.is_outage() => Err(e),
                    other => Ok(other),
                }
            })
            .await;

        match result {
            Ok(Ok(answer)) => {
                let snap = self.budget.snapshot();
                Outcome::Solved {
                    answer,
                    metadata: SolveMetadata::from_source(self.client.name())
                        .with_detail("budget_used", snap.used.to_string())
                        .with_detail("budget_limit", snap.limit.to_string()),
                }
            }
            Ok(Err(ClientError::NotUnderstood(reason))) => Outcome::unsolvable(reason),
            Ok(Err(e)) | Err(CircuitBreakerError::Failed(e)) => {
                if !e.was_billed() {
                    self.budget.release();
                }
                warn!(backend = self.client.name(), error = %e, "computational call failed");
                Outcome::unavailable(e.to_string())
            }
            Err(CircuitBreakerError::Open) => {
                self.budget.release();
                Outcome::unavailable("computational backend circuit open")
            }
        }
    }
}

// ============================================================================
// Wolfram|Alpha Client
// ============================================================================

/// Wolfram|Alpha short-answer client.
///
/// Asks the Short Answers API (`/v1/result`) first and falls back to the
/// Spoken Results API (`/v1/spoken`) when the short form is not available.
///
/// ## Example
///
/// ```no_run
/// use tokio_math_cascade::tiers::WolframClient;
///
/// let client = WolframClient::from_env("WOLFRAM_APP_ID")
///     .with_base_url("https://api.wolframalpha.com");
/// ```
pub struct WolframClient {
    client: reqwest::Client,
    app_id: Option<String>,
    base_url: String,
}

impl WolframClient {
    /// Client with an explicit application id.
    pub fn new(app_id: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            app_id: app_id.filter(|id| !id.trim().is_empty()),
            base_url: "https://api.wolframalpha.com".to_string(),
        }
    }

    /// Read the application id from environment variable `var`.
    pub fn from_env(var: &str) -> Self {
        Self::new(std::env::var(var).ok())
    }

    /// Point the client at another host (tests, proxies).
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Whether an application id is configured.
    pub fn has_credentials(&self) -> bool {
        self.app_id.is_some()
    }

    async fn get(
        &self,
        path: &str,
        app_id: &str,
        text: &str,
        timeout: Duration,
    ) -> Result<String, ClientError> {
        let url = reqwest::Url::parse_with_params(
            &format!("{}{}", self.base_url, path),
            &[("appid", app_id), ("i", text)],
        )
        .map_err(|e| ClientError::Network(format!("invalid url: {e}")))?;

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_transport_error)?;
        let body = body.trim().to_string();

        match status {
            200 if body.is_empty() => Err(ClientError::NotUnderstood("empty answer".to_string())),
            200 => Ok(body),
            501 => Err(ClientError::NotUnderstood(body)),
            401 | 403 => Err(ClientError::Unauthorized(body)),
            429 => Err(ClientError::RateLimited),
            _ => Err(ClientError::Http {
                status,
                body: body.chars().take(200).collect(),
            }),
        }
    }
}

fn map_transport_error(e: reqwest::Error) -> ClientError {
    if e.is_timeout() {
        ClientError::Timeout
    } else {
        ClientError::Network(e.to_string())
    }
}

#[async_trait]
impl ComputationalClient for WolframClient {
    fn name(&self) -> &str {
        "wolfram_alpha"
    }

    async fn query(&self, text: &str, timeout: Duration) -> Result<String, ClientError> {
        let app_id = self
            .app_id
            .as_deref()
            .ok_or(ClientError::MissingCredentials)?;

        match self.get("/v1/result", app_id, text, timeout).await {
            Err(ClientError::NotUnderstood(first)) => {
                debug!(reason = %first, "short answer unavailable, trying spoken results");
                self.get("/v1/spoken", app_id, text, timeout).await
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::OutcomeKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedClient {
        reply: Result<String, ClientError>,
        calls: AtomicUsize,
    }

    impl FixedClient {
        fn new(reply: Result<String, ClientError>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ComputationalClient for FixedClient {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn query(&self, _text: &str, _timeout: Duration) -> Result<String, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    const BUDGET: Duration = Duration::from_secs(1);

    #[test]
    fn test_budget_exhausts_and_rolls_over() {
        let budget = UsageBudget::new(2);
        assert!(budget.try_reserve_in("2026-01"));
        assert!(budget.try_reserve_in("2026-01"));
        assert!(!budget.try_reserve_in("2026-01"));
        assert!(budget.try_reserve_in("2026-02"), "new month resets usage");
    }

    #[test]
    fn test_budget_release_never_underflows() {
        let budget = UsageBudget::new(1);
        budget.release();
        assert_eq!(budget.snapshot().used, 0);
    }

    #[tokio::test]
    async fn test_answer_is_solved_with_budget_detail() {
        let tier = ComputationalTier::new(FixedClient::new(Ok("37.78 °C".into())), 10);
        let outcome = tier.attempt("convert 100 fahrenheit to celsius", BUDGET).await;
        match outcome {
            Outcome::Solved { answer, metadata } => {
                assert_eq!(answer, "37.78 °C");
                assert_eq!(metadata.source, "fixed");
                assert_eq!(metadata.detail.get("budget_used").map(String::as_str), Some("1"));
            }
            other => panic!("expected solved, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_not_understood_is_unsolvable() {
        let tier = ComputationalTier::new(
            FixedClient::new(Err(ClientError::NotUnderstood("no idea".into()))),
            10,
        );
        assert_eq!(
            tier.attempt("prove it", BUDGET).await,
            Outcome::unsolvable("no idea")
        );
    }

    #[tokio::test]
    async fn test_missing_credentials_is_unavailable_and_not_billed() {
        let tier = ComputationalTier::new(FixedClient::new(Err(ClientError::MissingCredentials)), 10);
        let outcome = tier.attempt("mean of 1,2,3", BUDGET).await;
        assert_eq!(outcome.kind(), OutcomeKind::Unavailable);
        assert_eq!(tier.budget().used, 0);
    }

    #[tokio::test]
    async fn test_exhausted_budget_skips_backend() {
        let client = FixedClient::new(Ok("1".into()));
        let tier = ComputationalTier::new(client.clone(), 1);
        assert!(tier.attempt("a", BUDGET).await.is_solved());
        let outcome = tier.attempt("b", BUDGET).await;
        assert_eq!(outcome.kind(), OutcomeKind::Unavailable);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_burst() {
        let client = FixedClient::new(Ok("1".into()));
        let tier = ComputationalTier::new(client.clone(), 100).with_rate_limit(1);
        assert!(tier.attempt("a", BUDGET).await.is_solved());
        let outcome = tier.attempt("b", BUDGET).await;
        assert_eq!(outcome, Outcome::unavailable("computational rate limit reached"));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
        assert_eq!(tier.budget().used, 1, "rejected call must not be billed");
    }

    #[tokio::test]
    async fn test_breaker_opens_after_outages() {
        let client = FixedClient::new(Err(ClientError::Network("refused".into())));
        let tier = ComputationalTier::new(client.clone(), 100).with_breaker(CircuitBreaker::new(
            "test",
            2,
            0.5,
            Duration::from_secs(60),
        ));
        for _ in 0..2 {
            assert_eq!(tier.attempt("q", BUDGET).await.kind(), OutcomeKind::Unavailable);
        }
        let outcome = tier.attempt("q", BUDGET).await;
        assert_eq!(outcome, Outcome::unavailable("computational backend circuit open"));
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_not_understood_does_not_trip_breaker() {
        let client = FixedClient::new(Err(ClientError::NotUnderstood("?".into())));
        let tier = ComputationalTier::new(client.clone(), 100).with_breaker(CircuitBreaker::new(
            "test",
            1,
            0.5,
            Duration::from_secs(60),
        ));
        for _ in 0..3 {
            assert_eq!(tier.attempt("q", BUDGET).await.kind(), OutcomeKind::Unsolvable);
        }
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_wolfram_client_without_app_id() {
        let client = WolframClient::new(Some("  ".into()));
        assert!(!client.has_credentials());
        assert_eq!(
            client.query("2+2", BUDGET).await,
            Err(ClientError::MissingCredentials)
        );
    }

    #[test]
    fn test_usage_survives_restart() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let path = dir.path().join("usage.json");

        let budget = UsageBudget::new(2).persist_to(&path);
        assert!(budget.try_reserve());
        assert!(budget.try_reserve());
        drop(budget);

        let restarted = UsageBudget::new(2).persist_to(&path);
        assert_eq!(restarted.snapshot().used, 2);
        assert!(!restarted.try_reserve(), "spent calls must stay spent");
    }

    #[test]
    fn test_release_is_persisted() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let path = dir.path().join("usage.json");

        let budget = UsageBudget::new(5).persist_to(&path);
        assert!(budget.try_reserve());
        budget.release();

        let restarted = UsageBudget::new(5).persist_to(&path);
        assert_eq!(restarted.snapshot().used, 0);
    }

    #[test]
    fn test_stale_month_on_disk_rolls_over() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let path = dir.path().join("usage.json");
        std::fs::write(
            &path,
            r#"{"month":"1999-12","development_used":3,"production_used":9}"#,
        )
        .expect("test: write");

        let budget = UsageBudget::new(10).persist_to(&path);
        let snapshot = budget.snapshot();
        assert_eq!(snapshot.month, current_month());
        assert_eq!(snapshot.total_used, 0);
    }

    #[test]
    fn test_corrupt_usage_document_starts_fresh() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let path = dir.path().join("usage.json");
        std::fs::write(&path, b"{not json").expect("test: write");

        let budget = UsageBudget::new(3).persist_to(&path);
        assert_eq!(budget.snapshot().used, 0);
        assert!(budget.try_reserve());

        let raw = std::fs::read_to_string(&path).expect("test: read");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("test: rewritten as json");
        assert_eq!(value["production_used"], 1);
        assert!(value["last_updated"].is_string());
    }

    #[test]
    fn test_pools_split_the_monthly_plan() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        let path = dir.path().join("usage.json");

        let dev = UsageBudget::new(5)
            .with_development_limit(2)
            .with_pool(BudgetPool::Development)
            .persist_to(&path);
        assert_eq!(dev.pool_limit(), 2);
        assert!(dev.try_reserve());
        assert!(dev.try_reserve());
        assert!(!dev.try_reserve());
        drop(dev);

        let prod = UsageBudget::new(5).with_development_limit(2).persist_to(&path);
        assert_eq!(prod.pool_limit(), 3);
        for _ in 0..3 {
            assert!(prod.try_reserve());
        }
        assert!(!prod.try_reserve());

        let snapshot = prod.snapshot();
        assert_eq!(snapshot.pool, BudgetPool::Production);
        assert_eq!(snapshot.used, 3);
        assert_eq!(snapshot.total_used, 5);
        assert_eq!(snapshot.monthly_limit, 5);
        assert_eq!(snapshot.remaining(), 0);
    }

    #[test]
    fn test_near_limit_at_ninety_percent() {
        let budget = UsageBudget::new(10);
        for _ in 0..8 {
            assert!(budget.try_reserve());
        }
        assert!(!budget.snapshot().near_limit);
        assert!(budget.try_reserve());
        assert!(budget.snapshot().near_limit);
    }

    #[test]
    fn test_tier_reports_usage() {
        let client = FixedClient::new(Ok("1".into()));
        let tier = ComputationalTier::new(client, 100)
            .with_budget(UsageBudget::new(10).with_development_limit(4));
        let usage = tier.usage().expect("test: computational tier has a budget");
        assert_eq!(usage.limit, 6);
        assert_eq!(usage.used, 0);
    }

    #[test]
    fn test_outage_classification() {
        assert!(ClientError::Timeout.is_outage());
        assert!(ClientError::Http { status: 503, body: String::new() }.is_outage());
        assert!(!ClientError::Http { status: 400, body: String::new() }.is_outage());
        assert!(!ClientError::NotUnderstood(String::new()).is_outage());
    }
}
