//! # Stage: Declarative Cascade Configuration
//!
//! ## Responsibility
//! Parse and validate TOML configuration for a cascade instance: tier
//! budgets, cache lifetimes and storage, external tier endpoints, and the
//! ambient logging/metrics/server settings.
//! ```text
//! math-cascade --config cascade.toml --interactive
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `CascadeConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Complete defaults: every section may be omitted; `CascadeConfig::default()`
//!   passes validation
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building the orchestrator from config (that belongs to `orchestrator`)
//! - Reading secrets (only the *name* of the app-id variable lives here)

pub mod loader;
pub mod validation;

use crate::cache::TtlPolicy;
use crate::tiers::BudgetPool;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Default value functions ──────────────────────────────────────────────

fn default_symbolic_timeout_ms() -> u64 {
    2_000
}

fn default_computational_timeout_ms() -> u64 {
    10_000
}

fn default_reasoning_timeout_ms() -> u64 {
    300_000
}

fn default_decline_message() -> String {
    "Sorry, I couldn't solve that one. Try rephrasing it or breaking it into smaller steps."
        .to_string()
}

fn default_max_memory_entries() -> usize {
    512
}

fn default_computational_ttl_s() -> u64 {
    7 * 24 * 3600
}

fn default_reasoning_ttl_s() -> u64 {
    24 * 3600
}

fn default_declined_ttl_s() -> u64 {
    60
}

fn default_unavailable_ttl_s() -> u64 {
    30
}

fn default_cache_path() -> String {
    ".cascade-cache".to_string()
}

fn default_store_breaker_threshold() -> u32 {
    3
}

fn default_store_breaker_cooldown_s() -> u64 {
    30
}

fn default_wolfram_endpoint() -> String {
    "https://api.wolframalpha.com".to_string()
}

fn default_app_id_env() -> String {
    "WOLFRAM_APP_ID".to_string()
}

fn default_monthly_budget() -> u32 {
    2_000
}

fn default_requests_per_minute() -> u32 {
    30
}

fn default_development_budget() -> u32 {
    1_000
}

fn default_usage_path() -> Option<String> {
    Some(".cascade-usage.json".to_string())
}

fn default_api_breaker_threshold() -> u32 {
    5
}

fn default_api_breaker_cooldown_s() -> u64 {
    60
}

fn default_llama_endpoint() -> String {
    "http://localhost:8080".to_string()
}

fn default_max_tokens() -> u32 {
    512
}

fn default_temperature() -> f32 {
    0.1
}

fn default_event_channel_capacity() -> usize {
    1024
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_request_size() -> usize {
    64 * 1024
}

fn default_true() -> bool {
    true
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a cascade instance.
///
/// # Example
///
/// ```toml
/// [cascade]
/// reasoning_timeout_ms = 120000
///
/// [cache]
/// store = "file"
/// path = "/var/cache/math-cascade"
///
/// [computational]
/// enabled = true
/// monthly_budget = 2000
/// development_budget = 1000
/// budget_pool = "production"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CascadeConfig {
    /// Tier budgets and the decline message.
    #[serde(default)]
    pub cascade: CascadeSection,
    /// Cache lifetimes and storage.
    #[serde(default)]
    pub cache: CacheSection,
    /// Computational tier (external API).
    #[serde(default)]
    pub computational: ComputationalSection,
    /// Reasoning tier (local model server).
    #[serde(default)]
    pub reasoning: ReasoningSection,
    /// Statistics event stream.
    #[serde(default)]
    pub stats: StatsSection,
    /// Logging and metrics.
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// HTTP control surface.
    #[serde(default)]
    pub server: ServerSection,
}

// ── Cascade ──────────────────────────────────────────────────────────────

/// Per-tier time budgets.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CascadeSection {
    /// Symbolic tier budget (ms).
    #[serde(default = "default_symbolic_timeout_ms")]
    pub symbolic_timeout_ms: u64,
    /// Computational tier budget (ms).
    #[serde(default = "default_computational_timeout_ms")]
    pub computational_timeout_ms: u64,
    /// Reasoning tier budget (ms).
    #[serde(default = "default_reasoning_timeout_ms")]
    pub reasoning_timeout_ms: u64,
    /// Reply returned when every tier fails.
    #[serde(default = "default_decline_message")]
    pub decline_message: String,
}

impl Default for CascadeSection {
    fn default() -> Self {
        Self {
            symbolic_timeout_ms: default_symbolic_timeout_ms(),
            computational_timeout_ms: default_computational_timeout_ms(),
            reasoning_timeout_ms: default_reasoning_timeout_ms(),
            decline_message: default_decline_message(),
        }
    }
}

// ── Cache ────────────────────────────────────────────────────────────────

/// Durable cache backend.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Memory only; nothing survives a restart.
    None,
    /// One JSON file per entry under `cache.path`.
    #[default]
    File,
    /// Redis at `cache.redis_url` (requires feature `redis-store`).
    Redis,
}

/// Cache configuration. TTLs are seconds; `0` means "never expires".
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CacheSection {
    /// Capacity of the in-memory level.
    #[serde(default = "default_max_memory_entries")]
    pub max_memory_entries: usize,
    /// Symbolic outcome TTL.
    #[serde(default)]
    pub symbolic_ttl_s: u64,
    /// Computational outcome TTL.
    #[serde(default = "default_computational_ttl_s")]
    pub computational_ttl_s: u64,
    /// Reasoning outcome TTL.
    #[serde(default = "default_reasoning_ttl_s")]
    pub reasoning_ttl_s: u64,
    /// Decline TTL. Must be non-zero.
    #[serde(default = "default_declined_ttl_s")]
    pub declined_ttl_s: u64,
    /// TTL for `unavailable` outcomes at any tier. Must be non-zero.
    #[serde(default = "default_unavailable_ttl_s")]
    pub unavailable_ttl_s: u64,
    /// Durable backend.
    #[serde(default)]
    pub store: StoreKind,
    /// Directory for the file store.
    #[serde(default = "default_cache_path")]
    pub path: String,
    /// Redis URL for the redis store.
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Consecutive durable failures before running memory-only.
    #[serde(default = "default_store_breaker_threshold")]
    pub breaker_threshold: u32,
    /// Seconds before probing the durable level again.
    #[serde(default = "default_store_breaker_cooldown_s")]
    pub breaker_cooldown_s: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            max_memory_entries: default_max_memory_entries(),
            symbolic_ttl_s: 0,
            computational_ttl_s: default_computational_ttl_s(),
            reasoning_ttl_s: default_reasoning_ttl_s(),
            declined_ttl_s: default_declined_ttl_s(),
            unavailable_ttl_s: default_unavailable_ttl_s(),
            store: StoreKind::default(),
            path: default_cache_path(),
            redis_url: None,
            breaker_threshold: default_store_breaker_threshold(),
            breaker_cooldown_s: default_store_breaker_cooldown_s(),
        }
    }
}

impl CacheSection {
    /// Lifetime policy described by this section.
    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy::from_secs(
            self.symbolic_ttl_s,
            self.computational_ttl_s,
            self.reasoning_ttl_s,
            self.declined_ttl_s,
            self.unavailable_ttl_s,
        )
    }
}

// ── External tiers ───────────────────────────────────────────────────────

/// Computational tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ComputationalSection {
    /// Whether the tier is wired in. Disabled tiers report `unavailable`.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// API base URL.
    #[serde(default = "default_wolfram_endpoint")]
    pub endpoint: String,
    /// Name of the environment variable holding the app id.
    #[serde(default = "default_app_id_env")]
    pub app_id_env: String,
    /// Calls allowed per calendar month.
    #[serde(default = "default_monthly_budget")]
    pub monthly_budget: u32,
    /// Share of the monthly budget reserved for development use.
    #[serde(default = "default_development_budget")]
    pub development_budget: u32,
    /// Pool this process draws from.
    #[serde(default)]
    pub budget_pool: BudgetPool,
    /// JSON document keeping the monthly usage across restarts; unset keeps
    /// it in memory only.
    #[serde(default = "default_usage_path")]
    pub usage_path: Option<String>,
    /// Calls allowed per minute; `0` disables the limit.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Consecutive outages before the breaker opens.
    #[serde(default = "default_api_breaker_threshold")]
    pub breaker_threshold: u32,
    /// Seconds the breaker stays open.
    #[serde(default = "default_api_breaker_cooldown_s")]
    pub breaker_cooldown_s: u64,
}

impl Default for ComputationalSection {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_wolfram_endpoint(),
            app_id_env: default_app_id_env(),
            monthly_budget: default_monthly_budget(),
            development_budget: default_development_budget(),
            budget_pool: BudgetPool::default(),
            usage_path: default_usage_path(),
            requests_per_minute: default_requests_per_minute(),
            breaker_threshold: default_api_breaker_threshold(),
            breaker_cooldown_s: default_api_breaker_cooldown_s(),
        }
    }
}

/// Reasoning tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ReasoningSection {
    /// Whether the tier is wired in.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// llama.cpp server URL.
    #[serde(default = "default_llama_endpoint")]
    pub endpoint: String,
    /// Generation length cap.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for ReasoningSection {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: default_llama_endpoint(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

// ── Stats / observability / server ───────────────────────────────────────

/// Statistics event stream.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct StatsSection {
    /// Log every cascade event at debug level through a channel sink.
    #[serde(default)]
    pub log_events: bool,
    /// Capacity of the event channel; events beyond it are shed.
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for StatsSection {
    fn default() -> Self {
        Self {
            log_events: false,
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ObservabilityConfig {
    /// Log output format. `LOG_FORMAT` in the environment takes precedence.
    #[serde(default)]
    pub log_format: LogFormat,
    /// Whether Prometheus metrics are collected.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            metrics: true,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable log output.
    #[default]
    Pretty,
    /// Structured JSON log output for machine consumption.
    Json,
}

impl LogFormat {
    /// Value understood by `LOG_FORMAT`.
    pub fn as_str(self) -> &'static str {
        match self {
            LogFormat::Pretty => "pretty",
            LogFormat::Json => "json",
        }
    }
}

/// HTTP control surface.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ServerSection {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum request body in bytes.
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_request_size: default_max_request_size(),
        }
    }
}

impl CascadeSection {
    /// Budget for `tier`. [`crate::TierId::Declined`] has no budget.
    pub fn budget_for(&self, tier: crate::TierId) -> Duration {
        let ms = match tier {
            crate::TierId::Symbolic => self.symbolic_timeout_ms,
            crate::TierId::Computational => self.computational_timeout_ms,
            crate::TierId::Reasoning => self.reasoning_timeout_ms,
            crate::TierId::Declined => 0,
        };
        Duration::from_millis(ms)
    }
}

/// Export the JSON Schema for [`CascadeConfig`].
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails.
///
/// # Panics
///
/// This function never panics.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(CascadeConfig);
    serde_json::to_string_pretty(&schema)
}
