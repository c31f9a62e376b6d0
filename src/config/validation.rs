//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`CascadeConfig`] that cannot
//! be expressed through the type system alone (range checks, cross-field
//! requirements such as "a redis store needs a URL").
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::{CascadeConfig, StoreKind};
use crate::tiers::BudgetPool;

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "cache.declined_ttl_s").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn is_http_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

/// Validate all semantic constraints on a [`CascadeConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &CascadeConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Tier budgets ─────────────────────────────────────────────────
    for (field, value) in [
        ("cascade.symbolic_timeout_ms", config.cascade.symbolic_timeout_ms),
        (
            "cascade.computational_timeout_ms",
            config.cascade.computational_timeout_ms,
        ),
        ("cascade.reasoning_timeout_ms", config.cascade.reasoning_timeout_ms),
    ] {
        if value == 0 {
            errors.push(invalid(field, value, "must be at least 1 ms"));
        }
    }

    if config.cascade.decline_message.trim().is_empty() {
        errors.push(invalid(
            "cascade.decline_message",
            "\"\"",
            "must not be empty",
        ));
    }

    // ── Cache ────────────────────────────────────────────────────────
    if config.cache.max_memory_entries == 0 {
        errors.push(invalid(
            "cache.max_memory_entries",
            0,
            "must be at least 1",
        ));
    }

    // Failure outcomes must expire or the cascade could never retry.
    if config.cache.declined_ttl_s == 0 {
        errors.push(invalid(
            "cache.declined_ttl_s",
            0,
            "must be at least 1 second",
        ));
    }
    if config.cache.unavailable_ttl_s == 0 {
        errors.push(invalid(
            "cache.unavailable_ttl_s",
            0,
            "must be at least 1 second",
        ));
    }

    match config.cache.store {
        StoreKind::None => {}
        StoreKind::File => {
            if config.cache.path.trim().is_empty() {
                errors.push(invalid(
                    "cache.path",
                    "\"\"",
                    "file store requires a directory",
                ));
            }
        }
        StoreKind::Redis => match config.cache.redis_url.as_deref() {
            Some(url) if url.starts_with("redis://") || url.starts_with("rediss://") => {}
            Some(url) => errors.push(invalid(
                "cache.redis_url",
                url,
                "must start with redis:// or rediss://",
            )),
            None => errors.push(invalid(
                "cache.redis_url",
                "none",
                "redis store requires a URL",
            )),
        },
    }

    if config.cache.store != StoreKind::None {
        if config.cache.breaker_threshold == 0 {
            errors.push(invalid(
                "cache.breaker_threshold",
                0,
                "must be at least 1",
            ));
        }
        if config.cache.breaker_cooldown_s == 0 {
            errors.push(invalid(
                "cache.breaker_cooldown_s",
                0,
                "must be at least 1 second",
            ));
        }
    }

    // ── Computational tier ───────────────────────────────────────────
    let computational = &config.computational;
    if computational.enabled {
        if !is_http_url(&computational.endpoint) {
            errors.push(invalid(
                "computational.endpoint",
                &computational.endpoint,
                "must be an http(s) URL",
            ));
        }
        if computational.app_id_env.trim().is_empty() {
            errors.push(invalid(
                "computational.app_id_env",
                "\"\"",
                "must name an environment variable",
            ));
        }
        if computational.monthly_budget == 0 {
            errors.push(invalid(
                "computational.monthly_budget",
                0,
                "must be at least 1 (disable the tier instead)",
            ));
        } else if computational.development_budget > computational.monthly_budget {
            errors.push(invalid(
                "computational.development_budget",
                computational.development_budget,
                "must not exceed computational.monthly_budget",
            ));
        } else {
            let pool_calls = match computational.budget_pool {
                BudgetPool::Development => computational.development_budget,
                BudgetPool::Production => {
                    computational.monthly_budget - computational.development_budget
                }
            };
            if pool_calls == 0 {
                errors.push(invalid(
                    "computational.budget_pool",
                    computational.budget_pool.as_str(),
                    "selects a pool with no calls left in the monthly budget",
                ));
            }
        }
        if computational.breaker_threshold == 0 {
            errors.push(invalid(
                "computational.breaker_threshold",
                0,
                "must be at least 1",
            ));
        }
        if computational.breaker_cooldown_s == 0 {
            errors.push(invalid(
                "computational.breaker_cooldown_s",
                0,
                "must be at least 1 second",
            ));
        }
    }

    // ── Reasoning tier ───────────────────────────────────────────────
    let reasoning = &config.reasoning;
    if reasoning.enabled {
        if !is_http_url(&reasoning.endpoint) {
            errors.push(invalid(
                "reasoning.endpoint",
                &reasoning.endpoint,
                "must be an http(s) URL",
            ));
        }
        if reasoning.max_tokens == 0 {
            errors.push(invalid("reasoning.max_tokens", 0, "must be at least 1"));
        }
        if !(0.0..=2.0).contains(&reasoning.temperature) {
            errors.push(invalid(
                "reasoning.temperature",
                reasoning.temperature,
                "must be between 0.0 and 2.0",
            ));
        }
    }

    // ── Stats / server ───────────────────────────────────────────────
    if config.stats.log_events && config.stats.event_channel_capacity == 0 {
        errors.push(invalid(
            "stats.event_channel_capacity",
            0,
            "must be at least 1 when log_events is on",
        ));
    }

    if config.server.max_request_size == 0 {
        errors.push(invalid(
            "server.max_request_size",
            0,
            "must be at least 1 byte",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
