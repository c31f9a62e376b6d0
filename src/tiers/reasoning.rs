//! Reasoning tier: local language model.
//!
//! Builds a step-by-step prompt, sends it to a [`ReasoningEngine`] and pulls
//! the final answer out of the generated text. The engine is the slowest tier
//! by far, so its timeout is the largest budget in the cascade.
//!
//! ## Environment Variables
//!
//! - `LLAMA_CPP_URL`: llama.cpp server URL (default: http://localhost:8080)

use super::TierAdapter;
use crate::{Outcome, SolveMetadata, TierId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Upper bound on the readiness probe, whatever the tier budget.
const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Failure modes of a reasoning engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The model server is up but not ready (e.g. still loading weights).
    #[error("engine not ready: {0}")]
    NotReady(String),

    /// Generation exceeded its deadline.
    #[error("generation timed out")]
    Timeout,

    /// Transport failure.
    #[error("request failed: {0}")]
    Request(String),

    /// Non-success HTTP status.
    #[error("http {status}: {body}")]
    Http {
        /// Status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },

    /// The response body was not what the engine protocol promises.
    #[error("malformed response: {0}")]
    Parse(String),
}

/// A text generation backend.
#[async_trait]
pub trait ReasoningEngine: Send + Sync {
    /// Engine name recorded in solve metadata.
    fn name(&self) -> &str;

    /// Generate a completion for `prompt`, returning within `timeout`.
    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        timeout: Duration,
    ) -> Result<String, EngineError>;
}

/// Adapter for the reasoning tier.
pub struct ReasoningTier {
    engine: Arc<dyn ReasoningEngine>,
    max_tokens: u32,
    temperature: f32,
}

impl ReasoningTier {
    /// Wrap `engine` with defaults tuned for math: 512 tokens, temperature 0.1.
    pub fn new(engine: Arc<dyn ReasoningEngine>) -> Self {
        Self {
            engine,
            max_tokens: 512,
            temperature: 0.1,
        }
    }

    /// Set the generation length cap.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl TierAdapter for ReasoningTier {
    fn tier(&self) -> TierId {
        TierId::Reasoning
    }

    fn name(&self) -> &str {
        self.engine.name()
    }

    async fn attempt(&self, query: &str, timeout: Duration) -> Outcome {
        let prompt = build_prompt(query);
        let generated = self
            .engine
            .generate(&prompt, self.max_tokens, self.temperature, timeout)
            .await;

        match generated {
            Ok(text) => match extract_answer(&text) {
                Some(answer) => Outcome::Solved {
                    answer,
                    metadata: SolveMetadata::from_source(self.engine.name())
                        .with_detail("generated_words", text.split_whitespace().count().to_string()),
                },
                None => Outcome::unsolvable("model produced no answer"),
            },
            Err(e) => {
                warn!(engine = self.engine.name(), error = %e, "reasoning engine failed");
                Outcome::unavailable(e.to_string())
            }
        }
    }
}

/// Chain-of-thought prompt asking for a marked final answer.
pub fn build_prompt(query: &str) -> String {
    format!(
        "You are a careful mathematician. Solve the problem below step by step, \
         then state the final result on its own line as \"The answer is: <answer>\".\n\n\
         Problem: {query}\n\nSolution:\n"
    )
}

/// Pull the final answer out of generated text.
///
/// Markers are tried from most to least explicit: `\boxed{..}`, `#### ..`,
/// "The answer is / Final answer / Answer:", "Therefore / Thus / So,",
/// "Result: / Solution:". Falls back to the last non-empty line. Returns
/// `None` when the text is blank.
pub fn extract_answer(text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if let Some(boxed) = extract_boxed(text) {
        return non_empty(boxed);
    }

    if let Some(line) = text.lines().rev().find_map(|l| l.trim().strip_prefix("####")) {
        if let Some(a) = non_empty(line) {
            return Some(a);
        }
    }

    let lowered = text.to_ascii_lowercase();
    for marker in [
        "the answer is:",
        "the answer is",
        "final answer:",
        "answer:",
        "therefore,",
        "therefore",
        "thus,",
        "thus",
        "so,",
        "result:",
        "solution:",
    ] {
        if let Some(idx) = rfind_marker(&lowered, marker) {
            let rest = &text[idx + marker.len()..];
            let line = rest.lines().next().unwrap_or_default();
            if let Some(a) = non_empty(line) {
                return Some(a);
            }
        }
    }

    text.lines().rev().find_map(non_empty)
}

/// Last occurrence of `marker` that starts a word. Markers ending in a
/// letter must also end one, so "thus" does not match "thusly".
fn rfind_marker(haystack: &str, marker: &str) -> Option<usize> {
    let open_ended = marker.ends_with(|c: char| c.is_alphanumeric());
    haystack.rmatch_indices(marker).map(|(idx, _)| idx).find(|&idx| {
        let before = haystack[..idx].chars().next_back();
        let after = haystack[idx + marker.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric)
            && !(open_ended && after.is_some_and(char::is_alphanumeric))
    })
}

fn extract_boxed(text: &str) -> Option<&str> {
    let start = text.rfind("\\boxed{")? + "\\boxed{".len();
    let mut depth = 1usize;
    for (offset, c) in text[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s
        .trim()
        .trim_start_matches(':')
        .trim()
        .trim_end_matches('.')
        .trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

// ============================================================================
// llama.cpp Engine
// ============================================================================

/// llama.cpp server request payload
#[derive(Debug, Serialize)]
struct LlamaCppRequest<'a> {
    prompt: &'a str,
    n_predict: u32,
    temperature: f32,
    stop: Vec<&'static str>,
}

/// llama.cpp server response
#[derive(Debug, Deserialize)]
struct LlamaCppResponse {
    content: String,
}

/// llama.cpp HTTP server engine
///
/// Probes `/health` first so a server that is still loading weights is
/// reported as not ready instead of hanging until the tier budget runs out.
///
/// ## Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tokio_math_cascade::tiers::{LlamaCppEngine, ReasoningTier};
///
/// let tier = ReasoningTier::new(Arc::new(LlamaCppEngine::new().with_url("http://localhost:8080")))
///     .with_max_tokens(512);
/// ```
pub struct LlamaCppEngine {
    client: reqwest::Client,
    url: String,
}

impl LlamaCppEngine {
    /// Create a new engine.
    ///
    /// Reads server URL from the `LLAMA_CPP_URL` environment variable,
    /// or defaults to http://localhost:8080
    pub fn new() -> Self {
        let url =
            std::env::var("LLAMA_CPP_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }

    /// Set server URL
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into().trim_end_matches('/').to_string();
        self
    }

    async fn ensure_ready(&self, timeout: Duration) -> Result<(), EngineError> {
        let response = self
            .client
            .get(format!("{}/health", self.url))
            .timeout(timeout.min(HEALTH_PROBE_TIMEOUT))
            .send()
            .await
            .map_err(|e| EngineError::NotReady(format!("health probe failed: {e}")))?;

        match response.status().as_u16() {
            200..=299 => Ok(()),
            503 => Err(EngineError::NotReady("model still loading".to_string())),
            status => Err(EngineError::NotReady(format!("health probe returned {status}"))),
        }
    }
}

impl Default for LlamaCppEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReasoningEngine for LlamaCppEngine {
    fn name(&self) -> &str {
        "llama_cpp"
    }

    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        timeout: Duration,
    ) -> Result<String, EngineError> {
        let started = Instant::now();
        self.ensure_ready(timeout).await?;

        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(EngineError::Timeout);
        }

        let request = LlamaCppRequest {
            prompt,
            n_predict: max_tokens,
            temperature,
            stop: vec!["</s>", "\nProblem:"],
        };

        let response = self
            .client
            .post(format!("{}/completion", self.url))
            .timeout(remaining)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout
                } else {
                    EngineError::Request(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Http {
                status,
                body: body.chars().take(200).collect(),
            });
        }

        let parsed: LlamaCppResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Parse(e.to_string()))?;

        debug!(
            chars = parsed.content.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "llama.cpp generation complete"
        );
        Ok(parsed.content)
    }
}
