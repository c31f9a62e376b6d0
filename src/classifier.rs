//! # Stage: Tier Classification
//!
//! ## Responsibility
//! Pick the starting tier for a query without invoking any solver and without
//! consulting the cache. Runs on every request, including cache hits, so every
//! predicate is a bounded linear scan.
//!
//! ## Predicate order (first match wins)
//!
//! | # | Predicate | Tier |
//! |---|-----------|------|
//! | 1 | Symbolic-parseable expression (after stripping command words) | `Symbolic` |
//! | 2 | Computational / numeric-data keyword | `Computational` |
//! | 3 | Reasoning indicator (prove, explain, why, ...) | `Reasoning` |
//! | – | Nothing matched | `Reasoning` |
//!
//! Falling through to `Reasoning` is intentional: declining a solvable query
//! costs more than running the most capable tier.
//!
//! ## NOT Responsible For
//! - Normalising text (that belongs to `fingerprint`)
//! - Deciding fallback (that belongs to `orchestrator`)

use crate::fingerprint::normalize;
use crate::TierId;
use serde::Serialize;

/// Predicates only look at this many bytes of the canonical text.
const DEFAULT_SCAN_LIMIT: usize = 4096;

/// Leading command words stripped before the expression check.
/// Longer phrases come first so "derivative of" wins over "derivative".
const COMMAND_PREFIXES: &[&str] = &[
    "find the derivative of",
    "what is the value of",
    "derivative of",
    "integral of",
    "value of",
    "what's",
    "what is",
    "calculate",
    "compute",
    "evaluate",
    "simplify",
    "differentiate",
    "integrate",
    "solve",
    "factor",
    "expand",
    "find",
    "the",
    "for x",
    "for y",
    "d/dx",
];

/// Alphabetic tokens allowed inside a symbolic expression besides
/// single-letter variables.
const FUNCTION_NAMES: &[&str] = &[
    "sin", "cos", "tan", "sec", "csc", "cot", "asin", "acos", "atan", "sinh", "cosh", "tanh",
    "log", "ln", "sqrt", "exp", "abs", "pi", "dx", "dy", "dt",
];

const COMPUTATIONAL_KEYWORDS: &[&str] = &[
    "convert",
    "plot",
    "graph",
    "distribution",
    "statistics",
    "mean",
    "median",
    "mode",
    "standard deviation",
    "variance",
    "prime",
    "taylor series",
    "fourier",
    "numerical",
    "numerically",
    "approximate",
    "speed of",
    "mass of",
    "molecular",
    "atomic",
    "chemical",
    "population",
    "distance from",
];

const REASONING_INDICATORS: &[&str] = &[
    "prove",
    "proof",
    "explain",
    "why",
    "show that",
    "demonstrate",
    "compare",
    "strategy",
    "approach",
    "understand",
    "reasoning",
    "intuition",
    "how many",
    "how much",
    "word problem",
];

/// Which predicate decided a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierRule {
    /// The text parses as a plain symbolic expression.
    SymbolicExpression,
    /// A computational keyword matched.
    ComputationalKeyword,
    /// A reasoning indicator matched.
    ReasoningIndicator,
    /// Nothing matched; default tier.
    Default,
}

/// A classification plus the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Classification {
    /// The chosen starting tier.
    pub tier: TierId,
    /// The predicate that fired.
    pub rule: ClassifierRule,
    /// The keyword that matched, for keyword rules.
    pub matched: Option<&'static str>,
}

/// Ordered predicate router.
///
/// Stateless apart from its scan limit; cheap to clone and share.
#[derive(Debug, Clone)]
pub struct Classifier {
    scan_limit: usize,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Classifier {
    /// Create a classifier with the default scan limit.
    pub fn new() -> Self {
        Self {
            scan_limit: DEFAULT_SCAN_LIMIT,
        }
    }

    /// Create a classifier that inspects at most `scan_limit` bytes.
    pub fn with_scan_limit(scan_limit: usize) -> Self {
        Self { scan_limit }
    }

    /// Classify a raw query.
    ///
    /// # Panics
    ///
    /// This function never panics.
    ///
    /// # Example
    ///
    /// ```rust
    /// use tokio_math_cascade::{Classifier, TierId};
    /// let classifier = Classifier::new();
    /// assert_eq!(classifier.classify("2+2"), TierId::Symbolic);
    /// assert_eq!(classifier.classify("explain why pi is irrational"), TierId::Reasoning);
    /// ```
    pub fn classify(&self, raw: &str) -> TierId {
        self.explain(raw).tier
    }

    /// Classify a raw query and report which rule fired.
    pub fn explain(&self, raw: &str) -> Classification {
        self.explain_normalized(&normalize(raw))
    }

    /// Classify text that is already in canonical form (see
    /// [`crate::fingerprint::normalize`]).
    pub fn explain_normalized(&self, canonical: &str) -> Classification {
        let oversized = canonical.len() > self.scan_limit;
        let text = truncate_at_char_boundary(canonical, self.scan_limit).to_ascii_lowercase();

        if !oversized && is_symbolic_expression(&text) {
            return Classification {
                tier: TierId::Symbolic,
                rule: ClassifierRule::SymbolicExpression,
                matched: None,
            };
        }

        let words = words(&text);

        if let Some(kw) = first_phrase_match(&words, COMPUTATIONAL_KEYWORDS) {
            return Classification {
                tier: TierId::Computational,
                rule: ClassifierRule::ComputationalKeyword,
                matched: Some(kw),
            };
        }

        if let Some(kw) = first_phrase_match(&words, REASONING_INDICATORS) {
            return Classification {
                tier: TierId::Reasoning,
                rule: ClassifierRule::ReasoningIndicator,
                matched: Some(kw),
            };
        }

        Classification {
            tier: TierId::Reasoning,
            rule: ClassifierRule::Default,
            matched: None,
        }
    }
}

/// Strip leading command words ("what is", "solve", "derivative of", ...)
/// and trailing `?`/`.` from lowercase canonical text.
///
/// Shared with the built-in arithmetic solver so both agree on what counts as
/// the expression part of a query.
pub(crate) fn strip_command_words(text: &str) -> &str {
    let mut rest = text.trim();
    // Each pass removes one prefix; bounded by the prefix table size.
    for _ in 0..COMMAND_PREFIXES.len() {
        let before = rest.len();
        rest = rest.trim_start_matches(|c: char| c == ':' || c == ' ');
        for prefix in COMMAND_PREFIXES {
            if let Some(after) = rest.strip_prefix(prefix) {
                let boundary = after
                    .chars()
                    .next()
                    .map_or(true, |c| !c.is_ascii_alphanumeric());
                if boundary {
                    rest = after;
                    break;
                }
            }
        }
        rest = rest.trim_start_matches(|c: char| c == ':' || c == ' ');
        if rest.len() == before {
            break;
        }
    }
    rest.trim_end_matches(|c: char| c == '?' || c == '.' || c == ' ')
}

fn is_symbolic_expression(text: &str) -> bool {
    let expr = strip_command_words(text);
    if expr.is_empty() {
        return false;
    }

    let mut has_math = false;
    let mut word = String::new();
    for c in expr.chars().chain(std::iter::once(' ')) {
        if c.is_ascii_alphabetic() {
            word.push(c);
            continue;
        }
        if !word.is_empty() {
            if word.len() > 1 && !FUNCTION_NAMES.contains(&word.as_str()) {
                return false;
            }
            word.clear();
        }
        match c {
            '0'..='9' => has_math = true,
            '+' | '-' | '*' | '/' | '^' | '=' | '(' | ')' | '<' | '>' | '!' | '|' => has_math = true,
            '.' | ',' | ' ' | '[' | ']' => {}
            _ => return false,
        }
    }
    has_math
}

fn words(text: &str) -> Vec<&str> {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect()
}

fn first_phrase_match(words: &[&str], phrases: &[&'static str]) -> Option<&'static str> {
    phrases.iter().copied().find(|phrase| {
        let needle: Vec<&str> = phrase.split(' ').collect();
        !needle.is_empty() && words.windows(needle.len()).any(|w| w == needle.as_slice())
    })
}

fn truncate_at_char_boundary(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(q: &str) -> TierId {
        Classifier::new().classify(q)
    }

    #[test]
    fn test_plain_arithmetic_is_symbolic() {
        assert_eq!(tier("2+2"), TierId::Symbolic);
        assert_eq!(tier("What is 12345 + 67890?"), TierId::Symbolic);
    }

    #[test]
    fn test_command_prefixed_expressions_are_symbolic() {
        assert_eq!(tier("Solve for x: 2x + 5 = 13"), TierId::Symbolic);
        assert_eq!(tier("What is the derivative of x^2 + 3x?"), TierId::Symbolic);
        assert_eq!(tier("Simplify: (x+1)(x-1)"), TierId::Symbolic);
        assert_eq!(tier("integrate sin(x) dx"), TierId::Symbolic);
    }

    #[test]
    fn test_explanation_goes_straight_to_reasoning() {
        let c = Classifier::new().explain("explain why pi is irrational");
        assert_eq!(c.tier, TierId::Reasoning);
        assert_eq!(c.rule, ClassifierRule::ReasoningIndicator);
        assert_eq!(c.matched, Some("explain"));
    }

    #[test]
    fn test_proof_is_reasoning() {
        assert_eq!(tier("prove the pythagorean theorem"), TierId::Reasoning);
    }

    #[test]
    fn test_computational_keywords() {
        let c = Classifier::new().explain("Convert 100 fahrenheit to celsius");
        assert_eq!(c.tier, TierId::Computational);
        assert_eq!(c.matched, Some("convert"));
        assert_eq!(
            tier("standard deviation of 2, 4, 4, 4, 5, 5, 7, 9"),
            TierId::Computational
        );
    }

    #[test]
    fn test_symbolic_check_runs_before_keywords() {
        assert_eq!(tier("compute 2*3"), TierId::Symbolic);
        assert_eq!(tier("compute the mean of 2, 4 and 9"), TierId::Computational);
    }

    #[test]
    fn test_keywords_match_whole_words_only() {
        // "whyte" must not trigger "why", "meanwhile" must not trigger "mean"
        let c = Classifier::new().explain("meanwhile whyte counted sheep");
        assert_eq!(c.rule, ClassifierRule::Default);
    }

    #[test]
    fn test_unmatched_defaults_to_reasoning() {
        let c = Classifier::new().explain("tell me something about triangles");
        assert_eq!(c.tier, TierId::Reasoning);
        assert_eq!(c.rule, ClassifierRule::Default);
    }

    #[test]
    fn test_empty_and_garbage_default_to_reasoning() {
        assert_eq!(tier(""), TierId::Reasoning);
        assert_eq!(tier("???"), TierId::Reasoning);
        assert_eq!(tier("solve"), TierId::Reasoning);
    }

    #[test]
    fn test_oversized_input_is_never_symbolic() {
        let long = "1+".repeat(5000) + "1";
        let c = Classifier::with_scan_limit(64).explain(&long);
        assert_ne!(c.tier, TierId::Symbolic);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let s = "ééé";
        assert_eq!(truncate_at_char_boundary(s, 3), "é");
        assert_eq!(truncate_at_char_boundary(s, 100), s);
    }

    #[test]
    fn test_strip_command_words() {
        assert_eq!(strip_command_words("what is 2+2?"), "2+2");
        assert_eq!(strip_command_words("solve for x: 2x+5=13"), "2x+5=13");
        assert_eq!(strip_command_words("theory of everything"), "theory of everything");
    }
}
