//! # Stage: Query Fingerprinting
//!
//! ## Responsibility
//! Reduce a raw query string to a canonical text and a fixed-width key used
//! for classification, cache lookup and in-flight deduplication.
//!
//! ## Normalisation rules (applied in this order)
//! 1. Typographic operator variants map to ASCII: `×`/`·` → `*`, `÷` → `/`,
//!    `−`/`–` → `-`.
//! 2. Whitespace runs collapse to one space; leading/trailing whitespace is
//!    dropped.
//! 3. Spaces next to `+ - * / ^ = ( ) , < >` are removed.
//! 4. ASCII letter runs of length ≥ 2 are lowercased. Single letters are
//!    variables and keep their case (`X` and `x` stay distinct).
//!
//! `**` and `^` are deliberately kept apart: merging them is only sound if
//! every tier treats them identically, and a false cache hit is worse than a
//! miss.
//!
//! ## Guarantees
//! - Pure and deterministic: no I/O, no failure mode.
//! - Idempotent: `normalize(normalize(q)) == normalize(q)`.
//! - Empty and malformed input still yields a stable key.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of hex characters of the BLAKE3 digest kept in the key.
const DIGEST_HEX_LEN: usize = 32;

/// Canonical identity of a query, independent of tier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    canonical: String,
    digest: String,
}

impl Fingerprint {
    /// The normalised query text.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }

    /// Fixed-width hex key derived from the canonical text.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digest)
    }
}

/// Fingerprint a raw query.
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```rust
/// use tokio_math_cascade::fingerprint;
/// assert_eq!(fingerprint("2 + 2"), fingerprint("  2+2 "));
/// assert_ne!(fingerprint("x^2"), fingerprint("x**2"));
/// ```
pub fn fingerprint(raw: &str) -> Fingerprint {
    let canonical = normalize(raw);
    let hash = blake3::hash(canonical.as_bytes());
    let mut digest = hash.to_hex().to_string();
    digest.truncate(DIGEST_HEX_LEN);
    Fingerprint { canonical, digest }
}

/// Apply the normalisation rules listed in the module docs.
///
/// # Panics
///
/// This function never panics.
pub fn normalize(raw: &str) -> String {
    let mapped: String = raw.chars().map(canonical_operator).collect();

    let collapsed = mapped.split_whitespace().collect::<Vec<_>>().join(" ");

    let tight = strip_operator_spacing(&collapsed);

    lowercase_words(&tight)
}

fn canonical_operator(c: char) -> char {
    match c {
        '×' | '·' => '*',
        '÷' => '/',
        '−' | '–' => '-',
        other => other,
    }
}

fn is_operator(c: char) -> bool {
    matches!(
        c,
        '+' | '-' | '*' | '/' | '^' | '=' | '(' | ')' | ',' | '<' | '>'
    )
}

/// Drop single spaces that touch an operator. Input has already been
/// collapsed, so every space is a lone `' '`.
fn strip_operator_spacing(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    for (i, &c) in chars.iter().enumerate() {
        if c == ' ' {
            let prev_op = i > 0 && is_operator(chars[i - 1]);
            let next_op = chars.get(i + 1).is_some_and(|&n| is_operator(n));
            if prev_op || next_op {
                continue;
            }
        }
        out.push(c);
    }
    out
}

fn lowercase_words(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut run = String::new();
    for c in s.chars() {
        if c.is_ascii_alphabetic() {
            run.push(c);
            continue;
        }
        flush_run(&mut run, &mut out);
        out.push(c);
    }
    flush_run(&mut run, &mut out);
    out
}

fn flush_run(run: &mut String, out: &mut String) {
    if run.len() >= 2 {
        out.push_str(&run.to_ascii_lowercase());
    } else {
        out.push_str(run);
    }
    run.clear();
}
