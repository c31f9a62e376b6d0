//! Symbolic tier: offline, deterministic, cheap.
//!
//! The solver itself is synchronous and CPU bound, so [`SymbolicTier`] runs
//! it on Tokio's blocking pool under the tier timeout. A solver that panics or
//! overruns yields [`Outcome::Unavailable`] instead of taking the runtime down.
//!
//! The bundled [`ArithmeticSolver`] evaluates closed arithmetic expressions
//! (`+ - * / ^ **`, parentheses, unary minus, `sqrt`, `pi`, `e`). Anything with
//! free variables or equations is reported unsolvable so the cascade moves on.

use super::TierAdapter;
use crate::classifier::strip_command_words;
use crate::{Outcome, SolveMetadata, TierId};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Verdict of a synchronous symbolic solver.
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolicVerdict {
    /// The expression was solved.
    Solved(String),
    /// The solver cannot handle this input.
    Unsolvable(String),
}

/// A synchronous, pure solver for normalised query text.
pub trait SymbolicSolver: Send + Sync + 'static {
    /// Backend name recorded in solve metadata.
    fn name(&self) -> &str;

    /// Try to solve `normalized`. Must not block on I/O.
    fn try_solve(&self, normalized: &str) -> SymbolicVerdict;
}

/// Adapter that runs a [`SymbolicSolver`] on the blocking pool.
pub struct SymbolicTier {
    solver: Arc<dyn SymbolicSolver>,
}

impl SymbolicTier {
    /// Wrap a solver.
    pub fn new(solver: Arc<dyn SymbolicSolver>) -> Self {
        Self { solver }
    }
}

impl Default for SymbolicTier {
    fn default() -> Self {
        Self::new(Arc::new(ArithmeticSolver))
    }
}

#[async_trait]
impl TierAdapter for SymbolicTier {
    fn tier(&self) -> TierId {
        TierId::Symbolic
    }

    fn name(&self) -> &str {
        self.solver.name()
    }

    async fn attempt(&self, query: &str, timeout: Duration) -> Outcome {
        let solver = Arc::clone(&self.solver);
        let text = query.to_string();
        let handle = tokio::task::spawn_blocking(move || solver.try_solve(&text));

        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(SymbolicVerdict::Solved(answer))) => Outcome::Solved {
                answer,
                metadata: SolveMetadata::from_source(self.solver.name()),
            },
            Ok(Ok(SymbolicVerdict::Unsolvable(reason))) => Outcome::unsolvable(reason),
            Ok(Err(join_err)) => {
                warn!(solver = self.solver.name(), error = %join_err, "symbolic solver crashed");
                Outcome::unavailable(format!("symbolic solver crashed: {join_err}"))
            }
            Err(_) => Outcome::unavailable(format!(
                "symbolic solver exceeded {}ms",
                timeout.as_millis()
            )),
        }
    }
}

// ============================================================================
// Arithmetic Solver
// ============================================================================

/// Recursive-descent evaluator for closed arithmetic expressions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArithmeticSolver;

/// Expressions nested deeper than this are rejected.
const MAX_DEPTH: usize = 64;

impl SymbolicSolver for ArithmeticSolver {
    fn name(&self) -> &str {
        "arithmetic"
    }

    fn try_solve(&self, normalized: &str) -> SymbolicVerdict {
        let lowered = normalized.to_ascii_lowercase();
        let expr = strip_command_words(&lowered);
        if expr.is_empty() {
            return SymbolicVerdict::Unsolvable("no expression found".to_string());
        }
        if expr.contains('=') {
            return SymbolicVerdict::Unsolvable("equations are not supported".to_string());
        }

        let tokens = match tokenize(expr) {
            Ok(tokens) => tokens,
            Err(reason) => return SymbolicVerdict::Unsolvable(reason),
        };
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            depth: 0,
        };
        let value = match parser.expr() {
            Ok(v) => v,
            Err(reason) => return SymbolicVerdict::Unsolvable(reason),
        };
        if parser.pos != tokens.len() {
            return SymbolicVerdict::Unsolvable("unexpected trailing input".to_string());
        }
        if !value.is_finite() {
            return SymbolicVerdict::Unsolvable("result is not a finite number".to_string());
        }
        SymbolicVerdict::Solved(format_number(value))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(s: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = s.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let lit: String = chars[start..i].iter().collect();
                let n = lit
                    .parse::<f64>()
                    .map_err(|_| format!("malformed number '{lit}'"))?;
                tokens.push(Token::Num(n));
            }
            'a'..='z' => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_alphabetic() {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Caret);
                i += 2;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            other => return Err(format!("unsupported character '{other}'")),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        self.pos += 1;
        t
    }

    fn descend(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err("expression nested too deeply".to_string());
        }
        Ok(())
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> Result<f64, String> {
        self.descend()?;
        let mut acc = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    acc += self.term()?;
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    acc -= self.term()?;
                }
                _ => break,
            }
        }
        self.depth -= 1;
        Ok(acc)
    }

    // term := unary (('*' | '/') unary)*
    fn term(&mut self) -> Result<f64, String> {
        let mut acc = self.unary()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    acc *= self.unary()?;
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    let rhs = self.unary()?;
                    if rhs == 0.0 {
                        return Err("division by zero".to_string());
                    }
                    acc /= rhs;
                }
                _ => break,
            }
        }
        Ok(acc)
    }

    // unary := ('-' | '+') unary | power
    fn unary(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some(Token::Minus) => {
                self.pos += 1;
                self.descend()?;
                let v = -self.unary()?;
                self.depth -= 1;
                Ok(v)
            }
            Some(Token::Plus) => {
                self.pos += 1;
                self.descend()?;
                let v = self.unary()?;
                self.depth -= 1;
                Ok(v)
            }
            _ => self.power(),
        }
    }

    // power := primary ('^' unary)?   right associative
    fn power(&mut self) -> Result<f64, String> {
        let base = self.primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.pos += 1;
            self.descend()?;
            let exp = self.unary()?;
            self.depth -= 1;
            return Ok(base.powf(exp));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<f64, String> {
        match self.bump().cloned() {
            Some(Token::Num(n)) => Ok(n),
            Some(Token::LParen) => {
                let v = self.expr()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(v),
                    _ => Err("unbalanced parentheses".to_string()),
                }
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "pi" => Ok(std::f64::consts::PI),
                "e" => Ok(std::f64::consts::E),
                "sqrt" => {
                    let arg = self.primary()?;
                    if arg < 0.0 {
                        return Err("square root of a negative number".to_string());
                    }
                    Ok(arg.sqrt())
                }
                other => Err(format!("unknown symbol '{other}'")),
            },
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

/// Integers print without a fractional part; everything else keeps at most
/// ten decimals with trailing zeros trimmed.
fn format_number(v: f64) -> String {
    if (v - v.round()).abs() < 1e-9 && v.abs() < 1e15 {
        let rounded = v.round();
        // avoid "-0"
        if rounded == 0.0 {
            return "0".to_string();
        }
        return format!("{rounded:.0}");
    }
    let s = format!("{v:.10}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}
