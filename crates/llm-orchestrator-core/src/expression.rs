// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Boolean expression evaluator used by the condition and loop executors.
//! `spec.md` §4.2.
//!
//! `${...}` references are substituted by the [`crate::variables::VariableResolver`]
//! before any operator is evaluated, then the resulting literal text is
//! tokenized and evaluated by a small recursive-descent parser. This is the
//! "small expression library" the spec allows delegating to; the grammar it
//! implements is exactly the one `spec.md` §4.2 mandates and nothing more.

use crate::context::ExecutionContext;
use crate::error::{OrchestratorError, Result};
use crate::variables::VariableResolver;

#[derive(Debug, Clone)]
struct Lit {
    raw: String,
    quoted: bool,
}

impl Lit {
    fn is_numeric(&self) -> bool {
        !self.quoted && self.raw.parse::<f64>().is_ok()
    }

    fn as_bool_literal(&self) -> Option<bool> {
        if self.quoted {
            return None;
        }
        match self.raw.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    fn truthy(&self) -> bool {
        if let Some(b) = self.as_bool_literal() {
            return b;
        }
        if self.is_numeric() {
            return self.raw.parse::<f64>().map(|n| n != 0.0).unwrap_or(false);
        }
        !self.raw.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
    Literal(String, bool),
}

fn tokenize(s: &str) -> Result<Vec<Tok>> {
    let chars: Vec<char> = s.chars().collect();
    let mut i = 0;
    let mut tokens = Vec::new();
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                tokens.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Tok::RParen);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Tok::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Tok::Neq);
                i += 2;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Tok::Lte);
                i += 2;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Tok::Gte);
                i += 2;
            }
            '<' => {
                tokens.push(Tok::Lt);
                i += 1;
            }
            '>' => {
                tokens.push(Tok::Gt);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != quote {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(OrchestratorError::Execution(format!(
                        "unterminated string literal in expression: {s}"
                    )));
                }
                let text: String = chars[start..j].iter().collect();
                tokens.push(Tok::Literal(text, true));
                i = j + 1;
            }
            _ => {
                let start = i;
                while i < chars.len()
                    && !chars[i].is_whitespace()
                    && !"()".contains(chars[i])
                    && !(chars[i] == '=' && chars.get(i + 1) == Some(&'='))
                    && !(chars[i] == '!' && chars.get(i + 1) == Some(&'='))
                    && chars[i] != '<'
                    && chars[i] != '>'
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                if word.is_empty() {
                    return Err(OrchestratorError::Execution(format!(
                        "unexpected character in expression: {s}"
                    )));
                }
                match word.to_uppercase().as_str() {
                    "AND" => tokens.push(Tok::And),
                    "OR" => tokens.push(Tok::Or),
                    "NOT" => tokens.push(Tok::Not),
                    _ => tokens.push(Tok::Literal(word, false)),
                }
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Tok> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse_or(&mut self) -> Result<bool> {
        let mut left = self.parse_and()?;
        while matches!(self.peek(), Some(Tok::Or)) {
            self.advance();
            let right = self.parse_and()?;
            left = left || right;
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<bool> {
        let mut left = self.parse_not()?;
        while matches!(self.peek(), Some(Tok::And)) {
            self.advance();
            let right = self.parse_not()?;
            left = left && right;
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<bool> {
        if matches!(self.peek(), Some(Tok::Not)) {
            self.advance();
            let inner = self.parse_not()?;
            return Ok(!inner);
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<bool> {
        if matches!(self.peek(), Some(Tok::LParen)) {
            self.advance();
            let inner = self.parse_or()?;
            match self.advance() {
                Some(Tok::RParen) => return Ok(inner),
                _ => {
                    return Err(OrchestratorError::Execution(
                        "missing closing parenthesis in expression".to_string(),
                    ))
                }
            }
        }

        let left = self.parse_literal()?;
        let op = match self.peek() {
            Some(Tok::Eq) => Some(Tok::Eq),
            Some(Tok::Neq) => Some(Tok::Neq),
            Some(Tok::Lt) => Some(Tok::Lt),
            Some(Tok::Lte) => Some(Tok::Lte),
            Some(Tok::Gt) => Some(Tok::Gt),
            Some(Tok::Gte) => Some(Tok::Gte),
            _ => None,
        };

        match op {
            None => Ok(left.truthy()),
            Some(op) => {
                self.advance();
                let right = self.parse_literal()?;
                Ok(compare(&op, &left, &right))
            }
        }
    }

    fn parse_literal(&mut self) -> Result<Lit> {
        match self.advance() {
            Some(Tok::Literal(raw, quoted)) => Ok(Lit { raw, quoted }),
            other => Err(OrchestratorError::Execution(format!(
                "expected a literal in expression, found {other:?}"
            ))),
        }
    }
}

fn compare(op: &Tok, left: &Lit, right: &Lit) -> bool {
    if left.is_numeric() && right.is_numeric() {
        let l: f64 = left.raw.parse().unwrap_or(f64::NAN);
        let r: f64 = right.raw.parse().unwrap_or(f64::NAN);
        return match op {
            Tok::Eq => l == r,
            Tok::Neq => l != r,
            Tok::Lt => l < r,
            Tok::Lte => l <= r,
            Tok::Gt => l > r,
            Tok::Gte => l >= r,
            _ => false,
        };
    }
    match op {
        Tok::Eq => left.raw == right.raw,
        Tok::Neq => left.raw != right.raw,
        Tok::Lt => left.raw < right.raw,
        Tok::Lte => left.raw <= right.raw,
        Tok::Gt => left.raw > right.raw,
        Tok::Gte => left.raw >= right.raw,
        _ => false,
    }
}

/// Stateless evaluator; holds a [`VariableResolver`] for `${...}` substitution.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpressionEvaluator {
    resolver: VariableResolver,
}

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self {
            resolver: VariableResolver::new(),
        }
    }

    /// Evaluates `expr` to a boolean, resolving `${...}` references first.
    pub fn evaluate_string(&self, expr: &str, ctx: &ExecutionContext) -> Result<bool> {
        let resolved = self.resolver.resolve_string(expr, ctx);
        let tokens = tokenize(&resolved)?;
        if tokens.is_empty() {
            // A bare reference resolving to an empty string tokenizes to
            // nothing; truthiness (§4.2) treats an empty string as falsy.
            return Ok(false);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let result = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(OrchestratorError::Execution(format!(
                "trailing tokens in expression: {expr}"
            )));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(vars: &[(&str, serde_json::Value)]) -> ExecutionContext {
        let ctx = ExecutionContext::new("wf", "exec");
        for (k, v) in vars {
            ctx.set_variable(*k, v.clone());
        }
        ctx
    }

    #[test]
    fn numeric_comparison() {
        let eval = ExpressionEvaluator::new();
        let ctx = ctx_with(&[("value", serde_json::json!(3))]);
        assert!(eval.evaluate_string("${value} > 2", &ctx).unwrap());
        assert!(!eval.evaluate_string("${value} > 5", &ctx).unwrap());
    }

    #[test]
    fn string_equality() {
        let eval = ExpressionEvaluator::new();
        let ctx = ctx_with(&[("status", serde_json::json!("ok"))]);
        assert!(eval.evaluate_string("${status} == \"ok\"", &ctx).unwrap());
    }

    #[test]
    fn logical_and_or_not_with_parens() {
        let eval = ExpressionEvaluator::new();
        let ctx = ctx_with(&[("a", serde_json::json!(1)), ("b", serde_json::json!(0))]);
        assert!(eval
            .evaluate_string("(${a} == 1 AND NOT ${b} == 1) OR false", &ctx)
            .unwrap());
    }

    #[test]
    fn s1_if_else_if_else_chain() {
        let eval = ExpressionEvaluator::new();
        let ctx = ctx_with(&[("value", serde_json::json!(3))]);
        assert!(!eval.evaluate_string("${value} > 5", &ctx).unwrap());
        assert!(eval.evaluate_string("${value} > 2", &ctx).unwrap());
    }

    #[test]
    fn truthiness_of_bare_values() {
        let eval = ExpressionEvaluator::new();
        let ctx = ctx_with(&[("flag", serde_json::json!(true)), ("empty", serde_json::json!(""))]);
        assert!(eval.evaluate_string("${flag}", &ctx).unwrap());
        assert!(!eval.evaluate_string("${empty}", &ctx).unwrap());
    }
}
