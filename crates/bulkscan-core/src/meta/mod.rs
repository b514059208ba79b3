//! Meta rule expressions
//!
//! A meta expression combines other rules with `!`, `&&`, `||`, parentheses
//! and count terms such as `(A + B + C > 1)`. Each rule name is resolved
//! once, in the order it appears, while the expression is parsed. Any parse
//! failure makes the whole expression false.

mod lexer;
mod parser;

use std::fmt;

use bulkscan_common::Error;
use thiserror::Error as ThisError;
use tracing::warn;

pub use lexer::{tokenize, Token, TokenKind};

/// Looks up whether a named rule hit
pub trait RuleResolver {
    fn resolve(&mut self, name: &str) -> Result<bool, Error>;
}

impl<F> RuleResolver for F
where
    F: FnMut(&str) -> bool,
{
    fn resolve(&mut self, name: &str) -> Result<bool, Error> {
        Ok(self(name))
    }
}

/// Meta expression errors
#[derive(Debug, Clone, PartialEq, ThisError)]
pub enum MetaError {
    #[error("empty expression")]
    Empty,

    #[error("invalid character '{ch}' at offset {offset}")]
    InvalidCharacter { ch: char, offset: usize },

    #[error("invalid number '{value}' at offset {offset}")]
    InvalidNumber { value: String, offset: usize },

    #[error("unexpected '{token}' at offset {offset}")]
    UnexpectedToken { token: String, offset: usize },

    #[error("unexpected end of expression at offset {offset}")]
    UnexpectedEnd { offset: usize },

    #[error("trailing '{token}' at offset {offset}")]
    TrailingInput { token: String, offset: usize },

    #[error("expression nested too deeply at offset {offset}")]
    TooDeep { offset: usize },

    #[error("resolving {rule}: {reason}")]
    Resolver { rule: String, reason: String },
}

impl From<MetaError> for Error {
    fn from(err: MetaError) -> Self {
        match err {
            MetaError::Resolver { rule, reason } => Error::Resolver { rule, reason },
            other => Error::Expression(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountOp {
    Greater,
    GreaterEqual,
}

impl CountOp {
    pub fn apply(self, count: u64, threshold: u64) -> bool {
        match self {
            CountOp::Greater => count > threshold,
            CountOp::GreaterEqual => count >= threshold,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            CountOp::Greater => ">",
            CountOp::GreaterEqual => ">=",
        }
    }
}

/// A parsed expression with every rule reference already resolved
#[derive(Debug, Clone, PartialEq)]
pub enum MetaExpr {
    Rule {
        name: String,
        hit: bool,
    },
    Count {
        rules: Vec<(String, bool)>,
        op: CountOp,
        threshold: u64,
    },
    Not(Box<MetaExpr>),
    And(Vec<MetaExpr>),
    Or(Vec<MetaExpr>),
}

impl MetaExpr {
    pub fn value(&self) -> bool {
        match self {
            MetaExpr::Rule { hit, .. } => *hit,
            MetaExpr::Count {
                rules,
                op,
                threshold,
            } => {
                let count = rules.iter().filter(|(_, hit)| *hit).count() as u64;
                op.apply(count, *threshold)
            }
            MetaExpr::Not(inner) => !inner.value(),
            MetaExpr::And(operands) => operands.iter().all(MetaExpr::value),
            MetaExpr::Or(operands) => operands.iter().any(MetaExpr::value),
        }
    }
}

impl fmt::Display for MetaExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn join(f: &mut fmt::Formatter<'_>, operands: &[MetaExpr], sep: &str) -> fmt::Result {
            f.write_str("(")?;
            for (i, operand) in operands.iter().enumerate() {
                if i > 0 {
                    f.write_str(sep)?;
                }
                write!(f, "{}", operand)?;
            }
            f.write_str(")")
        }

        match self {
            MetaExpr::Rule { name, .. } => f.write_str(name),
            MetaExpr::Count {
                rules,
                op,
                threshold,
            } => {
                f.write_str("(")?;
                for (i, (name, _)) in rules.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" + ")?;
                    }
                    f.write_str(name)?;
                }
                write!(f, " {} {})", op.as_str(), threshold)
            }
            MetaExpr::Not(inner) => write!(f, "!{}", inner),
            MetaExpr::And(operands) => join(f, operands, " && "),
            MetaExpr::Or(operands) => join(f, operands, " || "),
        }
    }
}

/// Parse `expression`, resolving rule names through `resolver`
pub fn parse<R>(expression: &str, resolver: &mut R) -> Result<MetaExpr, MetaError>
where
    R: RuleResolver + ?Sized,
{
    let tokens = tokenize(expression)?;
    parser::Parser::new(&tokens, expression.len(), resolver).parse()
}

/// Evaluate `expression`, reporting parse and resolver failures
pub fn try_evaluate<R>(expression: &str, resolver: &mut R) -> Result<bool, MetaError>
where
    R: RuleResolver + ?Sized,
{
    parse(expression, resolver).map(|expr| expr.value())
}

/// Evaluate `expression`. Failures are logged and yield `false`.
pub fn evaluate<R>(expression: &str, resolver: &mut R) -> bool
where
    R: RuleResolver + ?Sized,
{
    match try_evaluate(expression, resolver) {
        Ok(value) => value,
        Err(e) => {
            warn!(expression = %expression, error = %e, "Meta expression evaluated as false");
            false
        }
    }
}

/// Rule names referenced by `expression`, in order of appearance. Nothing is resolved.
pub fn referenced_rules(expression: &str) -> Result<Vec<String>, MetaError> {
    Ok(tokenize(expression)?
        .into_iter()
        .filter_map(|token| match token.kind {
            TokenKind::Ident(name) => Some(name),
            _ => None,
        })
        .collect())
}
