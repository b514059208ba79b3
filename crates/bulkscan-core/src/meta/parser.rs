//! Recursive descent parser building resolved meta expression trees
//!
//! ```text
//! expr    := or
//! or      := and ( '||' and )*
//! and     := not ( '&&' not )*
//! not     := '!' not | atom
//! atom    := NAME | count | '(' expr ')'
//! count   := '(' NAME ( '+' NAME )* cmp NUMBER ')'
//!          | '(' NAME ( '+' NAME )* ')' cmp NUMBER
//! cmp     := '>' | '>='
//! ```
//!
//! Rule names are resolved as they are parsed, left to right, exactly once
//! per occurrence.

use super::lexer::{Token, TokenKind};
use super::{CountOp, MetaError, MetaExpr, RuleResolver};

/// Deepest nesting of `!` and `(` accepted
pub const MAX_DEPTH: usize = 256;

pub struct Parser<'a, R: RuleResolver + ?Sized> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
    input_len: usize,
    resolver: &'a mut R,
}

/// A count term found by lookahead, not yet resolved
struct CountTerm {
    names: Vec<String>,
    op: CountOp,
    threshold: u64,
    end: usize,
}

impl<'a, R: RuleResolver + ?Sized> Parser<'a, R> {
    pub fn new(tokens: &'a [Token], input_len: usize, resolver: &'a mut R) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
            input_len,
            resolver,
        }
    }

    /// Parse the whole token stream
    pub fn parse(mut self) -> Result<MetaExpr, MetaError> {
        if self.tokens.is_empty() {
            return Err(MetaError::Empty);
        }
        let expr = self.parse_or()?;
        if let Some(token) = self.tokens.get(self.pos) {
            return Err(MetaError::TrailingInput {
                token: token.kind.to_string(),
                offset: token.offset,
            });
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&'a TokenKind> {
        self.tokens.get(self.pos).map(|t| &t.kind)
    }

    fn kind_at(&self, index: usize) -> Option<&'a TokenKind> {
        self.tokens.get(index).map(|t| &t.kind)
    }

    fn unexpected(&self) -> MetaError {
        match self.tokens.get(self.pos) {
            Some(token) => MetaError::UnexpectedToken {
                token: token.kind.to_string(),
                offset: token.offset,
            },
            None => MetaError::UnexpectedEnd {
                offset: self.input_len,
            },
        }
    }

    fn parse_or(&mut self) -> Result<MetaExpr, MetaError> {
        let mut operands = vec![self.parse_and()?];
        while self.peek() == Some(&TokenKind::Or) {
            self.pos += 1;
            operands.push(self.parse_and()?);
        }
        Ok(collapse(operands, MetaExpr::Or))
    }

    fn parse_and(&mut self) -> Result<MetaExpr, MetaError> {
        let mut operands = vec![self.parse_not()?];
        while self.peek() == Some(&TokenKind::And) {
            self.pos += 1;
            operands.push(self.parse_not()?);
        }
        Ok(collapse(operands, MetaExpr::And))
    }

    fn parse_not(&mut self) -> Result<MetaExpr, MetaError> {
        if self.peek() == Some(&TokenKind::Not) {
            self.descend()?;
            self.pos += 1;
            let operand = self.parse_not()?;
            self.depth -= 1;
            return Ok(MetaExpr::Not(Box::new(operand)));
        }
        self.parse_atom()
    }

    fn descend(&mut self) -> Result<(), MetaError> {
        if self.depth >= MAX_DEPTH {
            return Err(MetaError::TooDeep {
                offset: self.tokens.get(self.pos).map_or(self.input_len, |t| t.offset),
            });
        }
        self.depth += 1;
        Ok(())
    }

    fn parse_atom(&mut self) -> Result<MetaExpr, MetaError> {
        match self.peek() {
            Some(TokenKind::Ident(name)) => {
                self.pos += 1;
                let hit = self.resolve(name)?;
                Ok(MetaExpr::Rule {
                    name: name.clone(),
                    hit,
                })
            }
            Some(TokenKind::LParen) => {
                if let Some(term) = self.scan_count() {
                    self.pos = term.end;
                    let mut rules = Vec::with_capacity(term.names.len());
                    for name in term.names {
                        let hit = self.resolve(&name)?;
                        rules.push((name, hit));
                    }
                    return Ok(MetaExpr::Count {
                        rules,
                        op: term.op,
                        threshold: term.threshold,
                    });
                }

                self.descend()?;
                self.pos += 1;
                let inner = self.parse_or()?;
                if self.peek() != Some(&TokenKind::RParen) {
                    return Err(self.unexpected());
                }
                self.pos += 1;
                self.depth -= 1;
                Ok(inner)
            }
            _ => Err(self.unexpected()),
        }
    }

    /// Look ahead from a `(` for either count form without consuming or
    /// resolving anything
    fn scan_count(&self) -> Option<CountTerm> {
        let mut i = self.pos + 1;
        let mut names = Vec::new();

        match self.kind_at(i)? {
            TokenKind::Ident(name) => names.push(name.clone()),
            _ => return None,
        }
        i += 1;

        while let (Some(TokenKind::Plus), Some(TokenKind::Ident(name))) =
            (self.kind_at(i), self.kind_at(i + 1))
        {
            names.push(name.clone());
            i += 2;
        }

        let (op, threshold) = match (self.kind_at(i)?, self.kind_at(i + 1), self.kind_at(i + 2)) {
            // (A + B > N)
            (cmp, Some(TokenKind::Number(n)), Some(TokenKind::RParen)) => (comparison(cmp)?, *n),
            // (A + B) > N
            (TokenKind::RParen, Some(cmp), Some(TokenKind::Number(n))) => (comparison(cmp)?, *n),
            _ => return None,
        };

        Some(CountTerm {
            names,
            op,
            threshold,
            end: i + 3,
        })
    }

    fn resolve(&mut self, name: &str) -> Result<bool, MetaError> {
        self.resolver
            .resolve(name)
            .map_err(|source| MetaError::Resolver {
                rule: name.to_string(),
                reason: source.to_string(),
            })
    }
}

fn comparison(kind: &TokenKind) -> Option<CountOp> {
    match kind {
        TokenKind::Greater => Some(CountOp::Greater),
        TokenKind::GreaterEqual => Some(CountOp::GreaterEqual),
        _ => None,
    }
}

fn collapse(mut operands: Vec<MetaExpr>, wrap: fn(Vec<MetaExpr>) -> MetaExpr) -> MetaExpr {
    if operands.len() == 1 {
        operands.remove(0)
    } else {
        wrap(operands)
    }
}
