//! Bulkscan Core - Near-duplicate digests and SpamAssassin style rules
//!
//! This crate provides the fuzzy digest engine used to count bulk mail,
//! the meta expression evaluator and a rule set loader and evaluator built
//! on top of it.

pub mod digest;
pub mod fuzor;
pub mod message;
pub mod meta;
pub mod rules;
pub mod store;

pub use digest::{Digest, DigestEngine};
pub use fuzor::{FuzorScanner, ReportOutcome};
pub use message::{Header, MessagePart, ParsedMessage};
pub use meta::{evaluate, try_evaluate, MetaError, MetaExpr, RuleResolver};
pub use rules::{EvaluationRun, Rule, RuleKind, RuleLoader, RuleSet, RunReport};
pub use store::{CountStore, MemoryCountStore};
