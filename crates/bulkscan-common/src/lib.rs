//! Bulkscan Common - Shared types and configuration
//!
//! This crate provides the configuration, error type and small value types
//! shared by the digest engine, the rule evaluator and the command line tool.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::{Fingerprint, ScoreSet};
