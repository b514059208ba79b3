//! Error types for bulkscan

use thiserror::Error;

/// Main error type for bulkscan
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Digest error: {0}")]
    Digest(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Rule load error: {0}")]
    RuleLoad(String),

    #[error("Resolver error for rule {rule}: {reason}")]
    Resolver { rule: String, reason: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for bulkscan
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Error::Config(_) => "CONFIG_ERROR",
            Error::Digest(_) => "DIGEST_ERROR",
            Error::Expression(_) => "EXPRESSION_ERROR",
            Error::RuleLoad(_) => "RULE_LOAD_ERROR",
            Error::Resolver { .. } => "RESOLVER_ERROR",
            Error::Store(_) => "STORE_ERROR",
            Error::Internal(_) => "INTERNAL_ERROR",
            Error::Other(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether the failure is scoped to a single rule or message part and
    /// processing of the remaining input may continue
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Digest(_) | Error::Expression(_) | Error::Resolver { .. }
        )
    }
}
