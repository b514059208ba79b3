//! Perl style regular expression literals (`/re/flags`, `m{re}flags`)

use regex::{Regex, RegexBuilder};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PatternError {
    #[error("pattern '{0}' has no delimiter")]
    MissingDelimiter(String),

    #[error("pattern '{0}' is not terminated")]
    Unterminated(String),

    #[error("unsupported flag '{flag}' in '{pattern}'")]
    UnsupportedFlag { flag: char, pattern: String },

    #[error("invalid regex '{pattern}': {reason}")]
    Invalid { pattern: String, reason: String },
}

fn closing_delimiter(open: char) -> char {
    match open {
        '{' => '}',
        '(' => ')',
        '[' => ']',
        '<' => '>',
        other => other,
    }
}

/// Split a literal into its pattern body and flags
pub fn split_literal(literal: &str) -> Result<(&str, &str), PatternError> {
    let literal = literal.trim();
    let body = match literal.strip_prefix('m') {
        Some(rest) if rest.starts_with(|c: char| !c.is_alphanumeric() && !c.is_whitespace()) => rest,
        _ if literal.starts_with('/') => literal,
        _ => return Err(PatternError::MissingDelimiter(literal.to_string())),
    };

    let open = body
        .chars()
        .next()
        .ok_or_else(|| PatternError::MissingDelimiter(literal.to_string()))?;
    let close = closing_delimiter(open);
    let inner = &body[open.len_utf8()..];
    let end = inner
        .rfind(close)
        .ok_or_else(|| PatternError::Unterminated(literal.to_string()))?;

    Ok((&inner[..end], &inner[end + close.len_utf8()..]))
}

/// Compile a Perl style literal. Flags `i`, `m`, `s` and `x` are honoured,
/// `g` and `o` are accepted and ignored.
pub fn compile(literal: &str) -> Result<Regex, PatternError> {
    let (pattern, flags) = split_literal(literal)?;

    let mut builder = RegexBuilder::new(pattern);
    for flag in flags.chars() {
        match flag {
            'i' => {
                builder.case_insensitive(true);
            }
            'm' => {
                builder.multi_line(true);
            }
            's' => {
                builder.dot_matches_new_line(true);
            }
            'x' => {
                builder.ignore_whitespace(true);
            }
            'g' | 'o' => {}
            other => {
                return Err(PatternError::UnsupportedFlag {
                    flag: other,
                    pattern: literal.trim().to_string(),
                })
            }
        }
    }

    builder.build().map_err(|e| PatternError::Invalid {
        pattern: literal.trim().to_string(),
        reason: e.to_string(),
    })
}
