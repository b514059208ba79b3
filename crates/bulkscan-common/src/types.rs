//! Common types for bulkscan

use serde::{Deserialize, Serialize};
use std::fmt;

/// Hex encoded SHA-1 digest identifying a family of near-duplicate messages
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Length of a fingerprint in hex characters
    pub const LEN: usize = 40;

    /// Wrap a hex string, returning `None` unless it is exactly 40 lowercase hex digits
    pub fn from_hex(hex: impl Into<String>) -> Option<Self> {
        let hex = hex.into();
        if hex.len() == Self::LEN
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            Some(Self(hex))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Per-level rule scores. Level 0 is used when neither bayes nor network
/// tests are active, levels 1-3 cover the remaining combinations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreSet(pub [f64; 4]);

impl ScoreSet {
    /// The same score on every level
    pub fn uniform(score: f64) -> Self {
        Self([score; 4])
    }

    /// Score for the given level, clamped to the last level
    pub fn level(&self, level: usize) -> f64 {
        self.0[level.min(3)]
    }

    /// A rule scored zero on level 0 is disabled
    pub fn is_disabled(&self) -> bool {
        self.0[0] == 0.0
    }
}

impl Default for ScoreSet {
    fn default() -> Self {
        Self::uniform(1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_from_hex() {
        let hex = "da39a3ee5e6b4b0d3255bfef95601890afd80709";
        let fp = Fingerprint::from_hex(hex).unwrap();
        assert_eq!(fp.as_str(), hex);
        assert_eq!(fp.to_string(), hex);

        assert!(Fingerprint::from_hex("abc").is_none());
        assert!(Fingerprint::from_hex(hex.to_uppercase()).is_none());
    }

    #[test]
    fn test_score_set() {
        let scores = ScoreSet([0.5, 1.0, 1.5, 2.0]);
        assert_eq!(scores.level(0), 0.5);
        assert_eq!(scores.level(9), 2.0);
        assert!(!scores.is_disabled());
        assert!(ScoreSet::uniform(0.0).is_disabled());
        assert_eq!(ScoreSet::default(), ScoreSet::uniform(1.0));
    }
}
