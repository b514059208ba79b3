//! Reporting and checking messages against the fingerprint counts

use std::sync::Arc;

use bulkscan_common::config::StoreConfig;
use bulkscan_common::{Fingerprint, Result};
use tracing::{debug, info};

use crate::digest::DigestEngine;
use crate::message::ParsedMessage;
use crate::store::CountStore;

/// Outcome of reporting a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Larger than the configured maximum size
    Skipped,
    /// Not enough content for a fingerprint
    InsufficientData,
    Counted {
        fingerprint: Fingerprint,
        /// How many times the fingerprint was reported before this message
        seen_before: u64,
    },
}

/// Digest engine bound to a counting store
pub struct FuzorScanner {
    engine: DigestEngine,
    store: Arc<dyn CountStore>,
    config: StoreConfig,
}

impl FuzorScanner {
    pub fn new(engine: DigestEngine, store: Arc<dyn CountStore>, config: StoreConfig) -> Self {
        Self {
            engine,
            store,
            config,
        }
    }

    pub fn engine(&self) -> &DigestEngine {
        &self.engine
    }

    fn too_large(&self, size: usize) -> bool {
        if size > self.config.max_size {
            debug!("Message of {} bytes exceeds {} bytes, not digesting", size, self.config.max_size);
            return true;
        }
        false
    }

    /// Count the message's fingerprint. `size` is the message size in bytes.
    pub async fn report(&self, message: &ParsedMessage, size: usize) -> Result<ReportOutcome> {
        if self.too_large(size) {
            return Ok(ReportOutcome::Skipped);
        }

        let digest = self.engine.digest(message);
        debug!(
            bodytext_size = digest.bodytext_size,
            subject = message.subject().unwrap_or(""),
            "predigest {}",
            digest.predigest.chars().take(50).collect::<String>()
        );

        let Some(fingerprint) = digest.fingerprint else {
            info!("Not enough data for a digest");
            return Ok(ReportOutcome::InsufficientData);
        };

        let count = self.store.increment(fingerprint.as_str()).await?;
        let seen_before = count.saturating_sub(1);
        info!("Digest {} seen {} times before", fingerprint, seen_before);
        Ok(ReportOutcome::Counted {
            fingerprint,
            seen_before,
        })
    }

    /// Pseudo headers `<name>-ID` and `<name>-Lvl` for a message whose
    /// fingerprint has been reported before. Empty otherwise.
    pub async fn check(&self, message: &ParsedMessage, size: usize) -> Result<Vec<(String, String)>> {
        if self.too_large(size) {
            return Ok(Vec::new());
        }

        let Some(fingerprint) = self.engine.digest(message).fingerprint else {
            debug!("Not enough data for a unique digest");
            return Ok(Vec::new());
        };

        let count = self.store.get(fingerprint.as_str()).await?;
        if count == 0 {
            return Ok(Vec::new());
        }

        info!("Digest {} seen {} times", fingerprint, count);
        let header = &self.config.header_name;
        Ok(vec![
            (format!("{}-ID", header), fingerprint.to_string()),
            (format!("{}-Lvl", header), count.to_string()),
        ])
    }
}
