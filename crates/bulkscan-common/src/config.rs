//! Configuration for bulkscan

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Digest (fingerprint) configuration
    #[serde(default)]
    pub digest: DigestConfig,

    /// Counting store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rule loading configuration
    #[serde(default)]
    pub rules: RulesConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Digest configuration
///
/// Replacement tokens set to `None`, or to an empty string in a TOML file,
/// disable the corresponding pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestConfig {
    /// Runs of at least this many non-space characters count as a long word
    #[serde(default = "default_long_word_threshold")]
    pub long_word_threshold: usize,

    /// Replacement for long words
    #[serde(default = "default_replace_long_word")]
    pub replace_long_word: Option<String>,

    /// Replacement for email addresses
    #[serde(default = "default_replace_email")]
    pub replace_email: Option<String>,

    /// Replacement for URLs
    #[serde(default = "default_replace_url")]
    pub replace_url: Option<String>,

    /// Append a hash of every non-text part
    #[serde(default)]
    pub include_attachment_content: bool,

    /// Append the number of non-text parts
    #[serde(default = "default_true")]
    pub include_attachment_count: bool,

    /// Minimum length of the trimmed predigest
    #[serde(default = "default_minimum_size")]
    pub minimum_predigest_size: usize,

    /// Minimum predigest length once placeholder tokens are removed
    #[serde(default = "default_minimum_size")]
    pub minimum_unmodified_content: usize,

    /// Minimum amount of decoded body text
    #[serde(default = "default_minimum_size")]
    pub minimum_bodytext_size: usize,

    /// Remove all whitespace from the predigest
    #[serde(default = "default_true")]
    pub strip_whitespace: bool,

    /// Remove HTML markup but keep the text content
    #[serde(default = "default_true")]
    pub strip_html_markup: bool,

    /// Tags removed together with their content
    #[serde(default = "default_remove_html_tags")]
    pub remove_html_tags: Vec<String>,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            long_word_threshold: default_long_word_threshold(),
            replace_long_word: default_replace_long_word(),
            replace_email: default_replace_email(),
            replace_url: default_replace_url(),
            include_attachment_content: false,
            include_attachment_count: true,
            minimum_predigest_size: default_minimum_size(),
            minimum_unmodified_content: default_minimum_size(),
            minimum_bodytext_size: default_minimum_size(),
            strip_whitespace: true,
            strip_html_markup: true,
            remove_html_tags: default_remove_html_tags(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_long_word_threshold() -> usize {
    10
}

fn default_replace_long_word() -> Option<String> {
    Some("[LONG]".to_string())
}

fn default_replace_email() -> Option<String> {
    Some("[EMAIL]".to_string())
}

fn default_replace_url() -> Option<String> {
    Some("[LINK]".to_string())
}

// 27 > len("von meinem Iphone gesendet")
fn default_minimum_size() -> usize {
    27
}

fn default_remove_html_tags() -> Vec<String> {
    vec!["script".to_string(), "style".to_string()]
}

/// Counting store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Fingerprint expiry in seconds, refreshed on every increment
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// Messages larger than this many bytes are not digested
    #[serde(default = "default_max_size")]
    pub max_size: usize,

    /// Prefix for the pseudo headers written by the check
    #[serde(default = "default_header_name")]
    pub header_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl(),
            max_size: default_max_size(),
            header_name: default_header_name(),
        }
    }
}

fn default_ttl() -> u64 {
    7 * 24 * 3600
}

fn default_max_size() -> usize {
    600_000
}

fn default_header_name() -> String {
    "X-FuZor".to_string()
}

/// Rule loading configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RulesConfig {
    /// Directories scanned for rule files, in order
    #[serde(default = "default_rule_dirs")]
    pub dirs: Vec<PathBuf>,

    /// Rule file extension
    #[serde(default = "default_rule_extension")]
    pub extension: String,

    /// Plugins considered loaded for `ifplugin` blocks
    #[serde(default)]
    pub plugins: Vec<String>,

    /// Literal `if` conditions considered true
    #[serde(default)]
    pub true_conditions: Vec<String>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            dirs: default_rule_dirs(),
            extension: default_rule_extension(),
            plugins: Vec::new(),
            true_conditions: Vec::new(),
        }
    }
}

fn default_rule_dirs() -> Vec<PathBuf> {
    vec![
        PathBuf::from("/var/lib/spamassassin/3.004000"),
        PathBuf::from("/etc/mail/spamassassin"),
    ]
}

fn default_rule_extension() -> String {
    "cf".to_string()
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from file
    pub fn from_file(path: &Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load configuration from the default locations, falling back to
    /// built-in defaults when no file exists. Returns the file that was read.
    pub fn load() -> crate::Result<(Self, Option<PathBuf>)> {
        Self::load_first(&[
            PathBuf::from("./bulkscan.toml"),
            PathBuf::from("/etc/bulkscan/bulkscan.toml"),
        ])
    }

    fn load_first(candidates: &[PathBuf]) -> crate::Result<(Self, Option<PathBuf>)> {
        match candidates.iter().find(|path| path.exists()) {
            Some(path) => Ok((Self::from_file(path)?, Some(path.clone()))),
            None => Ok((Self::default(), None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let digest = DigestConfig::default();
        assert_eq!(digest.long_word_threshold, 10);
        assert_eq!(digest.replace_url.as_deref(), Some("[LINK]"));
        assert_eq!(digest.minimum_bodytext_size, 27);
        assert!(!digest.include_attachment_content);
        assert_eq!(digest.remove_html_tags, vec!["script", "style"]);

        let store = StoreConfig::default();
        assert_eq!(store.ttl_secs, 604_800);
        assert_eq!(store.header_name, "X-FuZor");
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.digest, DigestConfig::default());
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[digest]
long_word_threshold = 12
minimum_bodytext_size = 40
remove_html_tags = ["script"]

[store]
ttl_secs = 3600

[rules]
dirs = ["/srv/rules"]
plugins = ["Mail::SpamAssassin::Plugin::FreeMail"]

[logging]
format = "json"
"#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.digest.long_word_threshold, 12);
        assert_eq!(config.digest.minimum_bodytext_size, 40);
        assert_eq!(config.digest.minimum_predigest_size, 27);
        assert_eq!(config.digest.remove_html_tags, vec!["script"]);
        assert_eq!(config.store.ttl_secs, 3600);
        assert_eq!(config.store.max_size, 600_000);
        assert_eq!(config.rules.dirs, vec![PathBuf::from("/srv/rules")]);
        assert_eq!(config.rules.extension, "cf");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[store]\nheader_name = \"X-Bulk\"").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.store.header_name, "X-Bulk");
    }

    #[test]
    fn test_load_first_reports_source() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        let present = dir.path().join("bulkscan.toml");
        std::fs::write(&present, "[store]\nttl_secs = 60\n").unwrap();

        let (config, source) = Config::load_first(&[missing.clone(), present.clone()]).unwrap();
        assert_eq!(source, Some(present));
        assert_eq!(config.store.ttl_secs, 60);

        let (config, source) = Config::load_first(&[missing]).unwrap();
        assert_eq!(source, None);
        assert_eq!(config.store.ttl_secs, 604_800);
    }

    #[test]
    fn test_invalid_config() {
        let err = Config::from_toml("[digest]\nlong_word_threshold = \"ten\"").unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }
}
