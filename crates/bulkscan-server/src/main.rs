//! bulkscan - command line entry point

use anyhow::{anyhow, Context, Result};
use bulkscan_common::config::{Config, LoggingConfig};
use bulkscan_core::{
    meta, DigestEngine, EvaluationRun, FuzorScanner, MemoryCountStore, ParsedMessage,
    ReportOutcome, RuleLoader,
};
use clap::Parser;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "bulkscan", version, about = "Bulk mail fingerprints and rule checks")]
struct Cli {
    /// Configuration file, defaults to ./bulkscan.toml or /etc/bulkscan/bulkscan.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Print the predigest and fingerprint of each message
    Digest {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Report every message to an in-memory store and print the pseudo headers
    Count {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Run the rule set against each message
    Check {
        /// Rule directory, may be repeated; defaults to the configured directories
        #[arg(long = "rules")]
        rules: Vec<PathBuf>,
        /// Print the reports as JSON
        #[arg(long)]
        json: bool,
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Evaluate a meta expression against literal rule values
    Meta {
        expression: String,
        /// NAME=true or NAME=false; unlisted names are false
        values: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (config, source) = match &cli.config {
        Some(path) => (Config::from_file(path)?, Some(path.clone())),
        None => Config::load()?,
    };

    init_logging(&config.logging);
    match &source {
        Some(path) => info!("Loaded configuration from {}", path.display()),
        None => info!("No configuration file found, using defaults"),
    }

    match cli.command {
        Command::Digest { files } => cmd_digest(&config, &files),
        Command::Count { files } => cmd_count(&config, &files).await,
        Command::Check { rules, json, files } => cmd_check(&config, rules, json, &files),
        Command::Meta { expression, values } => cmd_meta(&expression, &values),
    }
}

fn read_message(path: &Path) -> Result<Option<(ParsedMessage, usize)>> {
    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let size = raw.len();
    match ParsedMessage::parse(&raw) {
        Some(message) => Ok(Some((message, size))),
        None => {
            warn!("{} is not a parseable message, skipping", path.display());
            Ok(None)
        }
    }
}

fn cmd_digest(config: &Config, files: &[PathBuf]) -> Result<()> {
    let engine = DigestEngine::new(config.digest.clone())?;

    for path in files {
        let Some((message, _)) = read_message(path)? else {
            continue;
        };
        let digest = engine.digest(&message);
        match &digest.fingerprint {
            Some(fingerprint) => println!("{}: {}", path.display(), fingerprint),
            None => println!("{}: not enough data for a digest", path.display()),
        }
        println!(
            "  bodytext={} attachments={}",
            digest.bodytext_size, digest.attachment_count
        );
        println!("  predigest={}", digest.predigest);
    }
    Ok(())
}

async fn cmd_count(config: &Config, files: &[PathBuf]) -> Result<()> {
    let engine = DigestEngine::new(config.digest.clone())?;
    let store = Arc::new(MemoryCountStore::new(config.store.ttl_secs));
    let scanner = FuzorScanner::new(engine, store, config.store.clone());

    let mut messages = Vec::new();
    for path in files {
        let Some((message, size)) = read_message(path)? else {
            continue;
        };
        match scanner.report(&message, size).await? {
            ReportOutcome::Skipped => println!("{}: too large, skipped", path.display()),
            ReportOutcome::InsufficientData => {
                println!("{}: not enough data for a digest", path.display())
            }
            ReportOutcome::Counted {
                fingerprint,
                seen_before,
            } => println!(
                "{}: {} seen {} times before",
                path.display(),
                fingerprint,
                seen_before
            ),
        }
        messages.push((path, message, size));
    }

    for (path, message, size) in &messages {
        for (name, value) in scanner.check(message, *size).await? {
            println!("{}: {}: {}", path.display(), name, value);
        }
    }
    Ok(())
}

fn cmd_check(config: &Config, rules: Vec<PathBuf>, json: bool, files: &[PathBuf]) -> Result<()> {
    let dirs = if rules.is_empty() {
        config.rules.dirs.clone()
    } else {
        rules
    };

    let mut loader = RuleLoader::new(&config.rules);
    loader.load_dirs(&dirs)?;
    let rule_set = loader.finish();
    info!("Checking {} messages against {} rules", files.len(), rule_set.len());

    for path in files {
        let Some((message, _)) = read_message(path)? else {
            continue;
        };
        let report = EvaluationRun::new(&rule_set, &message)
            .with_remove_tags(config.digest.remove_html_tags.clone())
            .run();

        if json {
            let value = serde_json::json!({
                "file": path.display().to_string(),
                "report": report,
            });
            println!("{}", serde_json::to_string(&value)?);
            continue;
        }

        println!("{}: score={:.2}", path.display(), report.score);
        for hit in &report.hits {
            match &hit.description {
                Some(description) => println!("  {:>6.2} {} {}", hit.score, hit.name, description),
                None => println!("  {:>6.2} {}", hit.score, hit.name),
            }
        }
    }
    Ok(())
}

fn parse_values(values: &[String]) -> Result<HashMap<String, bool>> {
    values
        .iter()
        .map(|entry| {
            let (name, value) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("expected NAME=true|false, got {}", entry))?;
            let value = value
                .parse::<bool>()
                .map_err(|_| anyhow!("expected true or false for {}, got {}", name, value))?;
            Ok((name.to_string(), value))
        })
        .collect()
}

fn cmd_meta(expression: &str, values: &[String]) -> Result<()> {
    let values = parse_values(values)?;
    let mut resolver = |name: &str| values.get(name).copied().unwrap_or(false);

    match meta::parse(expression, &mut resolver) {
        Ok(expr) => println!("{} = {}", expr, expr.value()),
        Err(e) => {
            warn!("Could not parse meta expression: {}", e);
            println!("false");
        }
    }
    Ok(())
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,bulkscan={}", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}
