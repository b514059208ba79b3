//! Line oriented rule file loader

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use bulkscan_common::config::RulesConfig;
use bulkscan_common::{Error, Result, ScoreSet};
use tracing::{debug, info, warn};

use super::{Rule, RuleKind, RuleSet};

/// Builds a [`RuleSet`] from rule files
pub struct RuleLoader {
    rules: RuleSet,
    plugins: HashSet<String>,
    true_conditions: HashSet<String>,
    extension: String,
    if_stack: Vec<bool>,
    /// Files currently being loaded, innermost last
    include_stack: Vec<PathBuf>,
    loaded: HashSet<PathBuf>,
}

impl RuleLoader {
    pub fn new(config: &RulesConfig) -> Self {
        Self {
            rules: RuleSet::new(),
            plugins: config.plugins.iter().cloned().collect(),
            true_conditions: config
                .true_conditions
                .iter()
                .map(|c| c.trim().to_string())
                .collect(),
            extension: config.extension.to_ascii_lowercase(),
            if_stack: Vec::new(),
            include_stack: Vec::new(),
            loaded: HashSet::new(),
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Finish loading and hand out the rule set
    pub fn finish(self) -> RuleSet {
        if !self.if_stack.is_empty() {
            warn!("{} conditional block(s) not closed with endif", self.if_stack.len());
        }
        for (rule, missing) in self.rules.missing_references() {
            debug!(rule = %rule, "Meta rule references unknown rule {}", missing);
        }
        info!("Loaded {} rules", self.rules.len());
        self.rules
    }

    /// Load every rule file in `dirs`. Files ending in `.pre` are read
    /// before the rule files of the same directory, each group in name order.
    pub fn load_dirs(&mut self, dirs: &[PathBuf]) -> Result<()> {
        for dir in dirs {
            if !dir.is_dir() {
                warn!("Rule directory {} does not exist, skipping", dir.display());
                continue;
            }

            let entries = fs::read_dir(dir)
                .map_err(|e| Error::RuleLoad(format!("{}: {}", dir.display(), e)))?;
            let mut pre_files = Vec::new();
            let mut rule_files = Vec::new();
            for entry in entries {
                let path = entry
                    .map_err(|e| Error::RuleLoad(format!("{}: {}", dir.display(), e)))?
                    .path();
                if !path.is_file() {
                    continue;
                }
                let extension = path
                    .extension()
                    .map(|e| e.to_string_lossy().to_ascii_lowercase())
                    .unwrap_or_default();
                if extension == "pre" {
                    pre_files.push(path);
                } else if extension == self.extension {
                    rule_files.push(path);
                }
            }
            pre_files.sort();
            rule_files.sort();

            debug!(
                "Loading {} pre files and {} rule files from {}",
                pre_files.len(),
                rule_files.len(),
                dir.display()
            );
            for path in pre_files.iter().chain(rule_files.iter()) {
                self.load_file(path)?;
            }
        }
        Ok(())
    }

    /// Load a single rule file. Files already loaded are skipped.
    pub fn load_file(&mut self, path: &Path) -> Result<()> {
        let path = fs::canonicalize(path)
            .map_err(|e| Error::RuleLoad(format!("{}: {}", path.display(), e)))?;

        if self.include_stack.contains(&path) {
            warn!("Circular file inclusion: {}", path.display());
            return Ok(());
        }
        if !self.loaded.insert(path.clone()) {
            debug!("Rule file {} already loaded", path.display());
            return Ok(());
        }

        let content = fs::read(&path)
            .map_err(|e| Error::RuleLoad(format!("{}: {}", path.display(), e)))?;
        let content = String::from_utf8_lossy(&content);

        self.include_stack.push(path.clone());
        self.load_lines(&path.display().to_string(), content.lines());
        self.include_stack.pop();
        Ok(())
    }

    /// Apply rule file lines. `source` only names the input in log messages.
    pub fn load_lines<I, S>(&mut self, source: &str, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for (index, line) in lines.into_iter().enumerate() {
            let line = line.as_ref().trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (directive, rest) = match line.split_once(char::is_whitespace) {
                Some((directive, rest)) => (directive, rest.trim()),
                None => (line, ""),
            };
            let directive = directive.to_ascii_lowercase();

            match directive.as_str() {
                "if" => {
                    let satisfied = self.condition_holds(rest);
                    self.if_stack.push(satisfied);
                }
                "ifplugin" => {
                    let satisfied = self.plugins.contains(rest);
                    self.if_stack.push(satisfied);
                }
                "else" => match self.if_stack.last_mut() {
                    Some(top) => *top = !*top,
                    None => warn!("{}:{}: else without if", source, index + 1),
                },
                "endif" => {
                    if self.if_stack.pop().is_none() {
                        warn!("{}:{}: endif without if", source, index + 1);
                    }
                }
                _ if self.line_disabled() => {}
                "include" => self.include(source, rest),
                "loadplugin" => {
                    if let Some(plugin) = rest.split_whitespace().next() {
                        self.plugins.insert(plugin.to_string());
                    }
                }
                "score" => self.patch(source, index, rest, apply_score),
                "describe" => self.patch(source, index, rest, |rule, value| {
                    rule.description = Some(value.to_string());
                    Ok(())
                }),
                "tflags" => self.patch(source, index, rest, |rule, value| {
                    rule.tflags = value
                        .split_whitespace()
                        .take_while(|flag| !flag.starts_with('#'))
                        .map(str::to_string)
                        .collect();
                    Ok(())
                }),
                "priority" => self.patch(source, index, rest, |rule, value| {
                    rule.priority = first_value(value)
                        .parse()
                        .map_err(|_| format!("invalid priority '{}'", value))?;
                    Ok(())
                }),
                other => match RuleKind::from_directive(other) {
                    Some(kind) => self.define(source, index, kind, rest),
                    None => debug!("{}:{}: unsupported directive {}", source, index + 1, other),
                },
            }
        }
    }

    fn line_disabled(&self) -> bool {
        self.if_stack.iter().any(|satisfied| !satisfied)
    }

    fn condition_holds(&self, condition: &str) -> bool {
        let condition = condition.trim();
        if self.true_conditions.contains(condition) {
            return true;
        }
        let inner = condition
            .trim_start_matches('(')
            .trim_end_matches(')')
            .trim();
        match inner.strip_prefix("plugin(") {
            Some(plugin) => self.plugins.contains(plugin.trim_end_matches(')').trim()),
            None => false,
        }
    }

    fn include(&mut self, source: &str, target: &str) {
        let dir = self
            .include_stack
            .last()
            .and_then(|current| current.parent())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let path = dir.join(target);
        if let Err(e) = self.load_file(&path) {
            warn!("{}: include {} failed: {}", source, target, e);
        }
    }

    fn define(&mut self, source: &str, index: usize, kind: RuleKind, rest: &str) {
        let Some((name, definition)) = rest.split_once(char::is_whitespace) else {
            warn!("{}:{}: {} rule without definition", source, index + 1, kind);
            return;
        };
        self.rules.insert(Rule::new(name, kind, definition.trim()));
    }

    fn patch<F>(&mut self, source: &str, index: usize, rest: &str, apply: F)
    where
        F: FnOnce(&mut Rule, &str) -> std::result::Result<(), String>,
    {
        let (name, value) = match rest.split_once(char::is_whitespace) {
            Some((name, value)) => (name, value.trim()),
            None => (rest, ""),
        };
        let Some(rule) = self.rules.get_mut(name) else {
            debug!("{}:{}: ignoring setting for unknown rule {}", source, index + 1, name);
            return;
        };
        if let Err(reason) = apply(rule, value) {
            warn!("{}:{}: {}", source, index + 1, reason);
        }
    }
}

fn first_value(value: &str) -> &str {
    value.split_whitespace().next().unwrap_or("")
}

fn apply_score(rule: &mut Rule, value: &str) -> std::result::Result<(), String> {
    let scores = value
        .split_whitespace()
        .take_while(|v| !v.starts_with('#'))
        .map(|v| v.trim_matches(|c| c == '(' || c == ')').parse::<f64>())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|_| format!("invalid score '{}' for {}", value, rule.name))?;

    rule.scores = match scores.as_slice() {
        [score] => ScoreSet::uniform(*score),
        [a, b, c, d] => ScoreSet([*a, *b, *c, *d]),
        _ => {
            return Err(format!(
                "{} needs one or four scores, got {}",
                rule.name,
                scores.len()
            ))
        }
    };
    Ok(())
}

/// Build a rule set from in-memory lines with default settings
pub fn rules_from_lines<I, S>(lines: I) -> RuleSet
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut loader = RuleLoader::new(&RulesConfig::default());
    loader.load_lines("<lines>", lines);
    loader.finish()
}
