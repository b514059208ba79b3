//! SpamAssassin style rule sets
//!
//! Rules are loaded from `.cf` files, compiled once and evaluated per
//! message by an [`EvaluationRun`].

mod eval;
mod loader;
pub mod pattern;

use std::collections::HashMap;

use bulkscan_common::ScoreSet;
use regex::Regex;
use tracing::warn;

use crate::meta;

pub use eval::{EvaluationRun, RuleHit, RunReport};
pub use loader::{rules_from_lines, RuleLoader};

/// Type of a rule definition directive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    Header,
    Body,
    RawBody,
    Full,
    Meta,
    Uri,
    MimeHeader,
}

impl RuleKind {
    pub fn from_directive(directive: &str) -> Option<Self> {
        match directive {
            "header" => Some(RuleKind::Header),
            "body" => Some(RuleKind::Body),
            "rawbody" => Some(RuleKind::RawBody),
            "full" => Some(RuleKind::Full),
            "meta" => Some(RuleKind::Meta),
            "uri" => Some(RuleKind::Uri),
            "mimeheader" => Some(RuleKind::MimeHeader),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Header => "header",
            RuleKind::Body => "body",
            RuleKind::RawBody => "rawbody",
            RuleKind::Full => "full",
            RuleKind::Meta => "meta",
            RuleKind::Uri => "uri",
            RuleKind::MimeHeader => "mimeheader",
        }
    }
}

impl std::fmt::Display for RuleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a header value is presented to the pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderModifier {
    Plain,
    Raw,
    /// Address part, `a@b` out of `Name <a@b>`
    Addr,
    /// Display name part
    Name,
}

impl HeaderModifier {
    pub fn apply<'a>(&self, value: &'a str) -> &'a str {
        match self {
            HeaderModifier::Plain | HeaderModifier::Raw => value,
            HeaderModifier::Addr => match (value.find('<'), value.rfind('>')) {
                (Some(start), Some(end)) if start < end => value[start + 1..end].trim(),
                _ => value.trim(),
            },
            HeaderModifier::Name => match value.find('<') {
                Some(start) => value[..start].trim().trim_matches('"').trim(),
                None => "",
            },
        }
    }
}

/// Compiled test of a rule
#[derive(Debug, Clone)]
pub enum RuleTest {
    /// `NAME =~ /re/` or `NAME !~ /re/`
    Header {
        header: String,
        modifier: HeaderModifier,
        negate: bool,
        pattern: Regex,
        if_unset: Option<String>,
    },
    /// `exists:NAME`
    Exists(String),
    /// Body, rawbody, full and uri rules
    Pattern(Regex),
    Meta(String),
    /// `eval:` plugin calls, never hit
    Eval(String),
    /// Definition that failed to compile, never hits
    Invalid(String),
}

impl RuleTest {
    /// Compile `definition` for a rule of `kind`. Failures produce
    /// [`RuleTest::Invalid`] and are logged.
    pub fn compile(name: &str, kind: RuleKind, definition: &str) -> Self {
        let definition = definition.trim();
        if let Some(call) = definition.strip_prefix("eval:") {
            return RuleTest::Eval(call.trim().to_string());
        }

        let result = match kind {
            RuleKind::Meta => meta::referenced_rules(definition)
                .map(|_| RuleTest::Meta(definition.to_string()))
                .map_err(|e| e.to_string()),
            RuleKind::Header | RuleKind::MimeHeader => {
                compile_header(definition, kind == RuleKind::Header)
            }
            RuleKind::Body | RuleKind::RawBody | RuleKind::Full | RuleKind::Uri => {
                pattern::compile(definition)
                    .map(RuleTest::Pattern)
                    .map_err(|e| e.to_string())
            }
        };

        result.unwrap_or_else(|reason| {
            warn!(rule = %name, kind = %kind, "Invalid rule definition: {}", reason);
            RuleTest::Invalid(reason)
        })
    }
}

fn compile_header(definition: &str, allow_exists: bool) -> Result<RuleTest, String> {
    if let Some(header) = definition.strip_prefix("exists:") {
        if !allow_exists {
            return Err("exists: is only valid for header rules".to_string());
        }
        return Ok(RuleTest::Exists(header.trim().to_string()));
    }

    let (target, rest) = definition
        .split_once(char::is_whitespace)
        .ok_or_else(|| format!("missing operator in '{}'", definition))?;
    let rest = rest.trim_start();
    let (negate, rest) = if let Some(r) = rest.strip_prefix("=~") {
        (false, r)
    } else if let Some(r) = rest.strip_prefix("!~") {
        (true, r)
    } else {
        return Err(format!("unsupported operator in '{}'", definition));
    };

    let (literal, if_unset) = match rest.rfind("[if-unset:") {
        Some(pos) => {
            let default = rest[pos + "[if-unset:".len()..]
                .trim_end()
                .trim_end_matches(']')
                .trim();
            (&rest[..pos], Some(default.to_string()))
        }
        None => (rest, None),
    };

    let (header, modifier) = match target.split_once(':') {
        Some((header, "raw")) => (header, HeaderModifier::Raw),
        Some((header, "addr")) => (header, HeaderModifier::Addr),
        Some((header, "name")) => (header, HeaderModifier::Name),
        Some((_, other)) => return Err(format!("unsupported header modifier ':{}'", other)),
        None => (target, HeaderModifier::Plain),
    };

    let pattern = pattern::compile(literal).map_err(|e| e.to_string())?;
    Ok(RuleTest::Header {
        header: header.to_string(),
        modifier,
        negate,
        pattern,
        if_unset,
    })
}

/// A single rule
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub kind: RuleKind,
    pub definition: String,
    pub test: RuleTest,
    pub scores: ScoreSet,
    pub tflags: Vec<String>,
    pub priority: i32,
    pub description: Option<String>,
}

impl Rule {
    pub fn new(name: impl Into<String>, kind: RuleKind, definition: impl Into<String>) -> Self {
        let name = name.into();
        let definition = definition.into();
        let test = RuleTest::compile(&name, kind, &definition);
        let scores = if name.starts_with("T_") {
            ScoreSet::uniform(0.01)
        } else {
            ScoreSet::default()
        };
        Self {
            name,
            kind,
            definition,
            test,
            scores,
            tflags: Vec::new(),
            priority: 0,
            description: None,
        }
    }

    /// Sub rules (`__NAME`) only feed meta rules and never score
    pub fn is_subrule(&self) -> bool {
        self.name.starts_with("__")
    }

    pub fn has_tflag(&self, flag: &str) -> bool {
        self.tflags.iter().any(|f| f == flag)
    }
}

/// Loaded rules indexed by name. Read-only once loading is done.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: HashMap<String, Rule>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule, replacing any earlier definition with the same name
    pub fn insert(&mut self, rule: Rule) -> Option<Rule> {
        self.rules.insert(rule.name.clone(), rule)
    }

    pub fn get(&self, name: &str) -> Option<&Rule> {
        self.rules.get(name)
    }

    pub(crate) fn get_mut(&mut self, name: &str) -> Option<&mut Rule> {
        self.rules.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.values()
    }

    /// Rule names ordered by ascending priority, then name
    pub fn names_by_priority(&self) -> Vec<&str> {
        let mut rules: Vec<&Rule> = self.rules.values().collect();
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
        rules.into_iter().map(|r| r.name.as_str()).collect()
    }

    /// `(meta rule, missing rule)` pairs for meta rules referencing undefined rules
    pub fn missing_references(&self) -> Vec<(String, String)> {
        let mut missing = Vec::new();
        for name in self.names_by_priority() {
            let Some(Rule {
                test: RuleTest::Meta(expression),
                ..
            }) = self.rules.get(name)
            else {
                continue;
            };
            for referenced in meta::referenced_rules(expression).unwrap_or_default() {
                if !self.rules.contains_key(&referenced) {
                    missing.push((name.to_string(), referenced));
                }
            }
        }
        missing
    }
}
