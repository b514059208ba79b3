//! Per message rule evaluation

use std::cell::OnceCell;
use std::collections::HashMap;
use std::sync::OnceLock;

use bulkscan_common::Error;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use super::{Rule, RuleKind, RuleSet, RuleTest};
use crate::digest::strip_html;
use crate::message::{Header, ParsedMessage};
use crate::meta::{self, RuleResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HitState {
    /// Evaluation started but not finished; seeing this again means a cycle
    Pending,
    Done(bool),
}

/// A rule that hit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleHit {
    pub name: String,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Result of evaluating a whole rule set against one message
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunReport {
    pub hits: Vec<RuleHit>,
    pub score: f64,
}

impl RunReport {
    pub fn hit_names(&self) -> Vec<&str> {
        self.hits.iter().map(|h| h.name.as_str()).collect()
    }
}

/// Evaluates rules of one [`RuleSet`] against one message.
///
/// The hit cache belongs to the run, so every message gets a fresh run.
pub struct EvaluationRun<'a> {
    rules: &'a RuleSet,
    message: &'a ParsedMessage,
    cache: HashMap<String, HitState>,
    score_level: usize,
    remove_tags: Vec<String>,
    body: OnceCell<String>,
    raw_body: OnceCell<String>,
    full: OnceCell<String>,
    uris: OnceCell<Vec<String>>,
}

impl<'a> EvaluationRun<'a> {
    pub fn new(rules: &'a RuleSet, message: &'a ParsedMessage) -> Self {
        Self {
            rules,
            message,
            cache: HashMap::new(),
            score_level: 0,
            remove_tags: vec!["script".to_string(), "style".to_string()],
            body: OnceCell::new(),
            raw_body: OnceCell::new(),
            full: OnceCell::new(),
            uris: OnceCell::new(),
        }
    }

    /// Score set used for the report, 0 to 3
    pub fn with_score_level(mut self, level: usize) -> Self {
        self.score_level = level.min(3);
        self
    }

    /// Elements dropped with their content when body rules strip HTML
    pub fn with_remove_tags(mut self, tags: Vec<String>) -> Self {
        self.remove_tags = tags;
        self
    }

    /// Whether rule `name` hits. Each rule is evaluated at most once per run.
    pub fn eval(&mut self, name: &str) -> bool {
        match self.cache.get(name) {
            Some(HitState::Done(hit)) => return *hit,
            Some(HitState::Pending) => {
                debug!(rule = %name, "Rule cycle detected, treating as not hit");
                return false;
            }
            None => {}
        }

        let rules = self.rules;
        let Some(rule) = rules.get(name) else {
            return false;
        };

        if rule.scores.is_disabled() {
            self.cache.insert(name.to_string(), HitState::Done(false));
            return false;
        }

        self.cache.insert(name.to_string(), HitState::Pending);
        let hit = self.dispatch(rule);
        self.cache.insert(name.to_string(), HitState::Done(hit));
        hit
    }

    /// Evaluate every rule in priority order
    pub fn run(mut self) -> RunReport {
        let rules = self.rules;
        let mut report = RunReport::default();

        for name in rules.names_by_priority() {
            if !self.eval(name) {
                continue;
            }
            let Some(rule) = rules.get(name) else {
                continue;
            };
            let score = if rule.is_subrule() {
                0.0
            } else {
                rule.scores.level(self.score_level)
            };
            debug!("Rule {} matched, adding score {}", rule.name, score);
            report.score += score;
            report.hits.push(RuleHit {
                name: rule.name.clone(),
                score,
                description: rule.description.clone(),
            });
        }

        report
    }

    fn dispatch(&mut self, rule: &'a Rule) -> bool {
        match &rule.test {
            RuleTest::Meta(expression) => meta::evaluate(expression, self),
            RuleTest::Eval(call) => {
                debug!(rule = %rule.name, "eval:{} is not supported", call);
                false
            }
            RuleTest::Invalid(_) => false,
            RuleTest::Exists(header) => self
                .message
                .headers()
                .iter()
                .any(|h| h.name.eq_ignore_ascii_case(header)),
            RuleTest::Header { .. } if rule.kind == RuleKind::MimeHeader => self
                .message
                .parts()
                .into_iter()
                .any(|part| header_matches(&rule.test, &part.headers)),
            RuleTest::Header { .. } => header_matches(&rule.test, self.message.headers()),
            RuleTest::Pattern(pattern) => match rule.kind {
                RuleKind::Body => pattern.is_match(self.body()),
                RuleKind::RawBody => pattern.is_match(self.raw_body()),
                RuleKind::Full => pattern.is_match(self.full()),
                RuleKind::Uri => self.uris().iter().any(|uri| pattern.is_match(uri)),
                kind => {
                    debug!(rule = %rule.name, "Pattern test on {} rule", kind);
                    false
                }
            },
        }
    }

    /// Subject followed by the decoded, markup free text of every text part
    fn body(&self) -> &str {
        self.body.get_or_init(|| {
            let mut body = String::new();
            if let Some(subject) = self.message.subject() {
                body.push_str(subject);
                body.push('\n');
            }
            for part in self.message.leaves().into_iter().filter(|p| p.is_text()) {
                let Ok(text) = part.decoded_text() else {
                    continue;
                };
                if part.is_html() {
                    body.push_str(&strip_html(&text, &self.remove_tags));
                } else {
                    body.push_str(&text);
                }
                body.push('\n');
            }
            body
        })
    }

    /// Decoded text of every text part with markup left in place
    fn raw_body(&self) -> &str {
        self.raw_body.get_or_init(|| {
            let mut body = String::new();
            for part in self.message.leaves().into_iter().filter(|p| p.is_text()) {
                if let Ok(text) = part.decoded_text() {
                    body.push_str(&text);
                    body.push('\n');
                }
            }
            body
        })
    }

    fn full(&self) -> &str {
        self.full
            .get_or_init(|| String::from_utf8_lossy(&self.message.raw).into_owned())
    }

    fn uris(&self) -> &[String] {
        self.uris.get_or_init(|| extract_uris(self.raw_body()))
    }
}

impl RuleResolver for EvaluationRun<'_> {
    fn resolve(&mut self, name: &str) -> Result<bool, Error> {
        Ok(self.eval(name))
    }
}

fn header_matches(test: &RuleTest, headers: &[Header]) -> bool {
    let RuleTest::Header {
        header,
        modifier,
        negate,
        pattern,
        if_unset,
    } = test
    else {
        return false;
    };

    let mut present = false;
    let matched = if header == "ALL" {
        present = !headers.is_empty();
        let block: String = headers
            .iter()
            .map(|h| format!("{}: {}\n", h.name, h.value))
            .collect();
        pattern.is_match(&block)
    } else {
        let mut matched = false;
        for value in selected_values(header, headers) {
            present = true;
            if pattern.is_match(modifier.apply(value)) {
                matched = true;
                break;
            }
        }
        matched
    };

    match (present, if_unset) {
        (false, Some(default)) => pattern.is_match(default) != *negate,
        (false, None) => *negate,
        (true, _) => matched != *negate,
    }
}

/// Values of `header`; `ToCc` selects both `To` and `Cc`
fn selected_values<'h>(header: &'h str, headers: &'h [Header]) -> impl Iterator<Item = &'h str> + 'h {
    headers
        .iter()
        .filter(move |h| {
            if header.eq_ignore_ascii_case("ToCc") {
                h.name.eq_ignore_ascii_case("To") || h.name.eq_ignore_ascii_case("Cc")
            } else {
                h.name.eq_ignore_ascii_case(header)
            }
        })
        .map(|h| h.value.as_str())
}

fn uri_regex() -> Option<&'static Regex> {
    static URI: OnceLock<Option<Regex>> = OnceLock::new();
    URI.get_or_init(|| {
        Regex::new(r#"(?i)\b(?:(?:https?|ftp)://|mailto:|www\.)[^\s<>"'\)\]]+"#).ok()
    })
    .as_ref()
}

/// URIs found in `text`, in order of first appearance
pub fn extract_uris(text: &str) -> Vec<String> {
    let Some(regex) = uri_regex() else {
        return Vec::new();
    };
    let mut uris: Vec<String> = Vec::new();
    for m in regex.find_iter(text) {
        let uri = m.as_str().trim_end_matches(&['.', ',', ';', ':', '!', '?'][..]);
        if !uri.is_empty() && !uris.iter().any(|u| u == uri) {
            uris.push(uri.to_string());
        }
    }
    uris
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessagePart;
    use crate::rules::rules_from_lines;
    use pretty_assertions::assert_eq;

    fn message() -> ParsedMessage {
        let root = MessagePart::multipart(
            "alternative",
            vec![
                MessagePart::text(
                    "text/plain",
                    Some("utf-8"),
                    "Claim your prize at http://prize.example/claim today.",
                ),
                MessagePart::text(
                    "text/html",
                    Some("utf-8"),
                    "<p>Claim your <b>prize</b></p><a href=\"https://tracker.example/t?id=1\">here</a>",
                ),
                MessagePart::binary("application/pdf", Some("invoice.pdf"), b"%PDF".to_vec())
                    .with_headers(vec![Header::new("Content-Type", "application/pdf; name=invoice.pdf")]),
            ],
        )
        .with_headers(vec![
            Header::new("From", "\"Prize Team\" <winner@lottery.example>"),
            Header::new("To", "victim@example.org"),
            Header::new("Subject", "You have WON"),
            Header::new("Received", "from mx.example by relay"),
            Header::new("Received", "from relay by us"),
        ]);
        ParsedMessage::new(root).with_raw(b"Received: from mx.example\r\nSubject: You have WON\r\n\r\nbody".to_vec())
    }

    fn hits(lines: &[&str]) -> Vec<String> {
        let rules = rules_from_lines(lines.iter().copied());
        let msg = message();
        let report = EvaluationRun::new(&rules, &msg).run();
        let mut names: Vec<String> = report.hits.into_iter().map(|h| h.name).collect();
        names.sort();
        names
    }

    #[test]
    fn test_header_rules() {
        assert_eq!(
            hits(&[
                "header SUBJ_WON Subject =~ /\\bwon\\b/i",
                "header SUBJ_CASE Subject =~ /won/",
                "header FROM_LOTTERY From:addr =~ /\\.example$/",
                "header FROM_NAME From:name =~ /^Prize Team$/",
                "header NOT_FROM_US From !~ /ourdomain/",
                "header NO_REPLY_TO Reply-To =~ /./",
                "header NEG_MISSING Reply-To !~ /./",
                "header UNSET_DEFAULT Reply-To =~ /fallback/ [if-unset: fallback]",
                "header SECOND_RECEIVED Received =~ /relay by us/",
                "header TOCC ToCc =~ /victim/",
                "header ALL_HEADERS ALL =~ /^To: victim/m",
                "header HAS_SUBJECT exists:Subject",
                "header HAS_LIST exists:List-Id",
            ]),
            vec![
                "ALL_HEADERS",
                "FROM_LOTTERY",
                "FROM_NAME",
                "HAS_SUBJECT",
                "NEG_MISSING",
                "NOT_FROM_US",
                "SECOND_RECEIVED",
                "SUBJ_WON",
                "TOCC",
                "UNSET_DEFAULT",
            ]
        );
    }

    #[test]
    fn test_body_rules() {
        assert_eq!(
            hits(&[
                "body BODY_PRIZE /claim your prize/i",
                "body BODY_SUBJECT /^You have WON$/m",
                "body BODY_NO_MARKUP /<b>/",
                "rawbody RAW_MARKUP /<b>prize<\\/b>/",
                "full FULL_RECEIVED /^Received: from mx/m",
                "full FULL_MISSING /X-Mailer/",
            ]),
            vec!["BODY_PRIZE", "BODY_SUBJECT", "FULL_RECEIVED", "RAW_MARKUP"]
        );
    }

    #[test]
    fn test_uri_and_mimeheader_rules() {
        assert_eq!(
            hits(&[
                "uri URI_PRIZE /prize\\.example/",
                "uri URI_TRACKER m{^https://tracker\\.example/t\\?id=\\d+$}",
                "uri URI_MISSING /nowhere\\.example/",
                "mimeheader MIME_PDF Content-Type =~ /application\\/pdf/",
                "mimeheader MIME_ZIP Content-Type =~ /zip/",
            ]),
            vec!["MIME_PDF", "URI_PRIZE", "URI_TRACKER"]
        );
    }

    #[test]
    fn test_meta_rules_and_scores() {
        let rules = rules_from_lines([
            "header __SUBJ_WON Subject =~ /won/i",
            "body __PRIZE /prize/",
            "body __MISSING /nothing here/",
            "meta LOTTERY_SPAM __SUBJ_WON && __PRIZE && !__MISSING",
            "meta TWO_OF_THREE (__SUBJ_WON + __PRIZE + __MISSING >= 2)",
            "meta NOT_BOTH __SUBJ_WON && __MISSING",
            "meta BROKEN (__SUBJ_WON &&",
            "score LOTTERY_SPAM 3.5",
            "score TWO_OF_THREE 1.0 1.5 2.0 2.5",
            "describe LOTTERY_SPAM Looks like a lottery scam",
        ]);
        let msg = message();
        let report = EvaluationRun::new(&rules, &msg).run();

        let mut names = report.hit_names();
        names.sort();
        assert_eq!(names, vec!["LOTTERY_SPAM", "TWO_OF_THREE", "__PRIZE", "__SUBJ_WON"]);
        assert!((report.score - 4.5).abs() < 1e-9);

        let lottery = report.hits.iter().find(|h| h.name == "LOTTERY_SPAM").unwrap();
        assert_eq!(lottery.description.as_deref(), Some("Looks like a lottery scam"));
        assert!(report.hits.iter().filter(|h| h.name.starts_with("__")).all(|h| h.score == 0.0));

        let report = EvaluationRun::new(&rules, &msg).with_score_level(3).run();
        assert!((report.score - 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_meta_cycles_break_to_false() {
        let rules = rules_from_lines([
            "meta LOOP_A LOOP_B || __TRUE",
            "meta LOOP_B LOOP_A",
            "meta SELF SELF || __TRUE",
            "header __TRUE exists:Subject",
        ]);
        let msg = message();
        let mut run = EvaluationRun::new(&rules, &msg);

        // LOOP_A is pending while LOOP_B asks for it
        assert!(run.eval("LOOP_A"));
        assert!(!run.eval("LOOP_B"));
        assert!(run.eval("SELF"));
    }

    #[test]
    fn test_disabled_unknown_and_eval_rules() {
        let rules = rules_from_lines([
            "body ZERO_SCORE /prize/",
            "score ZERO_SCORE 0",
            "body EVAL_RULE eval:check_for_spam()",
            "body BAD /(/",
            "meta USES_ZERO ZERO_SCORE || UNKNOWN_RULE",
        ]);
        let msg = message();
        let mut run = EvaluationRun::new(&rules, &msg);
        assert!(!run.eval("ZERO_SCORE"));
        assert!(!run.eval("EVAL_RULE"));
        assert!(!run.eval("BAD"));
        assert!(!run.eval("USES_ZERO"));
        assert!(!run.eval("NOT_DEFINED"));
    }

    #[test]
    fn test_each_rule_evaluated_once() {
        let rules = rules_from_lines([
            "body __PRIZE /prize/",
            "meta M1 __PRIZE && __PRIZE",
            "meta M2 (__PRIZE + __PRIZE > 1)",
        ]);
        let msg = message();
        let mut run = EvaluationRun::new(&rules, &msg);
        assert!(run.eval("M1"));
        assert!(run.eval("M2"));
        assert_eq!(run.cache.len(), 3);
        assert!(run.cache.values().all(|s| *s == HitState::Done(true)));
    }

    #[test]
    fn test_report_serializes() {
        let report = RunReport {
            hits: vec![RuleHit {
                name: "A".to_string(),
                score: 1.5,
                description: None,
            }],
            score: 1.5,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["hits"][0]["name"], "A");
        assert_eq!(json["score"], 1.5);
        assert!(json["hits"][0].get("description").is_none());
    }

    #[test]
    fn test_extract_uris() {
        assert_eq!(
            extract_uris("see http://a.example/x. and WWW.b.example, <https://c.example/?q=1> http://a.example/x"),
            vec!["http://a.example/x", "WWW.b.example", "https://c.example/?q=1"]
        );
    }
}
