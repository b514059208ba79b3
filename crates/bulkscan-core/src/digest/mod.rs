//! Near-duplicate message fingerprinting
//!
//! A message is reduced to a "predigest": its text parts with markup
//! removed, high-entropy substrings (addresses, links, long tokens)
//! replaced by placeholders and whitespace dropped. The SHA-1 of the
//! predigest is the fingerprint. Copies of the same bulk mailing that only
//! differ in per-recipient tokens share a fingerprint.

mod html;

pub use html::strip_html;

use crate::message::{MessagePart, ParsedMessage};
use bulkscan_common::config::DigestConfig;
use bulkscan_common::{Error, Fingerprint, Result};
use regex::{Captures, Regex};
use sha1::{Digest as _, Sha1};
use tracing::{debug, warn};

/// Outcome of digesting one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    pub predigest: String,
    /// `None` when the message carries too little text
    pub fingerprint: Option<Fingerprint>,
    /// Characters of decoded, markup-free body text
    pub bodytext_size: usize,
    pub attachment_count: usize,
}

/// Computes predigests and fingerprints with a fixed configuration
#[derive(Debug, Clone)]
pub struct DigestEngine {
    config: DigestConfig,
    email: Regex,
    url: Regex,
    long_word: Regex,
    placeholder: Regex,
}

impl DigestEngine {
    /// Create an engine, compiling the normalisation patterns
    pub fn new(config: DigestConfig) -> Result<Self> {
        if config.long_word_threshold == 0 {
            return Err(Error::Config(
                "long_word_threshold must be at least 1".to_string(),
            ));
        }

        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| Error::Config(format!("invalid digest pattern {}: {}", pattern, e)))
        };

        // 1-50 non-space, @, 1-30 non-space
        let email = compile(r"\S{1,50}@\S{1,30}")?;
        // lowercase scheme, colon, up to 100 non-space
        let url = compile(r"[a-z]+:\S{1,100}")?;
        let long_word = compile(&format!(r"\S{{{},}}", config.long_word_threshold))?;
        let placeholder = compile(r"\[[A-Z0-9:]+\]")?;

        Ok(Self {
            config,
            email,
            url,
            long_word,
            placeholder,
        })
    }

    pub fn config(&self) -> &DigestConfig {
        &self.config
    }

    /// Digest a message
    pub fn digest(&self, message: &ParsedMessage) -> Digest {
        let mut predigest = String::new();
        let mut bodytext_size = 0;
        let mut attachment_count = 0;

        for part in message.leaves() {
            if part.is_text() {
                match self.normalize_part(part) {
                    Ok((normalized, text_size)) => {
                        predigest.push_str(&normalized);
                        bodytext_size += text_size;
                    }
                    Err(e) => warn!("Skipping {} part: {}", part.content_type, e),
                }
            } else {
                attachment_count += 1;
                if self.config.include_attachment_content {
                    predigest.push_str(&format!("[ATTH:{}]", sha1_hex(&part.body)));
                }
            }
        }

        if self.config.include_attachment_count && attachment_count > 0 {
            predigest.push_str(&format!("[ATTC:{}]", attachment_count));
        }

        if self.config.strip_whitespace {
            predigest.retain(|c| !c.is_whitespace());
        }

        let fingerprint = self.fingerprint(&predigest, bodytext_size);
        debug!(
            "Digest bodytext_size={} attachments={} fingerprint={:?} predigest={:.50}",
            bodytext_size, attachment_count, fingerprint, predigest
        );

        Digest {
            predigest,
            fingerprint,
            bodytext_size,
            attachment_count,
        }
    }

    /// Normalise one text part. Returns the normalised text and the size of
    /// the decoded, markup-free text.
    pub fn normalize_part(&self, part: &MessagePart) -> Result<(String, usize)> {
        let mut text = part.decoded_text()?;

        if self.config.strip_html_markup {
            text = strip_html(&text, &self.config.remove_html_tags);
        }
        let text_size = text.chars().count();

        Ok((self.normalize_text(&text), text_size))
    }

    /// Apply the placeholder and whitespace passes to decoded text.
    ///
    /// The order is significant: addresses first, then links, then long
    /// words, so that later passes never see the raw text an earlier pass
    /// already replaced.
    pub fn normalize_text(&self, text: &str) -> String {
        let mut text = text.to_string();

        if let Some(token) = active(&self.config.replace_email) {
            text = self.email.replace_all(&text, regex::NoExpand(token)).into_owned();
        }

        if let Some(token) = active(&self.config.replace_url) {
            text = self.url.replace_all(&text, regex::NoExpand(token)).into_owned();
        }

        if let Some(token) = active(&self.config.replace_long_word) {
            text = self
                .long_word
                .replace_all(&text, |caps: &Captures<'_>| {
                    self.replace_long_run(&caps[0], token)
                })
                .into_owned();
        }

        if self.config.strip_whitespace {
            text.retain(|c| !c.is_whitespace());
        }

        text.trim().to_string()
    }

    /// Replace the pieces of a long run that are not placeholders themselves
    fn replace_long_run(&self, run: &str, token: &str) -> String {
        let threshold = self.config.long_word_threshold;
        let mut out = String::with_capacity(run.len());
        let mut last = 0;

        let push_piece = |out: &mut String, piece: &str| {
            if piece.chars().count() >= threshold {
                out.push_str(token);
            } else {
                out.push_str(piece);
            }
        };

        for marker in self.placeholder.find_iter(run) {
            push_piece(&mut out, &run[last..marker.start()]);
            out.push_str(marker.as_str());
            last = marker.end();
        }
        push_piece(&mut out, &run[last..]);
        out
    }

    fn fingerprint(&self, predigest: &str, bodytext_size: usize) -> Option<Fingerprint> {
        if bodytext_size < self.config.minimum_bodytext_size {
            return None;
        }

        let predigest = predigest.trim();
        if predigest.chars().count() < self.config.minimum_predigest_size {
            return None;
        }

        let unmodified = self.placeholder.replace_all(predigest, "");
        if unmodified.chars().count() < self.config.minimum_unmodified_content {
            return None;
        }

        Fingerprint::from_hex(sha1_hex(predigest.as_bytes()))
    }
}

fn active(token: &Option<String>) -> Option<&str> {
    token.as_deref().filter(|t| !t.is_empty())
}

fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Header;
    use pretty_assertions::assert_eq;

    fn engine() -> DigestEngine {
        DigestEngine::new(DigestConfig::default()).unwrap()
    }

    fn text_message(parts: Vec<MessagePart>) -> ParsedMessage {
        ParsedMessage::new(
            MessagePart::multipart("mixed", parts)
                .with_headers(vec![Header::new("Subject", "Special offer")]),
        )
    }

    fn plain(body: &str) -> MessagePart {
        MessagePart::text("text/plain", Some("utf-8"), body)
    }

    const OFFER: &str = "Dear customer, we have a special offer for you this week only. \
        Visit {url} or write to {email} and quote code {code} at checkout.";

    fn offer(url: &str, email: &str, code: &str) -> ParsedMessage {
        let body = OFFER
            .replace("{url}", url)
            .replace("{email}", email)
            .replace("{code}", code);
        text_message(vec![plain(&body)])
    }

    #[test]
    fn test_normalize_text_order() {
        let engine = engine();
        assert_eq!(
            engine.normalize_text("Hello https://example.com/x?y=1 my@address.com"),
            "Hello[LINK][EMAIL]"
        );
        assert_eq!(
            engine.normalize_text("Hello https://other.example/z?y=2 other@address.org"),
            "Hello[LINK][EMAIL]"
        );
    }

    #[test]
    fn test_long_words_replaced() {
        let engine = engine();
        assert_eq!(
            engine.normalize_text("code XK29FJ20DK1 short"),
            "code[LONG]short"
        );
        // nine characters is not long
        assert_eq!(engine.normalize_text("abcdefghi"), "abcdefghi");
    }

    #[test]
    fn test_placeholders_survive_long_word_pass() {
        let engine = engine();
        assert_eq!(engine.normalize_text("abc[EMAIL]defghijklmnop"), "abc[EMAIL][LONG]");
        assert_eq!(engine.normalize_text("[LINK][EMAIL][LONG]"), "[LINK][EMAIL][LONG]");
        assert_eq!(engine.normalize_text("contact:me@example.com"), "[EMAIL]");
    }

    #[test]
    fn test_disabled_replacements() {
        let config = DigestConfig {
            replace_email: None,
            replace_url: Some(String::new()),
            replace_long_word: None,
            strip_whitespace: false,
            ..DigestConfig::default()
        };
        let engine = DigestEngine::new(config).unwrap();
        assert_eq!(
            engine.normalize_text(" a@b.c http://x.y/z "),
            "a@b.c http://x.y/z"
        );
    }

    #[test]
    fn test_digest_is_deterministic() {
        let engine = engine();
        let message = offer("https://shop.example/a", "sales@shop.example", "A1B2C3D4E5F6");
        let first = engine.digest(&message);
        let second = engine.digest(&message);
        assert_eq!(first, second);
        assert!(first.fingerprint.is_some());
        assert_eq!(first.fingerprint.unwrap().as_str().len(), 40);
    }

    #[test]
    fn test_templating_noise_collapses() {
        let engine = engine();
        let a = engine.digest(&offer(
            "https://shop.example/track?id=1",
            "alice@one.example",
            "ZZ81KD93JD0AQ",
        ));
        let b = engine.digest(&offer(
            "http://cdn.other.example/r/2",
            "bob.smith@two.example.org",
            "QP02MX71LK5CT",
        ));
        assert_eq!(a.predigest, b.predigest);
        assert!(a.fingerprint.is_some());
        assert_eq!(a.fingerprint, b.fingerprint);

        let c = engine.digest(&text_message(vec![plain(
            "A completely different letter about the garden party next saturday.",
        )]));
        assert_ne!(a.fingerprint, c.fingerprint);
    }

    #[test]
    fn test_two_part_message_normalizes_placeholders() {
        let engine = engine();
        let message = text_message(vec![
            plain("Hello https://example.com/x?y=1 my@address.com"),
            plain("Hello https://other.example/z?y=2 other@address.org"),
        ]);
        let digest = engine.digest(&message);
        assert_eq!(digest.predigest, "Hello[LINK][EMAIL]Hello[LINK][EMAIL]");
    }

    #[test]
    fn test_bodytext_threshold_boundary() {
        let config = DigestConfig {
            minimum_predigest_size: 1,
            minimum_unmodified_content: 1,
            ..DigestConfig::default()
        };
        let engine = DigestEngine::new(config).unwrap();
        let below = "aaaa bbbb cccc dddd eeee f";
        let at = "aaaa bbbb cccc dddd eeee ff";

        let digest = engine.digest(&text_message(vec![plain(below)]));
        assert_eq!(digest.bodytext_size, 26);
        assert_eq!(digest.fingerprint, None);

        let digest = engine.digest(&text_message(vec![plain(at)]));
        assert_eq!(digest.bodytext_size, 27);
        assert!(digest.fingerprint.is_some());
    }

    #[test]
    fn test_all_placeholder_message_rejected() {
        let engine = engine();
        let body = "http://a.example/1 x@y.example http://b.example/2 q@r.example \
            http://c.example/3 s@t.example http://d.example/4";
        let digest = engine.digest(&text_message(vec![plain(body)]));

        assert!(digest.bodytext_size >= 27);
        assert!(digest.predigest.len() >= 27);
        assert_eq!(digest.fingerprint, None);
    }

    #[test]
    fn test_attachments_counted() {
        let engine = engine();
        let body = "Please find the signed contract for the new office attached.";
        let with = engine.digest(&text_message(vec![
            plain(body),
            MessagePart::binary("application/pdf", Some("contract.pdf"), b"%PDF-1.4".to_vec()),
            MessagePart::binary("image/png", Some("logo.png"), vec![0x89, 0x50, 0x4e, 0x47]),
        ]));
        let without = engine.digest(&text_message(vec![plain(body)]));

        assert_eq!(with.attachment_count, 2);
        assert!(with.predigest.ends_with("[ATTC:2]"));
        assert_ne!(with.fingerprint, without.fingerprint);
    }

    #[test]
    fn test_attachment_content_hash() {
        let config = DigestConfig {
            include_attachment_content: true,
            include_attachment_count: false,
            ..DigestConfig::default()
        };
        let engine = DigestEngine::new(config).unwrap();
        let digest = engine.digest(&text_message(vec![
            plain("text"),
            MessagePart::binary("application/octet-stream", None, Vec::new()),
        ]));
        assert_eq!(
            digest.predigest,
            "text[ATTH:da39a3ee5e6b4b0d3255bfef95601890afd80709]"
        );
    }

    #[test]
    fn test_html_markup_stripped() {
        let engine = engine();
        let html = MessagePart::text(
            "text/html",
            Some("utf-8"),
            "<html><style>body{}</style><p>Your parcel is waiting at the depot</p></html>",
        );
        let digest = engine.digest(&text_message(vec![html]));
        assert_eq!(digest.predigest, "Yourparceliswaitingatthedepot");
        assert_eq!(digest.bodytext_size, "\nYour parcel is waiting at the depot\n".len());
    }

    #[test]
    fn test_markup_in_plain_text_part_stripped() {
        let engine = engine();
        let part = plain("<p>Hello friend</p><script>var x = 1;</script> this is our weekly letter");
        let digest = engine.digest(&text_message(vec![part]));
        assert_eq!(digest.predigest, "Hellofriendthisisourweeklyletter");
        assert_eq!(
            digest.bodytext_size,
            "\nHello friend\n this is our weekly letter".chars().count()
        );

        let raw = DigestEngine::new(DigestConfig {
            strip_html_markup: false,
            ..DigestConfig::default()
        })
        .unwrap();
        let part = plain("<b>Hi</b> friend");
        assert_eq!(raw.digest(&text_message(vec![part])).predigest, "<b>Hi</b>friend");
    }

    #[test]
    fn test_undecodable_part_is_skipped() {
        let engine = engine();
        let mut broken = plain("this text never makes it into the digest");
        broken.decode_error = Some("bad base64".to_string());
        let good = "The meeting moves to room four on the second floor.";

        let digest = engine.digest(&text_message(vec![broken, plain(good)]));
        let only_good = engine.digest(&text_message(vec![plain(good)]));
        assert_eq!(digest, only_good);
    }

    #[test]
    fn test_parsed_mime_message() {
        let raw = b"From: a@example.com\r\n\
Subject: Newsletter\r\n\
Content-Type: text/plain; charset=iso-8859-1\r\n\
Content-Transfer-Encoding: quoted-printable\r\n\
\r\n\
Gr=FC=DFe aus dem Newsletter, diese Woche mit neuen Angeboten.\r\n";
        let message = ParsedMessage::parse(raw).unwrap();
        let digest = engine().digest(&message);
        assert!(digest.predigest.starts_with("Gr\u{fc}\u{df}eausdem"));
        assert!(digest.fingerprint.is_some());
    }

    #[test]
    fn test_zero_threshold_rejected() {
        let config = DigestConfig {
            long_word_threshold: 0,
            ..DigestConfig::default()
        };
        assert!(DigestEngine::new(config).is_err());
    }
}
