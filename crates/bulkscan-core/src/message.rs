//! Parsed message abstraction
//!
//! The digest engine and the rule evaluator work on this tree instead of on
//! mail-parser types directly, so that callers with their own MIME parser
//! can build it by hand.

use bulkscan_common::{Error, Result};
use mail_parser::{MessageParser, MimeHeaders, PartType};
use tracing::debug;

/// A single header field, value unfolded and trimmed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// One node of the MIME tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessagePart {
    /// Lowercase `type/subtype`
    pub content_type: String,
    pub filename: Option<String>,
    pub charset: Option<String>,
    pub headers: Vec<Header>,
    /// Payload after content-transfer-decoding
    pub body: Vec<u8>,
    pub children: Vec<MessagePart>,
    /// Set when the payload could not be decoded
    pub decode_error: Option<String>,
}

impl MessagePart {
    /// A text leaf
    pub fn text(content_type: impl Into<String>, charset: Option<&str>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.into().to_ascii_lowercase(),
            filename: None,
            charset: charset.map(str::to_string),
            headers: Vec::new(),
            body: body.into(),
            children: Vec::new(),
            decode_error: None,
        }
    }

    /// A non-text leaf
    pub fn binary(content_type: impl Into<String>, filename: Option<&str>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.into().to_ascii_lowercase(),
            filename: filename.map(str::to_string),
            charset: None,
            headers: Vec::new(),
            body: body.into(),
            children: Vec::new(),
            decode_error: None,
        }
    }

    /// A container part
    pub fn multipart(subtype: &str, children: Vec<MessagePart>) -> Self {
        Self {
            content_type: format!("multipart/{}", subtype.to_ascii_lowercase()),
            filename: None,
            charset: None,
            headers: Vec::new(),
            body: Vec::new(),
            children,
            decode_error: None,
        }
    }

    pub fn with_headers(mut self, headers: Vec<Header>) -> Self {
        self.headers = headers;
        self
    }

    /// Top level media type, e.g. `text` for `text/html`
    pub fn main_type(&self) -> &str {
        self.content_type
            .split_once('/')
            .map(|(main, _)| main)
            .unwrap_or(&self.content_type)
    }

    pub fn is_multipart(&self) -> bool {
        !self.children.is_empty() || self.main_type() == "multipart"
    }

    pub fn is_text(&self) -> bool {
        !self.is_multipart() && self.main_type() == "text"
    }

    pub fn is_html(&self) -> bool {
        self.content_type == "text/html"
    }

    /// Payload decoded to text using the declared charset
    pub fn decoded_text(&self) -> Result<String> {
        if let Some(reason) = &self.decode_error {
            return Err(Error::Digest(format!(
                "cannot decode {} part: {}",
                self.content_type, reason
            )));
        }
        Ok(decode_text(&self.body, self.charset.as_deref()))
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a MessagePart>) {
        if self.is_multipart() {
            for child in &self.children {
                child.collect_leaves(out);
            }
        } else {
            out.push(self);
        }
    }

    fn collect_all<'a>(&'a self, out: &mut Vec<&'a MessagePart>) {
        out.push(self);
        for child in &self.children {
            child.collect_all(out);
        }
    }
}

/// A parsed message: top level headers, the MIME tree and the raw bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    pub raw: Vec<u8>,
    pub root: MessagePart,
}

impl ParsedMessage {
    /// Build a message from a hand-made tree. Top level headers are the root part's headers.
    pub fn new(root: MessagePart) -> Self {
        Self {
            raw: Vec::new(),
            root,
        }
    }

    pub fn with_raw(mut self, raw: impl Into<Vec<u8>>) -> Self {
        self.raw = raw.into();
        self
    }

    /// Parse an RFC 5322 message
    pub fn parse(raw: &[u8]) -> Option<Self> {
        let message = MessageParser::default().parse(raw)?;
        let root = convert_part(&message, 0, raw, 0)?;
        debug!("Parsed message with {} parts", message.parts.len());
        Some(Self {
            raw: raw.to_vec(),
            root,
        })
    }

    pub fn headers(&self) -> &[Header] {
        &self.root.headers
    }

    /// All values of a header, case-insensitive on the name
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.root
            .headers
            .iter()
            .filter(move |h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }

    pub fn subject(&self) -> Option<&str> {
        self.header_values("Subject").next()
    }

    /// Leaf parts in document order
    pub fn leaves(&self) -> Vec<&MessagePart> {
        let mut out = Vec::new();
        self.root.collect_leaves(&mut out);
        out
    }

    /// Every part including containers, depth-first
    pub fn parts(&self) -> Vec<&MessagePart> {
        let mut out = Vec::new();
        self.root.collect_all(&mut out);
        out
    }
}

// Nested message/rfc822 parts are limited to this depth.
const MAX_NESTING: usize = 16;

fn convert_part(
    message: &mail_parser::Message<'_>,
    part_id: usize,
    raw: &[u8],
    depth: usize,
) -> Option<MessagePart> {
    let part = message.parts.get(part_id)?;

    let content_type = part
        .content_type()
        .map(|ct| match ct.subtype() {
            Some(sub) => format!("{}/{}", ct.ctype(), sub),
            None => ct.ctype().to_string(),
        })
        .map(|ct| ct.to_ascii_lowercase());
    let charset = part
        .content_type()
        .and_then(|ct| ct.attribute("charset"))
        .map(str::to_string);

    let headers = part
        .headers
        .iter()
        .map(|h| {
            let value = raw
                .get(h.offset_start..h.offset_end)
                .map(|v| unfold(&String::from_utf8_lossy(v)))
                .unwrap_or_default();
            Header::new(h.name.as_str(), value)
        })
        .collect();

    let decode_error = part
        .is_encoding_problem
        .then(|| "content transfer encoding problem".to_string());

    let mut converted = MessagePart {
        content_type: content_type.unwrap_or_else(|| "text/plain".to_string()),
        filename: part.attachment_name().map(str::to_string),
        charset: None,
        headers,
        body: Vec::new(),
        children: Vec::new(),
        decode_error,
    };

    match &part.body {
        // mail-parser hands out text parts already charset-decoded
        PartType::Text(text) | PartType::Html(text) => {
            converted.body = text.as_bytes().to_vec();
            converted.charset = Some("utf-8".to_string());
            if !converted.content_type.starts_with("text/") {
                converted.content_type = if matches!(part.body, PartType::Html(_)) {
                    "text/html".to_string()
                } else {
                    "text/plain".to_string()
                };
            }
        }
        PartType::Binary(bytes) | PartType::InlineBinary(bytes) => {
            converted.body = bytes.to_vec();
            converted.charset = charset;
        }
        PartType::Multipart(ids) => {
            if depth < MAX_NESTING {
                converted.children = ids
                    .iter()
                    .filter_map(|id| convert_part(message, *id, raw, depth + 1))
                    .collect();
            }
            if !converted.content_type.starts_with("multipart/") {
                converted.content_type = "multipart/mixed".to_string();
            }
        }
        PartType::Message(inner) => {
            if depth < MAX_NESTING {
                let inner_raw = inner.raw_message();
                if let Some(child) = convert_part(inner, 0, inner_raw, depth + 1) {
                    converted.children.push(child);
                }
            }
            converted.content_type = "message/rfc822".to_string();
        }
    }

    Some(converted)
}

fn unfold(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Decode `body` using `charset`.
///
/// No charset means ASCII. Unknown charsets fall back to ASCII with every
/// non-ASCII byte replaced by U+FFFD.
pub fn decode_text(body: &[u8], charset: Option<&str>) -> String {
    let charset = charset.map(|c| c.trim().trim_matches('"')).unwrap_or("");

    if charset.is_empty() || charset.eq_ignore_ascii_case("us-ascii") || charset.eq_ignore_ascii_case("ascii") {
        return ascii_lossy(body);
    }
    if charset.eq_ignore_ascii_case("utf-8") || charset.eq_ignore_ascii_case("utf8") {
        return String::from_utf8_lossy(body).into_owned();
    }

    let charset = charset.to_ascii_lowercase();
    match mail_parser::decoders::charsets::map::charset_decoder(charset.as_bytes()) {
        Some(decoder) => decoder(body),
        None => {
            debug!("Unknown charset {:?}, decoding as ASCII", charset);
            ascii_lossy(body)
        }
    }
}

fn ascii_lossy(body: &[u8]) -> String {
    body.iter()
        .map(|&b| if b.is_ascii() { b as char } else { char::REPLACEMENT_CHARACTER })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MULTIPART: &[u8] = b"From: sender@example.com\r\n\
To: rcpt@example.com\r\n\
Subject: Quarterly report\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"outer\"\r\n\
\r\n\
--outer\r\n\
Content-Type: multipart/alternative; boundary=\"inner\"\r\n\
\r\n\
--inner\r\n\
Content-Type: text/plain; charset=us-ascii\r\n\
\r\n\
Plain body\r\n\
--inner\r\n\
Content-Type: text/html; charset=us-ascii\r\n\
\r\n\
<p>Html body</p>\r\n\
--inner--\r\n\
--outer\r\n\
Content-Type: application/pdf; name=\"report.pdf\"\r\n\
Content-Disposition: attachment; filename=\"report.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQK\r\n\
--outer--\r\n";

    #[test]
    fn test_parse_tree() {
        let message = ParsedMessage::parse(MULTIPART).unwrap();
        assert_eq!(message.subject(), Some("Quarterly report"));
        assert!(message.root.is_multipart());

        let leaves = message.leaves();
        assert_eq!(leaves.len(), 3);
        assert_eq!(leaves[0].content_type, "text/plain");
        assert!(leaves[0].decoded_text().unwrap().contains("Plain body"));
        assert!(leaves[1].is_html());
        assert_eq!(leaves[2].content_type, "application/pdf");
        assert_eq!(leaves[2].filename.as_deref(), Some("report.pdf"));
        assert_eq!(leaves[2].body, b"%PDF-1.4\n".to_vec());

        // root, alternative container, three leaves
        assert_eq!(message.parts().len(), 5);
    }

    #[test]
    fn test_header_values_case_insensitive() {
        let message = ParsedMessage::parse(MULTIPART).unwrap();
        let values: Vec<&str> = message.header_values("from").collect();
        assert_eq!(values, vec!["sender@example.com"]);
        assert_eq!(message.header_values("X-Missing").count(), 0);
    }

    #[test]
    fn test_hand_built_tree() {
        let root = MessagePart::multipart(
            "mixed",
            vec![
                MessagePart::text("text/plain", None, "hello"),
                MessagePart::binary("image/png", Some("a.png"), vec![0x89, 0x50]),
            ],
        )
        .with_headers(vec![Header::new("Subject", "hi")]);
        let message = ParsedMessage::new(root);

        assert_eq!(message.subject(), Some("hi"));
        let leaves = message.leaves();
        assert!(leaves[0].is_text());
        assert!(!leaves[1].is_text());
        assert_eq!(leaves[1].main_type(), "image");
    }

    #[test]
    fn test_decode_text_charsets() {
        assert_eq!(decode_text(b"plain", None), "plain");
        assert_eq!(decode_text("caf\u{e9}".as_bytes(), Some("UTF-8")), "caf\u{e9}");
        assert_eq!(decode_text(b"caf\xe9", Some("iso-8859-1")), "caf\u{e9}");
        assert_eq!(decode_text(b"caf\xe9", Some("x-no-such-charset")), "caf\u{fffd}");
        assert_eq!(decode_text(b"caf\xe9", None), "caf\u{fffd}");
    }

    #[test]
    fn test_decode_error_is_reported() {
        let mut part = MessagePart::text("text/plain", None, "x");
        part.decode_error = Some("broken base64".to_string());
        let err = part.decoded_text().unwrap_err();
        assert_eq!(err.code(), "DIGEST_ERROR");
    }
}
