//! HTML to text reduction used before normalisation

const BLOCK_TAGS: &[&str] = &[
    "br", "p", "div", "tr", "td", "th", "li", "ul", "ol", "table", "h1", "h2", "h3", "h4", "h5",
    "h6", "hr", "blockquote", "title",
];

/// Remove markup from `input`, keeping text content.
///
/// Comments are dropped, tags listed in `remove_tags` are dropped together
/// with everything up to their closing tag, block level tags become a
/// newline and common character references are decoded.
pub fn strip_html(input: &str, remove_tags: &[String]) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find(&['<', '&'][..]) {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];

        if rest.starts_with('&') {
            match decode_entity(rest) {
                Some((ch, len)) => {
                    out.push(ch);
                    rest = &rest[len..];
                }
                None => {
                    out.push('&');
                    rest = &rest[1..];
                }
            }
            continue;
        }

        if let Some(comment) = rest.strip_prefix("<!--") {
            rest = comment.find("-->").map(|end| &comment[end + 3..]).unwrap_or("");
            continue;
        }

        let starts_tag = rest[1..]
            .chars()
            .next()
            .map_or(false, |c| c.is_ascii_alphabetic() || matches!(c, '/' | '!' | '?'));
        let tag_len = if starts_tag { tag_end(rest) } else { None };
        let Some(tag_len) = tag_len else {
            // a lone '<' is text
            out.push('<');
            rest = &rest[1..];
            continue;
        };
        let tag = &rest[1..tag_len - 1];
        rest = &rest[tag_len..];

        let (closing, name) = tag_name(tag);
        if name.is_empty() {
            continue;
        }

        if !closing && !tag.ends_with('/') && remove_tags.iter().any(|t| t.eq_ignore_ascii_case(&name)) {
            rest = skip_element(rest, &name);
            continue;
        }

        if BLOCK_TAGS.contains(&name.as_str()) && !out.ends_with('\n') {
            out.push('\n');
        }
    }
    out.push_str(rest);
    out
}

/// Length of the tag starting at `input[0] == '<'` including the closing `>`.
/// Quoted attribute values may contain `>`. A tag never spans another `<`.
fn tag_end(input: &str) -> Option<usize> {
    let mut quote = None;
    for (i, ch) in input.char_indices().skip(1) {
        match (quote, ch) {
            (_, '<') => return None,
            (None, '>') => return Some(i + 1),
            (None, '"') | (None, '\'') => quote = Some(ch),
            (Some(q), c) if q == c => quote = None,
            _ => {}
        }
    }
    None
}

fn tag_name(tag: &str) -> (bool, String) {
    let tag = tag.trim_start();
    let (closing, tag) = match tag.strip_prefix('/') {
        Some(rest) => (true, rest.trim_start()),
        None => (false, tag),
    };
    let name = tag
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == ':')
        .collect::<String>()
        .to_ascii_lowercase();
    (closing, name)
}

/// Skip up to and including `</name>`; an unclosed element swallows the rest.
fn skip_element<'a>(input: &'a str, name: &str) -> &'a str {
    let bytes = input.as_bytes();
    let mut from = 0;
    while let Some(pos) = input[from..].find("</") {
        let start = from + pos + 2;
        let after = start + name.len();
        let matches_name = bytes
            .get(start..after)
            .map_or(false, |candidate| candidate.eq_ignore_ascii_case(name.as_bytes()));
        if !matches_name {
            from = start;
            continue;
        }
        let boundary = bytes
            .get(after)
            .map_or(true, |b| *b == b'>' || b.is_ascii_whitespace());
        if boundary {
            return match input[after..].find('>') {
                Some(end) => &input[after + end + 1..],
                None => "",
            };
        }
        from = after;
    }
    ""
}

/// Decode a character reference at the start of `input`, returning the
/// character and the number of bytes consumed
fn decode_entity(input: &str) -> Option<(char, usize)> {
    let end = input[1..]
        .char_indices()
        .take(10)
        .find(|(_, c)| *c == ';')
        .map(|(p, _)| p + 1)?;
    let name = &input[1..end];
    let ch = match name {
        "amp" => '&',
        "lt" => '<',
        "gt" => '>',
        "quot" => '"',
        "apos" => '\'',
        "nbsp" => ' ',
        _ => {
            let code = name.strip_prefix('#')?;
            let value = match code.strip_prefix(&['x', 'X'][..]) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => code.parse::<u32>().ok()?,
            };
            char::from_u32(value)?
        }
    };
    Some((ch, end + 1))
}
