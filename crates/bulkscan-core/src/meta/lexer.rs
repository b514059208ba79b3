//! Tokenizer for meta expressions

use super::MetaError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Ident(String),
    Number(u64),
    Not,
    And,
    Or,
    Plus,
    Greater,
    GreaterEqual,
    LParen,
    RParen,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenKind::Ident(name) => f.write_str(name),
            TokenKind::Number(n) => write!(f, "{}", n),
            TokenKind::Not => f.write_str("!"),
            TokenKind::And => f.write_str("&&"),
            TokenKind::Or => f.write_str("||"),
            TokenKind::Plus => f.write_str("+"),
            TokenKind::Greater => f.write_str(">"),
            TokenKind::GreaterEqual => f.write_str(">="),
            TokenKind::LParen => f.write_str("("),
            TokenKind::RParen => f.write_str(")"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset in the expression
    pub offset: usize,
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_uppercase() || b == b'_'
}

fn is_ident_continue(b: u8) -> bool {
    is_ident_start(b) || b.is_ascii_digit()
}

/// Split an expression into tokens. `#` starts a comment running to the end of the line.
pub fn tokenize(input: &str) -> Result<Vec<Token>, MetaError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let b = bytes[pos];
        let start = pos;

        let kind = match b {
            b if b.is_ascii_whitespace() => {
                pos += 1;
                continue;
            }
            b'#' => {
                while pos < bytes.len() && bytes[pos] != b'\n' {
                    pos += 1;
                }
                continue;
            }
            b'!' => {
                pos += 1;
                TokenKind::Not
            }
            b'+' => {
                pos += 1;
                TokenKind::Plus
            }
            b'(' => {
                pos += 1;
                TokenKind::LParen
            }
            b')' => {
                pos += 1;
                TokenKind::RParen
            }
            b'&' | b'|' => {
                if bytes.get(pos + 1) != Some(&b) {
                    return Err(MetaError::InvalidCharacter {
                        ch: b as char,
                        offset: pos,
                    });
                }
                pos += 2;
                if b == b'&' {
                    TokenKind::And
                } else {
                    TokenKind::Or
                }
            }
            b'>' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    pos += 2;
                    TokenKind::GreaterEqual
                } else {
                    pos += 1;
                    TokenKind::Greater
                }
            }
            b if b.is_ascii_digit() => {
                while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                    pos += 1;
                }
                let digits = &input[start..pos];
                let value = digits.parse::<u64>().map_err(|_| MetaError::InvalidNumber {
                    value: digits.to_string(),
                    offset: start,
                })?;
                TokenKind::Number(value)
            }
            b if is_ident_start(b) => {
                while pos < bytes.len() && is_ident_continue(bytes[pos]) {
                    pos += 1;
                }
                TokenKind::Ident(input[start..pos].to_string())
            }
            _ => {
                let ch = input[pos..].chars().next().unwrap_or('\u{fffd}');
                return Err(MetaError::InvalidCharacter { ch, offset: pos });
            }
        };

        tokens.push(Token {
            kind,
            offset: start,
        });
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds(input: &str) -> Vec<TokenKind> {
        tokenize(input)
            .unwrap()
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn test_operators_and_names() {
        assert_eq!(
            kinds("!__A&&(B_1||C)"),
            vec![
                TokenKind::Not,
                TokenKind::Ident("__A".into()),
                TokenKind::And,
                TokenKind::LParen,
                TokenKind::Ident("B_1".into()),
                TokenKind::Or,
                TokenKind::Ident("C".into()),
                TokenKind::RParen,
            ]
        );
    }

    #[test]
    fn test_count_tokens() {
        assert_eq!(
            kinds("(A + B >= 12)"),
            vec![
                TokenKind::LParen,
                TokenKind::Ident("A".into()),
                TokenKind::Plus,
                TokenKind::Ident("B".into()),
                TokenKind::GreaterEqual,
                TokenKind::Number(12),
                TokenKind::RParen,
            ]
        );
    }

    #[test]
    fn test_comments_ignored() {
        assert_eq!(
            kinds("A # trailing && garbage\n|| B"),
            vec![
                TokenKind::Ident("A".into()),
                TokenKind::Or,
                TokenKind::Ident("B".into()),
            ]
        );
    }

    #[test]
    fn test_offsets() {
        let tokens = tokenize("  A  && B").unwrap();
        let offsets: Vec<usize> = tokens.iter().map(|t| t.offset).collect();
        assert_eq!(offsets, vec![2, 5, 8]);
    }

    #[test]
    fn test_invalid_characters() {
        assert_eq!(
            tokenize("A & B"),
            Err(MetaError::InvalidCharacter { ch: '&', offset: 2 })
        );
        assert_eq!(
            tokenize("A || lower"),
            Err(MetaError::InvalidCharacter { ch: 'l', offset: 5 })
        );
        assert!(matches!(
            tokenize("(A+B > 99999999999999999999999)"),
            Err(MetaError::InvalidNumber { .. })
        ));
    }
}
