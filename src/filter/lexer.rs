//! Tokeniser for the filter expression language.
//!
//! Whitespace is insignificant outside string literals. String literals take
//! either quote style and support `\"`, `\'` and `\\` escapes. Bare words
//! double as field names and unquoted string values; the parser decides from
//! position.

use super::ast::Op;
use super::FilterError;

/// Hard cap on raw expression length. Longer inputs fail before scanning.
pub const MAX_EXPRESSION_LEN: usize = 4096;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Word(String),
    Str(String),
    Num(f64),
    Op(Op),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
    AndAnd,
    OrOr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub tok: Tok,
    /// Byte offset into the raw expression, for error snippets.
    pub pos: usize,
}

pub fn snippet(raw: &str, pos: usize) -> String {
    let end = raw.len().min(pos + 24);
    let start = pos.min(raw.len());
    raw[start..end].to_string()
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '.' | '-' | ':' | '+')
}

pub fn tokenize(raw: &str) -> Result<Vec<Spanned>, FilterError> {
    if raw.len() > MAX_EXPRESSION_LEN {
        return Err(FilterError::TooLong(raw.len()));
    }

    let bytes = raw.as_bytes();
    let mut out = Vec::new();
    let mut i = 0usize;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\r' | '\n' => {
                i += 1;
            }
            '(' => {
                out.push(Spanned { tok: Tok::LParen, pos: i });
                i += 1;
            }
            ')' => {
                out.push(Spanned { tok: Tok::RParen, pos: i });
                i += 1;
            }
            '[' => {
                out.push(Spanned { tok: Tok::LBracket, pos: i });
                i += 1;
            }
            ']' => {
                out.push(Spanned { tok: Tok::RBracket, pos: i });
                i += 1;
            }
            ',' => {
                out.push(Spanned { tok: Tok::Comma, pos: i });
                i += 1;
            }
            ';' => {
                out.push(Spanned { tok: Tok::Semicolon, pos: i });
                i += 1;
            }
            '&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    out.push(Spanned { tok: Tok::AndAnd, pos: i });
                    i += 2;
                } else {
                    return Err(FilterError::Parse(snippet(raw, i)));
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    out.push(Spanned { tok: Tok::OrOr, pos: i });
                    i += 2;
                } else {
                    return Err(FilterError::Parse(snippet(raw, i)));
                }
            }
            '"' | '\'' => {
                let (s, next) = scan_string(raw, i)?;
                out.push(Spanned { tok: Tok::Str(s), pos: i });
                i = next;
            }
            '=' => {
                let (op, next) = scan_eq_operator(raw, i)?;
                out.push(Spanned { tok: Tok::Op(op), pos: i });
                i = next;
            }
            '!' => {
                // `!%=` before `!=`.
                if raw[i..].starts_with("!%=") {
                    out.push(Spanned { tok: Tok::Op(Op::NotLike), pos: i });
                    i += 3;
                } else if raw[i..].starts_with("!=") {
                    out.push(Spanned { tok: Tok::Op(Op::Ne), pos: i });
                    i += 2;
                } else {
                    return Err(FilterError::Parse(snippet(raw, i)));
                }
            }
            '%' => {
                if raw[i..].starts_with("%=") {
                    out.push(Spanned { tok: Tok::Op(Op::Like), pos: i });
                    i += 2;
                } else {
                    return Err(FilterError::Parse(snippet(raw, i)));
                }
            }
            '>' => {
                if raw[i..].starts_with(">=") {
                    out.push(Spanned { tok: Tok::Op(Op::Ge), pos: i });
                    i += 2;
                } else {
                    out.push(Spanned { tok: Tok::Op(Op::Gt), pos: i });
                    i += 1;
                }
            }
            '<' => {
                if raw[i..].starts_with("<=") {
                    out.push(Spanned { tok: Tok::Op(Op::Le), pos: i });
                    i += 2;
                } else {
                    out.push(Spanned { tok: Tok::Op(Op::Lt), pos: i });
                    i += 1;
                }
            }
            _ if c.is_alphanumeric() || c == '_' || (c == '-' && next_is_digit(bytes, i)) => {
                let (word, next) = scan_word(raw, i);
                let tok = match word.parse::<f64>() {
                    Ok(n) if n.is_finite() => Tok::Num(n),
                    _ => Tok::Word(word),
                };
                out.push(Spanned { tok, pos: i });
                i = next;
            }
            _ => return Err(FilterError::Parse(snippet(raw, i))),
        }
    }

    Ok(out)
}

fn next_is_digit(bytes: &[u8], i: usize) -> bool {
    bytes.get(i + 1).map(|b| b.is_ascii_digit()).unwrap_or(false)
}

/// Scans `=name=` extension tokens and the single `==` shorthand.
fn scan_eq_operator(raw: &str, start: usize) -> Result<(Op, usize), FilterError> {
    let rest = &raw[start..];
    if rest.starts_with("==") {
        return Ok((Op::Eq, start + 2));
    }
    let inner = &rest[1..];
    let end = inner.find('=').ok_or_else(|| FilterError::Parse(snippet(raw, start)))?;
    let name = &inner[..end];
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(FilterError::Parse(snippet(raw, start)));
    }
    Ok((Op::from_extension(name), start + 1 + end + 1))
}

fn scan_word(raw: &str, start: usize) -> (String, usize) {
    let mut end = start;
    for (off, c) in raw[start..].char_indices() {
        if off == 0 || is_word_char(c) {
            end = start + off + c.len_utf8();
        } else {
            break;
        }
    }
    (raw[start..end].to_string(), end)
}

fn scan_string(raw: &str, start: usize) -> Result<(String, usize), FilterError> {
    let quote = raw[start..].chars().next().unwrap();
    let mut value = String::new();
    let mut chars = raw[start + 1..].char_indices();
    while let Some((off, c)) = chars.next() {
        match c {
            '\\' => match chars.next() {
                Some((_, escaped @ ('"' | '\'' | '\\'))) => value.push(escaped),
                // Unknown escapes pass through untouched so regex operands
                // keep their backslashes.
                Some((_, other)) => {
                    value.push('\\');
                    value.push(other);
                }
                None => return Err(FilterError::Parse(snippet(raw, start))),
            },
            c if c == quote => return Ok((value, start + 1 + off + 1)),
            c => value.push(c),
        }
    }
    Err(FilterError::Parse(snippet(raw, start)))
}
