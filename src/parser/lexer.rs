//! Tokenizer for the policy language.
//!
//! Produces a flat token vector with byte spans. `#` starts a comment that
//! runs to the end of the line.

/// Byte-level source span for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Integer(i64),
    Float(f64),
    Str(String),
    Ident(String),
    True,
    False,
    If,
    And,
    Or,
    Not,
    In,
    Matches,
    Mod,
    Rem,
    Type,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semicolon,
    Dot,
    Star,
    Plus,
    Minus,
    Slash,
    /// `=`
    Unify,
    /// `==`
    EqEq,
    Neq,
    Lt,
    Leq,
    Gt,
    Geq,
    /// `:=`
    Assign,
    /// `?=`
    QueryMark,
    Eof,
}

impl TokenKind {
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Integer(i) => format!("integer {i}"),
            TokenKind::Float(f) => format!("float {f}"),
            TokenKind::Str(s) => format!("string {s:?}"),
            TokenKind::Ident(s) => format!("`{s}`"),
            TokenKind::Eof => "end of input".to_string(),
            other => format!("`{}`", other.punctuation()),
        }
    }

    fn punctuation(&self) -> &'static str {
        match self {
            TokenKind::True => "true",
            TokenKind::False => "false",
            TokenKind::If => "if",
            TokenKind::And => "and",
            TokenKind::Or => "or",
            TokenKind::Not => "not",
            TokenKind::In => "in",
            TokenKind::Matches => "matches",
            TokenKind::Mod => "mod",
            TokenKind::Rem => "rem",
            TokenKind::Type => "type",
            TokenKind::LParen => "(",
            TokenKind::RParen => ")",
            TokenKind::LBracket => "[",
            TokenKind::RBracket => "]",
            TokenKind::LBrace => "{",
            TokenKind::RBrace => "}",
            TokenKind::Comma => ",",
            TokenKind::Colon => ":",
            TokenKind::Semicolon => ";",
            TokenKind::Dot => ".",
            TokenKind::Star => "*",
            TokenKind::Plus => "+",
            TokenKind::Minus => "-",
            TokenKind::Slash => "/",
            TokenKind::Unify => "=",
            TokenKind::EqEq => "==",
            TokenKind::Neq => "!=",
            TokenKind::Lt => "<",
            TokenKind::Leq => "<=",
            TokenKind::Gt => ">",
            TokenKind::Geq => ">=",
            TokenKind::Assign => ":=",
            TokenKind::QueryMark => "?=",
            _ => "",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

/// A lexing failure, positioned but not yet attached to its source.
#[derive(Debug, Clone, PartialEq)]
pub struct LexError {
    pub message: String,
    pub span: Span,
}

fn keyword(word: &str) -> Option<TokenKind> {
    Some(match word {
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "if" => TokenKind::If,
        "and" => TokenKind::And,
        "or" => TokenKind::Or,
        "not" => TokenKind::Not,
        "in" => TokenKind::In,
        "matches" => TokenKind::Matches,
        "mod" => TokenKind::Mod,
        "rem" => TokenKind::Rem,
        "type" => TokenKind::Type,
        _ => return None,
    })
}

pub fn tokenize(src: &str) -> Result<Vec<Token>, LexError> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if c == b'#' {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }

        let start = i;
        let two = |b: u8| bytes.get(i + 1) == Some(&b);
        let (kind, len) = match c {
            b'(' => (TokenKind::LParen, 1),
            b')' => (TokenKind::RParen, 1),
            b'[' => (TokenKind::LBracket, 1),
            b']' => (TokenKind::RBracket, 1),
            b'{' => (TokenKind::LBrace, 1),
            b'}' => (TokenKind::RBrace, 1),
            b',' => (TokenKind::Comma, 1),
            b';' => (TokenKind::Semicolon, 1),
            b'.' => (TokenKind::Dot, 1),
            b'*' => (TokenKind::Star, 1),
            b'+' => (TokenKind::Plus, 1),
            b'-' => (TokenKind::Minus, 1),
            b'/' => (TokenKind::Slash, 1),
            b':' if two(b'=') => (TokenKind::Assign, 2),
            b':' => (TokenKind::Colon, 1),
            b'=' if two(b'=') => (TokenKind::EqEq, 2),
            b'=' => (TokenKind::Unify, 1),
            b'!' if two(b'=') => (TokenKind::Neq, 2),
            b'<' if two(b'=') => (TokenKind::Leq, 2),
            b'<' => (TokenKind::Lt, 1),
            b'>' if two(b'=') => (TokenKind::Geq, 2),
            b'>' => (TokenKind::Gt, 1),
            b'?' if two(b'=') => (TokenKind::QueryMark, 2),
            b'"' => {
                let (s, len) = lex_string(src, i)?;
                (TokenKind::Str(s), len)
            }
            b'0'..=b'9' => lex_number(src, i)?,
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let mut j = i;
                while j < bytes.len() {
                    if bytes[j].is_ascii_alphanumeric() || bytes[j] == b'_' {
                        j += 1;
                    } else if bytes[j] == b':'
                        && bytes.get(j + 1) == Some(&b':')
                        && bytes.get(j + 2).is_some_and(|b| b.is_ascii_alphabetic())
                    {
                        j += 2;
                    } else {
                        break;
                    }
                }
                let word = &src[i..j];
                let kind = keyword(word).unwrap_or_else(|| TokenKind::Ident(word.to_string()));
                (kind, j - i)
            }
            _ => {
                let ch = src[i..].chars().next().unwrap_or('?');
                return Err(LexError {
                    message: format!("unexpected character {ch:?}"),
                    span: Span {
                        start,
                        end: start + ch.len_utf8(),
                    },
                });
            }
        };
        i += len;
        tokens.push(Token {
            kind,
            span: Span { start, end: i },
        });
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        span: Span {
            start: src.len(),
            end: src.len(),
        },
    });
    Ok(tokens)
}

fn lex_string(src: &str, start: usize) -> Result<(String, usize), LexError> {
    let mut out = String::new();
    let mut chars = src[start + 1..].char_indices();
    while let Some((off, ch)) = chars.next() {
        match ch {
            '"' => return Ok((out, off + 2)),
            '\\' => {
                let escaped = match chars.next() {
                    Some((_, 'n')) => '\n',
                    Some((_, 't')) => '\t',
                    Some((_, 'r')) => '\r',
                    Some((_, '0')) => '\0',
                    Some((_, '"')) => '"',
                    Some((_, '\\')) => '\\',
                    Some((eoff, other)) => {
                        let at = start + 1 + eoff;
                        return Err(LexError {
                            message: format!("unknown escape sequence \\{other}"),
                            span: Span {
                                start: at - 1,
                                end: at + other.len_utf8(),
                            },
                        });
                    }
                    None => break,
                };
                out.push(escaped);
            }
            other => out.push(other),
        }
    }
    Err(LexError {
        message: "unterminated string".to_string(),
        span: Span {
            start,
            end: src.len(),
        },
    })
}

fn lex_number(src: &str, start: usize) -> Result<(TokenKind, usize), LexError> {
    let bytes = src.as_bytes();
    let digits = |mut j: usize| {
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
        }
        j
    };
    let mut end = digits(start);
    let mut is_float = false;
    if bytes.get(end) == Some(&b'.') && bytes.get(end + 1).is_some_and(|b| b.is_ascii_digit()) {
        end = digits(end + 1);
        is_float = true;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut j = end + 1;
        if matches!(bytes.get(j), Some(b'+' | b'-')) {
            j += 1;
        }
        if bytes.get(j).is_some_and(|b| b.is_ascii_digit()) {
            end = digits(j);
            is_float = true;
        }
    }
    let text = &src[start..end];
    let span = Span { start, end };
    let kind = if is_float {
        text.parse::<f64>().map(TokenKind::Float).map_err(|e| LexError {
            message: format!("invalid float {text}: {e}"),
            span,
        })?
    } else {
        text.parse::<i64>().map(TokenKind::Integer).map_err(|_| LexError {
            message: format!("integer {text} is out of range"),
            span,
        })?
    };
    Ok((kind, end - start))
}
