//! Tokenizer for the concise DSL surface syntax.
//!
//! A single left-to-right scan is enough: every identifier this grammar
//! can produce is either `base`, a helper name, or a property name, and
//! the parser resolves which directly, with no multi-character builtin
//! disambiguation needed at the lexer stage.

use crate::core::{BigRational, CoreError, Span};

/// A DSL token, carrying its source span.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// The token's kind.
    pub kind: TokenKind,
    /// Its location in the source.
    pub span: Span,
}

/// The kind of a DSL token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// `+`
    Plus,
    /// `-`
    Minus,
    /// `*`
    Star,
    /// `/`
    Slash,
    /// `^`
    Caret,
    /// `(`
    LParen,
    /// `)`
    RParen,
    /// `[`
    LBracket,
    /// `]`
    RBracket,
    /// `.`
    Dot,
    /// An unsigned numeric literal (integer or decimal).
    Number {
        /// Its parsed value.
        value: BigRational,
        /// Whether the source used a decimal point.
        is_decimal: bool,
    },
    /// An identifier: `base`, a helper name, or a property name.
    Ident(String),
    /// End of input.
    Eof,
}

/// Byte-indexed cursor over the source, used only during lexing.
struct Scanner<'a> {
    source: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            bytes: source.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.source[self.pos..].chars().next()
    }

    fn peek_at(&self, byte_offset: usize) -> Option<char> {
        self.source.get(self.pos + byte_offset..)?.chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }
}

/// Tokenize a DSL source string.
///
/// # Errors
/// Returns [`CoreError::LexError`] for an unknown character, a malformed
/// number, or an unterminated construct.
pub fn tokenize(source: &str) -> Result<Vec<Token>, CoreError> {
    let mut scanner = Scanner::new(source);
    let mut tokens = Vec::new();

    loop {
        while scanner.peek().is_some_and(char::is_whitespace) {
            scanner.bump();
        }
        if scanner.peek() == Some('#') {
            while scanner.peek().is_some_and(|c| c != '\n') {
                scanner.bump();
            }
            continue;
        }
        let Some(c) = scanner.peek() else { break };

        let start = scanner.pos;
        let kind = match c {
            '+' => simple(&mut scanner, TokenKind::Plus),
            '-' => simple(&mut scanner, TokenKind::Minus),
            '*' => simple(&mut scanner, TokenKind::Star),
            '/' => simple(&mut scanner, TokenKind::Slash),
            '^' => simple(&mut scanner, TokenKind::Caret),
            '(' => simple(&mut scanner, TokenKind::LParen),
            ')' => simple(&mut scanner, TokenKind::RParen),
            '[' => simple(&mut scanner, TokenKind::LBracket),
            ']' => simple(&mut scanner, TokenKind::RBracket),
            '.' if !scanner.peek_at(1).is_some_and(|c| c.is_ascii_digit()) => {
                simple(&mut scanner, TokenKind::Dot)
            }
            c if c.is_ascii_digit() || c == '.' => lex_number(&mut scanner, source, start)?,
            c if c.is_alphabetic() || c == '_' => lex_ident(&mut scanner),
            other => {
                return Err(CoreError::lex(
                    format!("unexpected character '{other}'"),
                    source,
                    start,
                ));
            }
        };
        let span = Span::new(
            Span::at(source, start).line(),
            Span::at(source, start).column(),
            start,
            scanner.pos,
        );
        tokens.push(Token { kind, span });
    }

    let eof_pos = scanner.pos.min(source.len());
    tokens.push(Token {
        kind: TokenKind::Eof,
        span: Span::new(
            Span::at(source, eof_pos).line(),
            Span::at(source, eof_pos).column(),
            eof_pos,
            eof_pos,
        ),
    });
    Ok(tokens)
}

fn simple(scanner: &mut Scanner<'_>, kind: TokenKind) -> TokenKind {
    scanner.bump();
    kind
}

fn lex_ident(scanner: &mut Scanner<'_>) -> TokenKind {
    let mut ident = String::new();
    while let Some(c) = scanner.peek() {
        if c.is_alphanumeric() || c == '_' {
            ident.push(c);
            scanner.bump();
        } else {
            break;
        }
    }
    TokenKind::Ident(ident)
}

fn lex_number(
    scanner: &mut Scanner<'_>,
    source: &str,
    start: usize,
) -> Result<TokenKind, CoreError> {
    let mut text = String::new();
    let mut seen_dot = false;
    while let Some(c) = scanner.peek() {
        if c.is_ascii_digit() {
            text.push(c);
            scanner.bump();
        } else if c == '.' && !seen_dot && scanner.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            seen_dot = true;
            text.push(c);
            scanner.bump();
        } else {
            break;
        }
    }
    if text.is_empty() || text == "." {
        return Err(CoreError::lex("malformed number", source, start));
    }
    let value = if seen_dot {
        BigRational::from_decimal_str(&text)?
    } else {
        text.parse::<i64>().map(BigRational::from_int).map_err(|_| {
            CoreError::lex(
                format!("integer literal '{text}' out of range"),
                source,
                start,
            )
        })?
    };
    Ok(TokenKind::Number {
        value,
        is_decimal: seen_dot,
    })
}
