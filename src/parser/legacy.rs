//! Parser for the legacy method-chain surface syntax.
//!
//! Lowers into the same [`Expr`](crate::ast::Expr) the DSL parser produces:
//! a single-pass tokenizer (extended with string literals and commas for
//! method-call argument lists, since the method-chain grammar needs both),
//! followed by a small recursive descent over `module.x.getVariable(...)`
//! and `.method(...)` chains.

use crate::ast::{Expr, Helper, NoteTarget};
use crate::core::{BigRational, CoreError, Property, Span};

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Number(BigRational),
    Str(String),
    Minus,
    Dot,
    Comma,
    LParen,
    RParen,
    Eof,
}

struct Lexed {
    kind: Tok,
    span: Span,
}

fn lex(source: &str) -> Result<Vec<Lexed>, CoreError> {
    let mut out = Vec::new();
    let bytes = source.as_bytes();
    let mut pos = 0usize;
    while pos < bytes.len() {
        let c = source[pos..].chars().next().expect("pos within bounds");
        if c.is_whitespace() {
            pos += c.len_utf8();
            continue;
        }
        let start = pos;
        let kind = match c {
            '.' => {
                pos += 1;
                Tok::Dot
            }
            ',' => {
                pos += 1;
                Tok::Comma
            }
            '(' => {
                pos += 1;
                Tok::LParen
            }
            ')' => {
                pos += 1;
                Tok::RParen
            }
            '-' => {
                pos += 1;
                Tok::Minus
            }
            '\'' | '"' => {
                let quote = c;
                pos += 1;
                let mut s = String::new();
                loop {
                    let Some(next) = source[pos..].chars().next() else {
                        return Err(CoreError::lex("unterminated string literal", source, start));
                    };
                    if next == quote {
                        pos += 1;
                        break;
                    }
                    s.push(next);
                    pos += next.len_utf8();
                }
                Tok::Str(s)
            }
            c if c.is_ascii_digit() => {
                let mut text = String::new();
                let mut seen_dot = false;
                while let Some(next) = source[pos..].chars().next() {
                    if next.is_ascii_digit() {
                        text.push(next);
                        pos += 1;
                    } else if next == '.' && !seen_dot {
                        seen_dot = true;
                        text.push(next);
                        pos += 1;
                    } else {
                        break;
                    }
                }
                let value = if seen_dot {
                    BigRational::from_decimal_str(&text)?
                } else {
                    text.parse::<i64>().map(BigRational::from_int).map_err(|_| {
                        CoreError::lex(format!("integer literal '{text}' out of range"), source, start)
                    })?
                };
                Tok::Number(value)
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(next) = source[pos..].chars().next() {
                    if next.is_alphanumeric() || next == '_' {
                        ident.push(next);
                        pos += 1;
                    } else {
                        break;
                    }
                }
                Tok::Ident(ident)
            }
            other => {
                return Err(CoreError::lex(
                    format!("unexpected character '{other}'"),
                    source,
                    start,
                ));
            }
        };
        out.push(Lexed {
            kind,
            span: Span::at(source, start),
        });
    }
    out.push(Lexed {
        kind: Tok::Eof,
        span: Span::at(source, source.len().saturating_sub(1).max(0)),
    });
    Ok(out)
}

/// Parse a legacy method-chain source string into an [`Expr`].
///
/// # Errors
/// Returns [`CoreError::LexError`] / [`CoreError::ParseError`] /
/// [`CoreError::UnknownPropertyError`] for a lex, parse, or unresolved
/// property-name failure respectively.
pub fn parse(source: &str) -> Result<Expr, CoreError> {
    let tokens = lex(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.chain()?;
    parser.expect_eof()?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Lexed>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        &self.tokens[self.pos].kind
    }

    fn span(&self) -> Span {
        self.tokens[self.pos].span
    }

    fn bump(&mut self) -> Tok {
        let t = self.tokens[self.pos].kind.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn expect_ident(&mut self, expected: &str) -> Result<(), CoreError> {
        match self.bump() {
            Tok::Ident(s) if s == expected => Ok(()),
            _ => Err(CoreError::parse_at(
                format!("expected '{expected}'"),
                self.span(),
            )),
        }
    }

    fn expect(&mut self, kind: &Tok, what: &str) -> Result<(), CoreError> {
        if std::mem::discriminant(self.peek()) == std::mem::discriminant(kind) {
            self.bump();
            Ok(())
        } else {
            Err(CoreError::parse_at(format!("expected {what}"), self.span()))
        }
    }

    fn expect_eof(&mut self) -> Result<(), CoreError> {
        if matches!(self.peek(), Tok::Eof) {
            Ok(())
        } else {
            Err(CoreError::parse_at(
                "trailing input after expression".to_owned(),
                self.span(),
            ))
        }
    }

    fn chain(&mut self) -> Result<Expr, CoreError> {
        let mut expr = self.primary()?;
        loop {
            if !matches!(self.peek(), Tok::Dot) {
                break;
            }
            let checkpoint = self.pos;
            self.bump(); // '.'
            let Tok::Ident(method) = self.bump() else {
                self.pos = checkpoint;
                break;
            };
            match method.as_str() {
                "add" | "sub" | "mul" | "div" | "pow" => {
                    self.expect(&Tok::LParen, "'('")?;
                    let arg = self.chain()?;
                    self.expect(&Tok::RParen, "closing ')'")?;
                    expr = match method.as_str() {
                        "add" => Expr::Add(Box::new(expr), Box::new(arg)),
                        "sub" => Expr::Sub(Box::new(expr), Box::new(arg)),
                        "mul" => Expr::Mul(Box::new(expr), Box::new(arg)),
                        "div" => Expr::Div(Box::new(expr), Box::new(arg)),
                        _ => Expr::Pow(Box::new(expr), Box::new(arg)),
                    };
                }
                "neg" => {
                    self.expect(&Tok::LParen, "'('")?;
                    self.expect(&Tok::RParen, "closing ')'")?;
                    expr = Expr::Neg(Box::new(expr));
                }
                _ => {
                    self.pos = checkpoint;
                    break;
                }
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, CoreError> {
        match self.peek().clone() {
            Tok::Minus => {
                self.bump();
                let inner = self.primary()?;
                Ok(Expr::Neg(Box::new(inner)))
            }
            Tok::Number(value) => {
                self.bump();
                Ok(Expr::Number {
                    value,
                    is_fraction_literal: false,
                })
            }
            Tok::Ident(name) if name == "new" => {
                self.bump();
                self.expect_ident("Fraction")?;
                self.expect(&Tok::LParen, "'('")?;
                let num = self.signed_number()?;
                let den = if matches!(self.peek(), Tok::Comma) {
                    self.bump();
                    self.signed_number()?
                } else {
                    1
                };
                self.expect(&Tok::RParen, "closing ')'")?;
                if den == 0 {
                    return Err(CoreError::parse_at(
                        "division by zero in fraction literal".to_owned(),
                        self.span(),
                    ));
                }
                Ok(Expr::fraction(BigRational::new(num, den)?))
            }
            Tok::Ident(name) if name == "module" => {
                self.bump();
                self.expect(&Tok::Dot, "'.'")?;
                let member_span = self.span();
                let Tok::Ident(member) = self.bump() else {
                    return Err(CoreError::parse_at("expected a member name", member_span));
                };
                match member.as_str() {
                    "baseNote" => self.get_variable(NoteTarget::Base),
                    "getNoteById" => {
                        let id = self.note_id_call()?;
                        self.expect(&Tok::Dot, "'.'")?;
                        self.expect_ident("getVariable")?;
                        self.get_variable_args(NoteTarget::Note(id))
                    }
                    "findTempo" => {
                        self.expect(&Tok::LParen, "'('")?;
                        let target = self.note_arg()?;
                        self.expect(&Tok::RParen, "closing ')'")?;
                        Ok(Expr::HelperCall {
                            helper: Helper::Tempo,
                            target,
                        })
                    }
                    "findMeasureLength" => {
                        self.expect(&Tok::LParen, "'('")?;
                        let target = self.note_arg()?;
                        self.expect(&Tok::RParen, "closing ')'")?;
                        Ok(Expr::HelperCall {
                            helper: Helper::Measure,
                            target,
                        })
                    }
                    other => Err(CoreError::parse_at(
                        format!("unknown module member '{other}'"),
                        member_span,
                    )),
                }
            }
            _ => Err(CoreError::parse_at(
                "expected a legacy expression".to_owned(),
                self.span(),
            )),
        }
    }

    fn signed_number(&mut self) -> Result<i64, CoreError> {
        let negative = matches!(self.peek(), Tok::Minus);
        if negative {
            self.bump();
        }
        let span = self.span();
        let Tok::Number(value) = self.bump() else {
            return Err(CoreError::parse_at("expected an integer".to_owned(), span));
        };
        let n = value
            .to_integer()
            .and_then(|n| {
                use num_traits::cast::ToPrimitive;
                n.to_i64()
            })
            .ok_or_else(|| CoreError::parse_at("expected an integer".to_owned(), span))?;
        Ok(if negative { -n } else { n })
    }

    fn note_id_call(&mut self) -> Result<u32, CoreError> {
        self.expect(&Tok::LParen, "'('")?;
        let span = self.span();
        let Tok::Number(value) = self.bump() else {
            return Err(CoreError::parse_at("expected a note id".to_owned(), span));
        };
        let id = value.to_integer().and_then(|n| {
            use num_traits::cast::ToPrimitive;
            n.to_u32()
        });
        let Some(id) = id else {
            return Err(CoreError::parse_at(
                "note id must be a non-negative integer".to_owned(),
                span,
            ));
        };
        self.expect(&Tok::RParen, "closing ')'")?;
        Ok(id)
    }

    fn get_variable(&mut self, target: NoteTarget) -> Result<Expr, CoreError> {
        self.expect(&Tok::Dot, "'.'")?;
        self.expect_ident("getVariable")?;
        self.get_variable_args(target)
    }

    fn get_variable_args(&mut self, target: NoteTarget) -> Result<Expr, CoreError> {
        self.expect(&Tok::LParen, "'('")?;
        let span = self.span();
        let Tok::Str(name) = self.bump() else {
            return Err(CoreError::parse_at(
                "expected a quoted property name".to_owned(),
                span,
            ));
        };
        self.expect(&Tok::RParen, "closing ')'")?;
        let property = Property::from_name(&name).ok_or(CoreError::UnknownPropertyError {
            name,
            span: Some(span),
        })?;
        Ok(Expr::Ref { target, property })
    }

    /// `module.baseNote` or `module.getNoteById(id)`, used as a
    /// `findTempo`/`findMeasureLength` argument.
    fn note_arg(&mut self) -> Result<NoteTarget, CoreError> {
        self.expect_ident("module")?;
        self.expect(&Tok::Dot, "'.'")?;
        let span = self.span();
        let Tok::Ident(member) = self.bump() else {
            return Err(CoreError::parse_at("expected a member name", span));
        };
        match member.as_str() {
            "baseNote" => Ok(NoteTarget::Base),
            "getNoteById" => {
                let id = self.note_id_call()?;
                Ok(NoteTarget::Note(id))
            }
            other => Err(CoreError::parse_at(
                format!("unknown module member '{other}'"),
                span,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_base_get_variable() {
        let expr = parse("module.baseNote.getVariable('f')").expect("parses");
        assert_eq!(
            expr,
            Expr::Ref {
                target: NoteTarget::Base,
                property: Property::Frequency,
            }
        );
    }

    #[test]
    fn parses_note_by_id_with_mul_chain() {
        let expr =
            parse("module.getNoteById(1).getVariable('f').mul(new Fraction(5,4))").expect("parses");
        assert!(matches!(expr, Expr::Mul(..)));
    }

    #[test]
    fn fraction_with_default_denominator_is_integer() {
        let expr = parse("new Fraction(5)").expect("parses");
        assert_eq!(
            expr,
            Expr::fraction(BigRational::from_int(5))
        );
    }

    #[test]
    fn find_tempo_wraps_helper() {
        let expr = parse("module.findTempo(module.baseNote)").expect("parses");
        assert_eq!(
            expr,
            Expr::HelperCall {
                helper: Helper::Tempo,
                target: NoteTarget::Base,
            }
        );
    }

    #[test]
    fn neg_chain_applies() {
        let expr = parse("module.baseNote.getVariable('f').neg()").expect("parses");
        assert!(matches!(expr, Expr::Neg(..)));
    }

    #[test]
    fn unknown_property_errors() {
        let err = parse("module.baseNote.getVariable('nope')").unwrap_err();
        assert!(matches!(err, CoreError::UnknownPropertyError { .. }));
    }
}
