//! Recursive-descent parser for the concise DSL grammar.
//!
//! A precedence-climbing descent over a fixed, small operator set
//! (`+ - * / ^` plus unary minus); the operator set is small enough that
//! no configurable binding-power table is needed, just the five grammar
//! rules spelled out directly.

use crate::ast::{Expr, Helper, NoteTarget};
use crate::core::{CoreError, Property, Span};
use crate::parser::lexer::{self, Token, TokenKind};

/// Parse a DSL source string into an [`Expr`].
///
/// # Errors
/// Returns [`CoreError::LexError`] / [`CoreError::ParseError`] /
/// [`CoreError::UnknownPropertyError`] for a lex, parse, or unresolved
/// property-name failure respectively.
pub fn parse(source: &str) -> Result<Expr, CoreError> {
    let tokens = lexer::tokenize(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        source,
    };
    let expr = parser.expression()?;
    parser.expect_eof()?;
    Ok(expr)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    source: &'a str,
}

impl Parser<'_> {
    fn peek(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn span(&self) -> Span {
        self.tokens[self.pos].span
    }

    fn bump(&mut self) -> TokenKind {
        let tok = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        tok.kind
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<(), CoreError> {
        if std::mem::discriminant(self.peek()) == std::mem::discriminant(kind) {
            self.bump();
            Ok(())
        } else {
            Err(CoreError::parse_at(
                format!("expected {what}"),
                self.span(),
            ))
        }
    }

    fn expect_eof(&mut self) -> Result<(), CoreError> {
        if matches!(self.peek(), TokenKind::Eof) {
            Ok(())
        } else {
            Err(CoreError::parse_at(
                "trailing input after expression".to_owned(),
                self.span(),
            ))
        }
    }

    fn expression(&mut self) -> Result<Expr, CoreError> {
        self.additive()
    }

    fn additive(&mut self) -> Result<Expr, CoreError> {
        let mut lhs = self.multiplicative()?;
        loop {
            match self.peek() {
                TokenKind::Plus => {
                    self.bump();
                    let rhs = self.multiplicative()?;
                    lhs = Expr::Add(Box::new(lhs), Box::new(rhs));
                }
                TokenKind::Minus => {
                    self.bump();
                    let rhs = self.multiplicative()?;
                    lhs = Expr::Sub(Box::new(lhs), Box::new(rhs));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn multiplicative(&mut self) -> Result<Expr, CoreError> {
        let mut lhs = self.unary()?;
        loop {
            match self.peek() {
                TokenKind::Star => {
                    self.bump();
                    let rhs = self.unary()?;
                    lhs = Expr::Mul(Box::new(lhs), Box::new(rhs));
                }
                TokenKind::Slash => {
                    self.bump();
                    let rhs = self.unary()?;
                    lhs = Expr::Div(Box::new(lhs), Box::new(rhs));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, CoreError> {
        if matches!(self.peek(), TokenKind::Minus) {
            self.bump();
            let inner = self.unary()?;
            Ok(Expr::Neg(Box::new(inner)))
        } else {
            self.power()
        }
    }

    fn power(&mut self) -> Result<Expr, CoreError> {
        let base = self.primary()?;
        if matches!(self.peek(), TokenKind::Caret) {
            self.bump();
            let exp = self.unary()?;
            Ok(Expr::Pow(Box::new(base), Box::new(exp)))
        } else {
            Ok(base)
        }
    }

    fn primary(&mut self) -> Result<Expr, CoreError> {
        match self.peek().clone() {
            TokenKind::LParen => self.parenthesized(),
            TokenKind::LBracket => self.note_ref(),
            TokenKind::Number { value, .. } => {
                self.bump();
                Ok(Expr::Number {
                    value,
                    is_fraction_literal: false,
                })
            }
            TokenKind::Ident(name) => {
                self.bump();
                match name.as_str() {
                    "base" => self.property_ref(NoteTarget::Base),
                    "tempo" => self.helper_call(Helper::Tempo),
                    "measure" => self.helper_call(Helper::Measure),
                    "beat" => self.helper_call(Helper::Beat),
                    other => Err(CoreError::parse_at(
                        format!("unexpected identifier '{other}'"),
                        self.span(),
                    )),
                }
            }
            _ => Err(CoreError::parse_at(
                "expected an expression".to_owned(),
                self.span(),
            )),
        }
    }

    /// `'(' expression ')'` or the `'(' signedInt '/' signedInt ')'`
    /// fraction literal. Tries the fraction shape first since it is the
    /// more specific grammar production.
    fn parenthesized(&mut self) -> Result<Expr, CoreError> {
        let checkpoint = self.pos;
        if let Some(fraction) = self.try_fraction_literal()? {
            return Ok(fraction);
        }
        self.pos = checkpoint;

        self.bump(); // '('
        let inner = self.expression()?;
        self.expect(&TokenKind::RParen, "closing ')'")?;
        Ok(inner)
    }

    /// Attempts to parse `'(' signedInt '/' signedInt ')'`. Returns `Ok(None)`
    /// (without consuming input beyond the initial `(`) if the shape does
    /// not match, so the caller can fall back to a grouped expression.
    fn try_fraction_literal(&mut self) -> Result<Option<Expr>, CoreError> {
        let start = self.pos;
        self.bump(); // '('
        let Some(num) = self.try_signed_int() else {
            self.pos = start;
            return Ok(None);
        };
        if !matches!(self.peek(), TokenKind::Slash) {
            self.pos = start;
            return Ok(None);
        }
        self.bump(); // '/'
        let Some(den) = self.try_signed_int() else {
            self.pos = start;
            return Ok(None);
        };
        if !matches!(self.peek(), TokenKind::RParen) {
            self.pos = start;
            return Ok(None);
        }
        let close_span = self.span();
        self.bump(); // ')'

        if den == 0 {
            return Err(CoreError::parse_at(
                "division by zero in fraction literal".to_owned(),
                close_span,
            ));
        }
        let value = crate::core::BigRational::new(num, den)?;
        Ok(Some(Expr::fraction(value)))
    }

    /// Parse an optional `-` followed by an integer `Number` token,
    /// without decimal points. Does not consume anything on mismatch.
    fn try_signed_int(&mut self) -> Option<i64> {
        let start = self.pos;
        let negative = matches!(self.peek(), TokenKind::Minus);
        if negative {
            self.bump();
        }
        let TokenKind::Number {
            value,
            is_decimal: false,
        } = self.peek().clone()
        else {
            self.pos = start;
            return None;
        };
        self.bump();
        let magnitude = value.to_integer().and_then(|n| {
            use num_traits::cast::ToPrimitive;
            n.to_i64()
        })?;
        Some(if negative { -magnitude } else { magnitude })
    }

    fn note_ref(&mut self) -> Result<Expr, CoreError> {
        self.bump(); // '['
        let id_span = self.span();
        let TokenKind::Number {
            value,
            is_decimal: false,
        } = self.bump()
        else {
            return Err(CoreError::parse_at(
                "expected an unsigned note id inside '[...]'".to_owned(),
                id_span,
            ));
        };
        let id = value.to_integer().and_then(|n| {
            use num_traits::cast::ToPrimitive;
            n.to_u32()
        });
        let Some(id) = id else {
            return Err(CoreError::parse_at(
                "note id must be a non-negative integer".to_owned(),
                id_span,
            ));
        };
        self.expect(&TokenKind::RBracket, "closing ']'")?;
        let target = if id == 0 {
            NoteTarget::Base
        } else {
            NoteTarget::Note(id)
        };
        self.property_ref(target)
    }

    fn property_ref(&mut self, target: NoteTarget) -> Result<Expr, CoreError> {
        self.expect(&TokenKind::Dot, "'.' before a property name")?;
        let span = self.span();
        let TokenKind::Ident(name) = self.bump() else {
            return Err(CoreError::parse_at(
                "expected a property name after '.'".to_owned(),
                span,
            ));
        };
        let property = Property::from_name(&name).ok_or(CoreError::UnknownPropertyError {
            name,
            span: Some(span),
        })?;
        Ok(Expr::Ref { target, property })
    }

    fn helper_call(&mut self, helper: Helper) -> Result<Expr, CoreError> {
        self.expect(&TokenKind::LParen, "'(' after helper name")?;
        let target = self.note_arg()?;
        self.expect(&TokenKind::RParen, "closing ')'")?;
        Ok(Expr::HelperCall { helper, target })
    }

    fn note_arg(&mut self) -> Result<NoteTarget, CoreError> {
        match self.peek().clone() {
            TokenKind::Ident(name) if name == "base" => {
                self.bump();
                Ok(NoteTarget::Base)
            }
            TokenKind::LBracket => {
                self.bump();
                let id_span = self.span();
                let TokenKind::Number {
                    value,
                    is_decimal: false,
                } = self.bump()
                else {
                    return Err(CoreError::parse_at(
                        "expected an unsigned note id inside '[...]'".to_owned(),
                        id_span,
                    ));
                };
                let id = value.to_integer().and_then(|n| {
                    use num_traits::cast::ToPrimitive;
                    n.to_u32()
                });
                let Some(id) = id else {
                    return Err(CoreError::parse_at(
                        "note id must be a non-negative integer".to_owned(),
                        id_span,
                    ));
                };
                self.expect(&TokenKind::RBracket, "closing ']'")?;
                Ok(if id == 0 {
                    NoteTarget::Base
                } else {
                    NoteTarget::Note(id)
                })
            }
            _ => Err(CoreError::parse_at(
                "expected 'base' or '[id]'".to_owned(),
                self.span(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_note_ref() {
        let expr = parse("[1].f").expect("parses");
        assert_eq!(
            expr,
            Expr::Ref {
                target: NoteTarget::Note(1),
                property: Property::Frequency,
            }
        );
    }

    #[test]
    fn base_zero_equivalence() {
        assert_eq!(parse("base.f").expect("parses"), parse("[0].f").expect("parses"));
    }

    #[test]
    fn fraction_literal_vs_grouped_division() {
        let frac = parse("(1/3)").expect("parses");
        assert!(matches!(frac, Expr::Number { is_fraction_literal: true, .. }));

        let grouped = parse("(base.f/3)").expect("parses");
        assert!(matches!(grouped, Expr::Div(..)));
    }

    #[test]
    fn power_is_right_associative() {
        // 2^3^2 == 2^(3^2) == 2^9, not (2^3)^2
        let expr = parse("2^3^2").expect("parses");
        let Expr::Pow(base, exp) = expr else {
            panic!("expected Pow");
        };
        assert_eq!(*base, Expr::int(2));
        assert!(matches!(*exp, Expr::Pow(..)));
    }

    #[test]
    fn beat_desugars_to_helper_call() {
        let expr = parse("beat(base)").expect("parses");
        assert_eq!(
            expr,
            Expr::HelperCall {
                helper: Helper::Beat,
                target: NoteTarget::Base,
            }
        );
    }

    #[test]
    fn unknown_property_errors() {
        let err = parse("base.nope").unwrap_err();
        assert!(matches!(err, CoreError::UnknownPropertyError { .. }));
    }

    #[test]
    fn fraction_division_by_zero_errors() {
        let err = parse("(1/0)").unwrap_err();
        assert!(matches!(err, CoreError::ParseError { .. }));
    }

    #[test]
    fn precedence_respects_standard_rules() {
        // 1 + 2 * 3 == 1 + (2 * 3)
        let expr = parse("1+2*3").expect("parses");
        assert_eq!(
            expr,
            Expr::Add(Box::new(Expr::int(1)), Box::new(Expr::Mul(Box::new(Expr::int(2)), Box::new(Expr::int(3)))))
        );
    }
}
