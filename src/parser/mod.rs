//! Expression parsing: two surface syntaxes lowered to one [`Expr`](crate::ast::Expr).
//!
//! `parse` dispatches to whichever surface grammar [`dialect::detect`]
//! chooses; both grammars lower to the same AST, so nothing downstream of
//! parsing needs to know which one ran.

pub mod dialect;
pub mod dsl;
pub mod legacy;
pub mod lexer;

use crate::ast::Expr;
use crate::core::CoreError;
use dialect::Dialect;

/// Parse a source string, auto-detecting its dialect.
///
/// # Errors
/// Returns whatever `LexError`, `ParseError`, or `UnknownPropertyError`
/// the chosen dialect's own parser produces.
pub fn parse(source: &str) -> Result<Expr, CoreError> {
    match dialect::detect(source) {
        Dialect::Dsl => dsl::parse(source),
        Dialect::Legacy => legacy::parse(source),
    }
}

/// Parse a source string in an explicitly chosen dialect, bypassing
/// auto-detection.
///
/// # Errors
/// See [`parse`].
pub fn parse_as(source: &str, dialect: Dialect) -> Result<Expr, CoreError> {
    match dialect {
        Dialect::Dsl => dsl::parse(source),
        Dialect::Legacy => legacy::parse(source),
    }
}
