#![forbid(unsafe_code)]
//! `compose_core` — expression language, bytecode VM, and dependency graph
//! for a note-relative musical composition engine.
//!
//! Every note's properties (start time, duration, frequency, tempo,
//! beats-per-measure, derived measure length) are expressions referring to
//! other notes or to a shared reference note ("base"). This crate compiles
//! those expressions (written in either of two surface syntaxes) to a
//! compact bytecode, tracks the dependency graph between notes, evaluates
//! the graph with exact rational and algebraic-irrational arithmetic, and
//! keeps the result cache consistent under incremental edits.
//!
//! # Layout
//! - [`core`] — arbitrary-precision rationals, the symbolic value algebra,
//!   note ids, properties, and the shared error type.
//! - [`ast`] — the shared expression tree both surface syntaxes lower into.
//! - [`parser`] — the concise DSL and legacy method-chain syntaxes, plus
//!   dialect auto-detection.
//! - [`bytecode`] and [`compiler`] — the stack-bytecode format and the
//!   AST-to-bytecode lowering.
//! - [`decompiler`] — bytecode back to source text, in either dialect.
//! - [`evaluator`] — the stack VM that executes bytecode against a
//!   resolver (normally a [`module::Module`]).
//! - [`graph`] — the per-note, per-property dependency graph.
//! - [`module`] — [`module::Module`] and [`module::Note`], which own
//!   everything above and coordinate edits, dirty-marking, and
//!   incremental re-evaluation.
//!
//! # Example
//! ```
//! use compose_core::module::{Module, NoteEdits};
//! use compose_core::core::Property;
//!
//! let mut module = Module::default(); // base: frequency=440, tempo=60, bpm=4
//! let third = module
//!     .add_note(NoteEdits {
//!         frequency: Some("base.f*(5/4)".to_owned()),
//!         ..NoteEdits::default()
//!     })
//!     .expect("compiles and installs");
//!
//! module.evaluate().expect("no cycles, nothing malformed");
//! let value = module.find_tempo(third).expect("inherits from base");
//! assert_eq!(value, compose_core::core::Value::int(60));
//! ```

pub mod ast;
pub mod bytecode;
pub mod compiler;
pub mod core;
pub mod decompiler;
pub mod evaluator;
pub mod graph;
pub mod module;
pub mod parser;

pub use ast::Expr;
pub use bytecode::{Bytecode, Instruction};
pub use core::{BigRational, CoreError, NoteId, Property, Span, Value};
pub use module::{BaseNoteOverrides, Module, Note, NoteEdits, RemoveMode};
pub use parser::dialect::Dialect;

/// Parse `source` (auto-detecting its dialect) and compile it to bytecode
/// in one step, without installing it on any [`Module`].
///
/// This is a convenience for callers that only need to validate or inspect
/// an expression string — e.g. a GUI's live syntax check before the user
/// commits an edit. [`Module::set_expression`] does the same compilation
/// internally when the expression is actually installed.
///
/// # Errors
/// Returns whatever `LexError`, `ParseError`, `UnknownPropertyError`, or
/// `CompileError` parsing or compiling `source` produces.
pub fn compile_source(source: &str) -> Result<Bytecode, CoreError> {
    let expr = parser::parse(source)?;
    compiler::compile(&expr, source)
}
