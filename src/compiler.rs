//! AST → bytecode compiler.
//!
//! A single recursive walk over the AST emits a flat `Vec<Instruction>`
//! directly, tracking the note-dependency set and the `references_base`
//! flag as it goes. There is no unsafe hot path here: this VM operates on
//! heap-allocated `BigRational`s, not packed `f64` lanes, so there is
//! nothing to gain from bypassing `#![forbid(unsafe_code)]`.

use rustc_hash::FxHashSet;

use crate::ast::{Expr, Helper, NoteTarget};
use crate::bytecode::{self, Bytecode, Instruction};
use crate::core::note_id::NoteId;
use crate::core::{CoreError, Property};

/// Compile a parsed expression to bytecode, recording its dependency set
/// and whether it references `base` anywhere.
///
/// `source` is retained verbatim for decompilation and JSON round-trips.
///
/// # Errors
/// Returns [`CoreError::CompileError`] if the AST references an operator,
/// variable, or helper the compiler does not recognize — this should not
/// occur for an AST produced by either surface parser.
pub fn compile(expr: &Expr, source: impl Into<String>) -> Result<Bytecode, CoreError> {
    let mut ctx = Ctx {
        instructions: Vec::new(),
        dependencies: FxHashSet::default(),
        references_base: false,
    };
    ctx.emit(expr)?;
    Ok(Bytecode::new(
        ctx.instructions,
        ctx.dependencies,
        ctx.references_base,
        source.into(),
    ))
}

struct Ctx {
    instructions: Vec<Instruction>,
    dependencies: FxHashSet<NoteId>,
    references_base: bool,
}

impl Ctx {
    fn emit(&mut self, expr: &Expr) -> Result<(), CoreError> {
        match expr {
            Expr::Number { value, .. } => {
                self.emit_constant(value);
            }
            Expr::Ref { target, property } => {
                self.emit_load(*target, property.var_index());
            }
            Expr::HelperCall { helper, target } => self.emit_helper(*helper, *target),
            Expr::Add(a, b) => self.emit_binary(a, b, Instruction::Add)?,
            Expr::Sub(a, b) => self.emit_binary(a, b, Instruction::Sub)?,
            Expr::Mul(a, b) => self.emit_binary(a, b, Instruction::Mul)?,
            Expr::Div(a, b) => self.emit_binary(a, b, Instruction::Div)?,
            Expr::Pow(a, b) => self.emit_binary(a, b, Instruction::Pow)?,
            Expr::Neg(inner) => {
                self.emit(inner)?;
                self.instructions.push(Instruction::Neg);
            }
        }
        Ok(())
    }

    fn emit_binary(&mut self, a: &Expr, b: &Expr, op: Instruction) -> Result<(), CoreError> {
        self.emit(a)?;
        self.emit(b)?;
        self.instructions.push(op);
        Ok(())
    }

    fn emit_constant(&mut self, value: &crate::core::BigRational) {
        if let Some((num, den)) = bytecode::fits_i32(value) {
            self.instructions.push(Instruction::LoadConst { num, den });
        } else {
            self.instructions.push(Instruction::LoadConstBig {
                num: value.numer().clone(),
                den: value.denom().clone(),
            });
        }
    }

    fn emit_load(&mut self, target: NoteTarget, var_idx: u8) {
        match target {
            NoteTarget::Base => {
                self.references_base = true;
                self.instructions.push(Instruction::LoadBase { var_idx });
            }
            NoteTarget::Note(id) => {
                let note = NoteId::from(id);
                self.dependencies.insert(note);
                self.instructions.push(Instruction::LoadRef { note, var_idx });
            }
        }
    }

    fn emit_helper(&mut self, helper: Helper, target: NoteTarget) {
        match helper {
            Helper::Tempo => self.emit_load(target, Property::Tempo.var_index()),
            Helper::Measure => self.emit_load(target, Property::MeasureLength.var_index()),
            Helper::Beat => {
                // `beat(x)` compiles as `LOAD_CONST 60/1`, a tempo load, `DIV`.
                self.instructions.push(Instruction::LoadConst { num: 60, den: 1 });
                self.emit_load(target, Property::Tempo.var_index());
                self.instructions.push(Instruction::Div);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser;

    #[test]
    fn records_dependencies_and_base_flag() {
        let expr = parser::parse("[1].f*base.tempo").expect("parses");
        let bc = compile(&expr, "[1].f*base.tempo").expect("compiles");
        assert!(bc.dependencies().contains(&NoteId::from(1u32)));
        assert!(bc.references_base());
    }

    #[test]
    fn beat_desugars_to_const_load_div() {
        let expr = parser::parse("beat(base)").expect("parses");
        let bc = compile(&expr, "beat(base)").expect("compiles");
        assert_eq!(
            bc.instructions(),
            &[
                Instruction::LoadConst { num: 60, den: 1 },
                Instruction::LoadBase {
                    var_idx: Property::Tempo.var_index()
                },
                Instruction::Div,
            ]
        );
    }

    #[test]
    fn beat_matches_equivalent_division_expression() {
        let beat = compile(&parser::parse("beat(base)").expect("parses"), "").expect("compiles");
        let manual =
            compile(&parser::parse("60/tempo(base)").expect("parses"), "").expect("compiles");
        assert_eq!(beat.instructions(), manual.instructions());
    }

    #[test]
    fn big_constant_uses_load_const_big() {
        let huge = format!("{}", i64::from(i32::MAX) + 1);
        let expr = parser::parse(&huge).expect("parses");
        let bc = compile(&expr, huge.clone()).expect("compiles");
        assert!(matches!(bc.instructions()[0], Instruction::LoadConstBig { .. }));
    }

    #[test]
    fn dependency_set_dedupes_repeated_note_loads() {
        let expr = parser::parse("[1].f+[1].t").expect("parses");
        let bc = compile(&expr, "[1].f+[1].t").expect("compiles");
        assert_eq!(bc.dependencies().len(), 1);
    }
}
