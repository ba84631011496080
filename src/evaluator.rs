//! Stack VM: executes [`Bytecode`] against a caller-supplied resolver for
//! cross-note loads.
//!
//! `LOAD_REF`/`LOAD_BASE` instructions resolve through another note's own
//! (possibly still-uncached) evaluation; the [`Resolver`] trait is how
//! that cross-note recursion is threaded through without the VM itself
//! knowing about [`crate::module::Module`].

use crate::bytecode::{Bytecode, Instruction};
use crate::core::note_id::NoteId;
use crate::core::value::{self, Value};
use crate::core::{CoreError, Property};

/// The result of running a bytecode stream: the value, and whether any
/// instruction along the way produced it via a non-exact fallback (either
/// locally, via [`Value::mul`]/[`Value::div`]/[`value::pow`]'s degrade
/// paths, or by loading an already-corrupted cached property).
#[derive(Debug, Clone, PartialEq)]
pub struct EvalOutcome {
    /// The resulting value.
    pub value: Value,
    /// Whether this result is corrupted (non-exact).
    pub corrupted: bool,
}

/// Resolve a cross-note load: given a note id and the property it wants,
/// produce that property's (possibly freshly computed) value. Implemented
/// by [`crate::module::Module`], which also supplies the property's
/// inheritance fallback when the target note has no expression for it.
pub trait Resolver {
    /// Resolve `(note, property)` to a value.
    ///
    /// # Errors
    /// Propagates whatever error the underlying evaluation produced
    /// (`CycleError`, `DivideByZero`, `MalformedBytecode`, ...).
    fn resolve(&mut self, note: NoteId, property: Property) -> Result<EvalOutcome, CoreError>;
}

/// Run `bytecode`'s instruction stream to a single value.
///
/// # Errors
/// Returns [`CoreError::MalformedBytecode`] if the stream underflows its
/// operand stack or does not reduce to exactly one value, or propagates
/// whatever error `resolver` or an arithmetic operation produces
/// (`DivideByZero`, and anything a [`Resolver`] implementation raises).
pub fn run(bytecode: &Bytecode, resolver: &mut impl Resolver) -> Result<EvalOutcome, CoreError> {
    let mut stack: Vec<Value> = Vec::new();
    let mut corrupted = false;
    let underflow = || CoreError::MalformedBytecode {
        msg: "operand stack underflow during evaluation".to_owned(),
    };

    for instr in bytecode.instructions() {
        match instr {
            Instruction::LoadConst { num, den } => {
                let value = crate::core::BigRational::new(i64::from(*num), i64::from(*den))?;
                stack.push(Value::Rational(value));
            }
            Instruction::LoadConstBig { num, den } => {
                let value = crate::core::BigRational::new(num.clone(), den.clone())?;
                stack.push(Value::Rational(value));
            }
            Instruction::LoadRef { note, var_idx } => {
                let property = Property::from_var_index(*var_idx)?;
                let outcome = resolver.resolve(*note, property)?;
                corrupted |= outcome.corrupted;
                stack.push(outcome.value);
            }
            Instruction::LoadBase { var_idx } => {
                let property = Property::from_var_index(*var_idx)?;
                let outcome = resolver.resolve(NoteId::BASE, property)?;
                corrupted |= outcome.corrupted;
                stack.push(outcome.value);
            }
            Instruction::Add => {
                let b = stack.pop().ok_or_else(underflow)?;
                let a = stack.pop().ok_or_else(underflow)?;
                let result = a.add(&b);
                corrupted |= result.is_corrupted();
                stack.push(result.value);
            }
            Instruction::Sub => {
                let b = stack.pop().ok_or_else(underflow)?;
                let a = stack.pop().ok_or_else(underflow)?;
                let result = a.sub(&b);
                corrupted |= result.is_corrupted();
                stack.push(result.value);
            }
            Instruction::Mul => {
                let b = stack.pop().ok_or_else(underflow)?;
                let a = stack.pop().ok_or_else(underflow)?;
                let result = a.mul(&b);
                corrupted |= result.is_corrupted();
                stack.push(result.value);
            }
            Instruction::Div => {
                let b = stack.pop().ok_or_else(underflow)?;
                let a = stack.pop().ok_or_else(underflow)?;
                let result = a.div(&b)?;
                corrupted |= result.is_corrupted();
                stack.push(result.value);
            }
            Instruction::Neg => {
                let a = stack.pop().ok_or_else(underflow)?;
                stack.push(a.neg());
            }
            Instruction::Pow => {
                let b = stack.pop().ok_or_else(underflow)?;
                let a = stack.pop().ok_or_else(underflow)?;
                let result = value::pow(&a, &b)?;
                corrupted |= result.is_corrupted();
                stack.push(result.value);
            }
        }
    }

    if stack.len() != 1 {
        return Err(CoreError::MalformedBytecode {
            msg: format!("evaluation left {} values on the stack, expected 1", stack.len()),
        });
    }
    Ok(EvalOutcome {
        value: stack.remove(0),
        corrupted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use crate::core::BigRational;
    use crate::parser;

    struct StubResolver;

    impl Resolver for StubResolver {
        fn resolve(&mut self, note: NoteId, property: Property) -> Result<EvalOutcome, CoreError> {
            let _ = (note, property);
            Ok(EvalOutcome {
                value: Value::int(440),
                corrupted: false,
            })
        }
    }

    #[test]
    fn evaluates_plain_arithmetic() {
        let expr = parser::dsl::parse("2*(3+1)").expect("parses");
        let bc = compile(&expr, "2*(3+1)").expect("compiles");
        let outcome = run(&bc, &mut StubResolver).expect("evaluates");
        assert_eq!(outcome.value, Value::int(8));
        assert!(!outcome.corrupted);
    }

    #[test]
    fn loads_resolve_through_the_trait() {
        let expr = parser::parse("base.f").expect("parses");
        let bc = compile(&expr, "base.f").expect("compiles");
        let outcome = run(&bc, &mut StubResolver).expect("evaluates");
        assert_eq!(outcome.value, Value::int(440));
    }

    #[test]
    fn octave_step_raised_twelve_times_is_exact() {
        let expr = parser::parse("(2^(1/12))^12").expect("parses");
        let bc = compile(&expr, "(2^(1/12))^12").expect("compiles");
        let outcome = run(&bc, &mut StubResolver).expect("evaluates");
        assert_eq!(outcome.value, Value::Rational(BigRational::from_int(2)));
        assert!(!outcome.corrupted);
    }

    #[test]
    fn divide_by_zero_propagates() {
        let expr = parser::parse_as("2/0", parser::dialect::Dialect::Dsl).expect("parses");
        let bc = compile(&expr, "2/0").expect("compiles");
        assert_eq!(run(&bc, &mut StubResolver).unwrap_err(), CoreError::DivideByZero);
    }
}
