//! Stack bytecode: the compiled form of an [`Expr`](crate::ast::Expr).
//!
//! A [`Bytecode`] is produced once by the [`compiler`](crate::compiler) and
//! is thereafter immutable; the only way to change a note's compiled
//! expression is to replace it wholesale. The wire codec
//! (`encode`/`decode`) is a pure instruction-stream format — module
//! documents never serialize it, only the source text (regenerated
//! bytecode at load time) — but the codec's opcode widths are still a
//! fixed contract, exercised directly by tests.

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};
use rustc_hash::FxHashSet;

use crate::core::note_id::NoteId;
use crate::core::{BigRational, CoreError, Property};

/// A single bytecode instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// `LOAD_CONST num den` — push a rational constant that fits in
    /// signed 32-bit numerator and denominator.
    LoadConst {
        /// Numerator.
        num: i32,
        /// Denominator (always positive).
        den: i32,
    },
    /// `LOAD_REF noteId varIdx` — push `cache[noteId][varIdx]`.
    LoadRef {
        /// The referenced note.
        note: NoteId,
        /// The referenced property's VM variable index.
        var_idx: u8,
    },
    /// `LOAD_BASE varIdx` — push `cache[0][varIdx]`.
    LoadBase {
        /// The referenced property's VM variable index.
        var_idx: u8,
    },
    /// `LOAD_CONST_BIG num den` — push a rational constant whose
    /// numerator or denominator does not fit in `i32`.
    LoadConstBig {
        /// Numerator.
        num: BigInt,
        /// Denominator (always positive).
        den: BigInt,
    },
    /// Pop two, push their sum.
    Add,
    /// Pop two, push their difference (`a - b`).
    Sub,
    /// Pop two, push their product.
    Mul,
    /// Pop two, push their quotient (`a / b`).
    Div,
    /// Pop one, push its negation.
    Neg,
    /// Pop two, push `a ^ b`.
    Pow,
}

/// Opcode byte values.
mod opcode {
    pub const LOAD_CONST: u8 = 0x01;
    pub const LOAD_REF: u8 = 0x02;
    pub const LOAD_BASE: u8 = 0x03;
    pub const LOAD_CONST_BIG: u8 = 0x04;
    pub const ADD: u8 = 0x10;
    pub const SUB: u8 = 0x11;
    pub const MUL: u8 = 0x12;
    pub const DIV: u8 = 0x13;
    pub const NEG: u8 = 0x14;
    pub const POW: u8 = 0x15;
}

impl Instruction {
    /// How many values this instruction pops from (negative) and pushes
    /// to (positive) the VM stack, net.
    #[must_use]
    pub fn stack_effect(&self) -> i32 {
        match self {
            Instruction::LoadConst { .. }
            | Instruction::LoadRef { .. }
            | Instruction::LoadBase { .. }
            | Instruction::LoadConstBig { .. } => 1,
            Instruction::Neg => 0,
            Instruction::Add
            | Instruction::Sub
            | Instruction::Mul
            | Instruction::Div
            | Instruction::Pow => -1,
        }
    }
}

/// A compiled expression: its instruction stream plus the metadata the
/// module needs to maintain the dependency graph and to decompile back to
/// source text.
#[derive(Debug, Clone, PartialEq)]
pub struct Bytecode {
    instructions: Vec<Instruction>,
    dependencies: FxHashSet<NoteId>,
    references_base: bool,
    source: String,
}

impl Bytecode {
    /// Build a `Bytecode` from its parts. Used only by the compiler.
    #[must_use]
    pub(crate) fn new(
        instructions: Vec<Instruction>,
        dependencies: FxHashSet<NoteId>,
        references_base: bool,
        source: String,
    ) -> Self {
        Self {
            instructions,
            dependencies,
            references_base,
            source,
        }
    }

    /// The instruction stream.
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Every note id this expression directly loads from.
    #[must_use]
    pub fn dependencies(&self) -> &FxHashSet<NoteId> {
        &self.dependencies
    }

    /// Whether this expression loads from `base` anywhere.
    #[must_use]
    pub fn references_base(&self) -> bool {
        self.references_base
    }

    /// The original source text this was compiled from.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Encode the instruction stream to its compact wire format. Source text
    /// and dependency metadata are not part of the wire format — they are
    /// recomputed by the compiler when `decode`'s output is recompiled,
    /// or supplied by the caller via [`Bytecode::new`].
    ///
    /// # Errors
    /// Returns [`CoreError::CompileError`] if a `LoadRef` note id does not
    /// fit in the opcode table's `u16` operand width.
    pub fn encode(&self) -> Result<Vec<u8>, CoreError> {
        let mut out = Vec::new();
        for instr in &self.instructions {
            encode_instruction(instr, &mut out)?;
        }
        Ok(out)
    }

    /// Decode a raw instruction stream produced by [`Bytecode::encode`].
    /// The result carries no dependency/source metadata; callers that
    /// need it should recompile from source instead.
    ///
    /// # Errors
    /// Returns [`CoreError::MalformedBytecode`] if the stream is
    /// truncated or contains an unknown opcode.
    pub fn decode(bytes: &[u8]) -> Result<Vec<Instruction>, CoreError> {
        let mut cursor = Cursor { bytes, pos: 0 };
        let mut instructions = Vec::new();
        while cursor.pos < cursor.bytes.len() {
            instructions.push(decode_instruction(&mut cursor)?);
        }
        Ok(instructions)
    }
}

fn encode_instruction(instr: &Instruction, out: &mut Vec<u8>) -> Result<(), CoreError> {
    match instr {
        Instruction::LoadConst { num, den } => {
            out.push(opcode::LOAD_CONST);
            out.extend_from_slice(&num.to_be_bytes());
            out.extend_from_slice(&den.to_be_bytes());
        }
        Instruction::LoadRef { note, var_idx } => {
            let id: u16 = note.value().try_into().map_err(|_| CoreError::CompileError {
                msg: format!(
                    "note id {} does not fit the bytecode's u16 LOAD_REF operand",
                    note.value()
                ),
            })?;
            out.push(opcode::LOAD_REF);
            out.extend_from_slice(&id.to_be_bytes());
            out.push(*var_idx);
        }
        Instruction::LoadBase { var_idx } => {
            out.push(opcode::LOAD_BASE);
            out.push(*var_idx);
        }
        Instruction::LoadConstBig { num, den } => {
            out.push(opcode::LOAD_CONST_BIG);
            encode_signed_varint(num, out);
            encode_unsigned_varint(den, out);
        }
        Instruction::Add => out.push(opcode::ADD),
        Instruction::Sub => out.push(opcode::SUB),
        Instruction::Mul => out.push(opcode::MUL),
        Instruction::Div => out.push(opcode::DIV),
        Instruction::Neg => out.push(opcode::NEG),
        Instruction::Pow => out.push(opcode::POW),
    }
    Ok(())
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn byte(&mut self) -> Result<u8, CoreError> {
        let b = *self.bytes.get(self.pos).ok_or_else(|| CoreError::MalformedBytecode {
            msg: "truncated instruction stream".to_owned(),
        })?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&[u8], CoreError> {
        let end = self.pos + n;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| CoreError::MalformedBytecode {
                msg: "truncated instruction operand".to_owned(),
            })?;
        self.pos = end;
        Ok(slice)
    }
}

fn decode_instruction(cursor: &mut Cursor<'_>) -> Result<Instruction, CoreError> {
    let op = cursor.byte()?;
    match op {
        opcode::LOAD_CONST => {
            let num = i32::from_be_bytes(cursor.take(4)?.try_into().map_err(bad_operand)?);
            let den = i32::from_be_bytes(cursor.take(4)?.try_into().map_err(bad_operand)?);
            Ok(Instruction::LoadConst { num, den })
        }
        opcode::LOAD_REF => {
            let id = u16::from_be_bytes(cursor.take(2)?.try_into().map_err(bad_operand)?);
            let var_idx = cursor.byte()?;
            Ok(Instruction::LoadRef {
                note: NoteId::from(u32::from(id)),
                var_idx,
            })
        }
        opcode::LOAD_BASE => {
            let var_idx = cursor.byte()?;
            Ok(Instruction::LoadBase { var_idx })
        }
        opcode::LOAD_CONST_BIG => {
            let num = decode_signed_varint(cursor)?;
            let den = decode_unsigned_varint(cursor)?;
            Ok(Instruction::LoadConstBig { num, den })
        }
        opcode::ADD => Ok(Instruction::Add),
        opcode::SUB => Ok(Instruction::Sub),
        opcode::MUL => Ok(Instruction::Mul),
        opcode::DIV => Ok(Instruction::Div),
        opcode::NEG => Ok(Instruction::Neg),
        opcode::POW => Ok(Instruction::Pow),
        other => Err(CoreError::MalformedBytecode {
            msg: format!("unknown opcode 0x{other:02x}"),
        }),
    }
}

fn bad_operand<E>(_: E) -> CoreError {
    CoreError::MalformedBytecode {
        msg: "truncated fixed-width operand".to_owned(),
    }
}

/// Whether a given `(num, den)` pair fits in the compact `LOAD_CONST`
/// encoding (both sides signed-32-bit).
#[must_use]
pub fn fits_i32(value: &BigRational) -> Option<(i32, i32)> {
    let num = value.numer().to_i32()?;
    let den = value.denom().to_i32()?;
    Some((num, den))
}

/// Base-128 digit used by the varint codec (values here are always
/// non-negative: `encode_signed_varint` zigzag-maps negatives away first).
fn varint_base() -> BigInt {
    BigInt::from(128)
}

fn encode_unsigned_varint(value: &BigInt, out: &mut Vec<u8>) {
    let base = varint_base();
    let mut v = value.clone();
    loop {
        let digit = &v % &base;
        v /= &base;
        #[allow(
            clippy::cast_possible_truncation,
            reason = "digit is always in 0..128 by construction"
        )]
        let mut byte = digit.to_u32_digits().1.first().copied().unwrap_or(0) as u8;
        if v.is_zero() {
            out.push(byte);
            break;
        }
        byte |= 0x80;
        out.push(byte);
    }
}

fn decode_unsigned_varint(cursor: &mut Cursor<'_>) -> Result<BigInt, CoreError> {
    let base = varint_base();
    let mut result = BigInt::from(0);
    let mut place = BigInt::from(1);
    loop {
        let byte = cursor.byte()?;
        result += BigInt::from(byte & 0x7f) * &place;
        if byte & 0x80 == 0 {
            break;
        }
        place *= &base;
    }
    Ok(result)
}

fn encode_signed_varint(value: &BigInt, out: &mut Vec<u8>) {
    let zigzag = if value.is_negative() {
        (-value.clone() * BigInt::from(2)) - BigInt::from(1)
    } else {
        value * BigInt::from(2)
    };
    encode_unsigned_varint(&zigzag, out);
}

fn decode_signed_varint(cursor: &mut Cursor<'_>) -> Result<BigInt, CoreError> {
    let zigzag = decode_unsigned_varint(cursor)?;
    let is_odd = (&zigzag & BigInt::from(1)) == BigInt::from(1);
    Ok(if is_odd {
        -(zigzag + BigInt::from(1)) / BigInt::from(2)
    } else {
        zigzag / BigInt::from(2)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Bytecode {
        let mut deps = FxHashSet::default();
        deps.insert(NoteId::from(1u32));
        Bytecode::new(
            vec![
                Instruction::LoadRef {
                    note: NoteId::from(1u32),
                    var_idx: 2,
                },
                Instruction::LoadConst { num: 5, den: 4 },
                Instruction::Mul,
            ],
            deps,
            false,
            "[1].f*(5/4)".to_owned(),
        )
    }

    #[test]
    fn encode_decode_round_trips() {
        let bc = sample();
        let bytes = bc.encode().expect("encodable");
        let decoded = Bytecode::decode(&bytes).expect("decodable");
        assert_eq!(decoded, bc.instructions().to_vec());
    }

    #[test]
    fn load_ref_rejects_note_id_over_u16() {
        let mut deps = FxHashSet::default();
        deps.insert(NoteId::from(100_000u32));
        let bc = Bytecode::new(
            vec![Instruction::LoadRef {
                note: NoteId::from(100_000u32),
                var_idx: 0,
            }],
            deps,
            false,
            "[100000].t".to_owned(),
        );
        assert!(bc.encode().is_err());
    }

    #[test]
    fn big_varint_round_trips_negative_numerator() {
        let big = BigInt::from(-123_456_789_012_345_i64);
        let mut out = Vec::new();
        encode_signed_varint(&big, &mut out);
        let mut cursor = Cursor {
            bytes: &out,
            pos: 0,
        };
        let decoded = decode_signed_varint(&mut cursor).expect("decodes");
        assert_eq!(decoded, big);
    }
}
