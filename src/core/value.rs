//! Runtime value algebra: exact rationals plus a symbolic `base^exp` form.
//!
//! `Value` is the type every bytecode instruction operates on; the VM
//! threads a companion `degraded` flag alongside each value to track the
//! one case that silently collapses a `Symbolic` back into a `Rational`
//! without preserving exactness (different-base multiplication).

use num_traits::Signed;

use crate::core::bigrational::BigRational;
use crate::core::error::CoreError;

/// A runtime value: either an exact rational, or `coef * base^exp` with a
/// non-integer rational exponent.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// An exact rational number.
    Rational(BigRational),
    /// `coef * base^exp`, with `exp` a non-zero, non-integer rational,
    /// `base > 0` and `base != 1`.
    Symbolic {
        /// The symbolic base.
        base: BigRational,
        /// The (non-integer) rational exponent.
        exp: BigRational,
        /// The rational coefficient multiplying `base^exp`.
        coef: BigRational,
    },
}

/// The result of a binary or unary value operation: the value itself,
/// plus whether computing it required a non-exact numeric fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct Computed {
    /// The resulting value.
    pub value: Value,
    /// `true` if this value was produced via a float approximation
    /// rather than exact arithmetic (a different-base multiplication, or
    /// an add/sub with a symbolic operand).
    pub degraded: bool,
}

impl Computed {
    fn exact(value: Value) -> Self {
        Self {
            value,
            degraded: false,
        }
    }

    fn approximate(value: Value) -> Self {
        Self {
            value,
            degraded: true,
        }
    }

    /// Whether this result should set a property's corruption bit: it is
    /// either an approximation, or a surviving `Symbolic` value.
    #[must_use]
    pub fn is_corrupted(&self) -> bool {
        self.degraded || matches!(self.value, Value::Symbolic { .. })
    }
}

impl Value {
    /// Build an exact rational value from an integer.
    #[must_use]
    pub fn int(n: i64) -> Self {
        Value::Rational(BigRational::from_int(n))
    }

    /// Lossy conversion to `f64`, used only for the approximation
    /// fallback paths.
    #[must_use]
    fn to_f64(&self) -> f64 {
        match self {
            Value::Rational(r) => r.to_f64(),
            Value::Symbolic { base, exp, coef } => {
                coef.to_f64() * base.to_f64().powf(exp.to_f64())
            }
        }
    }

    /// Negate a value. Always exact.
    #[must_use]
    pub fn neg(&self) -> Value {
        match self {
            Value::Rational(r) => Value::Rational(r.neg()),
            Value::Symbolic { base, exp, coef } => Value::Symbolic {
                base: base.clone(),
                exp: exp.clone(),
                coef: coef.neg(),
            },
        }
    }

    /// Add two values. Exact when both are rational; otherwise falls
    /// back to a numeric approximation and marks the result corrupted.
    #[must_use]
    pub fn add(&self, other: &Value) -> Computed {
        match (self, other) {
            (Value::Rational(a), Value::Rational(b)) => Computed::exact(Value::Rational(a.add(b))),
            _ => {
                let approx = BigRational::from_f64_approx(self.to_f64() + other.to_f64());
                Computed::approximate(Value::Rational(approx))
            }
        }
    }

    /// Subtract `other` from `self`. Same exactness rule as `add`.
    #[must_use]
    pub fn sub(&self, other: &Value) -> Computed {
        self.add(&other.neg())
    }

    /// Multiply two values per the §4.2 simplification rules.
    #[must_use]
    pub fn mul(&self, other: &Value) -> Computed {
        match (self, other) {
            (Value::Rational(a), Value::Rational(b)) => Computed::exact(Value::Rational(a.mul(b))),
            (Value::Rational(r), Value::Symbolic { base, exp, coef })
            | (Value::Symbolic { base, exp, coef }, Value::Rational(r)) => {
                Computed::exact(Value::Symbolic {
                    base: base.clone(),
                    exp: exp.clone(),
                    coef: coef.mul(r),
                })
            }
            (
                Value::Symbolic {
                    base: b1,
                    exp: e1,
                    coef: c1,
                },
                Value::Symbolic {
                    base: b2,
                    exp: e2,
                    coef: c2,
                },
            ) => {
                if b1 == b2 {
                    let new_exp = e1.add(e2);
                    let new_coef = c1.mul(c2);
                    Computed::exact(demote_symbolic(b1.clone(), new_exp, new_coef))
                } else {
                    let approx = BigRational::from_f64_approx(self.to_f64() * other.to_f64());
                    Computed::approximate(Value::Rational(approx))
                }
            }
        }
    }

    /// Divide `self` by `other`.
    ///
    /// # Errors
    /// Returns `CoreError::DivideByZero` if `other` is exactly zero.
    pub fn div(&self, other: &Value) -> Result<Computed, CoreError> {
        if matches!(other, Value::Rational(r) if r.is_zero()) {
            return Err(CoreError::DivideByZero);
        }
        let inv = pow(other, &Value::Rational(BigRational::from_int(-1)))?;
        let product = self.mul(&inv.value);
        Ok(Computed {
            value: product.value,
            degraded: product.degraded || inv.degraded,
        })
    }
}

/// Raise `base` to `exp` per the §4.2 rules.
///
/// # Errors
/// Returns `CoreError::DivideByZero` for `0^n` with a negative integer
/// `n`, or for a zero base raised to a negative rational exponent.
pub fn pow(base: &Value, exp: &Value) -> Result<Computed, CoreError> {
    match (base, exp) {
        (Value::Rational(a), Value::Rational(e)) => {
            if let Some(n) = integer_exponent(e) {
                Ok(Computed::exact(Value::Rational(a.pow_int(n)?)))
            } else if a.is_zero() {
                Err(CoreError::DivideByZero)
            } else if a.is_one() {
                // 1^e == 1 exactly for any exponent; also keeps the
                // `Symbolic` invariant that `base != 1`.
                Ok(Computed::exact(Value::Rational(BigRational::one())))
            } else if a.numer().is_negative() {
                // `Symbolic` requires a positive base; a negative base with
                // a non-integer exponent has no exact rational or
                // real-valued representation in this algebra, so fall back
                // to the same numeric-approximation path as a different-base
                // symbolic multiplication.
                let approx = BigRational::from_f64_approx(a.to_f64().powf(e.to_f64()));
                Ok(Computed::approximate(Value::Rational(approx)))
            } else {
                Ok(Computed::exact(Value::Symbolic {
                    base: a.clone(),
                    exp: e.clone(),
                    coef: BigRational::one(),
                }))
            }
        }
        (
            Value::Symbolic {
                base: b,
                exp: be,
                coef: c,
            },
            Value::Rational(n),
        ) => {
            if let Some(n) = integer_exponent(n) {
                let new_exp = scale_exponent(be, n);
                let new_coef = c.pow_int(n)?;
                Ok(Computed::exact(demote_symbolic(b.clone(), new_exp, new_coef)))
            } else {
                // Exponent of an exponent with a non-integer rational power
                // has no exact representation in this algebra; approximate.
                let approx =
                    BigRational::from_f64_approx(base.to_f64().powf(exp.to_f64()));
                Ok(Computed::approximate(Value::Rational(approx)))
            }
        }
        _ => {
            // A symbolic exponent is outside the rational-`a`/rational-`b`
            // contract this algebra supports; degrade gracefully.
            let approx = BigRational::from_f64_approx(base.to_f64().powf(exp.to_f64()));
            Ok(Computed::approximate(Value::Rational(approx)))
        }
    }
}

/// If `exp` represents an integer, return it as `i64` (truncated to
/// range; compositions that would overflow `i64` are not expected for
/// musical-interval exponents).
fn integer_exponent(exp: &BigRational) -> Option<i64> {
    exp.to_integer().and_then(|n| {
        use num_traits::cast::ToPrimitive;
        n.to_i64()
    })
}

/// Scale a symbolic exponent by an integer power, i.e. compute `exp * n`
/// as a `BigRational`.
fn scale_exponent(exp: &BigRational, n: i64) -> BigRational {
    exp.mul(&BigRational::from_int(n))
}

/// Collapse a `Symbolic{base,exp,coef}` to a plain `Rational` if `exp` is
/// now zero or an integer, keeping the invariant that `Value` never holds
/// a `Symbolic` with an integer exponent.
fn demote_symbolic(base: BigRational, exp: BigRational, coef: BigRational) -> Value {
    if exp.is_zero() {
        return Value::Rational(coef);
    }
    if let Some(n) = integer_exponent(&exp) {
        if let Ok(pow) = base.pow_int(n) {
            return Value::Rational(coef.mul(&pow));
        }
    }
    Value::Symbolic { base, exp, coef }
}
