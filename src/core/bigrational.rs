//! Arbitrary-precision signed rational arithmetic.
//!
//! `BigRational` is the exact-arithmetic backbone of [`Value`](crate::core::value::Value).
//! Every instance is kept normalized: the denominator is positive and
//! `gcd(|numerator|, denominator) == 1`.

use std::cmp::Ordering;
use std::fmt;

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Signed, Zero};

use crate::core::error::CoreError;

/// An arbitrary-precision signed rational number, always kept in lowest
/// terms with a positive denominator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BigRational {
    num: BigInt,
    den: BigInt,
}

impl BigRational {
    /// Construct from an integer numerator and denominator, normalizing
    /// immediately.
    ///
    /// # Errors
    /// Returns `CoreError::DivideByZero` if `den` is zero.
    pub fn new(num: impl Into<BigInt>, den: impl Into<BigInt>) -> Result<Self, CoreError> {
        let den = den.into();
        if den.is_zero() {
            return Err(CoreError::DivideByZero);
        }
        Ok(Self {
            num: num.into(),
            den,
        }
        .normalize())
    }

    /// Construct an integer value (`n / 1`).
    #[must_use]
    pub fn from_int(n: i64) -> Self {
        Self {
            num: BigInt::from(n),
            den: BigInt::from(1),
        }
    }

    /// The constant zero.
    #[must_use]
    pub fn zero() -> Self {
        Self::from_int(0)
    }

    /// The constant one.
    #[must_use]
    pub fn one() -> Self {
        Self::from_int(1)
    }

    /// Numerator of the normalized fraction.
    #[must_use]
    pub fn numer(&self) -> &BigInt {
        &self.num
    }

    /// Denominator of the normalized fraction (always positive).
    #[must_use]
    pub fn denom(&self) -> &BigInt {
        &self.den
    }

    /// Reduce by the gcd of numerator and denominator and force a
    /// positive denominator.
    #[must_use]
    fn normalize(self) -> Self {
        let Self { mut num, mut den } = self;
        if den.is_negative() {
            num = -num;
            den = -den;
        }
        if num.is_zero() {
            return Self {
                num,
                den: BigInt::from(1),
            };
        }
        let g = num.gcd(&den);
        if g != BigInt::from(1) && !g.is_zero() {
            num /= &g;
            den /= &g;
        }
        Self { num, den }
    }

    /// Parse a decimal string (e.g. `"0.125"`, `"60"`) into an exact or
    /// best-fit rational.
    ///
    /// Uses a bounded search over candidate denominators `1..=10000`,
    /// accepting the first candidate whose error is within `1e-10` of the
    /// parsed `f64` value, or the overall best-error candidate otherwise.
    ///
    /// # Errors
    /// Returns `CoreError::ParseError` if `s` is not a valid decimal
    /// number.
    pub fn from_decimal_str(s: &str) -> Result<Self, CoreError> {
        let trimmed = s.trim();
        let value: f64 = trimmed
            .parse()
            .map_err(|_| CoreError::parse(format!("'{trimmed}' is not a valid number")))?;
        Ok(Self::from_f64_approx(value))
    }

    /// Approximate an `f64` as a `BigRational` via bounded continued
    /// fraction search (candidate denominators `1..=10000`).
    #[must_use]
    pub fn from_f64_approx(value: f64) -> Self {
        const TOLERANCE: f64 = 1e-10;
        const MAX_DEN: i64 = 10_000;

        if value == 0.0 {
            return Self::zero();
        }
        if value.fract() == 0.0 && value.abs() < 1e15 {
            #[allow(
                clippy::cast_possible_truncation,
                reason = "guarded by the preceding magnitude check"
            )]
            return Self::from_int(value as i64);
        }

        let mut best_num = 0i64;
        let mut best_den = 1i64;
        let mut best_err = f64::MAX;

        for den in 1..=MAX_DEN {
            let scaled = value * den as f64;
            let num = scaled.round();
            if num.abs() >= 9.0e15 {
                continue;
            }
            #[allow(
                clippy::cast_possible_truncation,
                reason = "bounded by the magnitude check above"
            )]
            let num_i = num as i64;
            let approx = num as f64 / den as f64;
            let err = (approx - value).abs();
            if err < best_err {
                best_err = err;
                best_num = num_i;
                best_den = den;
                if err < TOLERANCE {
                    break;
                }
            }
        }

        Self {
            num: BigInt::from(best_num),
            den: BigInt::from(best_den),
        }
        .normalize()
    }

    /// Lossy conversion to `f64`.
    #[must_use]
    pub fn to_f64(&self) -> f64 {
        // BigInt has no direct f64 conversion in num-bigint without the
        // `num-bigint::ToPrimitive` impl losing precision for huge values
        // anyway, so a string-free digit-weighted approach is unnecessary;
        // fall back to the crate's own f64 bridge via digits.
        let (num_sign, num_f) = big_to_f64(&self.num);
        let (_, den_f) = big_to_f64(&self.den);
        num_sign * num_f / den_f
    }

    /// Is this value exactly zero?
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.num.is_zero()
    }

    /// Is this value exactly one?
    #[must_use]
    pub fn is_one(&self) -> bool {
        self.num == self.den
    }

    /// Is this value an integer (denominator of 1)?
    #[must_use]
    pub fn is_integer(&self) -> bool {
        self.den == BigInt::from(1)
    }

    /// If this value is an integer, return it as `BigInt`.
    #[must_use]
    pub fn to_integer(&self) -> Option<BigInt> {
        self.is_integer().then(|| self.num.clone())
    }

    /// Negate.
    #[must_use]
    pub fn neg(&self) -> Self {
        Self {
            num: -self.num.clone(),
            den: self.den.clone(),
        }
    }

    /// Add two rationals.
    #[must_use]
    pub fn add(&self, other: &Self) -> Self {
        Self {
            num: &self.num * &other.den + &other.num * &self.den,
            den: &self.den * &other.den,
        }
        .normalize()
    }

    /// Subtract `other` from `self`.
    #[must_use]
    pub fn sub(&self, other: &Self) -> Self {
        self.add(&other.neg())
    }

    /// Multiply two rationals.
    #[must_use]
    pub fn mul(&self, other: &Self) -> Self {
        Self {
            num: &self.num * &other.num,
            den: &self.den * &other.den,
        }
        .normalize()
    }

    /// Divide `self` by `other`.
    ///
    /// # Errors
    /// Returns `CoreError::DivideByZero` if `other` is zero.
    pub fn div(&self, other: &Self) -> Result<Self, CoreError> {
        if other.is_zero() {
            return Err(CoreError::DivideByZero);
        }
        Ok(Self {
            num: &self.num * &other.den,
            den: &self.den * &other.num,
        }
        .normalize())
    }

    /// Raise to an integer power (positive or negative).
    ///
    /// # Errors
    /// Returns `CoreError::DivideByZero` for `0^n` with negative `n`.
    pub fn pow_int(&self, exp: i64) -> Result<Self, CoreError> {
        if exp == 0 {
            return Ok(Self::one());
        }
        if exp > 0 {
            #[allow(
                clippy::cast_sign_loss,
                reason = "exp > 0 checked above"
            )]
            let e = exp as u64;
            Ok(Self {
                num: pow_bigint(&self.num, e),
                den: pow_bigint(&self.den, e),
            }
            .normalize())
        } else {
            if self.is_zero() {
                return Err(CoreError::DivideByZero);
            }
            #[allow(
                clippy::cast_sign_loss,
                reason = "exp < 0, negated below to a positive magnitude"
            )]
            let e = (-exp) as u64;
            Ok(Self {
                num: pow_bigint(&self.den, e),
                den: pow_bigint(&self.num, e),
            }
            .normalize())
        }
    }

    /// Compare two rationals.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Ordering {
        (&self.num * &other.den).cmp(&(&other.num * &self.den))
    }
}

fn pow_bigint(base: &BigInt, exp: u64) -> BigInt {
    let mut result = BigInt::from(1);
    let mut base = base.clone();
    let mut exp = exp;
    while exp > 0 {
        if exp & 1 == 1 {
            result *= &base;
        }
        base = &base * &base;
        exp >>= 1;
    }
    result
}

/// Convert a `BigInt` to `(sign, magnitude)` as `f64`, accepting precision
/// loss for magnitudes beyond `f64`'s mantissa.
fn big_to_f64(n: &BigInt) -> (f64, f64) {
    const BASE: f64 = 4_294_967_296.0; // 2^32, the radix of `to_u32_digits`
    let sign = if n.is_negative() { -1.0 } else { 1.0 };
    let digits = n.to_u32_digits().1;
    let mut value = 0.0_f64;
    for &digit in digits.iter().rev() {
        value = value.mul_add(BASE, f64::from(digit));
    }
    (sign, value)
}

impl Ord for BigRational {
    fn cmp(&self, other: &Self) -> Ordering {
        self.compare(other)
    }
}

impl PartialOrd for BigRational {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for BigRational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_integer() {
            write!(f, "{}", self.num)
        } else {
            write!(f, "{}/{}", self.num, self.den)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_reduces_and_fixes_sign() {
        let r = BigRational::new(4, -8).expect("valid");
        assert_eq!(r.numer(), &BigInt::from(-1));
        assert_eq!(r.denom(), &BigInt::from(2));
    }

    #[test]
    fn zero_denominator_errors() {
        assert!(BigRational::new(1, 0).is_err());
    }

    #[test]
    fn add_sub_mul_div_roundtrip() {
        let a = BigRational::new(1, 3).expect("valid");
        let b = BigRational::new(1, 6).expect("valid");
        let sum = a.add(&b);
        assert_eq!(sum, BigRational::new(1, 2).expect("valid"));
        let diff = sum.sub(&b);
        assert_eq!(diff, a);
        let prod = a.mul(&b);
        assert_eq!(prod, BigRational::new(1, 18).expect("valid"));
        let quot = prod.div(&b).expect("nonzero");
        assert_eq!(quot, a);
    }

    #[test]
    fn pow_int_handles_negative_exponents() {
        let two = BigRational::from_int(2);
        let eighth = two.pow_int(-3).expect("nonzero base");
        assert_eq!(eighth, BigRational::new(1, 8).expect("valid"));
    }

    #[test]
    fn decimal_eighth_is_exact() {
        let r = BigRational::from_decimal_str("0.125").expect("valid number");
        assert_eq!(r, BigRational::new(1, 8).expect("valid"));
    }

    #[test]
    fn decimal_repeating_third_is_exact_within_tolerance() {
        let r = BigRational::from_decimal_str("0.333333").expect("valid number");
        assert_eq!(r, BigRational::new(1, 3).expect("valid"));
    }

    #[test]
    fn compare_orders_correctly() {
        let a = BigRational::new(1, 2).expect("valid");
        let b = BigRational::new(2, 3).expect("valid");
        assert_eq!(a.compare(&b), Ordering::Less);
    }

    #[test]
    fn to_f64_is_close_for_small_fractions() {
        let r = BigRational::new(1, 4).expect("valid");
        assert!((r.to_f64() - 0.25).abs() < 1e-12);
    }

    #[quickcheck_macros::quickcheck]
    fn normalize_always_has_positive_den_and_coprime_parts(num: i32, den: i32) -> bool {
        if den == 0 {
            return true;
        }
        let Ok(r) = BigRational::new(i64::from(num), i64::from(den)) else {
            return true;
        };
        let den_positive = !r.denom().is_negative();
        let g = r.numer().gcd(r.denom());
        den_positive && (g == BigInt::from(1) || r.is_zero())
    }
}
