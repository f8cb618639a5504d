//! Arbitrary-precision decimal arithmetic.
//!
//! A `Decimal` is a coefficient (`BigInt`) times ten to the `exponent`:
//! `value = coefficient * 10^exponent`. Trailing zeros are preserved so
//! `1.50` prints back as written; numeric comparison ignores them.

use std::cmp::Ordering;
use std::fmt::{self, Display};
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{Signed, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};

/// Number of significant digits carried by inexact division.
const DIV_PRECISION: u32 = 34;

/// A fixed-point decimal number with an arbitrary-precision coefficient.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decimal {
    coefficient: BigInt,
    exponent: i32,
}

impl Decimal {
    #[must_use]
    pub fn new(coefficient: BigInt, exponent: i32) -> Self {
        Self { coefficient, exponent }
    }

    #[must_use]
    pub fn from_i64(value: i64) -> Self {
        Self::new(BigInt::from(value), 0)
    }

    /// Converts a finite double through its shortest round-trip rendering,
    /// so `1.1d` becomes the decimal `1.1` rather than the binary expansion.
    #[must_use]
    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        format!("{value}").parse().ok()
    }

    #[must_use]
    pub fn zero() -> Self {
        Self::new(BigInt::zero(), 0)
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.coefficient.is_zero()
    }

    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.coefficient.is_negative()
    }

    /// True when the value has no fractional part.
    #[must_use]
    pub fn is_integral(&self) -> bool {
        if self.exponent >= 0 {
            return true;
        }
        let (_, rem) = self.coefficient.div_rem(&pow10(self.exponent.unsigned_abs()));
        rem.is_zero()
    }

    /// The integral value if it is exact and fits an i64.
    #[must_use]
    pub fn to_i64(&self) -> Option<i64> {
        if !self.is_integral() {
            return None;
        }
        let scaled = if self.exponent >= 0 {
            self.coefficient.clone() * pow10(self.exponent.unsigned_abs())
        } else {
            self.coefficient.clone() / pow10(self.exponent.unsigned_abs())
        };
        scaled.to_i64()
    }

    #[must_use]
    pub fn to_f64(&self) -> f64 {
        self.to_string().parse().unwrap_or(f64::NAN)
    }

    /// Strips trailing zeros from the coefficient. `1.00` normalises to `1`.
    #[must_use]
    pub fn normalized(&self) -> Self {
        if self.coefficient.is_zero() {
            return Self::zero();
        }
        let mut coefficient = self.coefficient.clone();
        let mut exponent = self.exponent;
        let ten = BigInt::from(10);
        loop {
            let (quot, rem) = coefficient.div_rem(&ten);
            if !rem.is_zero() {
                break;
            }
            coefficient = quot;
            exponent += 1;
        }
        Self::new(coefficient, exponent)
    }

    /// Both operands re-expressed over the smaller exponent, for add/compare.
    fn aligned(&self, other: &Self) -> (BigInt, BigInt, i32) {
        let exponent = self.exponent.min(other.exponent);
        let a = &self.coefficient * pow10((self.exponent - exponent).unsigned_abs());
        let b = &other.coefficient * pow10((other.exponent - exponent).unsigned_abs());
        (a, b, exponent)
    }

    #[must_use]
    pub fn add(&self, other: &Self) -> Self {
        let (a, b, exponent) = self.aligned(other);
        Self::new(a + b, exponent)
    }

    #[must_use]
    pub fn sub(&self, other: &Self) -> Self {
        let (a, b, exponent) = self.aligned(other);
        Self::new(a - b, exponent)
    }

    #[must_use]
    pub fn mul(&self, other: &Self) -> Self {
        Self::new(
            &self.coefficient * &other.coefficient,
            self.exponent + other.exponent,
        )
    }

    /// Division carrying `DIV_PRECISION` digits, half-up rounded, then
    /// normalised so exact quotients come out clean.
    ///
    /// Returns `None` on division by zero.
    #[must_use]
    pub fn div(&self, other: &Self) -> Option<Self> {
        if other.coefficient.is_zero() {
            return None;
        }
        let precision = i32::try_from(DIV_PRECISION).expect("precision fits i32");
        let numerator = &self.coefficient * pow10(DIV_PRECISION);
        let (mut quot, rem) = numerator.div_rem(&other.coefficient);
        // round half-up on the magnitude
        if (&rem * 2i32).magnitude() >= other.coefficient.magnitude() {
            if (self.coefficient.is_negative()) == (other.coefficient.is_negative()) {
                quot += 1;
            } else {
                quot -= 1;
            }
        }
        let exponent = self.exponent - other.exponent - precision;
        Some(Self::new(quot, exponent).normalized())
    }

    /// Remainder with truncated-quotient semantics: `a - trunc(a/b) * b`.
    #[must_use]
    pub fn rem(&self, other: &Self) -> Option<Self> {
        if other.coefficient.is_zero() {
            return None;
        }
        let (a, b, exponent) = self.aligned(other);
        let (_, rem) = a.div_rem(&b);
        Some(Self::new(rem, exponent))
    }

    #[must_use]
    pub fn neg(&self) -> Self {
        Self::new(-self.coefficient.clone(), self.exponent)
    }
}

fn pow10(power: u32) -> BigInt {
    BigInt::from(10).pow(power)
}

impl FromStr for Decimal {
    type Err = ();

    fn from_str(text: &str) -> Result<Self, ()> {
        let (sign, digits) = match text.strip_prefix('-') {
            Some(rest) => (-1, rest),
            None => (1, text.strip_prefix('+').unwrap_or(text)),
        };
        let (int_part, frac_part) = match digits.split_once('.') {
            Some((i, f)) => (i, f),
            None => (digits, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(());
        }
        if !int_part.chars().all(|c| c.is_ascii_digit())
            || !frac_part.chars().all(|c| c.is_ascii_digit())
        {
            return Err(());
        }
        let mut all_digits = String::with_capacity(int_part.len() + frac_part.len());
        all_digits.push_str(int_part);
        all_digits.push_str(frac_part);
        let coefficient = if all_digits.is_empty() {
            BigInt::zero()
        } else {
            all_digits.parse::<BigInt>().map_err(|_| ())?
        };
        let exponent = -(i32::try_from(frac_part.len()).map_err(|_| ())?);
        Ok(Self::new(coefficient * sign, exponent))
    }
}

impl Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exponent >= 0 {
            write!(f, "{}", &self.coefficient * pow10(self.exponent.unsigned_abs()))
        } else {
            let scale = self.exponent.unsigned_abs() as usize;
            let magnitude = self.coefficient.magnitude().to_string();
            let sign = if self.coefficient.is_negative() { "-" } else { "" };
            if magnitude.len() > scale {
                let (int_part, frac_part) = magnitude.split_at(magnitude.len() - scale);
                write!(f, "{sign}{int_part}.{frac_part}")
            } else {
                write!(f, "{sign}0.{0:0>1$}", magnitude, scale)
            }
        }
    }
}

impl PartialEq for Decimal {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Decimal {}

impl PartialOrd for Decimal {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Decimal {
    fn cmp(&self, other: &Self) -> Ordering {
        let (a, b, _) = self.aligned(other);
        a.cmp(&b)
    }
}

impl Hash for Decimal {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // consistent with Eq: hash the normalised representation
        let norm = self.normalized();
        norm.coefficient.hash(state);
        norm.exponent.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn trailing_zeros_print_but_compare_equal() {
        assert_eq!(dec("1.50").to_string(), "1.50");
        assert_eq!(dec("1.50"), dec("1.5"));
        assert_eq!(dec("1.00"), Decimal::from_i64(1));
    }

    #[test]
    fn arithmetic_keeps_exact_results() {
        assert_eq!(dec("0.1").add(&dec("0.2")), dec("0.3"));
        assert_eq!(dec("1.5").mul(&dec("2")), dec("3.0"));
        assert_eq!(dec("1").div(&dec("4")).unwrap(), dec("0.25"));
        assert_eq!(dec("7").rem(&dec("3")).unwrap(), dec("1"));
    }

    #[test]
    fn division_by_zero_is_none() {
        assert!(dec("1").div(&Decimal::zero()).is_none());
    }

    #[test]
    fn inexact_division_rounds() {
        let third = dec("1").div(&dec("3")).unwrap();
        let text = third.to_string();
        assert!(text.starts_with("0.3333333333"));
    }

    #[test]
    fn integral_detection() {
        assert!(dec("5.00").is_integral());
        assert_eq!(dec("5.00").to_i64(), Some(5));
        assert!(!dec("5.01").is_integral());
        assert_eq!(dec("5.01").to_i64(), None);
    }

    #[test]
    fn from_f64_uses_shortest_form() {
        assert_eq!(Decimal::from_f64(1.1).unwrap(), dec("1.1"));
        assert!(Decimal::from_f64(f64::INFINITY).is_none());
    }

    #[test]
    fn negative_fraction_formats() {
        assert_eq!(dec("-0.05").to_string(), "-0.05");
        assert_eq!(dec("-12.5").to_string(), "-12.5");
    }
}
