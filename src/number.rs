use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::{pow, One, Signed, ToPrimitive, Zero};
use serde::{Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Fractional digits emitted for a non-terminating decimal expansion.
const MAX_FRACTION_DIGITS: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NumberParseError {
    #[error("invalid digit in number literal")]
    InvalidDigit,
    #[error("number literal has an empty exponent")]
    EmptyExponent,
    #[error("exponent is out of range")]
    ExponentOutOfRange,
}

/// An exact arbitrary-precision number. Integer and float literals both
/// parse into this representation, so `1.1 + 2.2 == 3.3` holds exactly
/// and overflow cannot occur. Division by zero is the caller's diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Number(BigRational);

impl Number {
    pub fn zero() -> Number {
        Number(BigRational::zero())
    }

    /// Parses a decimal literal with optional fraction and exponent, e.g.
    /// `42`, `3.14`, `1e-9`. Signs are not part of literals; unary minus
    /// is an operator.
    pub fn from_literal(text: &str) -> Result<Number, NumberParseError> {
        let (mantissa, exp) = match text.find(['e', 'E']) {
            Some(i) => {
                let exp_text = &text[i + 1..];
                if exp_text.is_empty() || exp_text == "+" || exp_text == "-" {
                    return Err(NumberParseError::EmptyExponent);
                }
                let exp: i64 = exp_text
                    .parse()
                    .map_err(|_| NumberParseError::ExponentOutOfRange)?;
                (&text[..i], exp)
            }
            None => (text, 0),
        };

        let (int_part, frac_part) = match mantissa.find('.') {
            Some(i) => (&mantissa[..i], &mantissa[i + 1..]),
            None => (mantissa, ""),
        };
        if int_part.is_empty() || frac_part.contains('.') {
            return Err(NumberParseError::InvalidDigit);
        }
        if !int_part.bytes().all(|b| b.is_ascii_digit())
            || !frac_part.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(NumberParseError::InvalidDigit);
        }

        let mut digits = String::with_capacity(int_part.len() + frac_part.len());
        digits.push_str(int_part);
        digits.push_str(frac_part);
        let numer: BigInt = digits.parse().map_err(|_| NumberParseError::InvalidDigit)?;

        let scale = exp
            .checked_sub(frac_part.len() as i64)
            .ok_or(NumberParseError::ExponentOutOfRange)?;
        let ten = BigInt::from(10);
        let value = if scale >= 0 {
            BigRational::from_integer(numer * pow(ten, scale as usize))
        } else {
            BigRational::new(numer, pow(ten, (-scale) as usize))
        };
        Ok(Number(value))
    }

    pub fn is_integer(&self) -> bool {
        self.0.is_integer()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// The number as a non-negative collection index, if it is one.
    pub fn to_index(&self) -> Option<usize> {
        if !self.0.is_integer() || self.0.is_negative() {
            return None;
        }
        self.0.to_integer().to_usize()
    }

    pub fn to_i64(&self) -> Option<i64> {
        if !self.0.is_integer() {
            return None;
        }
        self.0.to_integer().to_i64()
    }

    pub fn to_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or(f64::NAN)
    }

    pub fn add(&self, other: &Number) -> Number {
        Number(&self.0 + &other.0)
    }

    pub fn sub(&self, other: &Number) -> Number {
        Number(&self.0 - &other.0)
    }

    pub fn mul(&self, other: &Number) -> Number {
        Number(&self.0 * &other.0)
    }

    /// Exact division. `None` when `other` is zero.
    pub fn checked_div(&self, other: &Number) -> Option<Number> {
        if other.0.is_zero() {
            return None;
        }
        Some(Number(&self.0 / &other.0))
    }

    /// Remainder with the sign of the dividend (truncated division).
    /// `None` when `other` is zero.
    pub fn checked_rem(&self, other: &Number) -> Option<Number> {
        if other.0.is_zero() {
            return None;
        }
        let q = (&self.0 / &other.0).trunc();
        Some(Number(&self.0 - &other.0 * q))
    }

    pub fn neg(&self) -> Number {
        Number(-&self.0)
    }

    pub fn compare(&self, other: &Number) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl From<i64> for Number {
    fn from(v: i64) -> Number {
        Number(BigRational::from_integer(BigInt::from(v)))
    }
}

impl From<usize> for Number {
    fn from(v: usize) -> Number {
        Number(BigRational::from_integer(BigInt::from(v)))
    }
}

impl fmt::Display for Number {
    /// Formats the exact decimal expansion when it terminates, otherwise
    /// truncates after [`MAX_FRACTION_DIGITS`] fractional digits.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_integer() {
            return write!(f, "{}", self.0.to_integer());
        }

        let negative = self.0.is_negative();
        let abs = self.0.abs();
        let int = abs.trunc().to_integer();
        let mut frac = &abs - BigRational::from_integer(int.clone());

        let ten = BigRational::from_integer(BigInt::from(10));
        let mut digits = String::new();
        while !frac.is_zero() && digits.len() < MAX_FRACTION_DIGITS {
            frac *= &ten;
            let d = frac.trunc().to_integer();
            digits.push_str(&d.to_string());
            frac -= BigRational::from_integer(d);
        }
        while digits.ends_with('0') {
            digits.pop();
        }
        if digits.is_empty() {
            digits.push('0');
        }
        if negative {
            write!(f, "-")?;
        }
        write!(f, "{int}.{digits}")
    }
}

impl Serialize for Number {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.to_i64() {
            Some(i) => serializer.serialize_i64(i),
            None => serializer.serialize_f64(self.to_f64()),
        }
    }
}
