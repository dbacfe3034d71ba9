//! Kubernetes resource quantity parsing
//!
//! Quantities such as `1000m`, `1`, `1024Mi` and `1Gi` are normalised to an
//! exact count of nano-units so that values written with different suffixes
//! compare equal when they denote the same amount.

use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

/// Largest decimal exponent accepted in `<n>e<exp>` notation
const MAX_EXPONENT: i32 = 18;

/// Nano-units per base unit
const NANOS: i128 = 1_000_000_000;

/// Errors returned while parsing a quantity string
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QuantityError {
    #[error("quantity is empty")]
    Empty,
    #[error("invalid number in quantity '{0}'")]
    InvalidNumber(String),
    #[error("unknown suffix in quantity '{0}'")]
    UnknownSuffix(String),
    #[error("quantity '{0}' is out of range")]
    OutOfRange(String),
}

/// A resource quantity normalised to nano-units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParsedQuantity {
    nanos: i128,
}

impl ParsedQuantity {
    /// Parse a k8s-openapi `Quantity`
    pub fn from_quantity(quantity: &Quantity) -> Result<Self, QuantityError> {
        quantity.0.parse()
    }

    /// Value in nano-units (`1` == 1_000_000_000, `1m` == 1_000_000)
    pub fn nanos(&self) -> i128 {
        self.nanos
    }
}

impl FromStr for ParsedQuantity {
    type Err = QuantityError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(QuantityError::Empty);
        }

        let (negative, unsigned) = match raw.as_bytes()[0] {
            b'-' => (true, &raw[1..]),
            b'+' => (false, &raw[1..]),
            _ => (false, raw),
        };

        let number_len = unsigned
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(unsigned.len());
        let (number, suffix) = unsigned.split_at(number_len);

        let (mantissa, fraction_digits) =
            parse_decimal(number).ok_or_else(|| QuantityError::InvalidNumber(raw.to_string()))?;
        let (multiplier, divisor) = scale_for_suffix(suffix, raw)?;

        let numerator = mantissa
            .checked_mul(multiplier)
            .ok_or_else(|| QuantityError::OutOfRange(raw.to_string()))?;
        let denominator = 10i128
            .checked_pow(fraction_digits)
            .and_then(|d| d.checked_mul(divisor))
            .ok_or_else(|| QuantityError::OutOfRange(raw.to_string()))?;

        // Sub-nano precision rounds up, as the API server does.
        let magnitude = numerator / denominator + i128::from(numerator % denominator != 0);
        let nanos = if negative { -magnitude } else { magnitude };

        Ok(ParsedQuantity { nanos })
    }
}

/// Parse `123`, `1.5` or `.5` into (digits without the point, digits after the point)
fn parse_decimal(number: &str) -> Option<(i128, u32)> {
    if number.is_empty() || number == "." {
        return None;
    }

    let (whole, fraction) = match number.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (number, ""),
    };
    if fraction.contains('.') {
        return None;
    }

    let mut mantissa: i128 = 0;
    for digit in whole.bytes().chain(fraction.bytes()) {
        mantissa = mantissa
            .checked_mul(10)?
            .checked_add(i128::from(digit - b'0'))?;
    }

    Some((mantissa, u32::try_from(fraction.len()).ok()?))
}

/// Returns (multiplier, divisor) converting one suffixed unit into nano-units
fn scale_for_suffix(suffix: &str, raw: &str) -> Result<(i128, i128), QuantityError> {
    let binary = |power: u32| Ok((1024i128.pow(power) * NANOS, 1));
    let decimal = |exponent: i32| Ok(pow10_scale(exponent));

    match suffix {
        "" => decimal(0),
        "n" => decimal(-9),
        "u" => decimal(-6),
        "m" => decimal(-3),
        "k" => decimal(3),
        "M" => decimal(6),
        "G" => decimal(9),
        "T" => decimal(12),
        "P" => decimal(15),
        "E" => decimal(18),
        "Ki" => binary(1),
        "Mi" => binary(2),
        "Gi" => binary(3),
        "Ti" => binary(4),
        "Pi" => binary(5),
        "Ei" => binary(6),
        _ => {
            let exponent = suffix
                .strip_prefix('e')
                .or_else(|| suffix.strip_prefix('E'))
                .ok_or_else(|| QuantityError::UnknownSuffix(raw.to_string()))?;
            let exponent: i32 = exponent
                .parse()
                .map_err(|_| QuantityError::UnknownSuffix(raw.to_string()))?;
            if exponent.abs() > MAX_EXPONENT {
                return Err(QuantityError::OutOfRange(raw.to_string()));
            }
            decimal(exponent)
        }
    }
}

/// Scale for `10^exponent` base units expressed in nano-units
fn pow10_scale(exponent: i32) -> (i128, i128) {
    let shifted = exponent + 9;
    if shifted >= 0 {
        (10i128.pow(shifted.unsigned_abs()), 1)
    } else {
        (1, 10i128.pow(shifted.unsigned_abs()))
    }
}
