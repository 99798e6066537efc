//! Decimal helpers for rates and statistics.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Calculate basis points (1 bp = 0.01%)
pub fn to_basis_points(rate: Decimal) -> Decimal {
    rate * dec!(10000)
}

/// Convert basis points to decimal rate
pub fn from_basis_points(bps: Decimal) -> Decimal {
    bps / dec!(10000)
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Lossy conversion for statistics; out-of-range values become 0.
pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Non-finite values become zero.
pub fn from_f64(value: f64) -> Decimal {
    Decimal::from_f64_retain(value).unwrap_or(Decimal::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basis_points() {
        assert_eq!(to_basis_points(dec!(0.0001)), dec!(1)); // 0.01% = 1 bp
        assert_eq!(to_basis_points(dec!(0.01)), dec!(100)); // 1% = 100 bp
        assert_eq!(from_basis_points(dec!(50)), dec!(0.005)); // 50 bp = 0.5%
    }

    #[test]
    fn test_safe_div() {
        assert_eq!(safe_div(dec!(1), dec!(0)), dec!(0));
        assert_eq!(safe_div(dec!(1), dec!(4)), dec!(0.25));
    }

    #[test]
    fn test_f64_conversion() {
        assert_eq!(to_f64(dec!(0.5)), 0.5);
        assert_eq!(from_f64(f64::NAN), Decimal::ZERO);
        assert_eq!(from_f64(0.25), dec!(0.25));
    }
}
