// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Precision rules for monetary values, rates and percentages.
//!
//! | Value                         | Decimal places |
//! |-------------------------------|----------------|
//! | Currency amounts              | 2              |
//! | Rates (tax, waste factor)     | 4              |
//! | Percentages (markup, discount)| 2              |
//! | Quantities                    | 4              |
//!
//! Inputs carrying more precision than their column are rejected rather than
//! silently truncated. Derived currency amounts are rounded half-to-even.

use crate::EngineError;
use rust_decimal::{Decimal, RoundingStrategy};

pub const CURRENCY_PRECISION: u32 = 2;
pub const RATE_PRECISION: u32 = 4;
pub const PERCENT_PRECISION: u32 = 2;
pub const QUANTITY_PRECISION: u32 = 4;

/// Rounds to currency precision using banker's rounding.
pub fn round_currency(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(CURRENCY_PRECISION, RoundingStrategy::MidpointNearestEven)
}

/// Error for arithmetic that left the `Decimal` range.
pub(crate) fn out_of_range(what: &str) -> EngineError {
    EngineError::validation(format!("{what} is out of range"))
}

/// Rejects negative values.
pub(crate) fn non_negative(field: &str, value: Decimal) -> Result<Decimal, EngineError> {
    if value < Decimal::ZERO {
        return Err(EngineError::validation(format!(
            "{field} must not be negative (got {value})"
        )));
    }
    Ok(value)
}

/// Rejects zero and negative values.
pub(crate) fn positive(field: &str, value: Decimal) -> Result<Decimal, EngineError> {
    if value <= Decimal::ZERO {
        return Err(EngineError::validation(format!(
            "{field} must be positive (got {value})"
        )));
    }
    Ok(value)
}

/// Rejects values with more fractional digits than `precision`.
pub(crate) fn within_precision(
    field: &str,
    value: Decimal,
    precision: u32,
) -> Result<Decimal, EngineError> {
    if value.normalize().scale() > precision {
        return Err(EngineError::validation(format!(
            "{field} allows at most {precision} decimal places (got {value})"
        )));
    }
    Ok(value)
}

/// Non-negative currency amount with at most two decimal places.
pub(crate) fn currency(field: &str, value: Decimal) -> Result<Decimal, EngineError> {
    within_precision(field, non_negative(field, value)?, CURRENCY_PRECISION)
}

/// Strictly positive currency amount with at most two decimal places.
pub(crate) fn positive_currency(field: &str, value: Decimal) -> Result<Decimal, EngineError> {
    within_precision(field, positive(field, value)?, CURRENCY_PRECISION)
}

/// Non-negative percentage with at most two decimal places.
pub(crate) fn percent(field: &str, value: Decimal) -> Result<Decimal, EngineError> {
    within_precision(field, non_negative(field, value)?, PERCENT_PRECISION)
}

/// Non-negative rate with at most four decimal places.
pub(crate) fn rate(field: &str, value: Decimal) -> Result<Decimal, EngineError> {
    within_precision(field, non_negative(field, value)?, RATE_PRECISION)
}

/// Non-negative quantity with at most four decimal places.
pub(crate) fn quantity(field: &str, value: Decimal) -> Result<Decimal, EngineError> {
    within_precision(field, non_negative(field, value)?, QUANTITY_PRECISION)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn round_currency_uses_bankers_rounding() {
        assert_eq!(round_currency(dec!(0.125)), dec!(0.12));
        assert_eq!(round_currency(dec!(0.135)), dec!(0.14));
        assert_eq!(round_currency(dec!(2.675)), dec!(2.68));
        assert_eq!(round_currency(dec!(-0.125)), dec!(-0.12));
    }

    #[test]
    fn round_currency_keeps_exact_values() {
        assert_eq!(round_currency(dec!(110)), dec!(110));
        assert_eq!(round_currency(dec!(15.84)), dec!(15.84));
    }

    #[test]
    fn negative_values_are_rejected() {
        assert!(matches!(
            non_negative("quantity", dec!(-1)),
            Err(EngineError::Validation(_))
        ));
        assert_eq!(non_negative("quantity", Decimal::ZERO), Ok(Decimal::ZERO));
    }

    #[test]
    fn positive_rejects_zero() {
        assert!(positive("amount", Decimal::ZERO).is_err());
        assert_eq!(positive("amount", dec!(0.01)), Ok(dec!(0.01)));
    }

    #[test]
    fn precision_ignores_trailing_zeros() {
        assert!(currency("amount", dec!(8.000000)).is_ok());
        assert!(currency("amount", dec!(8.001)).is_err());
        assert!(rate("tax rate", dec!(0.0875)).is_ok());
        assert!(rate("tax rate", dec!(0.08755)).is_err());
        assert!(percent("markup", dec!(12.5)).is_ok());
        assert!(percent("markup", dec!(12.505)).is_err());
        assert!(quantity("quantity", dec!(1.2345)).is_ok());
        assert!(quantity("quantity", dec!(1.23456)).is_err());
    }

    #[test]
    fn validation_message_names_field() {
        let err = currency("unit cost", dec!(-3)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "validation failed: unit cost must not be negative (got -3)"
        );
    }
}
