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

//! Document aggregator.
//!
//! Derives a document's totals from its line items:
//!
//! ```text
//! subtotal        = Σ line_total                 (already rounded per line)
//! discount_amount = min(value, subtotal)         (amount)
//!                 = round(subtotal * value / 100) (percentage)
//! tax_amount      = round((subtotal - discount_amount) * tax_rate)
//! total           = subtotal - discount_amount + tax_amount
//! ```

use crate::line_item::LineItem;
use crate::money::{self, round_currency};
use crate::EngineError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    #[default]
    Amount,
    Percentage,
}

impl fmt::Display for DiscountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscountType::Amount => f.write_str("amount"),
            DiscountType::Percentage => f.write_str("percentage"),
        }
    }
}

impl FromStr for DiscountType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "amount" => Ok(DiscountType::Amount),
            "percentage" | "percent" => Ok(DiscountType::Percentage),
            other => Err(EngineError::validation(format!(
                "unknown discount type '{other}'"
            ))),
        }
    }
}

/// Document-level discount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discount {
    #[serde(rename = "type")]
    pub kind: DiscountType,
    pub value: Decimal,
}

impl Discount {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn amount(value: Decimal) -> Self {
        Self {
            kind: DiscountType::Amount,
            value,
        }
    }

    pub fn percentage(value: Decimal) -> Self {
        Self {
            kind: DiscountType::Percentage,
            value,
        }
    }

    /// Checks the value against the column rules for its type.
    pub fn validate(&self) -> Result<(), EngineError> {
        match self.kind {
            DiscountType::Amount => {
                money::currency("discount", self.value)?;
            }
            DiscountType::Percentage => {
                money::percent("discount percentage", self.value)?;
                if self.value > Decimal::ONE_HUNDRED {
                    return Err(EngineError::validation(format!(
                        "discount percentage must not exceed 100 (got {})",
                        self.value
                    )));
                }
            }
        }
        Ok(())
    }

    /// Monetary discount for the given subtotal, rounded to currency precision.
    ///
    /// # Errors
    ///
    /// [`EngineError::Validation`] when the percentage of `subtotal` overflows.
    pub fn amount_for(&self, subtotal: Decimal) -> Result<Decimal, EngineError> {
        match self.kind {
            DiscountType::Amount => Ok(self.value),
            DiscountType::Percentage => subtotal
                .checked_mul(self.value)
                .and_then(|scaled| scaled.checked_div(Decimal::ONE_HUNDRED))
                .map(round_currency)
                .ok_or_else(|| money::out_of_range("discount amount")),
        }
    }
}

/// Validates a tax rate: a fraction between 0 and 1 with four decimal places.
pub fn validate_tax_rate(tax_rate: Decimal) -> Result<Decimal, EngineError> {
    money::rate("tax rate", tax_rate)?;
    if tax_rate > Decimal::ONE {
        return Err(EngineError::validation(format!(
            "tax rate must be between 0 and 1 (got {tax_rate})"
        )));
    }
    Ok(tax_rate)
}

/// Derived monetary fields of a document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DocumentTotals {
    pub subtotal: Decimal,
    pub discount_amount: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
}

/// Rejects a flat discount larger than the subtotal it is being applied to.
///
/// Used when a caller sets the discount explicitly; recomputation after item
/// removal clamps instead.
pub fn check_discount_fits(discount: &Discount, subtotal: Decimal) -> Result<(), EngineError> {
    discount.validate()?;
    let amount = discount.amount_for(subtotal)?;
    if amount > subtotal {
        return Err(EngineError::validation(format!(
            "discount {amount} exceeds subtotal {subtotal}"
        )));
    }
    Ok(())
}

/// Recomputes document totals from the full current item set.
///
/// A flat discount is clamped to the subtotal, so the total never goes negative.
///
/// # Errors
///
/// [`EngineError::Validation`] when the discount or tax rate is malformed
/// or the subtotal overflows.
pub fn compute_totals<'a, I>(
    items: I,
    discount: &Discount,
    tax_rate: Decimal,
) -> Result<DocumentTotals, EngineError>
where
    I: IntoIterator<Item = &'a LineItem>,
{
    discount.validate()?;
    validate_tax_rate(tax_rate)?;

    let subtotal = items
        .into_iter()
        .try_fold(Decimal::ZERO, |sum, item| sum.checked_add(item.line_total))
        .ok_or_else(|| money::out_of_range("document subtotal"))?;

    let discount_amount = discount.amount_for(subtotal)?.min(subtotal);

    let discounted = subtotal - discount_amount;
    let tax_amount = discounted
        .checked_mul(tax_rate)
        .map(round_currency)
        .ok_or_else(|| money::out_of_range("tax amount"))?;
    let total = discounted
        .checked_add(tax_amount)
        .map(round_currency)
        .ok_or_else(|| money::out_of_range("document total"))?;

    debug_assert!(total >= Decimal::ZERO, "total went negative: {total}");

    Ok(DocumentTotals {
        subtotal,
        discount_amount,
        tax_amount,
        total,
    })
}
