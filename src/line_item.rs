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

//! Line items and the line item calculator.
//!
//! A line's sale price is derived from its cost:
//!
//! ```text
//! unit_price        = unit_cost * (1 + markup_percent / 100)
//! adjusted_quantity = quantity * (1 + waste_factor)   (materials only)
//! line_total        = round_half_even(adjusted_quantity * unit_price, 2)
//! ```
//!
//! # Example
//!
//! ```
//! use docket::{LineItemKind, line_item};
//! use rust_decimal_macros::dec;
//!
//! let pricing = line_item::calculate(
//!     LineItemKind::Material,
//!     dec!(10),
//!     dec!(8.00),
//!     dec!(25),
//!     dec!(0.10),
//! )
//! .unwrap();
//! assert_eq!(pricing.unit_price, dec!(10.00));
//! assert_eq!(pricing.adjusted_quantity, dec!(11));
//! assert_eq!(pricing.line_total, dec!(110.00));
//! ```

use crate::base::{DocumentId, LineItemId};
use crate::money::{self, round_currency};
use crate::EngineError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineItemKind {
    #[default]
    Material,
    Labor,
    Equipment,
    Service,
    Other,
}

impl LineItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LineItemKind::Material => "material",
            LineItemKind::Labor => "labor",
            LineItemKind::Equipment => "equipment",
            LineItemKind::Service => "service",
            LineItemKind::Other => "other",
        }
    }
}

impl fmt::Display for LineItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LineItemKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "material" => Ok(LineItemKind::Material),
            "labor" => Ok(LineItemKind::Labor),
            "equipment" => Ok(LineItemKind::Equipment),
            "service" => Ok(LineItemKind::Service),
            "other" => Ok(LineItemKind::Other),
            other => Err(EngineError::validation(format!(
                "unknown line item kind '{other}'"
            ))),
        }
    }
}

/// Derived price fields of a single line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pricing {
    /// Unrounded price per unit after markup.
    pub unit_price: Decimal,
    /// Quantity including the waste allowance for materials.
    pub adjusted_quantity: Decimal,
    /// Line amount rounded to currency precision.
    pub line_total: Decimal,
}

/// Prices one line.
///
/// Only `line_total` is rounded; the unit price keeps full precision so that
/// rounding happens once per line.
///
/// # Errors
///
/// [`EngineError::Validation`] when any input is negative, carries more
/// precision than its column allows, or the product overflows.
pub fn calculate(
    kind: LineItemKind,
    quantity: Decimal,
    unit_cost: Decimal,
    markup_percent: Decimal,
    waste_factor: Decimal,
) -> Result<Pricing, EngineError> {
    let quantity = money::quantity("quantity", quantity)?;
    let unit_cost = money::currency("unit cost", unit_cost)?;
    let markup_percent = money::percent("markup percent", markup_percent)?;
    let waste_factor = money::rate("waste factor", waste_factor)?;

    let overflow = || money::out_of_range("line amount");

    let markup = Decimal::ONE
        .checked_add(markup_percent / Decimal::ONE_HUNDRED)
        .ok_or_else(overflow)?;
    let unit_price = unit_cost.checked_mul(markup).ok_or_else(overflow)?;
    let adjusted_quantity = adjust_quantity(kind, quantity, waste_factor)?;
    let line_total = adjusted_quantity
        .checked_mul(unit_price)
        .map(round_currency)
        .ok_or_else(overflow)?;

    Ok(Pricing {
        unit_price,
        adjusted_quantity,
        line_total,
    })
}

fn adjust_quantity(
    kind: LineItemKind,
    quantity: Decimal,
    waste_factor: Decimal,
) -> Result<Decimal, EngineError> {
    match kind {
        LineItemKind::Material => Decimal::ONE
            .checked_add(waste_factor)
            .and_then(|factor| quantity.checked_mul(factor))
            .ok_or_else(|| money::out_of_range("adjusted quantity")),
        _ => Ok(quantity),
    }
}

/// Input for a new line item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLineItem {
    pub kind: LineItemKind,
    pub name: String,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub category: Option<String>,
    pub sort_order: i32,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub markup_percent: Decimal,
    pub waste_factor: Decimal,
    pub labor_hours: Decimal,
    pub labor_rate: Decimal,
    pub is_optional: bool,
    pub is_add_on: bool,
    pub parent_item_id: Option<LineItemId>,
}

impl NewLineItem {
    pub fn new(
        kind: LineItemKind,
        name: impl Into<String>,
        quantity: Decimal,
        unit_cost: Decimal,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            description: None,
            unit: None,
            category: None,
            sort_order: 0,
            quantity,
            unit_cost,
            markup_percent: Decimal::ZERO,
            waste_factor: Decimal::ZERO,
            labor_hours: Decimal::ZERO,
            labor_rate: Decimal::ZERO,
            is_optional: false,
            is_add_on: false,
            parent_item_id: None,
        }
    }

    pub fn with_markup(mut self, markup_percent: Decimal) -> Self {
        self.markup_percent = markup_percent;
        self
    }

    pub fn with_waste_factor(mut self, waste_factor: Decimal) -> Self {
        self.waste_factor = waste_factor;
        self
    }

    pub fn with_parent(mut self, parent: LineItemId) -> Self {
        self.parent_item_id = Some(parent);
        self.is_add_on = true;
        self
    }

    pub fn with_sort_order(mut self, sort_order: i32) -> Self {
        self.sort_order = sort_order;
        self
    }
}

/// Partial update of a line item. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineItemPatch {
    pub kind: Option<LineItemKind>,
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub unit: Option<Option<String>>,
    pub category: Option<Option<String>>,
    pub sort_order: Option<i32>,
    pub quantity: Option<Decimal>,
    pub unit_cost: Option<Decimal>,
    pub markup_percent: Option<Decimal>,
    pub waste_factor: Option<Decimal>,
    pub labor_hours: Option<Decimal>,
    pub labor_rate: Option<Decimal>,
    pub is_optional: Option<bool>,
    pub parent_item_id: Option<Option<LineItemId>>,
}

/// A priced unit of work or material on a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineItem {
    pub id: LineItemId,
    pub document_id: DocumentId,
    pub kind: LineItemKind,
    pub name: String,
    pub description: Option<String>,
    pub unit: Option<String>,
    pub category: Option<String>,
    pub sort_order: i32,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub markup_percent: Decimal,
    pub waste_factor: Decimal,
    pub unit_price: Decimal,
    pub line_total: Decimal,
    pub labor_hours: Decimal,
    pub labor_rate: Decimal,
    pub is_optional: bool,
    pub is_add_on: bool,
    pub is_late_fee: bool,
    pub parent_item_id: Option<LineItemId>,
}

impl LineItem {
    /// Builds and prices a line item.
    pub(crate) fn create(
        id: LineItemId,
        document_id: DocumentId,
        input: NewLineItem,
    ) -> Result<Self, EngineError> {
        let mut item = LineItem {
            id,
            document_id,
            kind: input.kind,
            name: input.name,
            description: input.description,
            unit: input.unit,
            category: input.category,
            sort_order: input.sort_order,
            quantity: input.quantity,
            unit_cost: input.unit_cost,
            markup_percent: input.markup_percent,
            waste_factor: input.waste_factor,
            unit_price: Decimal::ZERO,
            line_total: Decimal::ZERO,
            labor_hours: input.labor_hours,
            labor_rate: input.labor_rate,
            is_optional: input.is_optional,
            is_add_on: input.is_add_on,
            is_late_fee: false,
            parent_item_id: input.parent_item_id,
        };
        item.reprice()?;
        Ok(item)
    }

    /// Applies a patch and reprices. On error `self` is left untouched.
    pub(crate) fn apply(&mut self, patch: LineItemPatch) -> Result<(), EngineError> {
        let mut next = self.clone();
        if let Some(kind) = patch.kind {
            next.kind = kind;
        }
        if let Some(name) = patch.name {
            next.name = name;
        }
        if let Some(description) = patch.description {
            next.description = description;
        }
        if let Some(unit) = patch.unit {
            next.unit = unit;
        }
        if let Some(category) = patch.category {
            next.category = category;
        }
        if let Some(sort_order) = patch.sort_order {
            next.sort_order = sort_order;
        }
        if let Some(quantity) = patch.quantity {
            next.quantity = quantity;
        }
        if let Some(unit_cost) = patch.unit_cost {
            next.unit_cost = unit_cost;
        }
        if let Some(markup_percent) = patch.markup_percent {
            next.markup_percent = markup_percent;
        }
        if let Some(waste_factor) = patch.waste_factor {
            next.waste_factor = waste_factor;
        }
        if let Some(labor_hours) = patch.labor_hours {
            next.labor_hours = labor_hours;
        }
        if let Some(labor_rate) = patch.labor_rate {
            next.labor_rate = labor_rate;
        }
        if let Some(is_optional) = patch.is_optional {
            next.is_optional = is_optional;
        }
        if let Some(parent) = patch.parent_item_id {
            if parent == Some(self.id) {
                return Err(EngineError::validation("line item cannot be its own parent"));
            }
            next.parent_item_id = parent;
            next.is_add_on = parent.is_some();
        }
        next.reprice()?;
        *self = next;
        Ok(())
    }

    /// Recomputes `unit_price` and `line_total` from the current fields.
    pub fn reprice(&mut self) -> Result<(), EngineError> {
        if self.name.trim().is_empty() {
            return Err(EngineError::validation("line item name must not be empty"));
        }
        money::non_negative("labor hours", self.labor_hours)?;
        money::currency("labor rate", self.labor_rate)?;

        let pricing = calculate(
            self.kind,
            self.quantity,
            self.unit_cost,
            self.markup_percent,
            self.waste_factor,
        )?;
        self.labor_cost()?;
        self.unit_price = pricing.unit_price;
        self.line_total = pricing.line_total;
        Ok(())
    }

    /// Quantity including waste for materials.
    pub fn adjusted_quantity(&self) -> Result<Decimal, EngineError> {
        adjust_quantity(self.kind, self.quantity, self.waste_factor)
    }

    /// Estimated labor cost (`labor_hours * labor_rate`). Informational only.
    pub fn labor_cost(&self) -> Result<Decimal, EngineError> {
        self.labor_hours
            .checked_mul(self.labor_rate)
            .map(round_currency)
            .ok_or_else(|| money::out_of_range("labor cost"))
    }

    /// Copy of this line for another document, keeping pricing inputs.
    pub(crate) fn to_new(&self) -> NewLineItem {
        NewLineItem {
            kind: self.kind,
            name: self.name.clone(),
            description: self.description.clone(),
            unit: self.unit.clone(),
            category: self.category.clone(),
            sort_order: self.sort_order,
            quantity: self.quantity,
            unit_cost: self.unit_cost,
            markup_percent: self.markup_percent,
            waste_factor: self.waste_factor,
            labor_hours: self.labor_hours,
            labor_rate: self.labor_rate,
            is_optional: self.is_optional,
            is_add_on: self.is_add_on,
            parent_item_id: None,
        }
    }
}
