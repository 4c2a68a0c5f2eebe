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

//! Property-based tests for the document engine.
//!
//! These tests verify invariants that should hold for any sequence of
//! valid edits and payments.

use docket::line_item::calculate;
use docket::money::round_currency;
use docket::{
    CustomerId, Discount, DocumentId, Engine, LineItemId, LineItemKind, LineItemPatch, NewInvoice,
    NewLineItem, NewPayment, NewRefund, PaymentMethod, PaymentStatus, Status, TenantId,
};
use proptest::prelude::*;
use rust_decimal::Decimal;

const TENANT: TenantId = TenantId(1);

// =============================================================================
// Arbitrary Strategies
// =============================================================================

fn arb_kind() -> impl Strategy<Value = LineItemKind> {
    prop_oneof![
        Just(LineItemKind::Material),
        Just(LineItemKind::Labor),
        Just(LineItemKind::Equipment),
        Just(LineItemKind::Service),
        Just(LineItemKind::Other),
    ]
}

/// Quantity from 0 to 500 with up to four decimal places.
fn arb_quantity() -> impl Strategy<Value = Decimal> {
    (0i64..=5_000_000i64).prop_map(|q| Decimal::new(q, 4))
}

/// Currency amount from 0 to 10000.
fn arb_cost() -> impl Strategy<Value = Decimal> {
    (0i64..=1_000_000i64).prop_map(|cents| Decimal::new(cents, 2))
}

fn arb_positive_amount() -> impl Strategy<Value = Decimal> {
    (1i64..=200_000i64).prop_map(|cents| Decimal::new(cents, 2))
}

fn arb_markup() -> impl Strategy<Value = Decimal> {
    (0i64..=20_000i64).prop_map(|bp| Decimal::new(bp, 2))
}

fn arb_waste() -> impl Strategy<Value = Decimal> {
    (0i64..=2_500i64).prop_map(|r| Decimal::new(r, 4))
}

fn arb_tax_rate() -> impl Strategy<Value = Decimal> {
    (0i64..=2_500i64).prop_map(|r| Decimal::new(r, 4))
}

fn arb_item() -> impl Strategy<Value = NewLineItem> {
    (arb_kind(), arb_quantity(), arb_cost(), arb_markup(), arb_waste()).prop_map(
        |(kind, quantity, cost, markup, waste)| {
            NewLineItem::new(kind, "Line", quantity, cost)
                .with_markup(markup)
                .with_waste_factor(waste)
        },
    )
}

#[derive(Debug, Clone)]
enum ItemOp {
    Add(NewLineItem),
    Requantify(usize, Decimal),
    Delete(usize),
}

fn arb_item_op() -> impl Strategy<Value = ItemOp> {
    prop_oneof![
        3 => arb_item().prop_map(ItemOp::Add),
        1 => (any::<usize>(), arb_quantity()).prop_map(|(i, q)| ItemOp::Requantify(i, q)),
        1 => any::<usize>().prop_map(ItemOp::Delete),
    ]
}

#[derive(Debug, Clone)]
enum MoneyOp {
    Pay(Decimal),
    Refund(usize, Decimal),
    FullRefund(usize),
}

fn arb_money_op() -> impl Strategy<Value = MoneyOp> {
    prop_oneof![
        3 => arb_positive_amount().prop_map(MoneyOp::Pay),
        1 => (any::<usize>(), arb_positive_amount()).prop_map(|(i, a)| MoneyOp::Refund(i, a)),
        1 => any::<usize>().prop_map(MoneyOp::FullRefund),
    ]
}

fn invoice(engine: &Engine, tax_rate: Decimal, discount: Discount) -> DocumentId {
    engine
        .create_invoice(
            TENANT,
            NewInvoice::new(CustomerId(1), "Property")
                .with_tax_rate(tax_rate)
                .with_discount(discount),
        )
        .unwrap()
        .id
}

fn apply_item_op(engine: &Engine, document: DocumentId, items: &mut Vec<LineItemId>, op: ItemOp) {
    match op {
        ItemOp::Add(input) => {
            let (_, item) = engine.create_line_item(TENANT, document, input).unwrap();
            items.push(item.id);
        }
        ItemOp::Requantify(i, quantity) if !items.is_empty() => {
            let id = items[i % items.len()];
            let patch = LineItemPatch {
                quantity: Some(quantity),
                ..Default::default()
            };
            engine.update_line_item(TENANT, document, id, patch).unwrap();
        }
        ItemOp::Delete(i) if !items.is_empty() => {
            let id = items.remove(i % items.len());
            engine.delete_line_item(TENANT, document, id).unwrap();
        }
        _ => {}
    }
}

// =============================================================================
// Line Item Invariants
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    /// A line total is the rounded product of adjusted quantity and marked-up cost.
    #[test]
    fn line_total_matches_formula(
        kind in arb_kind(),
        quantity in arb_quantity(),
        cost in arb_cost(),
        markup in arb_markup(),
        waste in arb_waste(),
    ) {
        let pricing = calculate(kind, quantity, cost, markup, waste).unwrap();

        let unit_price = cost * (Decimal::ONE + markup / Decimal::ONE_HUNDRED);
        let adjusted = if kind == LineItemKind::Material {
            quantity * (Decimal::ONE + waste)
        } else {
            quantity
        };
        prop_assert_eq!(pricing.adjusted_quantity, adjusted);
        prop_assert_eq!(pricing.line_total, round_currency(adjusted * unit_price));
        prop_assert!(pricing.line_total >= Decimal::ZERO);
        prop_assert!(pricing.line_total.scale() <= 2);
    }

    /// Waste only ever inflates material lines.
    #[test]
    fn waste_factor_ignored_for_non_materials(
        quantity in arb_quantity(),
        cost in arb_cost(),
        waste in arb_waste(),
    ) {
        let with_waste =
            calculate(LineItemKind::Labor, quantity, cost, Decimal::ZERO, waste).unwrap();
        let without =
            calculate(LineItemKind::Labor, quantity, cost, Decimal::ZERO, Decimal::ZERO).unwrap();
        prop_assert_eq!(with_waste, without);
    }
}

// =============================================================================
// Document Invariants
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// After any sequence of item edits the stored totals equal a fresh
    /// computation from the remaining items.
    #[test]
    fn totals_track_item_edits(
        tax_rate in arb_tax_rate(),
        percent in (0i64..=10_000i64).prop_map(|p| Decimal::new(p, 2)),
        ops in prop::collection::vec(arb_item_op(), 1..25),
    ) {
        let engine = Engine::new();
        let document = invoice(&engine, tax_rate, Discount::percentage(percent));
        let mut items = Vec::new();
        for op in ops {
            apply_item_op(&engine, document, &mut items, op);
        }

        let record = engine.snapshot(TENANT, document).unwrap();
        let totals = record.document.totals;
        let subtotal: Decimal = record.items.iter().map(|item| item.line_total).sum();
        let discount = round_currency(subtotal * percent / Decimal::ONE_HUNDRED);
        let tax = round_currency((subtotal - discount) * tax_rate);

        prop_assert_eq!(record.items.len(), items.len());
        prop_assert_eq!(totals.subtotal, subtotal);
        prop_assert_eq!(totals.discount_amount, discount);
        prop_assert_eq!(totals.tax_amount, tax);
        prop_assert_eq!(totals.total, subtotal - discount + tax);
        prop_assert!(totals.total >= Decimal::ZERO);
        prop_assert_eq!(record.document.amount_due(), totals.total);
    }

    /// A flat discount never drives the total below zero, even after the
    /// items it was sized against are removed.
    #[test]
    fn flat_discount_never_goes_negative(
        flat in arb_positive_amount(),
        ops in prop::collection::vec(arb_item_op(), 1..20),
    ) {
        let engine = Engine::new();
        let document = invoice(&engine, Decimal::ZERO, Discount::amount(flat));
        let mut items = Vec::new();
        for op in ops {
            apply_item_op(&engine, document, &mut items, op);
        }

        let totals = engine.snapshot(TENANT, document).unwrap().document.totals;
        prop_assert!(totals.discount_amount <= totals.subtotal);
        prop_assert!(totals.total >= Decimal::ZERO);
    }

    /// Recalculating twice changes nothing.
    #[test]
    fn recalculation_is_idempotent(
        tax_rate in arb_tax_rate(),
        inputs in prop::collection::vec(arb_item(), 0..15),
    ) {
        let engine = Engine::new();
        let document = invoice(&engine, tax_rate, Discount::none());
        for input in inputs {
            engine.create_line_item(TENANT, document, input).unwrap();
        }

        let before = engine.snapshot(TENANT, document).unwrap();
        let first = engine.recalculate_document(TENANT, document).unwrap();
        let second = engine.recalculate_document(TENANT, document).unwrap();
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first.totals, before.document.totals);
    }
}

// =============================================================================
// Payment Invariants
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// The invoice's paid and due amounts always reconcile with its completed
    /// payments, and its status always agrees with them.
    #[test]
    fn payments_reconcile_with_status(
        cost in (100i64..=500_000i64).prop_map(|cents| Decimal::new(cents, 2)),
        ops in prop::collection::vec(arb_money_op(), 1..20),
    ) {
        let engine = Engine::new();
        let document = invoice(&engine, Decimal::ZERO, Discount::none());
        engine
            .create_line_item(
                TENANT,
                document,
                NewLineItem::new(LineItemKind::Service, "Work", Decimal::ONE, cost),
            )
            .unwrap();
        engine.transition_status(TENANT, document, Status::Sent).unwrap();

        let mut payments = Vec::new();
        for op in ops {
            match op {
                MoneyOp::Pay(amount) => {
                    let card = NewPayment::completed(amount, PaymentMethod::CreditCard);
                    let (_, payment) = engine.record_payment(TENANT, document, card).unwrap();
                    payments.push(payment.id);
                }
                MoneyOp::Refund(i, amount) if !payments.is_empty() => {
                    // Over-refunds are rejected and leave the invoice untouched.
                    let _ = engine.create_refund(
                        TENANT,
                        document,
                        payments[i % payments.len()],
                        NewRefund::completed(amount),
                    );
                }
                MoneyOp::FullRefund(i) if !payments.is_empty() => {
                    let _ = engine.create_refund(
                        TENANT,
                        document,
                        payments[i % payments.len()],
                        NewRefund::full(),
                    );
                }
                _ => {}
            }
        }

        let record = engine.snapshot(TENANT, document).unwrap();
        let completed = record
            .payments
            .iter()
            .filter(|payment| payment.status == PaymentStatus::Completed);
        let paid: Decimal = completed
            .clone()
            .filter(|payment| !payment.is_refund)
            .map(|payment| payment.amount)
            .sum();
        let refunded: Decimal = completed
            .filter(|payment| payment.is_refund)
            .map(|payment| payment.amount)
            .sum();

        let total = record.document.total();
        let amount_paid = record.document.amount_paid();
        prop_assert_eq!(amount_paid, paid - refunded);
        prop_assert!(amount_paid >= Decimal::ZERO);
        prop_assert_eq!(record.document.amount_due(), total - amount_paid);

        for original in payments {
            let amount = record.payment(original).unwrap().amount;
            let refunds: Decimal = record
                .payments
                .iter()
                .filter(|payment| payment.original_payment_id == Some(original))
                .map(|payment| payment.amount)
                .sum();
            prop_assert!(refunds <= amount);
        }

        let expected = if amount_paid >= total {
            Status::Paid
        } else if amount_paid > Decimal::ZERO {
            Status::Partial
        } else {
            Status::Sent
        };
        prop_assert_eq!(record.document.status, expected);
    }
}
