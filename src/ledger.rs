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

//! Payment ledger.
//!
//! Payments are append-only: once completed they never change, and a refund
//! is a new payment row linked to the one it reverses.
//!
//! ```text
//! pending ──► processing ──► completed
//!    │            │
//!    └────────────┴──► failed | cancelled
//! ```
//!
//! An invoice's amount paid is always recomputed from its whole payment
//! history rather than adjusted incrementally:
//!
//! ```text
//! amount_paid = Σ completed payments - Σ completed refunds
//! amount_due  = total - amount_paid
//! ```

use crate::base::{CustomerId, DocumentId, PaymentId};
use crate::money;
use crate::EngineError;
use chrono::{DateTime, Datelike, Duration, Utc};
use std::collections::BTreeMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    #[default]
    Check,
    CreditCard,
    DebitCard,
    BankTransfer,
    Paypal,
    Stripe,
    Other,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Check => "check",
            PaymentMethod::CreditCard => "credit_card",
            PaymentMethod::DebitCard => "debit_card",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::Paypal => "paypal",
            PaymentMethod::Stripe => "stripe",
            PaymentMethod::Other => "other",
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let method = match s.trim().to_lowercase().as_str() {
            "cash" => PaymentMethod::Cash,
            "check" => PaymentMethod::Check,
            "credit_card" => PaymentMethod::CreditCard,
            "debit_card" => PaymentMethod::DebitCard,
            "bank_transfer" => PaymentMethod::BankTransfer,
            "paypal" => PaymentMethod::Paypal,
            "stripe" => PaymentMethod::Stripe,
            "other" => PaymentMethod::Other,
            other => {
                return Err(EngineError::validation(format!(
                    "unknown payment method '{other}'"
                )));
            }
        };
        Ok(method)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Cancelled => "cancelled",
        }
    }

    fn is_open(&self) -> bool {
        matches!(self, PaymentStatus::Pending | PaymentStatus::Processing)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input for recording a payment against an invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPayment {
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub reference: Option<String>,
    pub processing_fee: Decimal,
    pub notes: Option<String>,
    /// `Pending` or `Completed`.
    pub status: PaymentStatus,
}

impl NewPayment {
    /// A payment received in full right away.
    pub fn completed(amount: Decimal, method: PaymentMethod) -> Self {
        Self {
            amount,
            method,
            reference: None,
            processing_fee: Decimal::ZERO,
            notes: None,
            status: PaymentStatus::Completed,
        }
    }

    /// A payment awaiting confirmation from the processor.
    pub fn pending(amount: Decimal, method: PaymentMethod) -> Self {
        Self {
            status: PaymentStatus::Pending,
            ..Self::completed(amount, method)
        }
    }

    pub fn with_reference(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn with_processing_fee(mut self, fee: Decimal) -> Self {
        self.processing_fee = fee;
        self
    }
}

/// Input for refunding a completed payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRefund {
    /// `None` refunds whatever has not been refunded yet.
    pub amount: Option<Decimal>,
    pub reason: Option<String>,
    /// `Pending` or `Completed`.
    pub status: PaymentStatus,
}

impl NewRefund {
    pub fn completed(amount: Decimal) -> Self {
        Self {
            amount: Some(amount),
            reason: None,
            status: PaymentStatus::Completed,
        }
    }

    pub fn full() -> Self {
        Self {
            amount: None,
            reason: None,
            status: PaymentStatus::Completed,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// A payment or refund recorded against an invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Payment {
    pub id: PaymentId,
    pub invoice_id: DocumentId,
    pub customer_id: CustomerId,
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub status: PaymentStatus,
    pub reference: Option<String>,
    pub processing_fee: Decimal,
    pub net_amount: Decimal,
    pub payment_date: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub is_refund: bool,
    pub original_payment_id: Option<PaymentId>,
    pub refund_reason: Option<String>,
}

fn initial_status(status: PaymentStatus) -> Result<PaymentStatus, EngineError> {
    match status {
        PaymentStatus::Pending | PaymentStatus::Completed => Ok(status),
        other => Err(EngineError::validation(format!(
            "new payments start pending or completed (got {other})"
        ))),
    }
}

impl Payment {
    pub(crate) fn record(
        id: PaymentId,
        invoice_id: DocumentId,
        customer_id: CustomerId,
        input: NewPayment,
        now: DateTime<Utc>,
    ) -> Result<Self, EngineError> {
        let amount = money::positive_currency("payment amount", input.amount)?;
        let processing_fee = money::currency("processing fee", input.processing_fee)?;
        if processing_fee > amount {
            return Err(EngineError::validation(format!(
                "processing fee {processing_fee} exceeds payment amount {amount}"
            )));
        }
        let status = initial_status(input.status)?;

        Ok(Payment {
            id,
            invoice_id,
            customer_id,
            amount,
            method: input.method,
            status,
            reference: input.reference,
            processing_fee,
            net_amount: amount - processing_fee,
            payment_date: now,
            processed_at: (status == PaymentStatus::Completed).then_some(now),
            notes: input.notes,
            is_refund: false,
            original_payment_id: None,
            refund_reason: None,
        })
    }

    /// Builds a refund of `original`, given what has already been refunded against it.
    pub(crate) fn refund_of(
        id: PaymentId,
        original: &Payment,
        already_refunded: Decimal,
        input: NewRefund,
        now: DateTime<Utc>,
    ) -> Result<Self, EngineError> {
        if original.is_refund {
            return Err(EngineError::validation(format!(
                "payment {} is a refund and cannot be refunded",
                original.id
            )));
        }
        if original.status != PaymentStatus::Completed {
            return Err(EngineError::validation(format!(
                "only completed payments can be refunded (payment {} is {})",
                original.id, original.status
            )));
        }

        let remaining = original.amount - already_refunded;
        let amount = money::positive_currency("refund amount", input.amount.unwrap_or(remaining))?;
        if amount > remaining {
            return Err(EngineError::validation(format!(
                "refund {amount} exceeds refundable amount {remaining} of payment {}",
                original.id
            )));
        }
        let status = initial_status(input.status)?;

        Ok(Payment {
            id,
            invoice_id: original.invoice_id,
            customer_id: original.customer_id,
            amount,
            method: original.method,
            status,
            reference: original.reference.clone(),
            processing_fee: Decimal::ZERO,
            net_amount: amount,
            payment_date: now,
            processed_at: (status == PaymentStatus::Completed).then_some(now),
            notes: None,
            is_refund: true,
            original_payment_id: Some(original.id),
            refund_reason: input.reason,
        })
    }

    fn invalid(&self, requested: PaymentStatus) -> EngineError {
        EngineError::InvalidTransition {
            current: self.status.as_str(),
            requested: requested.as_str(),
        }
    }

    pub(crate) fn mark_processing(&mut self) -> Result<(), EngineError> {
        if self.status != PaymentStatus::Pending {
            return Err(self.invalid(PaymentStatus::Processing));
        }
        self.status = PaymentStatus::Processing;
        Ok(())
    }

    pub(crate) fn complete(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if !self.status.is_open() {
            return Err(self.invalid(PaymentStatus::Completed));
        }
        self.status = PaymentStatus::Completed;
        self.processed_at = Some(now);
        Ok(())
    }

    pub(crate) fn fail(
        &mut self,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if !self.status.is_open() {
            return Err(self.invalid(PaymentStatus::Failed));
        }
        self.status = PaymentStatus::Failed;
        self.processed_at = Some(now);
        if let Some(reason) = reason {
            let line = format!("Failure reason: {reason}");
            self.notes = Some(match self.notes.take() {
                Some(notes) => format!("{notes}\n\n{line}"),
                None => line,
            });
        }
        Ok(())
    }

    pub(crate) fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), EngineError> {
        if !self.status.is_open() {
            return Err(self.invalid(PaymentStatus::Cancelled));
        }
        self.status = PaymentStatus::Cancelled;
        self.processed_at = Some(now);
        Ok(())
    }

    /// Signed contribution to the invoice's amount paid.
    pub fn contribution(&self) -> Decimal {
        match (self.status, self.is_refund) {
            (PaymentStatus::Completed, false) => self.amount,
            (PaymentStatus::Completed, true) => -self.amount,
            _ => Decimal::ZERO,
        }
    }
}

/// Amount already refunded (or in flight) against `original`.
///
/// Failed and cancelled refunds do not count.
pub fn refunded_against<'a, I>(payments: I, original: PaymentId) -> Result<Decimal, EngineError>
where
    I: IntoIterator<Item = &'a Payment>,
{
    payments
        .into_iter()
        .filter(|p| p.is_refund && p.original_payment_id == Some(original))
        .filter(|p| !matches!(p.status, PaymentStatus::Failed | PaymentStatus::Cancelled))
        .try_fold(Decimal::ZERO, |sum, p| sum.checked_add(p.amount))
        .ok_or_else(|| money::out_of_range("refunded amount"))
}

/// Amount paid and due on an invoice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Settlement {
    pub amount_paid: Decimal,
    pub amount_due: Decimal,
}

/// Recomputes the settlement from the full payment history.
///
/// # Errors
///
/// [`EngineError::Validation`] when the payment sum leaves the `Decimal` range.
pub fn reconcile<'a, I>(payments: I, total: Decimal) -> Result<Settlement, EngineError>
where
    I: IntoIterator<Item = &'a Payment>,
{
    let amount_paid = payments
        .into_iter()
        .try_fold(Decimal::ZERO, |sum, p| sum.checked_add(p.contribution()))
        .ok_or_else(|| money::out_of_range("amount paid"))?;
    let amount_due = total
        .checked_sub(amount_paid)
        .ok_or_else(|| money::out_of_range("amount due"))?;
    Ok(Settlement {
        amount_paid,
        amount_due,
    })
}

// === Reporting ===

/// Completed payments received through one method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MethodTotal {
    pub method: PaymentMethod,
    pub total: Decimal,
    pub count: usize,
}

/// Completed payments received in one calendar month (1-12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MonthlyTotal {
    pub month: u32,
    pub total: Decimal,
    pub count: usize,
}

fn is_received(payment: &Payment) -> bool {
    payment.status == PaymentStatus::Completed && !payment.is_refund
}

fn add_to(total: &mut Decimal, count: &mut usize, amount: Decimal) -> Result<(), EngineError> {
    *total = total
        .checked_add(amount)
        .ok_or_else(|| money::out_of_range("payment total"))?;
    *count += 1;
    Ok(())
}

/// Sums completed non-refund payments per method, optionally limited to
/// payment dates within `[from, to]`. Methods without payments are omitted.
pub fn totals_by_method<'a, I>(
    payments: I,
    range: Option<(DateTime<Utc>, DateTime<Utc>)>,
) -> Result<Vec<MethodTotal>, EngineError>
where
    I: IntoIterator<Item = &'a Payment>,
{
    let mut totals: BTreeMap<PaymentMethod, (Decimal, usize)> = BTreeMap::new();
    let in_range = |date: DateTime<Utc>| range.is_none_or(|(from, to)| from <= date && date <= to);
    for payment in payments {
        if !is_received(payment) || !in_range(payment.payment_date) {
            continue;
        }
        let (total, count) = totals.entry(payment.method).or_default();
        add_to(total, count, payment.amount)?;
    }
    Ok(totals
        .into_iter()
        .map(|(method, (total, count))| MethodTotal {
            method,
            total,
            count,
        })
        .collect())
}

/// Completed non-refund payments of `year`, one entry per month, zero-filled.
pub fn monthly_totals<'a, I>(payments: I, year: i32) -> Result<Vec<MonthlyTotal>, EngineError>
where
    I: IntoIterator<Item = &'a Payment>,
{
    let mut months: Vec<MonthlyTotal> = (1..=12)
        .map(|month| MonthlyTotal {
            month,
            total: Decimal::ZERO,
            count: 0,
        })
        .collect();
    for payment in payments {
        if !is_received(payment) || payment.payment_date.year() != year {
            continue;
        }
        let slot = &mut months[payment.payment_date.month0() as usize];
        add_to(&mut slot.total, &mut slot.count, payment.amount)?;
    }
    Ok(months)
}

/// Failed payments recorded in the last `days` days, newest first.
pub fn recent_failures<'a, I>(payments: I, days: u32, now: DateTime<Utc>) -> Vec<Payment>
where
    I: IntoIterator<Item = &'a Payment>,
{
    let since = now
        .checked_sub_signed(Duration::days(i64::from(days)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let mut failed: Vec<Payment> = payments
        .into_iter()
        .filter(|p| p.status == PaymentStatus::Failed && p.payment_date >= since)
        .cloned()
        .collect();
    failed.sort_by(|a, b| b.payment_date.cmp(&a.payment_date).then(b.id.cmp(&a.id)));
    failed
}
