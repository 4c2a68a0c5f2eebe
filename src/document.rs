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

//! Estimates, invoices and the projects estimates convert into.
//!
//! A [`DocumentRecord`] is the aggregate root: the document header together
//! with every line item and payment it owns. All derived fields are
//! recomputed on the record as a whole.

use crate::aggregate::{compute_totals, validate_tax_rate, Discount, DocumentTotals};
use crate::base::{CustomerId, DocumentId, LineItemId, PaymentId, ProjectId, TenantId};
use crate::ledger::{reconcile, Payment};
use crate::line_item::LineItem;
use crate::money;
use crate::sequence::{DocumentNumber, DocumentType};
use crate::status::{self, Status, TransitionContext};
use crate::EngineError;
use chrono::{DateTime, Duration, Months, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Customer e-signature captured on acceptance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Signature {
    pub signer_name: String,
    pub signed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EstimateDetails {
    pub valid_until: Option<DateTime<Utc>>,
    pub responded_at: Option<DateTime<Utc>>,
    pub signature: Option<Signature>,
    pub project_id: Option<ProjectId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrenceInterval {
    Weekly,
    Biweekly,
    Monthly,
    Quarterly,
    Annually,
}

impl RecurrenceInterval {
    /// Moves `date` forward by one interval.
    pub fn advance(&self, date: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            RecurrenceInterval::Weekly => date.checked_add_signed(Duration::weeks(1)),
            RecurrenceInterval::Biweekly => date.checked_add_signed(Duration::weeks(2)),
            RecurrenceInterval::Monthly => date.checked_add_months(Months::new(1)),
            RecurrenceInterval::Quarterly => date.checked_add_months(Months::new(3)),
            RecurrenceInterval::Annually => date.checked_add_months(Months::new(12)),
        }
    }
}

impl FromStr for RecurrenceInterval {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "weekly" => Ok(RecurrenceInterval::Weekly),
            "biweekly" => Ok(RecurrenceInterval::Biweekly),
            "monthly" => Ok(RecurrenceInterval::Monthly),
            "quarterly" => Ok(RecurrenceInterval::Quarterly),
            "annually" => Ok(RecurrenceInterval::Annually),
            other => Err(EngineError::validation(format!(
                "unknown recurrence interval '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Recurrence {
    pub interval: RecurrenceInterval,
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvoiceDetails {
    pub issue_date: DateTime<Utc>,
    pub due_date: DateTime<Utc>,
    pub amount_paid: Decimal,
    pub amount_due: Decimal,
    pub paid_at: Option<DateTime<Utc>>,
    pub late_fee: Decimal,
    pub late_fee_days: u32,
    pub recurrence: Option<Recurrence>,
    pub parent_invoice_id: Option<DocumentId>,
    pub estimate_id: Option<DocumentId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Details {
    Estimate(EstimateDetails),
    Invoice(InvoiceDetails),
}

/// Estimate or invoice header with its derived totals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Document {
    pub id: DocumentId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub number: DocumentNumber,
    pub title: String,
    pub description: Option<String>,
    pub status: Status,
    pub tax_rate: Decimal,
    pub discount: Discount,
    pub totals: DocumentTotals,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub viewed_at: Option<DateTime<Utc>>,
    pub details: Details,
}

impl Document {
    pub fn document_type(&self) -> DocumentType {
        match self.details {
            Details::Estimate(_) => DocumentType::Estimate,
            Details::Invoice(_) => DocumentType::Invoice,
        }
    }

    pub fn estimate(&self) -> Option<&EstimateDetails> {
        match &self.details {
            Details::Estimate(details) => Some(details),
            Details::Invoice(_) => None,
        }
    }

    pub fn invoice(&self) -> Option<&InvoiceDetails> {
        match &self.details {
            Details::Invoice(details) => Some(details),
            Details::Estimate(_) => None,
        }
    }

    pub(crate) fn estimate_mut(&mut self) -> Result<&mut EstimateDetails, EngineError> {
        let number = self.number;
        match &mut self.details {
            Details::Estimate(details) => Ok(details),
            Details::Invoice(_) => Err(EngineError::validation(format!(
                "{number} is not an estimate"
            ))),
        }
    }

    pub(crate) fn invoice_mut(&mut self) -> Result<&mut InvoiceDetails, EngineError> {
        let number = self.number;
        match &mut self.details {
            Details::Invoice(details) => Ok(details),
            Details::Estimate(_) => Err(EngineError::validation(format!(
                "{number} is not an invoice"
            ))),
        }
    }

    pub fn total(&self) -> Decimal {
        self.totals.total
    }

    /// Zero for estimates.
    pub fn amount_paid(&self) -> Decimal {
        self.invoice().map_or(Decimal::ZERO, |i| i.amount_paid)
    }

    /// Equal to the total for estimates.
    pub fn amount_due(&self) -> Decimal {
        self.invoice().map_or(self.totals.total, |i| i.amount_due)
    }

    /// `valid_until` for estimates, `due_date` for invoices.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        match &self.details {
            Details::Estimate(details) => details.valid_until,
            Details::Invoice(details) => Some(details.due_date),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.estimate()
            .and_then(|e| e.valid_until)
            .is_some_and(|valid_until| now > valid_until)
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        match self.invoice() {
            Some(invoice) => {
                !matches!(self.status, Status::Paid | Status::Cancelled | Status::Draft)
                    && now > invoice.due_date
            }
            None => false,
        }
    }

    /// Whole days past the due date, rounded up; zero when not overdue.
    pub fn days_overdue(&self, now: DateTime<Utc>) -> i64 {
        match self.invoice() {
            Some(invoice) if self.is_overdue(now) => {
                let elapsed = now - invoice.due_date;
                let days = elapsed.num_days();
                if elapsed > Duration::days(days) { days + 1 } else { days }
            }
            _ => 0,
        }
    }

    pub fn is_editable(&self) -> bool {
        status::is_editable(self.document_type(), self.status)
    }

    pub(crate) fn ensure_editable(&self) -> Result<(), EngineError> {
        if self.is_editable() {
            Ok(())
        } else {
            Err(EngineError::validation(format!(
                "{} cannot be edited while {}",
                self.number, self.status
            )))
        }
    }

    pub(crate) fn transition_context(&self, now: DateTime<Utc>) -> TransitionContext {
        TransitionContext {
            now,
            deadline: self.deadline(),
            amount_paid: self.amount_paid(),
        }
    }
}

/// Document together with the line items and payments it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentRecord {
    pub document: Document,
    pub items: Vec<LineItem>,
    pub payments: Vec<Payment>,
}

/// Status change produced while applying an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub from: Status,
    pub to: Status,
}

impl DocumentRecord {
    pub(crate) fn new(document: Document) -> Self {
        Self {
            document,
            items: Vec::new(),
            payments: Vec::new(),
        }
    }

    pub fn item(&self, id: LineItemId) -> Option<&LineItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub(crate) fn item_mut(&mut self, id: LineItemId) -> Result<&mut LineItem, EngineError> {
        self.items
            .iter_mut()
            .find(|item| item.id == id)
            .ok_or(EngineError::not_found(crate::error::Entity::LineItem, id.0))
    }

    pub fn payment(&self, id: PaymentId) -> Option<&Payment> {
        self.payments.iter().find(|payment| payment.id == id)
    }

    pub(crate) fn payment_mut(&mut self, id: PaymentId) -> Result<&mut Payment, EngineError> {
        self.payments
            .iter_mut()
            .find(|payment| payment.id == id)
            .ok_or(EngineError::not_found(crate::error::Entity::Payment, id.0))
    }

    /// Line items in display order.
    pub fn sorted_items(&self) -> Vec<&LineItem> {
        let mut items: Vec<&LineItem> = self.items.iter().collect();
        items.sort_by_key(|item| (item.sort_order, item.id));
        items
    }

    /// Recomputes totals from the items and, for invoices, the settlement from the payments.
    pub fn recalculate(&mut self) -> Result<(), EngineError> {
        let totals = compute_totals(&self.items, &self.document.discount, self.document.tax_rate)?;
        self.document.totals = totals;
        if let Details::Invoice(invoice) = &mut self.document.details {
            let settlement = reconcile(&self.payments, totals.total)?;
            invoice.amount_paid = settlement.amount_paid;
            invoice.amount_due = settlement.amount_due;
        }
        Ok(())
    }

    /// Applies the invoice status implied by the current settlement.
    ///
    /// Records `paid_at` the first time the invoice becomes paid. An invoice
    /// that took money while still a draft returns to `draft` once
    /// everything is refunded.
    pub(crate) fn settle(
        &mut self,
        now: DateTime<Utc>,
    ) -> Result<Option<StatusChange>, EngineError> {
        let current = self.document.status;
        let total = self.document.totals.total;
        let was_sent = self.document.sent_at.is_some();
        let Details::Invoice(invoice) = &mut self.document.details else {
            return Ok(None);
        };

        let mut next = status::settle_invoice(current, invoice.amount_paid, total)?;
        if next == Status::Sent && !was_sent {
            next = Status::Draft;
        }
        if next == Status::Paid && invoice.paid_at.is_none() {
            invoice.paid_at = Some(now);
        }
        if next == current {
            return Ok(None);
        }
        self.document.status = next;
        Ok(Some(StatusChange {
            from: current,
            to: next,
        }))
    }

    /// Whether a late fee line already exists.
    pub fn has_late_fee(&self) -> bool {
        self.items.iter().any(|item| item.is_late_fee)
    }
}

/// Input for a new estimate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEstimate {
    pub customer_id: CustomerId,
    pub title: String,
    pub description: Option<String>,
    pub valid_until: Option<DateTime<Utc>>,
    pub tax_rate: Decimal,
    pub discount: Discount,
    /// Pre-assigned number, for imports. Allocated when `None`.
    pub number: Option<DocumentNumber>,
}

impl NewEstimate {
    pub fn new(customer_id: CustomerId, title: impl Into<String>) -> Self {
        Self {
            customer_id,
            title: title.into(),
            description: None,
            valid_until: None,
            tax_rate: Decimal::ZERO,
            discount: Discount::none(),
            number: None,
        }
    }

    pub fn with_tax_rate(mut self, tax_rate: Decimal) -> Self {
        self.tax_rate = tax_rate;
        self
    }

    pub fn with_discount(mut self, discount: Discount) -> Self {
        self.discount = discount;
        self
    }

    pub fn valid_until(mut self, valid_until: DateTime<Utc>) -> Self {
        self.valid_until = Some(valid_until);
        self
    }
}

/// Input for a new invoice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInvoice {
    pub customer_id: CustomerId,
    pub title: String,
    pub description: Option<String>,
    /// Defaults to creation time.
    pub issue_date: Option<DateTime<Utc>>,
    /// Defaults to the issue date plus the configured payment terms.
    pub due_date: Option<DateTime<Utc>>,
    pub tax_rate: Decimal,
    pub discount: Discount,
    pub late_fee: Decimal,
    /// Defaults to the configured grace period.
    pub late_fee_days: Option<u32>,
    pub recurrence: Option<Recurrence>,
    pub number: Option<DocumentNumber>,
}

impl NewInvoice {
    pub fn new(customer_id: CustomerId, title: impl Into<String>) -> Self {
        Self {
            customer_id,
            title: title.into(),
            description: None,
            issue_date: None,
            due_date: None,
            tax_rate: Decimal::ZERO,
            discount: Discount::none(),
            late_fee: Decimal::ZERO,
            late_fee_days: None,
            recurrence: None,
            number: None,
        }
    }

    pub fn with_tax_rate(mut self, tax_rate: Decimal) -> Self {
        self.tax_rate = tax_rate;
        self
    }

    pub fn with_discount(mut self, discount: Discount) -> Self {
        self.discount = discount;
        self
    }

    pub fn due(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn with_late_fee(mut self, late_fee: Decimal, after_days: u32) -> Self {
        self.late_fee = late_fee;
        self.late_fee_days = Some(after_days);
        self
    }

    pub fn recurring(
        mut self,
        interval: RecurrenceInterval,
        end_date: Option<DateTime<Utc>>,
    ) -> Self {
        self.recurrence = Some(Recurrence { interval, end_date });
        self
    }
}

/// Header fields shared by both document types, validated.
pub(crate) struct Header {
    pub title: String,
    pub tax_rate: Decimal,
    pub discount: Discount,
}

impl Header {
    pub(crate) fn validate(
        title: String,
        tax_rate: Decimal,
        discount: Discount,
    ) -> Result<Self, EngineError> {
        if title.trim().is_empty() {
            return Err(EngineError::validation("document title must not be empty"));
        }
        let tax_rate = validate_tax_rate(tax_rate)?;
        discount.validate()?;
        Ok(Self {
            title,
            tax_rate,
            discount,
        })
    }
}

pub(crate) fn validate_late_fee(late_fee: Decimal) -> Result<Decimal, EngineError> {
    money::currency("late fee", late_fee)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Planned,
    Active,
    OnHold,
    Completed,
    Cancelled,
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProjectStatus::Planned => "planned",
            ProjectStatus::Active => "active",
            ProjectStatus::OnHold => "on_hold",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Job created from an accepted estimate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    pub id: ProjectId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub name: String,
    pub description: Option<String>,
    pub estimated_value: Decimal,
    pub status: ProjectStatus,
    pub start_date: DateTime<Utc>,
    pub source_estimate: DocumentId,
}
