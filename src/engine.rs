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

//! Document processing engine.
//!
//! The [`Engine`] is the only way to change a document. Every operation runs
//! as one unit of work against the owning document:
//!
//! 1. apply the mutation (line item, pricing, payment or status),
//! 2. reprice and re-aggregate the document from its full item set,
//! 3. reconcile the invoice against its full payment history,
//! 4. derive the payment-driven status (`partial`, `paid`, back to `sent`),
//! 5. commit everything, or nothing if any step failed.
//!
//! # Thread Safety
//!
//! Each document is locked for the whole read-modify-write, so two edits of
//! the same document serialize while edits of different documents run in
//! parallel. Document numbers come from the lock-free [`Sequencer`].

use crate::EngineError;
use crate::aggregate::{Discount, check_discount_fits, validate_tax_rate};
use crate::base::{DocumentId, LineItemId, PaymentId, ProjectId, TenantId};
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::document::{
    Details, Document, DocumentRecord, EstimateDetails, Header, InvoiceDetails, NewEstimate,
    NewInvoice, Project, ProjectStatus, Signature, validate_late_fee,
};
use crate::error::Entity;
use crate::ledger::{
    self, MethodTotal, MonthlyTotal, NewPayment, NewRefund, Payment, PaymentStatus,
    refunded_against,
};
use crate::line_item::{LineItem, LineItemKind, LineItemPatch, NewLineItem};
use crate::sequence::{DocumentNumber, DocumentType, Sequencer};
use crate::status::{self, Status};
use crate::store::{DocumentEvent, MemoryStore, Repository, UnitOfWork};
use chrono::{DateTime, Datelike, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, instrument};

/// Documents changed by one [`Engine::sweep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub overdue: usize,
}

#[derive(Debug, Default)]
struct IdGenerator {
    document: AtomicU64,
    line_item: AtomicU64,
    payment: AtomicU64,
    project: AtomicU64,
}

impl IdGenerator {
    fn next(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn document(&self) -> DocumentId {
        DocumentId(Self::next(&self.document))
    }

    fn line_item(&self) -> LineItemId {
        LineItemId(Self::next(&self.line_item))
    }

    fn payment(&self) -> PaymentId {
        PaymentId(Self::next(&self.payment))
    }

    fn project(&self) -> ProjectId {
        ProjectId(Self::next(&self.project))
    }
}

/// Financial document engine.
///
/// # Invariants
///
/// - `line_total == round(adjusted_quantity * unit_price, 2)` for every line item.
/// - `total == subtotal - discount_amount + tax_amount` after every committed operation.
/// - `amount_paid` is the sum of completed payments minus completed refunds;
///   `amount_due == total - amount_paid`.
/// - Document numbers are unique per tenant and never reused.
pub struct Engine<S: Repository = MemoryStore> {
    store: S,
    sequencer: Sequencer,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    ids: IdGenerator,
}

impl Engine<MemoryStore> {
    /// Creates an engine with default configuration and the system clock.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default(), Arc::new(SystemClock))
    }

    /// Creates an in-memory engine.
    pub fn with_config(config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        let store = MemoryStore::new(config.lock_timeout(), config.max_attempts);
        Self::with_store(store, config, clock)
    }
}

impl Default for Engine<MemoryStore> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Repository> Engine<S> {
    pub fn with_store(store: S, config: EngineConfig, clock: Arc<dyn Clock>) -> Self {
        Engine {
            store,
            sequencer: Sequencer::new(config.sequence_max_attempts),
            clock,
            config,
            ids: IdGenerator::default(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // === Numbers ===

    /// Allocates the next number for the tenant in the current year.
    ///
    /// # Errors
    ///
    /// - [`EngineError::ConcurrencyConflict`] - every attempt collided with an issued number.
    /// - [`EngineError::Validation`] - the year's sequence is exhausted.
    #[instrument(skip(self), fields(tenant = %tenant_id))]
    pub fn allocate_document_number(
        &self,
        tenant_id: TenantId,
        document_type: DocumentType,
    ) -> Result<DocumentNumber, EngineError> {
        let number = self
            .sequencer
            .allocate(tenant_id, document_type, self.now().year())?;
        info!(%number, "Allocated document number");
        Ok(number)
    }

    fn assign_number(
        &self,
        tenant_id: TenantId,
        document_type: DocumentType,
        imported: Option<DocumentNumber>,
    ) -> Result<DocumentNumber, EngineError> {
        match imported {
            Some(number) if number.document_type != document_type => Err(EngineError::validation(
                format!("{number} is not a valid {document_type} number"),
            )),
            Some(number) => {
                self.sequencer.reserve(tenant_id, number)?;
                Ok(number)
            }
            None => self.allocate_document_number(tenant_id, document_type),
        }
    }

    // === Documents ===

    /// Creates a draft estimate with a freshly allocated number.
    #[instrument(skip_all, fields(tenant = %tenant_id))]
    pub fn create_estimate(
        &self,
        tenant_id: TenantId,
        input: NewEstimate,
    ) -> Result<Document, EngineError> {
        let header = Header::validate(input.title, input.tax_rate, input.discount)?;
        let number = self.assign_number(tenant_id, DocumentType::Estimate, input.number)?;
        let now = self.now();

        let document = Document {
            id: self.ids.document(),
            tenant_id,
            customer_id: input.customer_id,
            number,
            title: header.title,
            description: input.description,
            status: Status::Draft,
            tax_rate: header.tax_rate,
            discount: header.discount,
            totals: Default::default(),
            created_at: now,
            sent_at: None,
            viewed_at: None,
            details: Details::Estimate(EstimateDetails {
                valid_until: input.valid_until,
                responded_at: None,
                signature: None,
                project_id: None,
            }),
        };
        self.insert(DocumentRecord::new(document))
    }

    /// Creates a draft invoice with a freshly allocated number.
    ///
    /// The issue date defaults to now and the due date to the issue date plus
    /// the configured payment terms.
    #[instrument(skip_all, fields(tenant = %tenant_id))]
    pub fn create_invoice(
        &self,
        tenant_id: TenantId,
        input: NewInvoice,
    ) -> Result<Document, EngineError> {
        let header = Header::validate(input.title, input.tax_rate, input.discount)?;
        let late_fee = validate_late_fee(input.late_fee)?;
        let now = self.now();
        let issue_date = input.issue_date.unwrap_or(now);
        let due_date = match input.due_date {
            Some(due_date) => due_date,
            None => self.default_due_date(issue_date)?,
        };
        if due_date < issue_date {
            return Err(EngineError::validation(format!(
                "due date {due_date} is before issue date {issue_date}"
            )));
        }
        let number = self.assign_number(tenant_id, DocumentType::Invoice, input.number)?;

        let document = Document {
            id: self.ids.document(),
            tenant_id,
            customer_id: input.customer_id,
            number,
            title: header.title,
            description: input.description,
            status: Status::Draft,
            tax_rate: header.tax_rate,
            discount: header.discount,
            totals: Default::default(),
            created_at: now,
            sent_at: None,
            viewed_at: None,
            details: Details::Invoice(InvoiceDetails {
                issue_date,
                due_date,
                amount_paid: Decimal::ZERO,
                amount_due: Decimal::ZERO,
                paid_at: None,
                late_fee,
                late_fee_days: input
                    .late_fee_days
                    .unwrap_or(self.config.default_late_fee_days),
                recurrence: input.recurrence,
                parent_invoice_id: None,
                estimate_id: None,
            }),
        };
        self.insert(DocumentRecord::new(document))
    }

    fn default_due_date(&self, issue_date: DateTime<Utc>) -> Result<DateTime<Utc>, EngineError> {
        let terms = Duration::days(i64::from(self.config.default_payment_terms_days));
        issue_date
            .checked_add_signed(terms)
            .ok_or_else(|| EngineError::validation("payment terms push the due date out of range"))
    }

    fn insert(&self, mut record: DocumentRecord) -> Result<Document, EngineError> {
        record.recalculate()?;
        let document = record.document.clone();
        let mut work = UnitOfWork::new(record);
        work.publish(DocumentEvent::Created {
            tenant_id: document.tenant_id,
            document_id: document.id,
            number: document.number,
        });
        self.store.insert(work)?;
        info!(
            document = %document.id,
            number = %document.number,
            total = %document.totals.total,
            "Document created"
        );
        Ok(document)
    }

    /// Consistent copy of a document with its line items and payments.
    pub fn snapshot(
        &self,
        tenant_id: TenantId,
        id: DocumentId,
    ) -> Result<DocumentRecord, EngineError> {
        self.store.snapshot(tenant_id, id)
    }

    /// Copies of every document, optionally limited to one tenant, in id order.
    pub fn snapshots(
        &self,
        tenant_id: Option<TenantId>,
    ) -> Result<Vec<DocumentRecord>, EngineError> {
        let mut records = Vec::new();
        for (tenant_id, id) in self.store.documents(tenant_id) {
            match self.store.snapshot(tenant_id, id) {
                Ok(record) => records.push(record),
                // Deleted since it was listed.
                Err(EngineError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(records)
    }

    /// Deletes a document together with its line items and payments.
    ///
    /// The document's number stays consumed.
    #[instrument(skip(self), fields(tenant = %tenant_id, document = %id))]
    pub fn delete_document(&self, tenant_id: TenantId, id: DocumentId) -> Result<(), EngineError> {
        let record = self.store.remove(tenant_id, id)?;
        info!(
            number = %record.document.number,
            items = record.items.len(),
            payments = record.payments.len(),
            "Document deleted"
        );
        Ok(())
    }

    pub fn project(&self, tenant_id: TenantId, id: ProjectId) -> Result<Project, EngineError> {
        self.store.project(tenant_id, id)
    }

    /// Removes and returns every event committed so far.
    pub fn drain_events(&self) -> Vec<DocumentEvent> {
        self.store.drain_events()
    }

    // === Line items ===

    /// Adds a line item and returns the refreshed document with the new item.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotFound`] - unknown document, or a parent item not on this document.
    /// - [`EngineError::Validation`] - invalid pricing input or a document that is no longer
    ///   editable.
    #[instrument(skip_all, fields(tenant = %tenant_id, document = %document_id))]
    pub fn create_line_item(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        input: NewLineItem,
    ) -> Result<(Document, LineItem), EngineError> {
        let id = self.ids.line_item();
        let now = self.now();
        self.store.transaction(tenant_id, document_id, |work| {
            work.record.document.ensure_editable()?;
            if let Some(parent) = input.parent_item_id {
                ensure_parent(&work.record, id, parent)?;
            }
            let item = LineItem::create(id, document_id, input)?;
            work.record.items.push(item.clone());
            propagate(work, now)?;
            debug!(item = %id, line_total = %item.line_total, "Line item created");
            Ok((work.record.document.clone(), item))
        })
    }

    /// Applies a patch to a line item and returns the refreshed document and item.
    #[instrument(skip_all, fields(tenant = %tenant_id, document = %document_id, item = %item_id))]
    pub fn update_line_item(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        item_id: LineItemId,
        patch: LineItemPatch,
    ) -> Result<(Document, LineItem), EngineError> {
        let now = self.now();
        self.store.transaction(tenant_id, document_id, |work| {
            work.record.document.ensure_editable()?;
            if let Some(Some(parent)) = patch.parent_item_id {
                ensure_parent(&work.record, item_id, parent)?;
            }
            let item = work.record.item_mut(item_id)?;
            item.apply(patch)?;
            let item = item.clone();
            propagate(work, now)?;
            debug!(line_total = %item.line_total, "Line item updated");
            Ok((work.record.document.clone(), item))
        })
    }

    /// Removes a line item. Its add-ons stay on the document as top-level lines.
    #[instrument(skip(self), fields(tenant = %tenant_id, document = %document_id, item = %item_id))]
    pub fn delete_line_item(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        item_id: LineItemId,
    ) -> Result<Document, EngineError> {
        let now = self.now();
        self.store.transaction(tenant_id, document_id, |work| {
            work.record.document.ensure_editable()?;
            let position = work
                .record
                .items
                .iter()
                .position(|item| item.id == item_id)
                .ok_or(EngineError::not_found(Entity::LineItem, item_id.0))?;
            work.record.items.remove(position);
            for child in work
                .record
                .items
                .iter_mut()
                .filter(|item| item.parent_item_id == Some(item_id))
            {
                child.parent_item_id = None;
                child.is_add_on = false;
            }
            propagate(work, now)?;
            debug!("Line item deleted");
            Ok(work.record.document.clone())
        })
    }

    /// Copies every line item of `source_id` onto `target_id`, in display order.
    ///
    /// Late fee lines are not copied. Parent links between copied items are kept.
    #[instrument(skip(self), fields(tenant = %tenant_id, source = %source_id, target = %target_id))]
    pub fn duplicate_line_items(
        &self,
        tenant_id: TenantId,
        source_id: DocumentId,
        target_id: DocumentId,
    ) -> Result<Document, EngineError> {
        if source_id == target_id {
            return Err(EngineError::validation(
                "cannot duplicate line items onto the same document",
            ));
        }
        let source = self.store.snapshot(tenant_id, source_id)?;
        let now = self.now();
        self.store.transaction(tenant_id, target_id, |work| {
            work.record.document.ensure_editable()?;
            let copies = self.copy_items(&source, target_id)?;
            let copied = copies.len();
            work.record.items.extend(copies);
            propagate(work, now)?;
            info!(copied, "Line items duplicated");
            Ok(work.record.document.clone())
        })
    }

    fn copy_items(
        &self,
        source: &DocumentRecord,
        target_id: DocumentId,
    ) -> Result<Vec<LineItem>, EngineError> {
        let sources: Vec<&LineItem> = source
            .sorted_items()
            .into_iter()
            .filter(|item| !item.is_late_fee)
            .collect();
        let new_ids: HashMap<LineItemId, LineItemId> = sources
            .iter()
            .map(|item| (item.id, self.ids.line_item()))
            .collect();

        let mut copies = Vec::with_capacity(sources.len());
        for item in sources {
            let Some(&id) = new_ids.get(&item.id) else {
                continue;
            };
            let mut copy = LineItem::create(id, target_id, item.to_new())?;
            copy.parent_item_id = item
                .parent_item_id
                .and_then(|parent| new_ids.get(&parent).copied());
            copies.push(copy);
        }
        Ok(copies)
    }

    // === Pricing ===

    /// Reprices every line and recomputes the document from scratch.
    ///
    /// Idempotent; intended for repair after imports or migrations.
    #[instrument(skip(self), fields(tenant = %tenant_id, document = %document_id))]
    pub fn recalculate_document(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<Document, EngineError> {
        let now = self.now();
        self.store.transaction(tenant_id, document_id, |work| {
            for item in &mut work.record.items {
                item.reprice()?;
            }
            propagate(work, now)?;
            Ok(work.record.document.clone())
        })
    }

    /// Sets the document's tax rate (0 to 1, four decimal places).
    #[instrument(skip(self), fields(tenant = %tenant_id, document = %document_id))]
    pub fn set_tax_rate(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        tax_rate: Decimal,
    ) -> Result<Document, EngineError> {
        let tax_rate = validate_tax_rate(tax_rate)?;
        let now = self.now();
        self.store.transaction(tenant_id, document_id, |work| {
            work.record.document.ensure_editable()?;
            work.record.document.tax_rate = tax_rate;
            propagate(work, now)?;
            Ok(work.record.document.clone())
        })
    }

    /// Sets the document's discount.
    ///
    /// # Errors
    ///
    /// [`EngineError::Validation`] for a percentage above 100 or a flat amount
    /// larger than the current subtotal.
    #[instrument(skip(self), fields(tenant = %tenant_id, document = %document_id))]
    pub fn set_discount(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        discount: Discount,
    ) -> Result<Document, EngineError> {
        discount.validate()?;
        let now = self.now();
        self.store.transaction(tenant_id, document_id, |work| {
            work.record.document.ensure_editable()?;
            work.record.recalculate()?;
            check_discount_fits(&discount, work.record.document.totals.subtotal)?;
            work.record.document.discount = discount;
            propagate(work, now)?;
            Ok(work.record.document.clone())
        })
    }

    // === Payments ===

    /// Records a pending or completed payment against an invoice.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Validation`] - invalid amount or fee, or the document is an estimate.
    /// - [`EngineError::InvalidTransition`] - the invoice is cancelled.
    #[instrument(skip_all, fields(tenant = %tenant_id, invoice = %invoice_id))]
    pub fn record_payment(
        &self,
        tenant_id: TenantId,
        invoice_id: DocumentId,
        input: NewPayment,
    ) -> Result<(Document, Payment), EngineError> {
        let id = self.ids.payment();
        let now = self.now();
        self.store.transaction(tenant_id, invoice_id, |work| {
            let document = &work.record.document;
            ensure_accepts_payment(document, input.amount)?;
            let payment = Payment::record(id, document.id, document.customer_id, input, now)?;
            work.record.payments.push(payment.clone());
            propagate(work, now)?;
            if payment.status == PaymentStatus::Completed {
                publish_completed(work, &payment);
            }
            info!(
                payment = %id,
                amount = %payment.amount,
                status = %payment.status,
                "Payment recorded"
            );
            Ok((work.record.document.clone(), payment))
        })
    }

    /// Completes a pending or processing payment (or refund).
    #[instrument(
        skip(self),
        fields(tenant = %tenant_id, invoice = %invoice_id, payment = %payment_id)
    )]
    pub fn complete_payment(
        &self,
        tenant_id: TenantId,
        invoice_id: DocumentId,
        payment_id: PaymentId,
    ) -> Result<(Document, Payment), EngineError> {
        let now = self.now();
        self.store.transaction(tenant_id, invoice_id, |work| {
            let payment = work.record.payment_mut(payment_id)?;
            if !payment.is_refund {
                let amount = payment.amount;
                ensure_accepts_payment(&work.record.document, amount)?;
            }
            let payment = work.record.payment_mut(payment_id)?;
            payment.complete(now)?;
            let payment = payment.clone();
            propagate(work, now)?;
            publish_completed(work, &payment);
            info!(amount = %payment.amount, "Payment completed");
            Ok((work.record.document.clone(), payment))
        })
    }

    /// Fails a pending or processing payment, appending `reason` to its notes.
    #[instrument(
        skip(self),
        fields(tenant = %tenant_id, invoice = %invoice_id, payment = %payment_id)
    )]
    pub fn fail_payment(
        &self,
        tenant_id: TenantId,
        invoice_id: DocumentId,
        payment_id: PaymentId,
        reason: Option<&str>,
    ) -> Result<(Document, Payment), EngineError> {
        let now = self.now();
        self.store.transaction(tenant_id, invoice_id, |work| {
            let payment = work.record.payment_mut(payment_id)?;
            payment.fail(reason, now)?;
            let payment = payment.clone();
            propagate(work, now)?;
            info!("Payment failed");
            Ok((work.record.document.clone(), payment))
        })
    }

    /// Moves a pending payment to processing.
    pub fn mark_payment_processing(
        &self,
        tenant_id: TenantId,
        invoice_id: DocumentId,
        payment_id: PaymentId,
    ) -> Result<(Document, Payment), EngineError> {
        self.store.transaction(tenant_id, invoice_id, |work| {
            let payment = work.record.payment_mut(payment_id)?;
            payment.mark_processing()?;
            let payment = payment.clone();
            Ok((work.record.document.clone(), payment))
        })
    }

    /// Cancels a pending or processing payment.
    pub fn cancel_payment(
        &self,
        tenant_id: TenantId,
        invoice_id: DocumentId,
        payment_id: PaymentId,
    ) -> Result<(Document, Payment), EngineError> {
        let now = self.now();
        self.store.transaction(tenant_id, invoice_id, |work| {
            let payment = work.record.payment_mut(payment_id)?;
            payment.cancel(now)?;
            let payment = payment.clone();
            propagate(work, now)?;
            Ok((work.record.document.clone(), payment))
        })
    }

    /// Refunds part or all of a completed payment.
    ///
    /// # Errors
    ///
    /// - [`EngineError::NotFound`] - the payment does not belong to this invoice.
    /// - [`EngineError::Validation`] - the original is not a completed payment, or the
    ///   refunds against it would exceed its amount.
    #[instrument(
        skip(self, input),
        fields(tenant = %tenant_id, invoice = %invoice_id, original = %payment_id)
    )]
    pub fn create_refund(
        &self,
        tenant_id: TenantId,
        invoice_id: DocumentId,
        payment_id: PaymentId,
        input: NewRefund,
    ) -> Result<(Document, Payment), EngineError> {
        let id = self.ids.payment();
        let now = self.now();
        self.store.transaction(tenant_id, invoice_id, |work| {
            let original = work
                .record
                .payment(payment_id)
                .ok_or(EngineError::not_found(Entity::Payment, payment_id.0))?;
            let already_refunded = refunded_against(&work.record.payments, payment_id)?;
            let refund = Payment::refund_of(id, original, already_refunded, input, now)?;
            work.record.payments.push(refund.clone());
            propagate(work, now)?;
            work.publish(DocumentEvent::RefundCreated {
                document_id: invoice_id,
                payment_id: id,
                original_payment_id: payment_id,
                amount: refund.amount,
            });
            if refund.status == PaymentStatus::Completed {
                publish_completed(work, &refund);
            }
            info!(refund = %id, amount = %refund.amount, "Refund created");
            Ok((work.record.document.clone(), refund))
        })
    }

    // === Status ===

    /// Requests a status change and returns the resulting status.
    ///
    /// Converting an estimate also creates its project. `partial` and `paid`
    /// are derived from payments and cannot be requested.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidTransition`] for any change outside the allow-list.
    #[instrument(skip(self), fields(tenant = %tenant_id, document = %document_id))]
    pub fn transition_status(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        target: Status,
    ) -> Result<Status, EngineError> {
        let now = self.now();
        self.store.transaction(tenant_id, document_id, |work| {
            self.change_status(work, target, now)?;
            Ok(work.record.document.status)
        })
    }

    /// Records that the customer opened the document.
    ///
    /// The first view stamps `viewed_at` and moves a sent document to viewed;
    /// later views change nothing.
    #[instrument(skip(self), fields(tenant = %tenant_id, document = %document_id))]
    pub fn record_view(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<Document, EngineError> {
        let now = self.now();
        self.store.transaction(tenant_id, document_id, |work| {
            if work.record.document.viewed_at.is_none() {
                if work.record.document.status == Status::Sent {
                    self.change_status(work, Status::Viewed, now)?;
                } else {
                    work.record.document.viewed_at = Some(now);
                }
            }
            Ok(work.record.document.clone())
        })
    }

    /// Accepts a sent or viewed estimate, optionally capturing the signer's name.
    #[instrument(skip(self), fields(tenant = %tenant_id, document = %document_id))]
    pub fn accept_estimate(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        signer_name: Option<&str>,
    ) -> Result<Document, EngineError> {
        let signer_name = match signer_name.map(str::trim) {
            Some("") => return Err(EngineError::validation("signer name must not be empty")),
            other => other.map(str::to_string),
        };
        let now = self.now();
        self.store.transaction(tenant_id, document_id, |work| {
            self.change_status(work, Status::Accepted, now)?;
            if let Some(signer_name) = signer_name {
                work.record.document.estimate_mut()?.signature = Some(Signature {
                    signer_name,
                    signed_at: now,
                });
            }
            Ok(work.record.document.clone())
        })
    }

    /// Converts an accepted estimate into a planned project.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidTransition`] unless the estimate is accepted, which
    /// includes a second conversion.
    #[instrument(skip(self), fields(tenant = %tenant_id, document = %document_id))]
    pub fn convert_estimate(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<(Document, Project), EngineError> {
        let now = self.now();
        self.store.transaction(tenant_id, document_id, |work| {
            let document = &work.record.document;
            if document.document_type() != DocumentType::Estimate {
                return Err(EngineError::validation(format!(
                    "{} is not an estimate",
                    document.number
                )));
            }
            let project = self
                .change_status(work, Status::Converted, now)?
                .ok_or_else(|| EngineError::validation("conversion did not create a project"))?;
            Ok((work.record.document.clone(), project))
        })
    }

    fn change_status(
        &self,
        work: &mut UnitOfWork,
        target: Status,
        now: DateTime<Utc>,
    ) -> Result<Option<Project>, EngineError> {
        let document = &work.record.document;
        let current = document.status;
        let next = status::transition(
            document.document_type(),
            current,
            target,
            &document.transition_context(now),
        )?;
        if next == current {
            return Ok(None);
        }

        let project = match next {
            Status::Converted => Some(self.stage_project(work, now)?),
            _ => None,
        };

        let document = &mut work.record.document;
        match next {
            Status::Sent => document.sent_at = Some(now),
            Status::Viewed => {
                document.viewed_at.get_or_insert(now);
            }
            Status::Accepted | Status::Rejected => {
                document.estimate_mut()?.responded_at = Some(now);
            }
            _ => {}
        }
        document.status = next;
        let document_id = document.id;
        info!(
            document = %document_id,
            number = %document.number,
            from = %current,
            to = %next,
            "Status changed"
        );
        work.publish(DocumentEvent::StatusChanged {
            document_id,
            from: current,
            to: next,
        });
        Ok(project)
    }

    fn stage_project(
        &self,
        work: &mut UnitOfWork,
        now: DateTime<Utc>,
    ) -> Result<Project, EngineError> {
        let document = &work.record.document;
        let project = Project {
            id: self.ids.project(),
            tenant_id: document.tenant_id,
            customer_id: document.customer_id,
            name: document.title.clone(),
            description: document.description.clone(),
            estimated_value: document.total(),
            status: ProjectStatus::Planned,
            start_date: now,
            source_estimate: document.id,
        };
        let document_id = document.id;
        work.record.document.estimate_mut()?.project_id = Some(project.id);
        work.add_project(project.clone());
        work.publish(DocumentEvent::ProjectCreated {
            document_id,
            project_id: project.id,
        });
        info!(project = %project.id, value = %project.estimated_value, "Project created");
        Ok(project)
    }

    // === Invoicing ===

    /// Creates a draft invoice from an accepted or converted estimate, copying
    /// its customer, pricing and line items.
    #[instrument(skip(self), fields(tenant = %tenant_id, estimate = %estimate_id))]
    pub fn create_invoice_from_estimate(
        &self,
        tenant_id: TenantId,
        estimate_id: DocumentId,
        due_date: Option<DateTime<Utc>>,
    ) -> Result<Document, EngineError> {
        let source = self.store.snapshot(tenant_id, estimate_id)?;
        let estimate = &source.document;
        if estimate.document_type() != DocumentType::Estimate {
            return Err(EngineError::validation(format!(
                "{} is not an estimate",
                estimate.number
            )));
        }
        if !matches!(estimate.status, Status::Accepted | Status::Converted) {
            return Err(EngineError::validation(format!(
                "{} must be accepted before invoicing (currently {})",
                estimate.number, estimate.status
            )));
        }

        let now = self.now();
        let due_date = match due_date {
            Some(due_date) => due_date,
            None => self.default_due_date(now)?,
        };
        if due_date < now {
            return Err(EngineError::validation(format!(
                "due date {due_date} is in the past"
            )));
        }
        let number = self.allocate_document_number(tenant_id, DocumentType::Invoice)?;
        let id = self.ids.document();

        let document = Document {
            id,
            tenant_id,
            customer_id: estimate.customer_id,
            number,
            title: estimate.title.clone(),
            description: estimate.description.clone(),
            status: Status::Draft,
            tax_rate: estimate.tax_rate,
            discount: estimate.discount,
            totals: Default::default(),
            created_at: now,
            sent_at: None,
            viewed_at: None,
            details: Details::Invoice(InvoiceDetails {
                issue_date: now,
                due_date,
                amount_paid: Decimal::ZERO,
                amount_due: Decimal::ZERO,
                paid_at: None,
                late_fee: Decimal::ZERO,
                late_fee_days: self.config.default_late_fee_days,
                recurrence: None,
                parent_invoice_id: None,
                estimate_id: Some(estimate_id),
            }),
        };
        let mut record = DocumentRecord::new(document);
        record.items = self.copy_items(&source, id)?;
        self.insert(record)
    }

    /// Adds the invoice's late fee once it is overdue by at least its grace period.
    ///
    /// Returns `None` when no fee applies: no late fee configured, not overdue
    /// long enough, or the fee was already added.
    #[instrument(skip(self), fields(tenant = %tenant_id, invoice = %invoice_id))]
    pub fn apply_late_fee(
        &self,
        tenant_id: TenantId,
        invoice_id: DocumentId,
    ) -> Result<Option<Document>, EngineError> {
        let id = self.ids.line_item();
        let now = self.now();
        self.store.transaction(tenant_id, invoice_id, |work| {
            let document = &work.record.document;
            let invoice = document.invoice().ok_or_else(|| {
                EngineError::validation(format!("{} is not an invoice", document.number))
            })?;
            let days_overdue = document.days_overdue(now);
            if invoice.late_fee <= Decimal::ZERO
                || days_overdue == 0
                || days_overdue < i64::from(invoice.late_fee_days)
                || work.record.has_late_fee()
            {
                return Ok(None);
            }

            let late_fee = invoice.late_fee;
            let sort_order = work
                .record
                .items
                .iter()
                .map(|item| item.sort_order)
                .max()
                .map_or(0, |max| max.saturating_add(1));
            let input = NewLineItem::new(
                LineItemKind::Other,
                format!("Late fee ({days_overdue} days overdue)"),
                Decimal::ONE,
                late_fee,
            )
            .with_sort_order(sort_order);
            let mut item = LineItem::create(id, invoice_id, input)?;
            item.is_late_fee = true;
            work.record.items.push(item);
            propagate(work, now)?;
            info!(%late_fee, days_overdue, "Late fee applied");
            Ok(Some(work.record.document.clone()))
        })
    }

    /// Issues the next invoice of a recurring series.
    ///
    /// Returns `None` for a non-recurring invoice or once the next due date
    /// would pass the series' end date.
    #[instrument(skip(self), fields(tenant = %tenant_id, invoice = %invoice_id))]
    pub fn create_recurring_invoice(
        &self,
        tenant_id: TenantId,
        invoice_id: DocumentId,
    ) -> Result<Option<Document>, EngineError> {
        let source = self.store.snapshot(tenant_id, invoice_id)?;
        let parent = &source.document;
        let invoice = parent.invoice().ok_or_else(|| {
            EngineError::validation(format!("{} is not an invoice", parent.number))
        })?;
        let Some(recurrence) = invoice.recurrence else {
            return Ok(None);
        };
        let due_date = recurrence.interval.advance(invoice.due_date).ok_or_else(|| {
            let after = invoice.due_date;
            EngineError::validation(format!("next due date after {after} is out of range"))
        })?;
        if recurrence.end_date.is_some_and(|end_date| due_date > end_date) {
            debug!(%due_date, "Recurring series has ended");
            return Ok(None);
        }

        let now = self.now();
        let number = self.allocate_document_number(tenant_id, DocumentType::Invoice)?;
        let id = self.ids.document();
        let document = Document {
            id,
            tenant_id,
            customer_id: parent.customer_id,
            number,
            title: parent.title.clone(),
            description: parent.description.clone(),
            status: Status::Draft,
            tax_rate: parent.tax_rate,
            discount: parent.discount,
            totals: Default::default(),
            created_at: now,
            sent_at: None,
            viewed_at: None,
            details: Details::Invoice(InvoiceDetails {
                issue_date: now,
                due_date,
                amount_paid: Decimal::ZERO,
                amount_due: Decimal::ZERO,
                paid_at: None,
                late_fee: invoice.late_fee,
                late_fee_days: invoice.late_fee_days,
                recurrence: Some(recurrence),
                parent_invoice_id: Some(invoice_id),
                estimate_id: invoice.estimate_id,
            }),
        };
        let mut record = DocumentRecord::new(document);
        record.items = self.copy_items(&source, id)?;
        self.insert(record).map(Some)
    }

    // === Reports ===

    fn tenant_payments(&self, tenant_id: TenantId) -> Result<Vec<Payment>, EngineError> {
        Ok(self
            .snapshots(Some(tenant_id))?
            .into_iter()
            .flat_map(|record| record.payments)
            .collect())
    }

    /// Completed payments of the tenant grouped by method, optionally limited
    /// to payment dates within `[from, to]`.
    #[instrument(skip(self), fields(tenant = %tenant_id))]
    pub fn payment_totals_by_method(
        &self,
        tenant_id: TenantId,
        range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> Result<Vec<MethodTotal>, EngineError> {
        ledger::totals_by_method(&self.tenant_payments(tenant_id)?, range)
    }

    /// Completed payments of the tenant per month of `year`, all twelve months included.
    #[instrument(skip(self), fields(tenant = %tenant_id))]
    pub fn monthly_payment_totals(
        &self,
        tenant_id: TenantId,
        year: i32,
    ) -> Result<Vec<MonthlyTotal>, EngineError> {
        ledger::monthly_totals(&self.tenant_payments(tenant_id)?, year)
    }

    /// Payments of the tenant that failed within the last `days` days, newest first.
    #[instrument(skip(self), fields(tenant = %tenant_id))]
    pub fn failed_payments(
        &self,
        tenant_id: TenantId,
        days: u32,
    ) -> Result<Vec<Payment>, EngineError> {
        let payments = self.tenant_payments(tenant_id)?;
        Ok(ledger::recent_failures(&payments, days, self.now()))
    }

    // === Sweep ===

    /// Marks estimates past `valid_until` as expired and invoices past their
    /// due date as overdue.
    ///
    /// Idempotent: documents already expired or overdue are left alone.
    #[instrument(skip(self))]
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, EngineError> {
        let mut report = SweepReport::default();
        for (tenant_id, id) in self.store.documents(None) {
            let outcome = self.store.transaction(tenant_id, id, |work| {
                let Some(target) = sweep_target(&work.record.document, now) else {
                    return Ok(None);
                };
                self.change_status(work, target, now)?;
                Ok(Some(target))
            });
            match outcome {
                Ok(Some(Status::Expired)) => report.expired += 1,
                Ok(Some(_)) => report.overdue += 1,
                Ok(None) => {}
                // Deleted since it was listed.
                Err(EngineError::NotFound { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        info!(expired = report.expired, overdue = report.overdue, "Sweep finished");
        Ok(report)
    }
}

fn sweep_target(document: &Document, now: DateTime<Utc>) -> Option<Status> {
    use Status::*;
    match document.document_type() {
        DocumentType::Estimate
            if document.is_expired(now)
                && matches!(document.status, Draft | PendingApproval | Sent | Viewed | Accepted) =>
        {
            Some(Expired)
        }
        DocumentType::Invoice
            if document.invoice().is_some_and(|invoice| now > invoice.due_date)
                && matches!(document.status, Sent | Viewed | Partial) =>
        {
            Some(Overdue)
        }
        _ => None,
    }
}

/// Recomputes derived fields and applies the payment-driven status.
fn propagate(work: &mut UnitOfWork, now: DateTime<Utc>) -> Result<(), EngineError> {
    let before = work.record.document.totals;
    work.record.recalculate()?;

    let document_id = work.record.document.id;
    let totals = work.record.document.totals;
    if totals != before {
        debug!(
            document = %document_id,
            subtotal = %totals.subtotal,
            total = %totals.total,
            "Totals recalculated"
        );
        work.publish(DocumentEvent::TotalsRecalculated { document_id, totals });
    }

    if let Some(change) = work.record.settle(now)? {
        info!(
            document = %document_id,
            from = %change.from,
            to = %change.to,
            "Status derived from payments"
        );
        work.publish(DocumentEvent::StatusChanged {
            document_id,
            from: change.from,
            to: change.to,
        });
    }
    Ok(())
}

fn publish_completed(work: &mut UnitOfWork, payment: &Payment) {
    work.publish(DocumentEvent::PaymentCompleted {
        document_id: payment.invoice_id,
        payment_id: payment.id,
        amount: payment.amount,
        is_refund: payment.is_refund,
    });
}

/// Rejects a parent that is missing or would close a cycle through `item_id`.
fn ensure_parent(
    record: &DocumentRecord,
    item_id: LineItemId,
    parent_id: LineItemId,
) -> Result<(), EngineError> {
    if parent_id == item_id {
        return Err(EngineError::validation("line item cannot be its own parent"));
    }
    let mut ancestor = record
        .item(parent_id)
        .ok_or_else(|| EngineError::not_found(Entity::LineItem, parent_id.0))?;
    // A well-formed chain is never longer than the item list.
    for _ in 0..record.items.len() {
        let Some(next) = ancestor.parent_item_id else {
            return Ok(());
        };
        if next == item_id {
            return Err(EngineError::validation(format!(
                "line item {parent_id} is already an add-on of {item_id}"
            )));
        }
        match record.item(next) {
            Some(item) => ancestor = item,
            None => return Ok(()),
        }
    }
    Err(EngineError::validation(format!(
        "line item {parent_id} has a cyclic parent chain"
    )))
}

fn ensure_accepts_payment(document: &Document, amount: Decimal) -> Result<(), EngineError> {
    let invoice = document.invoice().ok_or_else(|| {
        EngineError::validation(format!("{} is not an invoice", document.number))
    })?;
    if document.status == Status::Cancelled {
        let requested = if amount >= invoice.amount_due {
            Status::Paid
        } else {
            Status::Partial
        };
        return Err(EngineError::InvalidTransition {
            current: Status::Cancelled.as_str(),
            requested: requested.as_str(),
        });
    }
    Ok(())
}
