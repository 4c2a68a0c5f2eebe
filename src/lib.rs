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

//! # Docket
//!
//! Consistency engine for estimates and invoices: it keeps document totals in
//! step with their line items, reconciles invoices against their payments,
//! enforces the document lifecycle and hands out collision-free document
//! numbers per tenant.
//!
//! ## Core Components
//!
//! - [`line_item`]: prices a single line from cost, markup, quantity and waste
//! - [`aggregate`]: subtotal, discount, tax and total of a document
//! - [`Sequencer`]: `EST-2025-0007` style numbers, unique per tenant
//! - [`status`]: estimate and invoice lifecycles
//! - [`ledger`]: payments, refunds and invoice settlement
//! - [`Engine`]: runs every change as one atomic unit of work
//!
//! ## Example
//!
//! ```
//! use docket::{CustomerId, Engine, LineItemKind, NewInvoice, NewLineItem, NewPayment,
//!     PaymentMethod, Status, TenantId};
//! use rust_decimal_macros::dec;
//!
//! let engine = Engine::new();
//! let tenant = TenantId(1);
//!
//! let input = NewInvoice::new(CustomerId(7), "Deck repair").with_tax_rate(dec!(0.08));
//! let invoice = engine.create_invoice(tenant, input).unwrap();
//!
//! let boards = NewLineItem::new(LineItemKind::Material, "Cedar boards", dec!(10), dec!(8.00))
//!     .with_markup(dec!(25))
//!     .with_waste_factor(dec!(0.10));
//! let (invoice, item) = engine.create_line_item(tenant, invoice.id, boards).unwrap();
//! assert_eq!(item.line_total, dec!(110.00));
//! assert_eq!(invoice.totals.total, dec!(118.80));
//!
//! engine.transition_status(tenant, invoice.id, Status::Sent).unwrap();
//! let check = NewPayment::completed(dec!(118.80), PaymentMethod::Check);
//! let (invoice, _) = engine.record_payment(tenant, invoice.id, check).unwrap();
//! assert_eq!(invoice.status, Status::Paid);
//! assert_eq!(invoice.amount_due(), dec!(0.00));
//! ```
//!
//! ## Thread Safety
//!
//! Operations on one document are serialized by a per-document lock; operations
//! on different documents proceed in parallel.

pub mod aggregate;
mod base;
pub mod clock;
pub mod config;
pub mod document;
mod engine;
pub mod error;
pub mod ledger;
pub mod line_item;
pub mod money;
pub mod sequence;
pub mod status;
pub mod store;

pub use aggregate::{Discount, DiscountType, DocumentTotals};
pub use base::{CustomerId, DocumentId, LineItemId, PaymentId, ProjectId, TenantId};
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::EngineConfig;
pub use document::{
    Document, DocumentRecord, NewEstimate, NewInvoice, Project, ProjectStatus, Recurrence,
    RecurrenceInterval,
};
pub use engine::{Engine, SweepReport};
pub use error::{EngineError, Entity};
pub use ledger::{
    MethodTotal, MonthlyTotal, NewPayment, NewRefund, Payment, PaymentMethod, PaymentStatus,
};
pub use line_item::{LineItem, LineItemKind, LineItemPatch, NewLineItem};
pub use sequence::{DocumentNumber, DocumentType, Sequencer};
pub use status::Status;
pub use store::{DocumentEvent, MemoryStore, Repository, UnitOfWork};
