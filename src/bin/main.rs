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

use chrono::{DateTime, NaiveDate, Utc};
use clap::Parser;
use csv::{ReaderBuilder, Trim, Writer};
use docket::{
    Clock, CustomerId, Discount, DocumentId, Engine, EngineConfig, EngineError, FixedClock,
    LineItemId, LineItemKind, NewEstimate, NewInvoice, NewLineItem, NewPayment, NewRefund,
    PaymentId, PaymentMethod, Status, TenantId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Docket - Replay estimate and invoice operations
///
/// Reads operations from a CSV file, applies them through the document engine
/// and writes the resulting document totals to stdout.
#[derive(Parser, Debug)]
#[command(name = "docket")]
#[command(about = "Replays estimate and invoice operations from a CSV file", long_about = None)]
struct Args {
    /// Path to CSV file with operations
    ///
    /// Expected format: op,tenant,doc,ref,kind,quantity,unit_cost,markup,waste,amount,target
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// Engine configuration file (TOML, YAML or JSON)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Date the replay runs on, for document numbers and due dates
    #[arg(long, value_name = "YYYY-MM-DD")]
    today: Option<NaiveDate>,

    /// Abort on the first failing row instead of skipping it
    #[arg(long)]
    strict: bool,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match EngineConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            error!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let today = args.today.map_or_else(Utc::now, start_of_day);
    let replay = Replay::new(config, today, args.strict);
    let engine = match replay.run(BufReader::new(file)) {
        Ok(engine) => engine,
        Err(e) => {
            error!("Error replaying operations: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = write_documents(&engine, std::io::stdout()) {
        error!("Error writing output: {e}");
        process::exit(1);
    }
}

fn start_of_day(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Raw CSV record matching the input format.
///
/// `doc` and `ref` are caller-side aliases for documents, line items and payments.
#[derive(Debug, Deserialize)]
struct CsvRecord {
    op: String,
    tenant: u32,
    #[serde(default)]
    doc: String,
    #[serde(rename = "ref", default, deserialize_with = "csv::invalid_option")]
    reference: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    kind: Option<String>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    quantity: Option<Decimal>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    unit_cost: Option<Decimal>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    markup: Option<Decimal>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    waste: Option<Decimal>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    amount: Option<Decimal>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    target: Option<String>,
}

/// Why a single row could not be applied.
#[derive(Debug, Error)]
pub enum RowError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("unknown {kind} '{alias}'")]
    UnknownAlias { kind: &'static str, alias: String },

    #[error("{kind} '{alias}' is already defined")]
    DuplicateAlias { kind: &'static str, alias: String },

    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error("row {row}: {source}")]
    Row { row: u64, source: RowError },
}

/// Applies CSV operations to an engine, resolving aliases to ids.
struct Replay {
    engine: Engine,
    clock: Arc<FixedClock>,
    strict: bool,
    documents: HashMap<(TenantId, String), DocumentId>,
    items: HashMap<(DocumentId, String), LineItemId>,
    payments: HashMap<(DocumentId, String), PaymentId>,
}

impl Replay {
    fn new(config: EngineConfig, today: DateTime<Utc>, strict: bool) -> Self {
        let clock = Arc::new(FixedClock::new(today));
        Self {
            engine: Engine::with_config(config, clock.clone()),
            clock,
            strict,
            documents: HashMap::new(),
            items: HashMap::new(),
            payments: HashMap::new(),
        }
    }

    /// Replays every row of `reader` and returns the resulting engine.
    ///
    /// Malformed rows and rows the engine rejects are logged and skipped,
    /// unless the replay is strict.
    ///
    /// # CSV Format
    ///
    /// | op | uses |
    /// |----|------|
    /// | `estimate`, `invoice` | `doc`, `amount` (tax rate), `target` (valid until / due date) |
    /// | `item` | `doc`, `ref`, `kind`, `quantity`, `unit_cost`, `markup`, `waste` |
    /// | `remove_item` | `doc`, `ref` |
    /// | `tax`, `discount_amount`, `discount_percent` | `doc`, `amount` |
    /// | `payment` | `doc`, `ref`, `amount`, `kind` (method), `target` (`pending`) |
    /// | `complete`, `fail` | `doc`, `ref`, `target` (failure reason) |
    /// | `refund` | `doc`, `ref` (original payment), `amount` (empty for the remainder) |
    /// | `status` | `doc`, `target` |
    /// | `recalculate` | `doc` |
    /// | `sweep` | `target` (date, defaults to today) |
    ///
    /// # Errors
    ///
    /// Returns a CSV error if the reader fails, or the first row error when strict.
    fn run<R: Read>(mut self, reader: R) -> Result<Engine, ReplayError> {
        let mut rdr = ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .has_headers(true)
            .from_reader(reader);

        for (index, result) in rdr.deserialize::<CsvRecord>().enumerate() {
            // Header is line 1.
            let row = index as u64 + 2;
            let outcome = match result {
                Ok(record) => self.apply(record),
                Err(e) if e.is_io_error() => return Err(e.into()),
                Err(e) => {
                    if self.strict {
                        return Err(e.into());
                    }
                    warn!(row, "Skipping malformed row: {e}");
                    continue;
                }
            };

            if let Err(source) = outcome {
                if self.strict {
                    return Err(ReplayError::Row { row, source });
                }
                warn!(row, "Skipping row: {source}");
            }
        }

        info!(documents = self.documents.len(), "Replay finished");
        Ok(self.engine)
    }

    fn apply(&mut self, record: CsvRecord) -> Result<(), RowError> {
        let tenant = TenantId(record.tenant);
        match record.op.to_lowercase().as_str() {
            "estimate" => {
                self.ensure_new_document(tenant, &record.doc)?;
                let mut input = NewEstimate::new(CustomerId(record.tenant), record.doc.clone())
                    .with_tax_rate(record.amount.unwrap_or_default());
                if let Some(date) = record.target.as_deref() {
                    input = input.valid_until(parse_date(date)?);
                }
                let document = self.engine.create_estimate(tenant, input)?;
                self.documents.insert((tenant, record.doc), document.id);
                Ok(())
            }
            "invoice" => {
                self.ensure_new_document(tenant, &record.doc)?;
                let mut input = NewInvoice::new(CustomerId(record.tenant), record.doc.clone())
                    .with_tax_rate(record.amount.unwrap_or_default());
                if let Some(date) = record.target.as_deref() {
                    input = input.due(parse_date(date)?);
                }
                let document = self.engine.create_invoice(tenant, input)?;
                self.documents.insert((tenant, record.doc), document.id);
                Ok(())
            }
            "item" => {
                let document_id = self.document(tenant, &record.doc)?;
                let alias = required(record.reference, "ref")?;
                let kind: LineItemKind = match record.kind.as_deref() {
                    Some(kind) => kind.parse()?,
                    None => LineItemKind::default(),
                };
                let input = NewLineItem::new(
                    kind,
                    alias.clone(),
                    required(record.quantity, "quantity")?,
                    required(record.unit_cost, "unit_cost")?,
                )
                .with_markup(record.markup.unwrap_or_default())
                .with_waste_factor(record.waste.unwrap_or_default());
                let key = (document_id, alias);
                if self.items.contains_key(&key) {
                    return Err(RowError::DuplicateAlias {
                        kind: "line item",
                        alias: key.1,
                    });
                }
                let (_, item) = self.engine.create_line_item(tenant, document_id, input)?;
                self.items.insert(key, item.id);
                Ok(())
            }
            "remove_item" => {
                let document_id = self.document(tenant, &record.doc)?;
                let alias = required(record.reference, "ref")?;
                let key = (document_id, alias);
                let item_id = *self.items.get(&key).ok_or_else(|| RowError::UnknownAlias {
                    kind: "line item",
                    alias: key.1.clone(),
                })?;
                self.engine.delete_line_item(tenant, document_id, item_id)?;
                self.items.remove(&key);
                Ok(())
            }
            "tax" => {
                let document_id = self.document(tenant, &record.doc)?;
                let rate = required(record.amount, "amount")?;
                self.engine.set_tax_rate(tenant, document_id, rate)?;
                Ok(())
            }
            "discount_amount" | "discount_percent" => {
                let document_id = self.document(tenant, &record.doc)?;
                let value = required(record.amount, "amount")?;
                let discount = if record.op.eq_ignore_ascii_case("discount_amount") {
                    Discount::amount(value)
                } else {
                    Discount::percentage(value)
                };
                self.engine.set_discount(tenant, document_id, discount)?;
                Ok(())
            }
            "payment" => {
                let document_id = self.document(tenant, &record.doc)?;
                let alias = required(record.reference, "ref")?;
                let amount = required(record.amount, "amount")?;
                let method: PaymentMethod = match record.kind.as_deref() {
                    Some(method) => method.parse()?,
                    None => PaymentMethod::default(),
                };
                let input = match record.target.as_deref() {
                    Some(status) if status.eq_ignore_ascii_case("pending") => {
                        NewPayment::pending(amount, method)
                    }
                    _ => NewPayment::completed(amount, method),
                };
                let key = (document_id, alias);
                if self.payments.contains_key(&key) {
                    return Err(RowError::DuplicateAlias {
                        kind: "payment",
                        alias: key.1,
                    });
                }
                let (_, payment) = self.engine.record_payment(tenant, document_id, input)?;
                self.payments.insert(key, payment.id);
                Ok(())
            }
            "complete" => {
                let (document_id, payment_id) = self.payment(tenant, &record)?;
                self.engine.complete_payment(tenant, document_id, payment_id)?;
                Ok(())
            }
            "fail" => {
                let (document_id, payment_id) = self.payment(tenant, &record)?;
                self.engine
                    .fail_payment(tenant, document_id, payment_id, record.target.as_deref())?;
                Ok(())
            }
            "refund" => {
                let (document_id, payment_id) = self.payment(tenant, &record)?;
                let input = match record.amount {
                    Some(amount) => NewRefund::completed(amount),
                    None => NewRefund::full(),
                };
                self.engine.create_refund(tenant, document_id, payment_id, input)?;
                Ok(())
            }
            "status" => {
                let document_id = self.document(tenant, &record.doc)?;
                let target: Status = required(record.target, "target")?.parse()?;
                self.engine.transition_status(tenant, document_id, target)?;
                Ok(())
            }
            "recalculate" => {
                let document_id = self.document(tenant, &record.doc)?;
                self.engine.recalculate_document(tenant, document_id)?;
                Ok(())
            }
            "sweep" => {
                let now = match record.target.as_deref() {
                    Some(date) => parse_date(date)?,
                    None => self.clock.now(),
                };
                self.engine.sweep(now)?;
                Ok(())
            }
            other => Err(RowError::UnknownOperation(other.to_string())),
        }
    }

    fn ensure_new_document(&self, tenant: TenantId, alias: &str) -> Result<(), RowError> {
        if self.documents.contains_key(&(tenant, alias.to_string())) {
            return Err(RowError::DuplicateAlias {
                kind: "document",
                alias: alias.to_string(),
            });
        }
        Ok(())
    }

    fn document(&self, tenant: TenantId, alias: &str) -> Result<DocumentId, RowError> {
        self.documents
            .get(&(tenant, alias.to_string()))
            .copied()
            .ok_or_else(|| RowError::UnknownAlias {
                kind: "document",
                alias: alias.to_string(),
            })
    }

    fn payment(
        &self,
        tenant: TenantId,
        record: &CsvRecord,
    ) -> Result<(DocumentId, PaymentId), RowError> {
        let document_id = self.document(tenant, &record.doc)?;
        let alias = record.reference.clone().ok_or(RowError::MissingField("ref"))?;
        let payment_id = self
            .payments
            .get(&(document_id, alias.clone()))
            .copied()
            .ok_or(RowError::UnknownAlias {
                kind: "payment",
                alias,
            })?;
        Ok((document_id, payment_id))
    }
}

fn required<T>(value: Option<T>, field: &'static str) -> Result<T, RowError> {
    value.ok_or(RowError::MissingField(field))
}

fn parse_date(value: &str) -> Result<DateTime<Utc>, RowError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(start_of_day)
        .map_err(|_| RowError::InvalidDate(value.to_string()))
}

/// One output row per document.
#[derive(Debug, Serialize)]
struct DocumentRow {
    number: String,
    status: Status,
    subtotal: String,
    discount: String,
    tax: String,
    total: String,
    amount_paid: String,
    amount_due: String,
}

fn money(value: Decimal) -> String {
    format!("{value:.2}")
}

/// Write document totals to a CSV writer, in creation order.
///
/// # CSV Format
///
/// Columns: `number, status, subtotal, discount, tax, total, amount_paid, amount_due`
///
/// # Example
///
/// ```csv
/// number,status,subtotal,discount,tax,total,amount_paid,amount_due
/// INV-2025-0001,partial,220.00,22.00,15.84,213.84,100.00,113.84
/// ```
///
/// # Errors
///
/// Returns a CSV error if writing fails.
pub fn write_documents<W: Write>(engine: &Engine, writer: W) -> Result<(), csv::Error> {
    let mut wtr = Writer::from_writer(writer);

    let records = engine
        .snapshots(None)
        .map_err(|e| csv::Error::from(std::io::Error::other(e)))?;
    for record in records {
        let document = &record.document;
        wtr.serialize(DocumentRow {
            number: document.number.to_string(),
            status: document.status,
            subtotal: money(document.totals.subtotal),
            discount: money(document.totals.discount_amount),
            tax: money(document.totals.tax_amount),
            total: money(document.totals.total),
            amount_paid: money(document.amount_paid()),
            amount_due: money(document.amount_due()),
        })?;
    }

    wtr.flush()?;
    Ok(())
}
