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

//! Document sequencer.
//!
//! Allocates `{PREFIX}-{YEAR}-{NNNN}` numbers per tenant, document type and
//! year. The next value comes from an atomic per-key counter, never from
//! counting existing documents, so concurrent allocations cannot observe the
//! same "next" value. Each allocated number is then claimed in the issued set;
//! a collision with a number claimed out of band (for example an imported
//! legacy document) is skipped and retried a bounded number of times.
//!
//! Numbers are gap-tolerant and never reused, even after a document is deleted.

use crate::base::TenantId;
use crate::EngineError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Highest sequence value that fits the four-digit number format.
pub const MAX_SEQUENCE: u32 = 9_999;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Estimate,
    Invoice,
}

impl DocumentType {
    pub fn prefix(&self) -> &'static str {
        match self {
            DocumentType::Estimate => "EST",
            DocumentType::Invoice => "INV",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Estimate => "estimate",
            DocumentType::Invoice => "invoice",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "EST" | "ESTIMATE" => Ok(DocumentType::Estimate),
            "INV" | "INVOICE" => Ok(DocumentType::Invoice),
            other => Err(EngineError::validation(format!(
                "unknown document type '{other}'"
            ))),
        }
    }
}

/// A formatted document number such as `EST-2025-0007`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentNumber {
    pub document_type: DocumentType,
    pub year: i32,
    pub sequence: u32,
}

impl DocumentNumber {
    pub fn new(document_type: DocumentType, year: i32, sequence: u32) -> Result<Self, EngineError> {
        if !(0..=9999).contains(&year) {
            return Err(EngineError::validation(format!(
                "document year must have four digits (got {year})"
            )));
        }
        if sequence == 0 || sequence > MAX_SEQUENCE {
            return Err(EngineError::validation(format!(
                "document sequence must be between 1 and {MAX_SEQUENCE} (got {sequence})"
            )));
        }
        Ok(Self {
            document_type,
            year,
            sequence,
        })
    }
}

impl fmt::Display for DocumentNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{:04}-{:04}",
            self.document_type.prefix(),
            self.year,
            self.sequence
        )
    }
}

impl FromStr for DocumentNumber {
    type Err = EngineError;

    /// Parses `^(EST|INV)-\d{4}-\d{4}$`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EngineError::validation(format!("malformed document number '{s}'"));
        let four_digits = |part: &str| part.len() == 4 && part.bytes().all(|b| b.is_ascii_digit());

        let mut parts = s.split('-');
        let (Some(prefix), Some(year), Some(sequence), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        let document_type = match prefix {
            "EST" => DocumentType::Estimate,
            "INV" => DocumentType::Invoice,
            _ => return Err(invalid()),
        };
        if !four_digits(year) || !four_digits(sequence) {
            return Err(invalid());
        }
        let year = year.parse().map_err(|_| invalid())?;
        let sequence = sequence.parse().map_err(|_| invalid())?;
        DocumentNumber::new(document_type, year, sequence)
    }
}

impl Serialize for DocumentNumber {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SequenceKey {
    tenant_id: TenantId,
    document_type: DocumentType,
    year: i32,
}

/// Per-tenant document number allocator.
#[derive(Debug)]
pub struct Sequencer {
    /// Last value handed out per (tenant, type, year).
    counters: DashMap<SequenceKey, u32>,
    /// Every number claimed per tenant, for uniqueness.
    issued: DashMap<(TenantId, DocumentNumber), ()>,
    max_attempts: u32,
}

impl Sequencer {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            counters: DashMap::new(),
            issued: DashMap::new(),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Allocates the next unused number for `(tenant_id, document_type, year)`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::ConcurrencyConflict`] - every attempt collided with an issued number.
    /// - [`EngineError::Validation`] - the four-digit sequence space is exhausted.
    pub fn allocate(
        &self,
        tenant_id: TenantId,
        document_type: DocumentType,
        year: i32,
    ) -> Result<DocumentNumber, EngineError> {
        let key = SequenceKey {
            tenant_id,
            document_type,
            year,
        };

        for attempt in 1..=self.max_attempts {
            // The entry guard holds the shard lock, so the increment is atomic.
            let sequence = {
                let mut counter = self.counters.entry(key).or_insert(0);
                *counter += 1;
                *counter
            };
            if sequence > MAX_SEQUENCE {
                return Err(EngineError::validation(format!(
                    "{} numbers for tenant {tenant_id} in {year} are exhausted",
                    document_type
                )));
            }

            let number = DocumentNumber::new(document_type, year, sequence)?;
            match self.issued.entry((tenant_id, number)) {
                Entry::Vacant(entry) => {
                    entry.insert(());
                    debug!(tenant = %tenant_id, %number, attempt, "Allocated document number");
                    return Ok(number);
                }
                Entry::Occupied(_) => {
                    warn!(
                        tenant = %tenant_id,
                        %number,
                        attempt,
                        "Document number already issued, retrying"
                    );
                }
            }
        }

        Err(EngineError::ConcurrencyConflict {
            resource: format!("{document_type} sequence for tenant {tenant_id} in {year}"),
            attempts: self.max_attempts,
        })
    }

    /// Claims an externally assigned number (for example on import).
    ///
    /// The counter is not advanced; later allocations skip the claimed value.
    pub fn reserve(&self, tenant_id: TenantId, number: DocumentNumber) -> Result<(), EngineError> {
        match self.issued.entry((tenant_id, number)) {
            Entry::Vacant(entry) => {
                entry.insert(());
                Ok(())
            }
            Entry::Occupied(_) => Err(EngineError::validation(format!(
                "document number {number} is already issued for tenant {tenant_id}"
            ))),
        }
    }

    /// Whether `number` has been issued for the tenant.
    pub fn is_issued(&self, tenant_id: TenantId, number: &DocumentNumber) -> bool {
        self.issued.contains_key(&(tenant_id, *number))
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new(5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn number_formats_with_padding() {
        let number = DocumentNumber::new(DocumentType::Estimate, 2025, 7).unwrap();
        assert_eq!(number.to_string(), "EST-2025-0007");
    }

    #[test]
    fn number_parses_round_trip() {
        let number: DocumentNumber = "INV-2024-0312".parse().unwrap();
        assert_eq!(number.document_type, DocumentType::Invoice);
        assert_eq!(number.year, 2024);
        assert_eq!(number.sequence, 312);
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        for raw in [
            "EST-2025-007",
            "EST-2025-00007",
            "QTE-2025-0001",
            "EST-25-0001",
            "EST-2025-0001-1",
            "EST-2025-000a",
            "EST-2025-0000",
            "est-2025-0001",
            "",
        ] {
            assert!(raw.parse::<DocumentNumber>().is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn first_allocation_starts_at_one() {
        let sequencer = Sequencer::default();
        let number = sequencer
            .allocate(TenantId(1), DocumentType::Estimate, 2025)
            .unwrap();
        assert_eq!(number.to_string(), "EST-2025-0001");
        assert!(sequencer.is_issued(TenantId(1), &number));
    }

    #[test]
    fn sequences_are_scoped_by_tenant_type_and_year() {
        let sequencer = Sequencer::default();
        let a = sequencer.allocate(TenantId(1), DocumentType::Estimate, 2025).unwrap();
        let b = sequencer.allocate(TenantId(2), DocumentType::Estimate, 2025).unwrap();
        let c = sequencer.allocate(TenantId(1), DocumentType::Invoice, 2025).unwrap();
        let d = sequencer.allocate(TenantId(1), DocumentType::Estimate, 2026).unwrap();
        let e = sequencer.allocate(TenantId(1), DocumentType::Estimate, 2025).unwrap();

        assert_eq!(a.to_string(), "EST-2025-0001");
        assert_eq!(b.to_string(), "EST-2025-0001");
        assert_eq!(c.to_string(), "INV-2025-0001");
        assert_eq!(d.to_string(), "EST-2026-0001");
        assert_eq!(e.to_string(), "EST-2025-0002");
    }

    #[test]
    fn allocation_skips_reserved_numbers() {
        let sequencer = Sequencer::default();
        let imported: DocumentNumber = "EST-2025-0001".parse().unwrap();
        sequencer.reserve(TenantId(1), imported).unwrap();

        let number = sequencer
            .allocate(TenantId(1), DocumentType::Estimate, 2025)
            .unwrap();
        assert_eq!(number.to_string(), "EST-2025-0002");
    }

    #[test]
    fn exhausted_retries_report_conflict() {
        let sequencer = Sequencer::new(3);
        for raw in ["EST-2025-0001", "EST-2025-0002", "EST-2025-0003"] {
            sequencer.reserve(TenantId(1), raw.parse().unwrap()).unwrap();
        }

        let result = sequencer.allocate(TenantId(1), DocumentType::Estimate, 2025);
        assert!(matches!(
            result,
            Err(EngineError::ConcurrencyConflict { attempts: 3, .. })
        ));

        // The counter moved past the collisions, so the next call succeeds.
        let number = sequencer
            .allocate(TenantId(1), DocumentType::Estimate, 2025)
            .unwrap();
        assert_eq!(number.to_string(), "EST-2025-0004");
    }

    #[test]
    fn duplicate_reservation_is_rejected() {
        let sequencer = Sequencer::default();
        let number = sequencer.allocate(TenantId(1), DocumentType::Invoice, 2025).unwrap();
        assert!(matches!(
            sequencer.reserve(TenantId(1), number),
            Err(EngineError::Validation(_))
        ));
        // Same number for another tenant is fine.
        assert!(sequencer.reserve(TenantId(2), number).is_ok());
    }

    #[test]
    fn sequence_space_exhaustion() {
        let sequencer = Sequencer::default();
        let key = SequenceKey {
            tenant_id: TenantId(1),
            document_type: DocumentType::Invoice,
            year: 2025,
        };
        sequencer.counters.insert(key, MAX_SEQUENCE);
        let result = sequencer.allocate(TenantId(1), DocumentType::Invoice, 2025);
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[test]
    fn concurrent_allocations_are_unique_and_contiguous() {
        let sequencer = Arc::new(Sequencer::default());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let sequencer = Arc::clone(&sequencer);
                thread::spawn(move || {
                    (0..25)
                        .map(|_| {
                            sequencer
                                .allocate(TenantId(1), DocumentType::Estimate, 2025)
                                .unwrap()
                                .sequence
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for sequence in handle.join().unwrap() {
                assert!(seen.insert(sequence), "sequence {sequence} issued twice");
            }
        }
        assert_eq!(seen.len(), 400);
        assert_eq!(seen.iter().copied().max(), Some(400));
    }
}
