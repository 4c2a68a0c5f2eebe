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

//! Document persistence with a per-document lock scope.
//!
//! Every mutation runs inside [`Repository::transaction`]: the store locks the
//! document, hands a private copy of the full record (items and payments
//! included) to the caller, and writes it back only if the closure succeeds.
//! Events and projects staged on the [`UnitOfWork`] are published on the same
//! commit, so a failed operation leaves no trace.

use crate::EngineError;
use crate::aggregate::DocumentTotals;
use crate::base::{DocumentId, PaymentId, ProjectId, TenantId};
use crate::document::{DocumentRecord, Project};
use crate::error::Entity;
use crate::sequence::DocumentNumber;
use crate::status::Status;
use crossbeam::queue::SegQueue;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, MutexGuard};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Committed change, published to the outbox for downstream consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DocumentEvent {
    Created {
        tenant_id: TenantId,
        document_id: DocumentId,
        number: DocumentNumber,
    },
    TotalsRecalculated {
        document_id: DocumentId,
        totals: DocumentTotals,
    },
    StatusChanged {
        document_id: DocumentId,
        from: Status,
        to: Status,
    },
    PaymentCompleted {
        document_id: DocumentId,
        payment_id: PaymentId,
        amount: Decimal,
        is_refund: bool,
    },
    RefundCreated {
        document_id: DocumentId,
        payment_id: PaymentId,
        original_payment_id: PaymentId,
        amount: Decimal,
    },
    ProjectCreated {
        document_id: DocumentId,
        project_id: ProjectId,
    },
    Deleted {
        document_id: DocumentId,
        number: DocumentNumber,
    },
}

/// Working copy of one document, committed as a whole or not at all.
#[derive(Debug)]
pub struct UnitOfWork {
    pub(crate) record: DocumentRecord,
    events: Vec<DocumentEvent>,
    projects: Vec<Project>,
}

impl UnitOfWork {
    pub fn new(record: DocumentRecord) -> Self {
        Self {
            record,
            events: Vec::new(),
            projects: Vec::new(),
        }
    }

    /// Stages an event for publication on commit.
    pub fn publish(&mut self, event: DocumentEvent) {
        self.events.push(event);
    }

    /// Stages a project for insertion on commit.
    pub fn add_project(&mut self, project: Project) {
        self.projects.push(project);
    }

    pub fn into_parts(self) -> (DocumentRecord, Vec<DocumentEvent>, Vec<Project>) {
        (self.record, self.events, self.projects)
    }
}

/// Transactional document store keyed by tenant.
pub trait Repository: Send + Sync {
    /// Stores a new document. The unit of work's staged events and projects
    /// are published with it.
    fn insert(&self, work: UnitOfWork) -> Result<(), EngineError>;

    /// Consistent copy of a document.
    fn snapshot(&self, tenant_id: TenantId, id: DocumentId) -> Result<DocumentRecord, EngineError>;

    /// Runs `f` against a private copy of the document under its lock and
    /// commits the copy only when `f` returns `Ok`.
    fn transaction<T, F>(&self, tenant_id: TenantId, id: DocumentId, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&mut UnitOfWork) -> Result<T, EngineError>;

    /// Removes a document with everything it owns.
    fn remove(&self, tenant_id: TenantId, id: DocumentId) -> Result<DocumentRecord, EngineError>;

    /// Keys of every stored document, optionally limited to one tenant, in id order.
    fn documents(&self, tenant_id: Option<TenantId>) -> Vec<(TenantId, DocumentId)>;

    fn project(&self, tenant_id: TenantId, id: ProjectId) -> Result<Project, EngineError>;

    /// Removes and returns every published event in commit order.
    fn drain_events(&self) -> Vec<DocumentEvent>;
}

#[derive(Debug)]
struct Slot {
    tenant_id: TenantId,
    /// `None` once the document has been removed.
    record: Mutex<Option<DocumentRecord>>,
}

/// In-memory [`Repository`].
///
/// Documents live behind their own [`Mutex`], so operations on different
/// documents never contend. Lock acquisition waits at most `lock_timeout`
/// per attempt and gives up after `max_attempts` with
/// [`EngineError::ConcurrencyConflict`].
#[derive(Debug)]
pub struct MemoryStore {
    documents: DashMap<DocumentId, Arc<Slot>>,
    projects: DashMap<ProjectId, Project>,
    outbox: SegQueue<DocumentEvent>,
    lock_timeout: Duration,
    max_attempts: u32,
}

impl MemoryStore {
    pub fn new(lock_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            documents: DashMap::new(),
            projects: DashMap::new(),
            outbox: SegQueue::new(),
            lock_timeout,
            max_attempts: max_attempts.max(1),
        }
    }

    fn slot(&self, tenant_id: TenantId, id: DocumentId) -> Result<Arc<Slot>, EngineError> {
        // Clone the Arc so the map shard is released before locking the document.
        let slot = self
            .documents
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(EngineError::not_found(Entity::Document, id.0))?;
        if slot.tenant_id != tenant_id {
            return Err(EngineError::not_found(Entity::Document, id.0));
        }
        Ok(slot)
    }

    fn lock<'a>(
        &self,
        slot: &'a Slot,
        id: DocumentId,
    ) -> Result<MutexGuard<'a, Option<DocumentRecord>>, EngineError> {
        for attempt in 1..=self.max_attempts {
            if let Some(guard) = slot.record.try_lock_for(self.lock_timeout) {
                return Ok(guard);
            }
            warn!(document = %id, attempt, "Document lock busy, retrying");
        }
        Err(EngineError::ConcurrencyConflict {
            resource: format!("document {id}"),
            attempts: self.max_attempts,
        })
    }

    fn publish(&self, events: Vec<DocumentEvent>, projects: Vec<Project>) {
        for project in projects {
            self.projects.insert(project.id, project);
        }
        for event in events {
            self.outbox.push(event);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_millis(250), 3)
    }
}

impl Repository for MemoryStore {
    fn insert(&self, work: UnitOfWork) -> Result<(), EngineError> {
        let (record, events, projects) = work.into_parts();
        let id = record.document.id;
        let tenant_id = record.document.tenant_id;

        match self.documents.entry(id) {
            Entry::Occupied(_) => Err(EngineError::validation(format!(
                "document {id} already exists"
            ))),
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Slot {
                    tenant_id,
                    record: Mutex::new(Some(record)),
                }));
                self.publish(events, projects);
                Ok(())
            }
        }
    }

    fn snapshot(&self, tenant_id: TenantId, id: DocumentId) -> Result<DocumentRecord, EngineError> {
        let slot = self.slot(tenant_id, id)?;
        let guard = self.lock(&slot, id)?;
        guard
            .clone()
            .ok_or(EngineError::not_found(Entity::Document, id.0))
    }

    fn transaction<T, F>(&self, tenant_id: TenantId, id: DocumentId, f: F) -> Result<T, EngineError>
    where
        F: FnOnce(&mut UnitOfWork) -> Result<T, EngineError>,
    {
        let slot = self.slot(tenant_id, id)?;
        let mut guard = self.lock(&slot, id)?;
        let current = guard
            .as_ref()
            .ok_or(EngineError::not_found(Entity::Document, id.0))?;

        let mut work = UnitOfWork::new(current.clone());
        let value = f(&mut work)?;

        let (record, events, projects) = work.into_parts();
        debug!(document = %id, events = events.len(), "Committing document");
        *guard = Some(record);
        // Published under the lock so per-document event order matches commit order.
        self.publish(events, projects);
        Ok(value)
    }

    fn remove(&self, tenant_id: TenantId, id: DocumentId) -> Result<DocumentRecord, EngineError> {
        let slot = self.slot(tenant_id, id)?;
        let mut guard = self.lock(&slot, id)?;
        let record = guard
            .take()
            .ok_or(EngineError::not_found(Entity::Document, id.0))?;
        self.documents.remove(&id);
        self.outbox.push(DocumentEvent::Deleted {
            document_id: id,
            number: record.document.number,
        });
        Ok(record)
    }

    fn documents(&self, tenant_id: Option<TenantId>) -> Vec<(TenantId, DocumentId)> {
        let mut keys: Vec<(TenantId, DocumentId)> = self
            .documents
            .iter()
            .filter(|entry| tenant_id.is_none_or(|tenant| entry.value().tenant_id == tenant))
            .map(|entry| (entry.value().tenant_id, *entry.key()))
            .collect();
        keys.sort_by_key(|(_, id)| *id);
        keys
    }

    fn project(&self, tenant_id: TenantId, id: ProjectId) -> Result<Project, EngineError> {
        self.projects
            .get(&id)
            .filter(|project| project.tenant_id == tenant_id)
            .map(|project| project.value().clone())
            .ok_or(EngineError::not_found(Entity::Project, id.0))
    }

    fn drain_events(&self) -> Vec<DocumentEvent> {
        let mut events = Vec::with_capacity(self.outbox.len());
        while let Some(event) = self.outbox.pop() {
            events.push(event);
        }
        events
    }
}
