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

//! Error types for document processing.

use std::fmt;
use thiserror::Error;

/// Kind of record a [`EngineError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Document,
    LineItem,
    Payment,
    Project,
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Entity::Document => "document",
            Entity::LineItem => "line item",
            Entity::Payment => "payment",
            Entity::Project => "project",
        };
        f.write_str(name)
    }
}

/// Document processing errors.
///
/// Every failing operation returns one of these before anything is
/// committed, so an error never leaves a half-updated document behind.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed or out-of-range input
    #[error("validation failed: {0}")]
    Validation(String),

    /// Status change not allowed from the current state
    #[error("invalid transition from {current} to {requested}")]
    InvalidTransition {
        current: &'static str,
        requested: &'static str,
    },

    /// Contention on a document lock or number sequence outlasted the retry budget
    #[error("concurrency conflict on {resource} after {attempts} attempts")]
    ConcurrencyConflict { resource: String, attempts: u32 },

    /// Referenced record is missing or belongs to another parent
    #[error("{entity} {id} not found")]
    NotFound { entity: Entity, id: u64 },
}

impl EngineError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation(message.into())
    }

    pub(crate) fn not_found(entity: Entity, id: u64) -> Self {
        EngineError::NotFound { entity, id }
    }

    /// Whether the caller may retry the whole operation unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ConcurrencyConflict { .. })
    }
}
