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

//! Engine configuration.
//!
//! Values come from defaults, an optional configuration file and
//! `DOCKET__*` environment variables, in increasing priority.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Time a single attempt waits for a document lock.
    pub lock_timeout_ms: u64,
    /// Lock attempts per operation before reporting a conflict.
    pub max_attempts: u32,
    /// Allocation attempts when a sequence number collides with an issued one.
    pub sequence_max_attempts: u32,
    /// Days past due before a late fee may be applied, for new invoices.
    pub default_late_fee_days: u32,
    /// Days between issue and due date when an invoice has no explicit due date.
    pub default_payment_terms_days: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 250,
            max_attempts: 3,
            sequence_max_attempts: 5,
            default_late_fee_days: 30,
            default_payment_terms_days: 30,
        }
    }
}

impl EngineConfig {
    /// Loads configuration, layering `path` (if any) and the environment over defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let config = builder
            .add_source(Environment::with_prefix("DOCKET").separator("__"))
            .build()?;
        let config: EngineConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Message("max_attempts must be at least 1".into()));
        }
        if self.sequence_max_attempts == 0 {
            return Err(ConfigError::Message(
                "sequence_max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
