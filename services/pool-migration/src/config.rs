// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Configuration for the migration engine

use std::time::Duration;

use anyhow::{Context, Result};

/// Engine-wide settings, loaded from environment variables with defaults.
///
/// Per-job knobs (concurrency, refresh period, modes) live in the job
/// definition; these settings cover the ambient timing constants shared by
/// every job and by the destination-side handler.
#[derive(Debug, Clone)]
pub struct MigrationSettings {
    /// Acknowledgment timeout for pool-to-pool messages. Liveness-ping
    /// cadence (2x) and update TTLs (0.5x) derive from this value.
    pub message_timeout: Duration,

    /// Job-wide backoff after a failed transfer.
    pub retry_backoff: Duration,

    /// Pool-list refresh period used when a job definition does not set
    /// its own.
    pub default_refresh_period: Duration,
}

impl Default for MigrationSettings {
    fn default() -> Self {
        Self {
            message_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(10),
            default_refresh_period: Duration::from_secs(300),
        }
    }
}

impl MigrationSettings {
    /// Load settings from environment variables, falling back to defaults
    /// for unset variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let message_timeout = env_secs("MIGRATION_MESSAGE_TIMEOUT_SECS")?
            .unwrap_or(defaults.message_timeout);
        let retry_backoff =
            env_secs("MIGRATION_RETRY_BACKOFF_SECS")?.unwrap_or(defaults.retry_backoff);
        let default_refresh_period = env_secs("MIGRATION_REFRESH_PERIOD_SECS")?
            .unwrap_or(defaults.default_refresh_period);

        Ok(Self {
            message_timeout,
            retry_backoff,
            default_refresh_period,
        })
    }
}

fn env_secs(name: &str) -> Result<Option<Duration>> {
    match std::env::var(name) {
        Ok(value) => {
            let secs: u64 = value
                .parse()
                .with_context(|| format!("{} must be a number of seconds", name))?;
            Ok(Some(Duration::from_secs(secs)))
        }
        Err(_) => Ok(None),
    }
}
