// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Cell messaging seam.
//!
//! The engine never talks to a transport directly; it sends protocol
//! messages through a [`MessageStub`], which wraps an injected endpoint
//! with a timeout. Delivery failures surface as a small taxonomy the task
//! state machine dispatches on.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use migration_types::{CellPath, MigrationErrorCode, MigrationFailure, PoolMigrationMessage};

/// Message delivery errors as seen by the sender.
#[derive(Debug, Clone, Error)]
pub enum MessageError {
    /// No acknowledgment arrived within the stub's timeout
    #[error("request timed out")]
    Timeout,

    /// The destination cell is not reachable
    #[error("no route to {0}")]
    NoRoute(String),

    /// The destination acknowledged negatively
    #[error("{0}")]
    Remote(MigrationFailure),
}

impl MessageError {
    /// A lost connection rather than an explicit refusal.
    pub fn is_no_response(&self) -> bool {
        matches!(self, MessageError::Timeout | MessageError::NoRoute(_))
    }

    pub fn remote_code(&self) -> Option<MigrationErrorCode> {
        match self {
            MessageError::Remote(failure) => Some(failure.code),
            _ => None,
        }
    }
}

/// Transport seam. An implementation resolves the cell path, delivers the
/// message, and reports the destination's acknowledgment.
#[async_trait]
pub trait MessageEndpoint: Send + Sync {
    async fn send(
        &self,
        path: &CellPath,
        message: PoolMigrationMessage,
    ) -> Result<(), MessageError>;
}

/// A message sender bound to a fixed timeout.
#[derive(Clone)]
pub struct MessageStub {
    endpoint: Arc<dyn MessageEndpoint>,
    timeout: Duration,
}

impl MessageStub {
    pub fn new(endpoint: Arc<dyn MessageEndpoint>, timeout: Duration) -> MessageStub {
        MessageStub { endpoint, timeout }
    }

    /// The stub's acknowledgment timeout. Liveness-ping cadence and update
    /// TTLs are derived from this value.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send a message and wait for the acknowledgment, bounded by the
    /// stub's timeout.
    pub async fn send(
        &self,
        path: &CellPath,
        message: PoolMigrationMessage,
    ) -> Result<(), MessageError> {
        match tokio::time::timeout(self.timeout, self.endpoint.send(path, message)).await {
            Ok(result) => result,
            Err(_) => Err(MessageError::Timeout),
        }
    }
}
