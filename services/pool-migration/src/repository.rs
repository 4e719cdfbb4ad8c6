// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Local replica repository seam.
//!
//! Both the job engine (scanning, listening, source-mode updates) and the
//! destination-side request handler (state mutation after a transfer) talk
//! to the pool's repository through this interface.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::broadcast;

use migration_types::{FileAttributes, PnfsId, ReplicaState, StickyRecord};

/// A replica's metadata as seen in the local repository.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub attributes: FileAttributes,
    pub state: ReplicaState,
    pub sticky: Vec<StickyRecord>,
    pub last_access: DateTime<Utc>,
}

impl CacheEntry {
    pub fn pnfs_id(&self) -> &PnfsId {
        &self.attributes.pnfs_id
    }

    pub fn size(&self) -> u64 {
        self.attributes.size
    }

    /// Sticky records that still pin the replica at `now`.
    pub fn valid_sticky_at(&self, now: DateTime<Utc>) -> Vec<StickyRecord> {
        self.sticky
            .iter()
            .filter(|r| r.is_valid_at(now))
            .cloned()
            .collect()
    }
}

/// Change events published by the repository.
#[derive(Debug, Clone)]
pub enum RepositoryEvent {
    Added(CacheEntry),
    Changed {
        old: Option<CacheEntry>,
        new: CacheEntry,
    },
    Removed(PnfsId),
}

#[derive(Debug, Clone, Error)]
pub enum RepositoryError {
    #[error("replica {0} not found")]
    NotFound(PnfsId),

    #[error("illegal state transition for {pnfs_id}: {from} -> {to}")]
    IllegalTransition {
        pnfs_id: PnfsId,
        from: ReplicaState,
        to: ReplicaState,
    },

    #[error("repository error: {0}")]
    Io(String),
}

/// The pool's replica repository.
#[async_trait]
pub trait Repository: Send + Sync {
    /// All replica identities currently in the repository.
    async fn list(&self) -> Result<Vec<PnfsId>, RepositoryError>;

    async fn entry(&self, pnfs_id: &PnfsId) -> Result<CacheEntry, RepositoryError>;

    async fn set_state(
        &self,
        pnfs_id: &PnfsId,
        state: ReplicaState,
    ) -> Result<(), RepositoryError>;

    /// Set or replace the sticky record of `owner`. A record that is
    /// already expired at the time of the call removes the owner's record
    /// instead. With `overwrite` false the repository only ever extends
    /// the owner's lifetime.
    async fn set_sticky(
        &self,
        pnfs_id: &PnfsId,
        owner: &str,
        expires_at: Option<DateTime<Utc>>,
        overwrite: bool,
    ) -> Result<(), RepositoryError>;

    /// Subscribe to the repository change-event stream.
    fn subscribe(&self) -> broadcast::Receiver<RepositoryEvent>;
}
