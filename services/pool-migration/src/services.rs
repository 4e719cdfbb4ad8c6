// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! External collaborator seams.
//!
//! The migration engine treats the namespace, the pool topology service,
//! the bulk-transfer client, the checksum engine, and the pin manager as
//! injected interfaces; none of their internals live in this crate.

use async_trait::async_trait;
use thiserror::Error;

use migration_types::{FileAttributes, PnfsId, PoolInformation, PoolName, ReplicaState,
                      StickyRecord};

#[derive(Debug, Clone, Error)]
pub enum NamespaceError {
    #[error("file {0} not found in namespace")]
    NotFound(PnfsId),

    #[error("namespace unavailable: {0}")]
    Unavailable(String),
}

/// Namespace/location-lookup service.
#[async_trait]
pub trait NamespaceClient: Send + Sync {
    /// All pools currently holding a copy of the file.
    async fn locations(&self, pnfs_id: &PnfsId) -> Result<Vec<PoolName>, NamespaceError>;
}

#[derive(Debug, Clone, Error)]
pub enum TopologyError {
    #[error("no such target: {0}")]
    NoSuchTarget(String),

    #[error("pool topology service unavailable: {0}")]
    Unavailable(String),
}

/// Pool topology service: resolves target descriptions to pools with
/// current cost metrics.
#[async_trait]
pub trait PoolTopologyClient: Send + Sync {
    async fn pools_by_name(
        &self,
        names: &[String],
    ) -> Result<Vec<PoolInformation>, TopologyError>;

    async fn pools_by_group(
        &self,
        groups: &[String],
    ) -> Result<Vec<PoolInformation>, TopologyError>;

    async fn pools_by_link(&self, link: &str) -> Result<Vec<PoolInformation>, TopologyError>;
}

#[derive(Debug, Clone, Error)]
pub enum TransferError {
    #[error("source pool error: {0}")]
    Source(String),

    #[error("local store error: {0}")]
    Local(String),
}

/// Bulk byte-transfer client used on the destination side to pull a new
/// replica from the coordinating pool.
#[async_trait]
pub trait ReplicaTransferClient: Send + Sync {
    /// Fetch the replica from `source_pool` and materialize it locally in
    /// the given state with the given sticky records.
    async fn fetch_replica(
        &self,
        source_pool: &PoolName,
        attributes: &FileAttributes,
        state: ReplicaState,
        sticky: &[StickyRecord],
    ) -> Result<(), TransferError>;
}

#[derive(Debug, Clone, Error)]
pub enum ChecksumError {
    #[error("checksum mismatch: expected {expected}, computed {computed}")]
    Mismatch { expected: String, computed: String },

    #[error("checksum engine unavailable: {0}")]
    Unavailable(String),
}

/// Checksum engine plus the pool's verification policy.
#[async_trait]
pub trait ChecksumService: Send + Sync {
    /// Whether this pool's policy verifies checksums when an existing
    /// replica is updated in place.
    fn verify_on_update(&self) -> bool;

    /// Recompute the local replica's checksum and compare it against the
    /// expected value carried in the file attributes.
    async fn verify(&self, attributes: &FileAttributes) -> Result<(), ChecksumError>;
}

#[derive(Debug, Clone, Error)]
pub enum PinError {
    #[error("pin manager refused: {0}")]
    Refused(String),

    #[error("pin manager unavailable: {0}")]
    Unavailable(String),
}

/// Pin-management service.
#[async_trait]
pub trait PinManagerClient: Send + Sync {
    /// Owner prefix identifying sticky records managed by the pin manager.
    fn pin_owner_prefix(&self) -> &str;

    /// Ask the pin manager to move the file's pins to the target pool.
    async fn move_pin(
        &self,
        pnfs_id: &PnfsId,
        target_pool: &PoolName,
    ) -> Result<(), PinError>;
}
