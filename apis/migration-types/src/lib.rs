// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Shared types for the pool migration engine.
//!
//! This crate contains the data model common to the source side of a
//! migration (the job/task engine running on the pool that owns the
//! replicas) and the destination side (the request handler running on the
//! pool that receives copies), plus the wire messages exchanged between
//! them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, VariantNames};
use uuid::Uuid;

// ============================================================================
// Type Aliases
// ============================================================================

/// Name of a storage pool (cell name of the pool process)
pub type PoolName = String;

/// Per-job task identifier
pub type TaskId = u64;

// ============================================================================
// File Identity
// ============================================================================

/// Identity of a file in the namespace.
///
/// A replica on a pool is addressed by the PNFS ID of the file it is a copy
/// of; the same id on two pools refers to two replicas of the same file.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(transparent)]
pub struct PnfsId(String);

impl PnfsId {
    /// Wrap a raw id string.
    pub fn new(id: impl Into<String>) -> PnfsId {
        PnfsId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PnfsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PnfsId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(format!("{}: invalid pnfsid", s));
        }
        Ok(PnfsId(s.to_uppercase()))
    }
}

// ============================================================================
// Replica Metadata
// ============================================================================

/// State of a replica in a pool's repository.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
    VariantNames,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    /// Entry allocated, no data yet
    New,
    /// Upload from a client in progress
    FromClient,
    /// Inbound copy from another pool in progress
    FromPool,
    /// Replica may be garbage collected once no sticky record holds it
    Cached,
    /// Replica must not be garbage collected (not yet flushed / authoritative)
    Precious,
    /// Replica data failed an integrity check
    Broken,
    /// Replica is being removed
    Removed,
}

impl ReplicaState {
    /// States in which a replica is fully present and usable as a copy
    /// source or update target.
    pub fn is_settled(self) -> bool {
        matches!(self, ReplicaState::Cached | ReplicaState::Precious)
    }
}

/// An (owner, expiration) pair pinning a replica against eviction.
///
/// `expires_at = None` means the record never expires. Multiple owners may
/// sticky the same replica independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StickyRecord {
    pub owner: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl StickyRecord {
    pub fn new(owner: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> StickyRecord {
        StickyRecord {
            owner: owner.into(),
            expires_at,
        }
    }

    /// Whether the record still pins the replica at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            None => true,
            Some(t) => t > now,
        }
    }

    /// Whether this record's lifetime is at least as long as `other`'s.
    pub fn outlives(&self, other: &StickyRecord) -> bool {
        match (self.expires_at, other.expires_at) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(a), Some(b)) => a >= b,
        }
    }
}

/// Access latency class of a file.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AccessLatency {
    Online,
    Nearline,
}

/// Retention policy class of a file.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    Custodial,
    Replica,
    Output,
}

/// Storage-class attributes of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StorageAttributes {
    /// Storage class, e.g. "exp:raw"
    pub storage_class: String,
    /// Backing HSM instance name
    pub hsm: String,
    pub access_latency: AccessLatency,
    pub retention_policy: RetentionPolicy,
}

impl StorageAttributes {
    /// Storage unit in "class@hsm" notation.
    pub fn unit(&self) -> String {
        format!("{}@{}", self.storage_class, self.hsm)
    }
}

/// A file checksum as computed by the checksum engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Checksum {
    /// Algorithm name, e.g. "adler32"
    pub algorithm: String,
    /// Hex-encoded digest
    pub value: String,
}

/// Immutable snapshot of a file's metadata as carried by a copy request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct FileAttributes {
    pub pnfs_id: PnfsId,
    /// File size in bytes
    pub size: u64,
    pub storage: StorageAttributes,
    pub checksum: Option<Checksum>,
}

// ============================================================================
// Cache Entry Modes
// ============================================================================

/// Desired end state of a replica after a transfer.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ModeState {
    /// Keep the replica's current state
    Same,
    Cached,
    Precious,
    /// Mark cached and strip all non-pin sticky records
    Removable,
    /// Remove the replica unless it is pinned
    Delete,
}

/// What happens to a replica (source or destination) after a transfer:
/// a target state plus a list of sticky records to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CacheEntryMode {
    pub state: ModeState,
    pub sticky: Vec<StickyRecord>,
}

impl CacheEntryMode {
    pub fn new(state: ModeState) -> CacheEntryMode {
        CacheEntryMode {
            state,
            sticky: Vec::new(),
        }
    }

    pub fn with_sticky(state: ModeState, sticky: Vec<StickyRecord>) -> CacheEntryMode {
        CacheEntryMode { state, sticky }
    }

    /// Destination replicas can only be cached or precious (or keep their
    /// state); removal modes make no sense on the receiving end.
    pub fn is_legal_for_destination(&self) -> bool {
        !matches!(self.state, ModeState::Removable | ModeState::Delete)
    }
}

// ============================================================================
// Pool Cost Model
// ============================================================================

/// Cost metrics of a pool as reported by the pool topology service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PoolCostInfo {
    pub space_cost: f64,
    pub cpu_cost: f64,
    /// Free bytes
    pub free: u64,
    /// Used bytes
    pub used: u64,
    /// Removable (evictable) bytes
    pub removable: u64,
    /// Total bytes
    pub total: u64,
    /// Configured free-space floor; pools at or below it take no new copies
    pub gap: u64,
    /// Decay parameter controlling how quickly removable space is treated
    /// as gone with age
    pub breakeven: f64,
    /// Age in seconds of the oldest removable byte
    pub lru_age_seconds: u64,
}

/// A pool together with its current cost metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PoolInformation {
    pub name: PoolName,
    pub cost: PoolCostInfo,
}

// ============================================================================
// Cell Paths
// ============================================================================

/// An addressable, reversible route between two communicating pool
/// processes. Replies travel along the reverted path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct CellPath {
    hops: Vec<String>,
}

impl CellPath {
    pub fn new(destination: impl Into<String>) -> CellPath {
        CellPath {
            hops: vec![destination.into()],
        }
    }

    /// Append an additional hop in routing order.
    pub fn via(mut self, hop: impl Into<String>) -> CellPath {
        self.hops.push(hop.into());
        self
    }

    /// Final destination of the path.
    pub fn destination(&self) -> &str {
        self.hops.last().map(String::as_str).unwrap_or("")
    }

    /// The reply route: the same hops in reverse order.
    pub fn revert(&self) -> CellPath {
        CellPath {
            hops: self.hops.iter().rev().cloned().collect(),
        }
    }
}

impl fmt::Display for CellPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hops.join(":"))
    }
}

// ============================================================================
// Failure Codes
// ============================================================================

/// Failure codes carried by negative acknowledgments and terminal replies.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    JsonSchema,
    Display,
    EnumString,
    VariantNames,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MigrationErrorCode {
    /// The destination has an active migration task for the same file
    Busy,
    /// The destination does not hold the addressed replica
    NoSuchReplica,
    /// No active request correlates with the given uuid
    NoSuchRequest,
    /// The requested destination mode is not legal
    InvalidMode,
    /// The replica's checksum did not verify
    ChecksumMismatch,
    /// The byte transfer failed
    TransferFailed,
    /// The request was cancelled before completion
    Cancelled,
    Internal,
}

/// A coded failure with a human-readable explanation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MigrationFailure {
    pub code: MigrationErrorCode,
    pub message: String,
}

impl MigrationFailure {
    pub fn new(code: MigrationErrorCode, message: impl Into<String>) -> MigrationFailure {
        MigrationFailure {
            code,
            message: message.into(),
        }
    }

    pub fn busy(message: impl Into<String>) -> MigrationFailure {
        MigrationFailure::new(MigrationErrorCode::Busy, message)
    }

    pub fn cancelled(message: impl Into<String>) -> MigrationFailure {
        MigrationFailure::new(MigrationErrorCode::Cancelled, message)
    }
}

impl fmt::Display for MigrationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

// ============================================================================
// Wire Messages
// ============================================================================

/// Initiates a new copy on the destination pool. Carries the full replica
/// metadata and the desired destination state.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CopyReplicaMessage {
    /// Correlation id for the whole request/reply exchange
    pub uuid: Uuid,
    /// Pool coordinating the migration (the copy source)
    pub pool: PoolName,
    pub attributes: FileAttributes,
    pub target_state: ReplicaState,
    pub sticky: Vec<StickyRecord>,
    /// Verify the checksum even where the destination's policy would not
    pub verify_checksum: bool,
}

/// Asks a pool already holding a replica to raise its state and sticky
/// records to the desired destination mode.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct UpdateReplicaMessage {
    pub uuid: Uuid,
    pub pool: PoolName,
    pub pnfs_id: PnfsId,
    pub target_state: ReplicaState,
    pub sticky: Vec<StickyRecord>,
    /// A destination receiving the message after this instant must drop it
    /// without mutating state.
    pub deadline: DateTime<Utc>,
}

/// Liveness probe for an outstanding copy request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PingMessage {
    pub uuid: Uuid,
    pub pool: PoolName,
    pub pnfs_id: PnfsId,
}

/// Aborts an active copy request.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CancelMessage {
    pub uuid: Uuid,
    pub pool: PoolName,
    pub pnfs_id: PnfsId,
}

/// Terminal outcome of a copy request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "result", content = "failure")]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    Success,
    Failure(MigrationFailure),
}

impl TransferOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TransferOutcome::Success)
    }
}

/// Terminal reply from the destination, routed back to the coordinating
/// pool along the reverted request path.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CopyFinishedMessage {
    pub uuid: Uuid,
    /// The coordinating pool the reply is destined for
    pub pool: PoolName,
    pub pnfs_id: PnfsId,
    pub outcome: TransferOutcome,
}

/// Envelope for all migration protocol messages.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum PoolMigrationMessage {
    Copy(CopyReplicaMessage),
    Update(UpdateReplicaMessage),
    Ping(PingMessage),
    Cancel(CancelMessage),
    Finished(CopyFinishedMessage),
}

impl PoolMigrationMessage {
    /// Correlation id of the carried message.
    pub fn uuid(&self) -> Uuid {
        match self {
            PoolMigrationMessage::Copy(m) => m.uuid,
            PoolMigrationMessage::Update(m) => m.uuid,
            PoolMigrationMessage::Ping(m) => m.uuid,
            PoolMigrationMessage::Cancel(m) => m.uuid,
            PoolMigrationMessage::Finished(m) => m.uuid,
        }
    }

    /// File identity the carried message concerns.
    pub fn pnfs_id(&self) -> &PnfsId {
        match self {
            PoolMigrationMessage::Copy(m) => &m.attributes.pnfs_id,
            PoolMigrationMessage::Update(m) => &m.pnfs_id,
            PoolMigrationMessage::Ping(m) => &m.pnfs_id,
            PoolMigrationMessage::Cancel(m) => &m.pnfs_id,
            PoolMigrationMessage::Finished(m) => &m.pnfs_id,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]

    use super::*;
    use chrono::TimeDelta;

    #[test]
    fn test_pnfsid_parsing() {
        let id: PnfsId = "000000000000A0F1".parse().unwrap();
        assert_eq!(id.to_string(), "000000000000A0F1");

        let lower: PnfsId = "0000c0ffee".parse().unwrap();
        assert_eq!(lower.as_str(), "0000C0FFEE");

        assert!("".parse::<PnfsId>().is_err());
        assert!("not/valid".parse::<PnfsId>().is_err());
    }

    #[test]
    fn test_sticky_record_validity() {
        let now = Utc::now();
        let forever = StickyRecord::new("system", None);
        let expired = StickyRecord::new("system", Some(now - TimeDelta::seconds(1)));
        let live = StickyRecord::new("system", Some(now + TimeDelta::seconds(60)));

        assert!(forever.is_valid_at(now));
        assert!(!expired.is_valid_at(now));
        assert!(live.is_valid_at(now));

        assert!(forever.outlives(&live));
        assert!(!expired.outlives(&live));
        assert!(live.outlives(&expired));
    }

    #[test]
    fn test_cell_path_revert() {
        let path = CellPath::new("pool-a").via("door").via("pool-b");
        assert_eq!(path.destination(), "pool-b");
        assert_eq!(path.to_string(), "pool-a:door:pool-b");

        let back = path.revert();
        assert_eq!(back.destination(), "pool-a");
        assert_eq!(back.to_string(), "pool-b:door:pool-a");
    }

    #[test]
    fn test_mode_legality() {
        assert!(CacheEntryMode::new(ModeState::Cached).is_legal_for_destination());
        assert!(CacheEntryMode::new(ModeState::Same).is_legal_for_destination());
        assert!(!CacheEntryMode::new(ModeState::Delete).is_legal_for_destination());
        assert!(!CacheEntryMode::new(ModeState::Removable).is_legal_for_destination());
    }

    #[test]
    fn test_message_envelope_tagging() {
        let msg = PoolMigrationMessage::Ping(PingMessage {
            uuid: Uuid::new_v4(),
            pool: "pool-a".to_string(),
            pnfs_id: PnfsId::new("0000A1"),
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"ping""#));

        let back: PoolMigrationMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.pnfs_id().as_str(), "0000A1");
    }

    #[test]
    fn test_transfer_outcome_serialization() {
        let ok = TransferOutcome::Success;
        assert_eq!(
            serde_json::to_string(&ok).unwrap(),
            r#"{"result":"success"}"#
        );

        let failed = TransferOutcome::Failure(MigrationFailure::busy(
            "active migration task for 0000A1",
        ));
        let json = serde_json::to_string(&failed).unwrap();
        assert!(json.contains(r#""result":"failure""#));
        assert!(json.contains(r#""code":"busy""#));
        assert!(!failed.is_success());
    }

    #[test]
    fn test_replica_state_display() {
        assert_eq!(ReplicaState::Cached.to_string(), "cached");
        assert_eq!(ReplicaState::FromPool.to_string(), "from_pool");
        assert!(ReplicaState::Precious.is_settled());
        assert!(!ReplicaState::New.is_settled());
    }
}
