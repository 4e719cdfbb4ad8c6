// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Destination-side request handling.
//!
//! Runs on any pool that is used as a transfer destination. Incoming copy
//! requests either delegate to the bulk-transfer client (no local replica
//! yet) or update the existing replica in place; both paths end with a
//! `CopyFinishedMessage` routed back along the reverted request path.
//!
//! Before a copy or update is honored the handler verifies that this pool
//! has no active outbound migration task for the same file. Without that
//! check two pools cross-migrating the same file could each believe they
//! are the copy source and the file could be lost.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use migration_types::{
    CancelMessage, CellPath, CopyFinishedMessage, CopyReplicaMessage, MigrationErrorCode,
    MigrationFailure, PingMessage, PnfsId, PoolMigrationMessage, PoolName, ReplicaState,
    StickyRecord, TransferOutcome, UpdateReplicaMessage,
};

use crate::context::MigrationContext;
use crate::repository::{CacheEntry, RepositoryError};
use crate::services::{ChecksumError, ChecksumService, ReplicaTransferClient};

/// What the transport should do with an incoming message after handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge the message to the sender
    Reply,
    /// Swallow the message; the sender gets no reply and will time out
    Discard,
}

struct ActiveRequest {
    pnfs_id: PnfsId,
    /// Pool coordinating the migration, echoed in the terminal reply
    requester: PoolName,
    reply_path: CellPath,
    /// Present while a bulk transfer is in flight
    transfer: Option<JoinHandle<()>>,
}

/// Destination-side handler for the migration protocol.
pub struct MigrationServer {
    me: Weak<MigrationServer>,
    context: Arc<MigrationContext>,
    transfer: Arc<dyn ReplicaTransferClient>,
    checksum: Arc<dyn ChecksumService>,
    requests: Mutex<HashMap<Uuid, ActiveRequest>>,
}

impl MigrationServer {
    pub fn new(
        context: Arc<MigrationContext>,
        transfer: Arc<dyn ReplicaTransferClient>,
        checksum: Arc<dyn ChecksumService>,
    ) -> Arc<MigrationServer> {
        Arc::new_cyclic(|me| MigrationServer {
            me: me.clone(),
            context,
            transfer,
            checksum,
            requests: Mutex::new(HashMap::new()),
        })
    }

    fn requests(&self) -> MutexGuard<'_, HashMap<Uuid, ActiveRequest>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of requests currently active on this pool.
    pub fn active_requests(&self) -> usize {
        self.requests().len()
    }

    /// Entry point for the transport: dispatch an incoming protocol
    /// message. The returned `Result` is the immediate acknowledgment;
    /// terminal outcomes travel separately as `CopyFinishedMessage`s.
    pub async fn message_arrived(
        &self,
        message: PoolMigrationMessage,
        reply_path: CellPath,
    ) -> Result<Disposition, MigrationFailure> {
        match message {
            PoolMigrationMessage::Copy(msg) => self.handle_copy(msg, reply_path).await,
            PoolMigrationMessage::Update(msg) => self.handle_update(msg).await,
            PoolMigrationMessage::Ping(msg) => self.handle_ping(msg),
            PoolMigrationMessage::Cancel(msg) => self.handle_cancel(msg),
            PoolMigrationMessage::Finished(msg) => {
                warn!(uuid = %msg.uuid, "Unexpected terminal reply on destination side");
                Ok(Disposition::Discard)
            }
        }
    }

    /// Guard against the cross-migration race: reject when this pool is
    /// itself migrating the file outward, or already receiving it.
    fn check_busy(&self, pnfs_id: &PnfsId) -> Result<(), MigrationFailure> {
        if self.context.is_active(pnfs_id) {
            return Err(MigrationFailure::busy(format!(
                "{} has an active outbound migration task for {}",
                self.context.pool_name(),
                pnfs_id
            )));
        }
        if self.requests().values().any(|r| &r.pnfs_id == pnfs_id) {
            return Err(MigrationFailure::busy(format!(
                "{} is already receiving {}",
                self.context.pool_name(),
                pnfs_id
            )));
        }
        Ok(())
    }

    async fn handle_copy(
        &self,
        msg: CopyReplicaMessage,
        reply_path: CellPath,
    ) -> Result<Disposition, MigrationFailure> {
        let pnfs_id = msg.attributes.pnfs_id.clone();

        if self.requests().contains_key(&msg.uuid) {
            // Retransmitted request for an exchange we are already running.
            debug!(uuid = %msg.uuid, pnfs_id = %pnfs_id, "Duplicate copy request acknowledged");
            return Ok(Disposition::Reply);
        }

        self.check_busy(&pnfs_id)?;

        if !msg.target_state.is_settled() {
            return Err(MigrationFailure::new(
                MigrationErrorCode::InvalidMode,
                format!("{} is not a valid destination state", msg.target_state),
            ));
        }

        match self.context.repository().entry(&pnfs_id).await {
            Err(RepositoryError::NotFound(_)) => {
                self.start_new_replica(msg, reply_path);
                Ok(Disposition::Reply)
            }
            Ok(entry) if entry.state.is_settled() => {
                self.start_existing_replica(msg, entry, reply_path);
                Ok(Disposition::Reply)
            }
            Ok(entry) => Err(MigrationFailure::busy(format!(
                "replica {} is in transient state {}",
                pnfs_id, entry.state
            ))),
            Err(e) => Err(MigrationFailure::new(
                MigrationErrorCode::Internal,
                e.to_string(),
            )),
        }
    }

    /// New-replica path: delegate to the bulk-transfer client; its
    /// completion produces the terminal reply.
    fn start_new_replica(&self, msg: CopyReplicaMessage, reply_path: CellPath) {
        let uuid = msg.uuid;
        let pnfs_id = msg.attributes.pnfs_id.clone();

        info!(
            uuid = %uuid,
            pnfs_id = %pnfs_id,
            source = %msg.pool,
            "Accepting copy request for new replica"
        );

        // Register before spawning so a fast transfer always finds its
        // request when it completes.
        self.requests().insert(
            uuid,
            ActiveRequest {
                pnfs_id,
                requester: msg.pool.clone(),
                reply_path,
                transfer: None,
            },
        );

        let Some(server) = self.me.upgrade() else {
            return;
        };
        let handle = self.context.executor().spawn(async move {
            let outcome = match server
                .transfer
                .fetch_replica(&msg.pool, &msg.attributes, msg.target_state, &msg.sticky)
                .await
            {
                Ok(()) => TransferOutcome::Success,
                Err(e) => TransferOutcome::Failure(MigrationFailure::new(
                    MigrationErrorCode::TransferFailed,
                    e.to_string(),
                )),
            };
            server.finish_request(uuid, outcome);
        });

        let mut requests = self.requests();
        match requests.get_mut(&uuid) {
            Some(request) => request.transfer = Some(handle),
            // Completed or cancelled in the meantime.
            None => handle.abort(),
        }
    }

    /// Existing-replica path: optionally verify the checksum, then raise
    /// the replica's state and sticky records to the requested mode.
    fn start_existing_replica(
        &self,
        msg: CopyReplicaMessage,
        entry: CacheEntry,
        reply_path: CellPath,
    ) {
        let uuid = msg.uuid;
        let pnfs_id = msg.attributes.pnfs_id.clone();

        info!(
            uuid = %uuid,
            pnfs_id = %pnfs_id,
            state = %entry.state,
            "Updating existing replica for copy request"
        );

        self.requests().insert(
            uuid,
            ActiveRequest {
                pnfs_id: pnfs_id.clone(),
                requester: msg.pool.clone(),
                reply_path,
                transfer: None,
            },
        );

        let Some(server) = self.me.upgrade() else {
            return;
        };
        self.context.executor().spawn(async move {
            let outcome = server.update_existing(&msg, &entry).await;
            server.finish_request(uuid, outcome);
        });
    }

    async fn update_existing(
        &self,
        msg: &CopyReplicaMessage,
        entry: &CacheEntry,
    ) -> TransferOutcome {
        if msg.verify_checksum || self.checksum.verify_on_update() {
            match self.checksum.verify(&msg.attributes).await {
                Ok(()) => {}
                Err(e @ ChecksumError::Mismatch { .. }) => {
                    return TransferOutcome::Failure(MigrationFailure::new(
                        MigrationErrorCode::ChecksumMismatch,
                        e.to_string(),
                    ));
                }
                Err(e) => {
                    return TransferOutcome::Failure(MigrationFailure::new(
                        MigrationErrorCode::Internal,
                        e.to_string(),
                    ));
                }
            }
        }

        match self
            .apply_target_mode(entry, msg.target_state, &msg.sticky)
            .await
        {
            Ok(()) => TransferOutcome::Success,
            Err(failure) => TransferOutcome::Failure(failure),
        }
    }

    /// Raise the replica to be at least as strong as the requested mode:
    /// cached may be promoted to precious but never the reverse, and
    /// per-owner sticky lifetimes are only ever extended.
    async fn apply_target_mode(
        &self,
        entry: &CacheEntry,
        target_state: ReplicaState,
        sticky: &[StickyRecord],
    ) -> Result<(), MigrationFailure> {
        let repository = self.context.repository();
        let pnfs_id = entry.pnfs_id();

        if entry.state == ReplicaState::Cached && target_state == ReplicaState::Precious {
            repository
                .set_state(pnfs_id, ReplicaState::Precious)
                .await
                .map_err(internal)?;
        }

        let now = Utc::now();
        for desired in sticky {
            if !desired.is_valid_at(now) {
                continue;
            }
            let superseded = entry
                .sticky
                .iter()
                .any(|current| current.owner == desired.owner && current.outlives(desired));
            if superseded {
                continue;
            }
            repository
                .set_sticky(pnfs_id, &desired.owner, desired.expires_at, true)
                .await
                .map_err(internal)?;
        }

        Ok(())
    }

    async fn handle_update(
        &self,
        msg: UpdateReplicaMessage,
    ) -> Result<Disposition, MigrationFailure> {
        if Utc::now() > msg.deadline {
            warn!(
                uuid = %msg.uuid,
                pnfs_id = %msg.pnfs_id,
                deadline = %msg.deadline,
                "Discarding stale update request"
            );
            return Ok(Disposition::Discard);
        }

        self.check_busy(&msg.pnfs_id)?;

        if !msg.target_state.is_settled() {
            return Err(MigrationFailure::new(
                MigrationErrorCode::InvalidMode,
                format!("{} is not a valid destination state", msg.target_state),
            ));
        }

        let entry = match self.context.repository().entry(&msg.pnfs_id).await {
            Ok(entry) if entry.state.is_settled() => entry,
            Ok(entry) => {
                return Err(MigrationFailure::busy(format!(
                    "replica {} is in transient state {}",
                    msg.pnfs_id, entry.state
                )));
            }
            Err(RepositoryError::NotFound(_)) => {
                return Err(MigrationFailure::new(
                    MigrationErrorCode::NoSuchReplica,
                    format!("no replica of {} on {}", msg.pnfs_id, self.context.pool_name()),
                ));
            }
            Err(e) => {
                return Err(MigrationFailure::new(
                    MigrationErrorCode::Internal,
                    e.to_string(),
                ));
            }
        };

        self.apply_target_mode(&entry, msg.target_state, &msg.sticky)
            .await?;

        debug!(uuid = %msg.uuid, pnfs_id = %msg.pnfs_id, "Updated existing replica");
        Ok(Disposition::Reply)
    }

    fn handle_ping(&self, msg: PingMessage) -> Result<Disposition, MigrationFailure> {
        if self.requests().contains_key(&msg.uuid) {
            Ok(Disposition::Reply)
        } else {
            Err(MigrationFailure::new(
                MigrationErrorCode::NoSuchRequest,
                format!("no active request {}", msg.uuid),
            ))
        }
    }

    /// A cancelled in-flight request still produces a terminal reply; the
    /// waiting caller must not be left hanging.
    fn handle_cancel(&self, msg: CancelMessage) -> Result<Disposition, MigrationFailure> {
        if let Some(request) = self.requests().remove(&msg.uuid) {
            if let Some(ref handle) = request.transfer {
                handle.abort();
            }
            info!(uuid = %msg.uuid, pnfs_id = %request.pnfs_id, "Cancelled active request");
            self.send_finished(
                &request,
                msg.uuid,
                TransferOutcome::Failure(MigrationFailure::cancelled(
                    "request cancelled by the coordinating pool",
                )),
            );
        }
        Ok(Disposition::Reply)
    }

    /// Remove a completed request and emit the terminal reply. A request
    /// that was cancelled in the meantime has already replied.
    fn finish_request(&self, uuid: Uuid, outcome: TransferOutcome) {
        let Some(request) = self.requests().remove(&uuid) else {
            return;
        };
        self.send_finished(&request, uuid, outcome);
    }

    fn send_finished(&self, request: &ActiveRequest, uuid: Uuid, outcome: TransferOutcome) {
        let message = CopyFinishedMessage {
            uuid,
            pool: request.requester.clone(),
            pnfs_id: request.pnfs_id.clone(),
            outcome,
        };
        let stub = self.context.pool_stub().clone();
        let path = request.reply_path.revert();
        self.context.executor().spawn(async move {
            if let Err(e) = stub
                .send(&path, PoolMigrationMessage::Finished(message))
                .await
            {
                warn!(uuid = %uuid, error = %e, "Failed to deliver terminal reply");
            }
        });
    }
}

fn internal(e: RepositoryError) -> MigrationFailure {
    MigrationFailure::new(MigrationErrorCode::Internal, e.to_string())
}
