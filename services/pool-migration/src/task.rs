// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Per-replica transfer state machine.
//!
//! A task transfers one replica. It discovers existing copies through the
//! namespace, either raises an existing copy to the desired mode or
//! initiates a fresh copy to a selected target pool, supervises the
//! transfer with liveness pings, and reports a terminal outcome to its
//! job.
//!
//! Every transition-triggering event (message acknowledgment, timeout,
//! ping tick, cancel request) is posted onto the task's event queue and
//! consumed by a single event loop, so transitions run to completion even
//! though many tasks execute concurrently.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use strum::Display;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use migration_types::{
    CancelMessage, CellPath, CopyFinishedMessage, CopyReplicaMessage, MigrationErrorCode,
    ModeState, PingMessage, PnfsId, PoolMigrationMessage, PoolName, ReplicaState, StickyRecord,
    TaskId, TransferOutcome, UpdateReplicaMessage,
};

use crate::context::MigrationContext;
use crate::job::Job;
use crate::messaging::MessageError;
use crate::repository::{CacheEntry, RepositoryError};
use crate::services::{NamespaceError, PinError};

/// States of the transfer state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TaskState {
    Queued,
    GettingLocations,
    UpdatingExistingFile,
    CancellingUpdate,
    InitiatingCopy,
    Copying,
    Pinging,
    Waiting,
    NoResponse,
    MovingPin,
    Cancelling,
    Cancelled,
    Failed,
    Done,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Cancelled | TaskState::Failed | TaskState::Done
        )
    }
}

/// Snapshot of a task for job introspection.
#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub id: TaskId,
    pub pnfs_id: PnfsId,
    pub state: TaskState,
    pub target: Option<PoolName>,
}

#[derive(Debug)]
enum TaskEvent {
    Locations(Result<Vec<PoolName>, NamespaceError>),
    UpdateReply(Result<(), MessageError>),
    CopyReply(Result<(), MessageError>),
    CancelReply(Result<(), MessageError>),
    PingTick,
    PingReply(Result<(), MessageError>),
    MovePinReply(Result<(), PinError>),
    CopyFinished(CopyFinishedMessage),
    Cancel,
}

/// Terminal outcomes reported to the job.
enum Outcome {
    Completed,
    Failed(String),
    FailedPermanently(String),
    Cancelled,
    /// The replica disappeared before the transfer started; dropped
    /// silently.
    Vanished,
}

struct TaskStatus {
    state: TaskState,
    target: Option<PoolName>,
}

/// A single replica transfer owned by a job.
pub struct Task {
    id: TaskId,
    pnfs_id: PnfsId,
    uuid: Uuid,
    job: Weak<Job>,
    context: Arc<MigrationContext>,
    event_tx: mpsc::UnboundedSender<TaskEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<TaskEvent>>>,
    status: Mutex<TaskStatus>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        pnfs_id: PnfsId,
        job: Weak<Job>,
        context: Arc<MigrationContext>,
    ) -> Arc<Task> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Arc::new(Task {
            id,
            pnfs_id,
            uuid: Uuid::new_v4(),
            job,
            context,
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            status: Mutex::new(TaskStatus {
                state: TaskState::Queued,
                target: None,
            }),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn pnfs_id(&self) -> &PnfsId {
        &self.pnfs_id
    }

    fn status(&self) -> MutexGuard<'_, TaskStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> TaskState {
        self.status().state
    }

    pub fn summary(&self) -> TaskSummary {
        let status = self.status();
        TaskSummary {
            id: self.id,
            pnfs_id: self.pnfs_id.clone(),
            state: status.state,
            target: status.target.clone(),
        }
    }

    /// Start the task's event loop on the job's executor.
    pub(crate) fn start(self: Arc<Self>) {
        let Some(rx) = self.event_rx.lock().unwrap_or_else(PoisonError::into_inner).take()
        else {
            return;
        };
        let executor = self.context.executor().clone();
        executor.spawn(async move {
            TaskRunner::new(self).run(rx).await;
        });
    }

    /// Request cancellation. The terminal report arrives asynchronously.
    pub(crate) fn cancel(&self) {
        let _ = self.event_tx.send(TaskEvent::Cancel);
    }

    /// Deliver a terminal reply routed to this task's file.
    pub(crate) fn copy_finished(&self, message: CopyFinishedMessage) {
        let _ = self.event_tx.send(TaskEvent::CopyFinished(message));
    }

    fn post(&self, event: TaskEvent) {
        let _ = self.event_tx.send(event);
    }
}

enum ReplyKind {
    Update,
    Copy,
    Ping,
    Cancel,
}

struct TaskRunner {
    task: Arc<Task>,
    entry: Option<CacheEntry>,
    target_state: ReplicaState,
    target_sticky: Vec<StickyRecord>,
    /// Known holders of the replica, intersected with the admissible set
    locations: Vec<PoolName>,
    target: Option<PoolName>,
}

impl TaskRunner {
    fn new(task: Arc<Task>) -> TaskRunner {
        TaskRunner {
            task,
            entry: None,
            target_state: ReplicaState::Cached,
            target_sticky: Vec::new(),
            locations: Vec::new(),
            target: None,
        }
    }

    fn context(&self) -> &Arc<MigrationContext> {
        &self.task.context
    }

    fn job(&self) -> Option<Arc<Job>> {
        self.task.job.upgrade()
    }

    fn set_state(&self, state: TaskState) {
        debug!(
            task_id = self.task.id,
            pnfs_id = %self.task.pnfs_id,
            state = %state,
            "Task transition"
        );
        self.task.status().state = state;
    }

    fn set_target(&mut self, target: Option<PoolName>) {
        self.target = target.clone();
        self.task.status().target = target;
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<TaskEvent>) {
        let Some(job) = self.job() else {
            return;
        };

        // Snapshot the source replica; a vanished or transient entry means
        // there is nothing to transfer.
        match self.context().repository().entry(&self.task.pnfs_id).await {
            Ok(entry) if entry.state.is_settled() => {
                let now = Utc::now();
                let pin_prefix = self.context().pin_manager().pin_owner_prefix().to_string();
                let (state, sticky) =
                    resolve_target_mode(&job.definition().target_mode, &entry, &pin_prefix, now);
                self.target_state = state;
                self.target_sticky = sticky;
                self.entry = Some(entry);
            }
            Ok(_) | Err(RepositoryError::NotFound(_)) => {
                self.report(Outcome::Vanished).await;
                return;
            }
            Err(e) => {
                self.report(Outcome::Failed(format!("failed to read replica: {}", e)))
                    .await;
                return;
            }
        }

        self.query_locations();

        while let Some(event) = rx.recv().await {
            if let Some(outcome) = self.handle(event) {
                self.report(outcome).await;
                return;
            }
        }
    }

    fn handle(&mut self, event: TaskEvent) -> Option<Outcome> {
        let state = self.task.state();
        match (state, event) {
            (TaskState::GettingLocations, TaskEvent::Locations(Ok(holders))) => {
                let admissible: Vec<PoolName> = self
                    .job()?
                    .definition()
                    .pool_list
                    .pools()
                    .into_iter()
                    .map(|p| p.name)
                    .collect();
                self.locations = holders
                    .into_iter()
                    .filter(|pool| admissible.contains(pool))
                    .collect();
                self.next_attempt()
            }
            (TaskState::GettingLocations, TaskEvent::Locations(Err(e))) => Some(Outcome::Failed(
                format!("failed to query file locations: {}", e),
            )),
            (TaskState::GettingLocations, TaskEvent::Cancel) => Some(Outcome::Cancelled),

            (TaskState::UpdatingExistingFile, TaskEvent::UpdateReply(Ok(()))) => {
                self.finish_success()
            }
            (TaskState::UpdatingExistingFile, TaskEvent::UpdateReply(Err(e))) => {
                self.update_failed(e)
            }
            (TaskState::UpdatingExistingFile, TaskEvent::Cancel) => {
                self.set_state(TaskState::CancellingUpdate);
                None
            }

            (TaskState::CancellingUpdate, TaskEvent::UpdateReply(_)) => Some(Outcome::Cancelled),

            (TaskState::InitiatingCopy, TaskEvent::CopyReply(Ok(()))) => {
                self.set_state(TaskState::Copying);
                self.schedule_ping(self.ping_interval() / 2);
                None
            }
            (TaskState::InitiatingCopy, TaskEvent::CopyReply(Err(e))) => self.copy_refused(e),
            (TaskState::InitiatingCopy, TaskEvent::Cancel) => {
                self.set_state(TaskState::Cancelling);
                None
            }

            (
                TaskState::Copying | TaskState::Waiting | TaskState::NoResponse,
                TaskEvent::PingTick,
            ) => {
                self.set_state(TaskState::Pinging);
                self.send_ping();
                None
            }
            (TaskState::Pinging, TaskEvent::PingReply(Ok(()))) => {
                self.set_state(TaskState::Waiting);
                self.schedule_ping(self.ping_interval());
                None
            }
            (TaskState::Pinging, TaskEvent::PingReply(Err(e))) if e.is_no_response() => {
                self.no_response()
            }
            (TaskState::Pinging, TaskEvent::PingReply(Err(_))) => Some(Outcome::Failed(format!(
                "target pool {} no longer knows the transfer",
                self.target_name()
            ))),

            (
                TaskState::Copying
                | TaskState::Pinging
                | TaskState::Waiting
                | TaskState::NoResponse,
                TaskEvent::CopyFinished(msg),
            ) => self.handle_finished(msg),
            (
                TaskState::Copying
                | TaskState::Pinging
                | TaskState::Waiting
                | TaskState::NoResponse,
                TaskEvent::Cancel,
            ) => {
                self.set_state(TaskState::Cancelling);
                self.send_cancel();
                None
            }

            (TaskState::MovingPin, TaskEvent::MovePinReply(Ok(()))) => Some(Outcome::Completed),
            (TaskState::MovingPin, TaskEvent::MovePinReply(Err(e))) => {
                Some(Outcome::Failed(format!("failed to move pin: {}", e)))
            }

            (TaskState::Cancelling, TaskEvent::CopyReply(Ok(()))) => {
                // The copy we are aborting was accepted after all.
                self.send_cancel();
                None
            }
            (TaskState::Cancelling, TaskEvent::CopyReply(Err(_))) => Some(Outcome::Cancelled),
            (TaskState::Cancelling, TaskEvent::CancelReply(_)) => Some(Outcome::Cancelled),
            (TaskState::Cancelling, TaskEvent::CopyFinished(_)) => Some(Outcome::Cancelled),

            (state, event) => {
                debug!(
                    task_id = self.task.id,
                    pnfs_id = %self.task.pnfs_id,
                    state = %state,
                    event = ?event,
                    "Ignoring event"
                );
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Location discovery and attempt selection
    // ------------------------------------------------------------------

    fn query_locations(&self) {
        self.set_state(TaskState::GettingLocations);
        let namespace = Arc::clone(self.context().namespace());
        let pnfs_id = self.task.pnfs_id.clone();
        let task = Arc::clone(&self.task);
        self.context().executor().spawn(async move {
            let result = namespace.locations(&pnfs_id).await;
            task.post(TaskEvent::Locations(result));
        });
    }

    /// Pick the next known holder for an in-place update, or fall back to
    /// initiating a fresh copy once the holders are exhausted.
    fn next_attempt(&mut self) -> Option<Outcome> {
        if self.locations.is_empty() {
            self.initiate_copy()
        } else {
            let holder = self.locations.remove(0);
            self.update_existing(holder);
            None
        }
    }

    fn update_existing(&mut self, holder: PoolName) {
        self.set_state(TaskState::UpdatingExistingFile);
        self.set_target(Some(holder.clone()));

        let ttl = self.context().settings().message_timeout / 2;
        let deadline = Utc::now()
            + TimeDelta::from_std(ttl).unwrap_or_else(|_| TimeDelta::seconds(i32::MAX as i64));
        let message = PoolMigrationMessage::Update(UpdateReplicaMessage {
            uuid: self.task.uuid,
            pool: self.context().pool_name().clone(),
            pnfs_id: self.task.pnfs_id.clone(),
            target_state: self.target_state,
            sticky: self.target_sticky.clone(),
            deadline,
        });
        self.send_to_pool(&holder, message, ReplyKind::Update);
    }

    fn update_failed(&mut self, error: MessageError) -> Option<Outcome> {
        let holder = self.target_name();
        if error.is_no_response() && !self.job()?.definition().eager {
            // The holder may still come back; retry the whole attempt
            // later rather than copying the file a second time.
            return Some(Outcome::Failed(format!(
                "pool {} failed to respond to update request",
                holder
            )));
        }
        warn!(
            task_id = self.task.id,
            pnfs_id = %self.task.pnfs_id,
            pool = %holder,
            error = %error,
            "Update request failed, trying remaining holders"
        );
        self.next_attempt()
    }

    fn initiate_copy(&mut self) -> Option<Outcome> {
        let job = self.job()?;
        let pools = job.definition().pool_list.pools();
        if pools.is_empty() {
            return Some(Outcome::FailedPermanently(
                "no target pools available".to_string(),
            ));
        }

        let target = job.definition().selection.select(&pools).name.clone();
        self.set_state(TaskState::InitiatingCopy);
        self.set_target(Some(target.clone()));

        let entry = self.entry.as_ref()?;
        let message = PoolMigrationMessage::Copy(CopyReplicaMessage {
            uuid: self.task.uuid,
            pool: self.context().pool_name().clone(),
            attributes: entry.attributes.clone(),
            target_state: self.target_state,
            sticky: self.target_sticky.clone(),
            verify_checksum: job.definition().verify_checksum,
        });
        self.send_to_pool(&target, message, ReplyKind::Copy);
        None
    }

    fn copy_refused(&mut self, error: MessageError) -> Option<Outcome> {
        if error.is_no_response() {
            return self.no_response();
        }
        match error.remote_code() {
            Some(MigrationErrorCode::Busy) => Some(Outcome::Failed(format!(
                "target pool {} is busy with the same file",
                self.target_name()
            ))),
            _ => Some(Outcome::FailedPermanently(format!(
                "target pool {} rejected the copy: {}",
                self.target_name(),
                error
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Liveness supervision
    // ------------------------------------------------------------------

    /// Pings repeat at twice the messaging timeout, tolerating exactly one
    /// missed heartbeat before the peer counts as unresponsive.
    fn ping_interval(&self) -> Duration {
        self.context().settings().message_timeout * 2
    }

    fn schedule_ping(&self, delay: Duration) {
        let task = Arc::clone(&self.task);
        self.context().executor().spawn(async move {
            tokio::time::sleep(delay).await;
            task.post(TaskEvent::PingTick);
        });
    }

    fn send_ping(&self) {
        let message = PoolMigrationMessage::Ping(PingMessage {
            uuid: self.task.uuid,
            pool: self.context().pool_name().clone(),
            pnfs_id: self.task.pnfs_id.clone(),
        });
        let target = self.target_name();
        self.send_to_pool(&target, message, ReplyKind::Ping);
    }

    fn no_response(&mut self) -> Option<Outcome> {
        if let Some(job) = self.job()
            && job.definition().eager
        {
            // An eager job gives up on the unresponsive target so the next
            // attempt can select a different pool.
            return Some(Outcome::Failed(format!(
                "no response from target pool {}",
                self.target_name()
            )));
        }
        self.set_state(TaskState::NoResponse);
        self.schedule_ping(self.ping_interval());
        None
    }

    // ------------------------------------------------------------------
    // Completion and cancellation
    // ------------------------------------------------------------------

    fn handle_finished(&mut self, msg: CopyFinishedMessage) -> Option<Outcome> {
        if msg.uuid != self.task.uuid {
            warn!(
                task_id = self.task.id,
                pnfs_id = %self.task.pnfs_id,
                uuid = %msg.uuid,
                "Ignoring stale terminal reply"
            );
            return None;
        }
        match msg.outcome {
            TransferOutcome::Success => self.finish_success(),
            TransferOutcome::Failure(failure) => match failure.code {
                MigrationErrorCode::InvalidMode | MigrationErrorCode::ChecksumMismatch => {
                    Some(Outcome::FailedPermanently(failure.to_string()))
                }
                _ => Some(Outcome::Failed(failure.to_string())),
            },
        }
    }

    fn finish_success(&mut self) -> Option<Outcome> {
        let job = self.job()?;
        let entry = self.entry.as_ref()?;
        let pin_prefix = self.context().pin_manager().pin_owner_prefix();
        let now = Utc::now();
        let pinned = entry
            .sticky
            .iter()
            .any(|r| r.owner.starts_with(pin_prefix) && r.is_valid_at(now));

        if job.definition().must_move_pins && pinned {
            self.set_state(TaskState::MovingPin);
            let pin_manager = Arc::clone(self.context().pin_manager());
            let pnfs_id = self.task.pnfs_id.clone();
            let target = self.target_name();
            let task = Arc::clone(&self.task);
            self.context().executor().spawn(async move {
                let result = pin_manager.move_pin(&pnfs_id, &target).await;
                task.post(TaskEvent::MovePinReply(result));
            });
            return None;
        }
        Some(Outcome::Completed)
    }

    fn send_cancel(&self) {
        let message = PoolMigrationMessage::Cancel(CancelMessage {
            uuid: self.task.uuid,
            pool: self.context().pool_name().clone(),
            pnfs_id: self.task.pnfs_id.clone(),
        });
        let target = self.target_name();
        self.send_to_pool(&target, message, ReplyKind::Cancel);
    }

    fn target_name(&self) -> PoolName {
        self.target.clone().unwrap_or_default()
    }

    fn send_to_pool(&self, pool: &PoolName, message: PoolMigrationMessage, kind: ReplyKind) {
        let stub = self.context().pool_stub().clone();
        let path = CellPath::new(pool.clone());
        let task = Arc::clone(&self.task);
        self.context().executor().spawn(async move {
            let result = stub.send(&path, message).await;
            let event = match kind {
                ReplyKind::Update => TaskEvent::UpdateReply(result),
                ReplyKind::Copy => TaskEvent::CopyReply(result),
                ReplyKind::Ping => TaskEvent::PingReply(result),
                ReplyKind::Cancel => TaskEvent::CancelReply(result),
            };
            task.post(event);
        });
    }

    // ------------------------------------------------------------------
    // Terminal reporting
    // ------------------------------------------------------------------

    async fn report(&self, outcome: Outcome) {
        let terminal = match &outcome {
            Outcome::Completed => TaskState::Done,
            Outcome::Failed(_) | Outcome::FailedPermanently(_) => TaskState::Failed,
            Outcome::Cancelled => TaskState::Cancelled,
            Outcome::Vanished => TaskState::Failed,
        };
        self.set_state(terminal);

        let Some(job) = self.job() else {
            return;
        };
        match outcome {
            Outcome::Completed => job.task_completed(&self.task).await,
            Outcome::Failed(msg) => job.task_failed(&self.task, msg),
            Outcome::FailedPermanently(msg) => job.task_failed_permanently(&self.task, msg),
            Outcome::Cancelled => job.task_cancelled(&self.task),
            Outcome::Vanished => job.task_vanished(&self.task),
        }
    }
}

/// Resolve the configured destination mode against the source snapshot.
///
/// `Same` carries the source replica's state and its unexpired non-pin
/// sticky records to the destination; explicit modes carry only the
/// configured records. Pins never travel with the copy; the pin manager
/// moves them separately when the job says so.
fn resolve_target_mode(
    mode: &migration_types::CacheEntryMode,
    entry: &CacheEntry,
    pin_prefix: &str,
    now: chrono::DateTime<Utc>,
) -> (ReplicaState, Vec<StickyRecord>) {
    match mode.state {
        ModeState::Same => {
            let state = if entry.state == ReplicaState::Precious {
                ReplicaState::Precious
            } else {
                ReplicaState::Cached
            };
            let mut sticky: Vec<StickyRecord> = entry
                .valid_sticky_at(now)
                .into_iter()
                .filter(|r| !r.owner.starts_with(pin_prefix))
                .collect();
            for record in &mode.sticky {
                if !sticky.iter().any(|r| r.owner == record.owner) {
                    sticky.push(record.clone());
                }
            }
            (state, sticky)
        }
        ModeState::Precious => (ReplicaState::Precious, mode.sticky.clone()),
        ModeState::Cached | ModeState::Removable | ModeState::Delete => {
            (ReplicaState::Cached, mode.sticky.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use chrono::TimeDelta;
    use migration_types::{
        AccessLatency, CacheEntryMode, FileAttributes, RetentionPolicy, StorageAttributes,
    };

    fn make_entry(state: ReplicaState, sticky: Vec<StickyRecord>) -> CacheEntry {
        CacheEntry {
            attributes: FileAttributes {
                pnfs_id: PnfsId::new("0000A1"),
                size: 1024,
                storage: StorageAttributes {
                    storage_class: "exp:raw".to_string(),
                    hsm: "osm".to_string(),
                    access_latency: AccessLatency::Online,
                    retention_policy: RetentionPolicy::Replica,
                },
                checksum: None,
            },
            state,
            sticky,
            last_access: Utc::now(),
        }
    }

    #[test]
    fn test_resolve_same_mode_carries_source_state_and_sticky() {
        let now = Utc::now();
        let entry = make_entry(
            ReplicaState::Precious,
            vec![
                StickyRecord::new("system", None),
                StickyRecord::new("pin-manager-7", None),
                StickyRecord::new("stale", Some(now - TimeDelta::seconds(5))),
            ],
        );
        let mode = CacheEntryMode::new(ModeState::Same);

        let (state, sticky) = resolve_target_mode(&mode, &entry, "pin-manager", now);
        assert_eq!(state, ReplicaState::Precious);
        // Pins and expired records are left behind.
        assert_eq!(sticky.len(), 1);
        assert_eq!(sticky[0].owner, "system");
    }

    #[test]
    fn test_resolve_same_mode_merges_configured_records() {
        let now = Utc::now();
        let entry = make_entry(
            ReplicaState::Cached,
            vec![StickyRecord::new("system", None)],
        );
        let mode = CacheEntryMode::with_sticky(
            ModeState::Same,
            vec![
                StickyRecord::new("system", Some(now + TimeDelta::seconds(60))),
                StickyRecord::new("replication", None),
            ],
        );

        let (state, sticky) = resolve_target_mode(&mode, &entry, "pin-manager", now);
        assert_eq!(state, ReplicaState::Cached);
        // The source's record wins for its owner; the new owner is added.
        assert_eq!(sticky.len(), 2);
        assert!(sticky.iter().any(|r| r.owner == "system" && r.expires_at.is_none()));
        assert!(sticky.iter().any(|r| r.owner == "replication"));
    }

    #[test]
    fn test_resolve_explicit_modes() {
        let now = Utc::now();
        let entry = make_entry(
            ReplicaState::Precious,
            vec![StickyRecord::new("system", None)],
        );

        let (state, sticky) = resolve_target_mode(
            &CacheEntryMode::new(ModeState::Cached),
            &entry,
            "pin-manager",
            now,
        );
        assert_eq!(state, ReplicaState::Cached);
        assert!(sticky.is_empty());

        let (state, _) = resolve_target_mode(
            &CacheEntryMode::new(ModeState::Precious),
            &entry,
            "pin-manager",
            now,
        );
        assert_eq!(state, ReplicaState::Precious);
    }
}
