// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Bulk migration jobs.
//!
//! A job is a collection of tasks, each task transferring a single
//! replica. The job scans the local repository for candidates, keeps them
//! in an insertion-ordered queue, and schedules up to `concurrency` tasks
//! at a time. It listens to repository change events for the whole of its
//! life: replicas that stop matching the selection criteria are dropped,
//! and permanent jobs admit replicas that start matching.
//!
//! A file identity is never simultaneously queued and running; failed
//! transfers are re-appended at the tail of the queue and the job backs
//! off globally for a fixed period before scheduling again.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use strum::Display;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use migration_types::{
    CacheEntryMode, CopyFinishedMessage, ModeState, PnfsId, ReplicaState, TaskId,
};

use crate::context::MigrationContext;
use crate::filters::CacheEntryFilter;
use crate::pool_list::RefreshablePoolList;
use crate::repository::{CacheEntry, RepositoryError, RepositoryEvent};
use crate::select::PoolSelectionStrategy;
use crate::task::{Task, TaskSummary};

/// Recent errors kept per job, oldest overwritten first.
const ERROR_HISTORY: usize = 15;

/// Candidate ordering applied once during the initial scan.
///
/// Sorting materializes the whole candidate set up front; for pools with
/// many files this makes job initialization significantly more expensive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEntryOrder {
    BySize { ascending: bool },
    ByLastAccess { ascending: bool },
}

impl CacheEntryOrder {
    fn compare(&self, a: &CacheEntry, b: &CacheEntry) -> CmpOrdering {
        let ordering = match self {
            CacheEntryOrder::BySize { .. } => a.size().cmp(&b.size()),
            CacheEntryOrder::ByLastAccess { .. } => a.last_access.cmp(&b.last_access),
        };
        let ascending = match self {
            CacheEntryOrder::BySize { ascending } => *ascending,
            CacheEntryOrder::ByLastAccess { ascending } => *ascending,
        };
        if ascending { ordering } else { ordering.reverse() }
    }
}

/// Immutable description of a job, created once at job-creation time.
pub struct JobDefinition {
    pub filters: Vec<Box<dyn CacheEntryFilter>>,
    /// Applied to the source replica after a successful transfer
    pub source_mode: CacheEntryMode,
    /// Desired state of the destination replica
    pub target_mode: CacheEntryMode,
    pub selection: Box<dyn PoolSelectionStrategy>,
    pub pool_list: Arc<dyn RefreshablePoolList>,
    pub refresh_period: Duration,
    pub order: Option<CacheEntryOrder>,
    /// Permanent jobs keep admitting matching replicas and never finish
    pub permanent: bool,
    /// Give up on unresponsive targets instead of waiting for them
    pub eager: bool,
    /// Ask the pin manager to move pins to the target after the transfer
    pub must_move_pins: bool,
    /// Force checksum verification when an existing replica is updated
    pub verify_checksum: bool,
}

/// Job states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum JobState {
    /// Initial scan of the repository
    Initializing,
    /// Scheduling new tasks
    Running,
    /// A task failed; nothing is scheduled until the backoff elapses
    Sleeping,
    /// Suspended by the user; no new tasks are scheduled
    Suspended,
    /// Cancelled by the user; waiting for tasks to stop
    Cancelling,
    Cancelled,
    Finished,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Cancelled | JobState::Finished | JobState::Failed
        )
    }
}

/// Running totals of a job.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobStatistics {
    pub attempts: u64,
    pub completed_files: u64,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
}

/// One entry of the per-job error ring buffer.
#[derive(Debug, Clone)]
pub struct JobErrorRecord {
    pub task_id: TaskId,
    pub pnfs_id: PnfsId,
    pub at: DateTime<Utc>,
    pub message: String,
}

impl std::fmt::Display for JobErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}] {}: {}",
            self.at.format("%H:%M:%S"),
            self.task_id,
            self.pnfs_id,
            self.message
        )
    }
}

/// Structured status snapshot of a job.
#[derive(Debug, Clone)]
pub struct JobInfo {
    pub id: String,
    pub state: JobState,
    pub queued: usize,
    pub concurrency: usize,
    pub statistics: JobStatistics,
    pub running: Vec<TaskSummary>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Error)]
#[error("job cannot {action} in state {state}")]
pub struct IllegalJobState {
    action: &'static str,
    state: JobState,
}

struct JobCore {
    state: JobState,
    concurrency: usize,
    queued: IndexSet<PnfsId>,
    sizes: HashMap<PnfsId, u64>,
    running: HashMap<PnfsId, Arc<Task>>,
    statistics: JobStatistics,
    errors: VecDeque<JobErrorRecord>,
}

/// A bulk migration operation as defined by a user command.
pub struct Job {
    id: String,
    me: Weak<Job>,
    context: Arc<MigrationContext>,
    definition: JobDefinition,
    core: Mutex<JobCore>,
    shutdown: watch::Sender<bool>,
    task_counter: AtomicU64,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Job {
    pub fn new(
        id: impl Into<String>,
        context: Arc<MigrationContext>,
        definition: JobDefinition,
    ) -> Arc<Job> {
        let (shutdown, _) = watch::channel(false);
        Arc::new_cyclic(|me| Job {
            id: id.into(),
            me: me.clone(),
            context,
            definition,
            core: Mutex::new(JobCore {
                state: JobState::Initializing,
                concurrency: 1,
                queued: IndexSet::new(),
                sizes: HashMap::new(),
                running: HashMap::new(),
                statistics: JobStatistics::default(),
                errors: VecDeque::new(),
            }),
            shutdown,
            task_counter: AtomicU64::new(0),
        })
    }

    /// Begin the initial repository scan, the repository listener, and the
    /// periodic pool-list refresh. Called once after creation.
    pub fn start(&self) {
        self.spawn_refresh_loop();
        self.spawn_repository_listener();

        let Some(job) = self.me.upgrade() else {
            return;
        };
        self.context.executor().spawn(async move {
            job.populate().await;
        });
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn definition(&self) -> &JobDefinition {
        &self.definition
    }

    fn lock_core(&self) -> MutexGuard<'_, JobCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> JobState {
        self.lock_core().state
    }

    pub fn statistics(&self) -> JobStatistics {
        self.lock_core().statistics
    }

    pub fn set_concurrency(&self, concurrency: usize) {
        let mut core = self.lock_core();
        core.concurrency = concurrency.max(1);
        self.schedule(&mut core);
    }

    /// Status snapshot for operator commands; running tasks are listed in
    /// task-id order.
    pub fn info(&self) -> JobInfo {
        let core = self.lock_core();
        let mut running: Vec<TaskSummary> =
            core.running.values().map(|t| t.summary()).collect();
        running.sort_by_key(|t| t.id);
        JobInfo {
            id: self.id.clone(),
            state: core.state,
            queued: core.queued.len(),
            concurrency: core.concurrency,
            statistics: core.statistics,
            running,
            errors: core.errors.iter().map(|e| e.to_string()).collect(),
        }
    }

    // ------------------------------------------------------------------
    // User commands
    // ------------------------------------------------------------------

    /// Cancel the job. With `force`, every running task is cancelled;
    /// otherwise running tasks finish naturally and no new ones start.
    pub fn cancel(&self, force: bool) -> Result<(), IllegalJobState> {
        let mut core = self.lock_core();
        match core.state {
            JobState::Running
            | JobState::Suspended
            | JobState::Cancelling
            | JobState::Sleeping => {}
            state => {
                return Err(IllegalJobState {
                    action: "be cancelled",
                    state,
                });
            }
        }
        if core.running.is_empty() {
            self.set_state(&mut core, JobState::Cancelled);
        } else {
            self.set_state(&mut core, JobState::Cancelling);
            if force {
                for task in core.running.values() {
                    task.cancel();
                }
            }
        }
        Ok(())
    }

    /// Suspend the job; running tasks finish, no new ones are scheduled.
    pub fn suspend(&self) -> Result<(), IllegalJobState> {
        let mut core = self.lock_core();
        match core.state {
            JobState::Running | JobState::Sleeping | JobState::Suspended => {
                self.set_state(&mut core, JobState::Suspended);
                Ok(())
            }
            state => Err(IllegalJobState {
                action: "be suspended",
                state,
            }),
        }
    }

    pub fn resume(&self) -> Result<(), IllegalJobState> {
        let mut core = self.lock_core();
        match core.state {
            JobState::Suspended => {
                self.set_state(&mut core, JobState::Running);
                Ok(())
            }
            state => Err(IllegalJobState {
                action: "resume",
                state,
            }),
        }
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    fn set_state(&self, core: &mut JobCore, state: JobState) {
        if core.state == state {
            return;
        }
        core.state = state;
        info!(job_id = %self.id, state = %state, "Job state changed");

        match state {
            JobState::Running => self.schedule(core),
            JobState::Sleeping => {
                let Some(job) = self.me.upgrade() else {
                    return;
                };
                let backoff = self.context.settings().retry_backoff;
                self.context.executor().spawn(async move {
                    tokio::time::sleep(backoff).await;
                    let mut core = job.lock_core();
                    if core.state == JobState::Sleeping {
                        job.set_state(&mut core, JobState::Running);
                    }
                });
            }
            JobState::Cancelled | JobState::Finished | JobState::Failed => {
                core.queued.clear();
                core.sizes.clear();
                // Stops the repository listener and the refresh loop.
                let _ = self.shutdown.send(true);
            }
            _ => {}
        }
    }

    /// The single dispatcher: invoked after every state-relevant event.
    fn schedule(&self, core: &mut JobCore) {
        if core.state.is_terminal() {
            return;
        }
        if core.state == JobState::Cancelling && core.running.is_empty() {
            self.set_state(core, JobState::Cancelled);
            return;
        }
        if core.state != JobState::Initializing
            && !self.definition.permanent
            && core.queued.is_empty()
            && core.running.is_empty()
        {
            self.set_state(core, JobState::Finished);
            return;
        }
        if core.state != JobState::Running {
            return;
        }
        if !self.definition.pool_list.is_valid() {
            // No usable target information yet; try again after a backoff.
            self.set_state(core, JobState::Sleeping);
            return;
        }

        let mut index = 0;
        while core.running.len() < core.concurrency {
            let Some(pnfs_id) = core.queued.get_index(index).cloned() else {
                break;
            };
            if !self.context.lock(&pnfs_id) {
                Self::push_error(
                    core,
                    JobErrorRecord {
                        task_id: 0,
                        pnfs_id: pnfs_id.clone(),
                        at: Utc::now(),
                        message: "file is locked by another job".to_string(),
                    },
                );
                index += 1;
                continue;
            }

            core.queued.shift_remove(&pnfs_id);
            let task_id = self.task_counter.fetch_add(1, Ordering::Relaxed) + 1;
            let task = Task::new(
                task_id,
                pnfs_id.clone(),
                self.me.clone(),
                Arc::clone(&self.context),
            );
            core.running.insert(pnfs_id, Arc::clone(&task));
            core.statistics.attempts += 1;
            task.start();
        }

        if core.running.is_empty() {
            if !self.definition.permanent && core.queued.is_empty() {
                self.set_state(core, JobState::Finished);
            } else {
                self.set_state(core, JobState::Sleeping);
            }
        }
    }

    // ------------------------------------------------------------------
    // Candidate admission
    // ------------------------------------------------------------------

    fn accept(&self, entry: &CacheEntry) -> bool {
        self.definition.filters.iter().all(|f| f.accept(entry))
    }

    /// Admit a candidate unless it is already queued or running.
    fn add(&self, entry: &CacheEntry) {
        let pnfs_id = entry.pnfs_id();
        let mut core = self.lock_core();
        if core.state.is_terminal() {
            return;
        }
        if !core.queued.contains(pnfs_id) && !core.running.contains_key(pnfs_id) {
            core.queued.insert(pnfs_id.clone());
            core.sizes.insert(pnfs_id.clone(), entry.size());
            core.statistics.total_bytes += entry.size();
            self.schedule(&mut core);
        }
    }

    /// Drop a candidate: cancel it if running, dequeue it otherwise.
    fn remove(&self, pnfs_id: &PnfsId) {
        let mut core = self.lock_core();
        if let Some(task) = core.running.get(pnfs_id) {
            task.cancel();
        } else if core.queued.shift_remove(pnfs_id) {
            core.sizes.remove(pnfs_id);
        }
    }

    fn remove_if_not_running(&self, pnfs_id: &PnfsId) {
        let mut core = self.lock_core();
        if !core.running.contains_key(pnfs_id) && core.queued.shift_remove(pnfs_id) {
            core.sizes.remove(pnfs_id);
        }
    }

    /// Initial repository scan. With an ordering configured the whole
    /// candidate set is materialized and sorted before admission.
    async fn populate(&self) {
        let repository = Arc::clone(self.context.repository());

        let result: Result<(), RepositoryError> = async {
            let ids = repository.list().await?;
            if let Some(order) = self.definition.order {
                let mut entries = Vec::new();
                for pnfs_id in ids {
                    match repository.entry(&pnfs_id).await {
                        Ok(entry) => entries.push(entry),
                        // Disappeared mid-scan; expected.
                        Err(RepositoryError::NotFound(_)) => {}
                        Err(e) => {
                            error!(job_id = %self.id, pnfs_id = %pnfs_id, error = %e,
                                   "Failed to load entry during scan");
                        }
                    }
                }
                entries.sort_by(|a, b| order.compare(a, b));
                for entry in &entries {
                    if self.accept(entry) {
                        self.add(entry);
                    }
                }
            } else {
                for pnfs_id in ids {
                    match repository.entry(&pnfs_id).await {
                        Ok(entry) => {
                            if self.accept(&entry) {
                                self.add(&entry);
                            }
                        }
                        Err(RepositoryError::NotFound(_)) => {}
                        Err(e) => {
                            error!(job_id = %self.id, pnfs_id = %pnfs_id, error = %e,
                                   "Failed to load entry during scan");
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        let mut core = self.lock_core();
        match result {
            Ok(()) => {
                if core.state == JobState::Initializing {
                    self.set_state(&mut core, JobState::Running);
                }
            }
            Err(e) => {
                error!(job_id = %self.id, error = %e, "Repository scan failed");
                if !core.state.is_terminal() {
                    self.set_state(&mut core, JobState::Failed);
                }
            }
        }
    }

    fn spawn_repository_listener(&self) {
        let Some(job) = self.me.upgrade() else {
            return;
        };
        let mut events = self.context.repository().subscribe();
        let mut shutdown = self.shutdown.subscribe();
        self.context.executor().spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(event) => job.on_repository_event(event),
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(job_id = %job.id, skipped = n,
                                  "Repository event stream lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    fn on_repository_event(&self, event: RepositoryEvent) {
        match event {
            RepositoryEvent::Removed(pnfs_id) => self.remove(&pnfs_id),
            RepositoryEvent::Added(entry) | RepositoryEvent::Changed { new: entry, .. } => {
                if !self.accept(&entry) {
                    // A rejected replica that is already transferring is
                    // left to finish.
                    self.remove_if_not_running(entry.pnfs_id());
                } else if self.definition.permanent {
                    self.add(&entry);
                }
            }
        }
    }

    fn spawn_refresh_loop(&self) {
        let Some(job) = self.me.upgrade() else {
            return;
        };
        let mut shutdown = self.shutdown.subscribe();
        self.context.executor().spawn(async move {
            loop {
                job.definition.pool_list.refresh().await;
                tokio::select! {
                    _ = tokio::time::sleep(job.definition.refresh_period) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    // ------------------------------------------------------------------
    // Task callbacks
    // ------------------------------------------------------------------

    pub(crate) async fn task_completed(&self, task: &Arc<Task>) {
        self.apply_source_mode(task.pnfs_id()).await;

        let mut core = self.lock_core();
        core.running.remove(task.pnfs_id());
        self.context.unlock(task.pnfs_id());
        let size = core.sizes.remove(task.pnfs_id()).unwrap_or(0);
        core.statistics.completed_files += 1;
        core.statistics.transferred_bytes += size;
        self.schedule(&mut core);
    }

    /// A transient failure: requeue at the tail and back off globally.
    pub(crate) fn task_failed(&self, task: &Arc<Task>, message: String) {
        let pnfs_id = task.pnfs_id();
        let mut core = self.lock_core();
        if core.running.remove(pnfs_id).is_some() {
            core.queued.insert(pnfs_id.clone());
            self.context.unlock(pnfs_id);
        }

        if core.state == JobState::Running {
            self.set_state(&mut core, JobState::Sleeping);
        } else {
            self.schedule(&mut core);
        }

        Self::push_error(
            &mut core,
            JobErrorRecord {
                task_id: task.id(),
                pnfs_id: pnfs_id.clone(),
                at: Utc::now(),
                message,
            },
        );
    }

    pub(crate) fn task_failed_permanently(&self, task: &Arc<Task>, message: String) {
        let pnfs_id = task.pnfs_id();
        let mut core = self.lock_core();
        core.running.remove(pnfs_id);
        core.sizes.remove(pnfs_id);
        self.context.unlock(pnfs_id);
        self.schedule(&mut core);

        Self::push_error(
            &mut core,
            JobErrorRecord {
                task_id: task.id(),
                pnfs_id: pnfs_id.clone(),
                at: Utc::now(),
                message,
            },
        );
    }

    pub(crate) fn task_cancelled(&self, task: &Arc<Task>) {
        let pnfs_id = task.pnfs_id();
        let mut core = self.lock_core();
        core.running.remove(pnfs_id);
        core.sizes.remove(pnfs_id);
        self.context.unlock(pnfs_id);
        self.schedule(&mut core);
    }

    /// The replica disappeared before the transfer started.
    pub(crate) fn task_vanished(&self, task: &Arc<Task>) {
        debug!(job_id = %self.id, pnfs_id = %task.pnfs_id(), "Candidate vanished before transfer");
        self.task_cancelled(task);
    }

    fn push_error(core: &mut JobCore, record: JobErrorRecord) {
        if core.errors.len() == ERROR_HISTORY {
            core.errors.pop_front();
        }
        core.errors.push_back(record);
    }

    // ------------------------------------------------------------------
    // Message routing
    // ------------------------------------------------------------------

    /// Route a terminal reply to the running task it belongs to. Replies
    /// for files no longer running are stale and dropped.
    pub fn message_arrived(&self, message: CopyFinishedMessage) {
        let task = self.lock_core().running.get(&message.pnfs_id).cloned();
        if let Some(task) = task {
            task.copy_finished(message);
        }
    }

    // ------------------------------------------------------------------
    // Source-mode update
    // ------------------------------------------------------------------

    /// Apply the configured post-transfer update to the source replica.
    /// A vanished entry or an illegal transition at this point is
    /// expected and swallowed.
    async fn apply_source_mode(&self, pnfs_id: &PnfsId) {
        let result = self.try_apply_source_mode(pnfs_id).await;
        match result {
            Ok(()) => {}
            Err(RepositoryError::NotFound(_)) => {
                debug!(job_id = %self.id, pnfs_id = %pnfs_id,
                       "Replica vanished before the source mode was applied");
            }
            Err(RepositoryError::IllegalTransition { .. }) => {
                debug!(job_id = %self.id, pnfs_id = %pnfs_id,
                       "Illegal transition applying source mode; replica is likely being removed");
            }
            Err(e) => {
                error!(job_id = %self.id, pnfs_id = %pnfs_id, error = %e,
                       "Failed to update source replica");
                let mut core = self.lock_core();
                self.set_state(&mut core, JobState::Failed);
            }
        }
    }

    async fn try_apply_source_mode(&self, pnfs_id: &PnfsId) -> Result<(), RepositoryError> {
        let mode = &self.definition.source_mode;
        let repository = self.context.repository();
        let pin_prefix = self.context.pin_manager().pin_owner_prefix();
        let entry = repository.entry(pnfs_id).await?;
        let is_pinned = entry
            .sticky
            .iter()
            .any(|r| r.owner.starts_with(pin_prefix));

        match mode.state {
            ModeState::Same => {
                self.apply_sticky(pnfs_id, &mode.sticky).await?;
            }
            ModeState::Delete if !is_pinned => {
                repository.set_state(pnfs_id, ReplicaState::Removed).await?;
            }
            // A pinned replica cannot be deleted; downgrade it instead.
            ModeState::Delete | ModeState::Removable => {
                self.apply_sticky(pnfs_id, &mode.sticky).await?;
                for record in &entry.sticky {
                    let keep = record.owner.starts_with(pin_prefix)
                        || mode.sticky.iter().any(|r| r.owner == record.owner);
                    if !keep {
                        repository
                            .set_sticky(pnfs_id, &record.owner, Some(DateTime::<Utc>::MIN_UTC), true)
                            .await?;
                    }
                }
                repository.set_state(pnfs_id, ReplicaState::Cached).await?;
            }
            ModeState::Cached => {
                self.apply_sticky(pnfs_id, &mode.sticky).await?;
                repository.set_state(pnfs_id, ReplicaState::Cached).await?;
            }
            ModeState::Precious => {
                repository.set_state(pnfs_id, ReplicaState::Precious).await?;
                self.apply_sticky(pnfs_id, &mode.sticky).await?;
            }
        }
        Ok(())
    }

    async fn apply_sticky(
        &self,
        pnfs_id: &PnfsId,
        records: &[migration_types::StickyRecord],
    ) -> Result<(), RepositoryError> {
        let repository = self.context.repository();
        for record in records {
            repository
                .set_sticky(pnfs_id, &record.owner, record.expires_at, true)
                .await?;
        }
        Ok(())
    }
}
