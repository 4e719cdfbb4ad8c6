// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Job registry for the source side of the migration engine.
//!
//! The module owns every job defined on this pool: it validates and
//! numbers new jobs, dispatches incoming terminal replies to the job that
//! is waiting for them, and exposes the replayable command strings of
//! permanent jobs so the host can persist and restore them across
//! restarts. The commands themselves are opaque to the engine.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tracing::{debug, info, warn};

use migration_types::{CopyFinishedMessage, ModeState};

use crate::context::MigrationContext;
use crate::job::{Job, JobDefinition, JobState};
use crate::pool_list::{GlobPattern, PoolListFilter};

#[derive(Debug, Clone, Error)]
pub enum JobCreationError {
    #[error("{0} is not a valid destination mode")]
    InvalidTargetMode(ModeState),

    #[error("permanent jobs cannot be ordered")]
    OrderedPermanentJob,

    #[error("concurrency must be at least 1")]
    InvalidConcurrency,

    #[error("job id is already in use: {0}")]
    DuplicateJobId(String),
}

/// One line of the job listing.
#[derive(Debug, Clone)]
pub struct JobSummary {
    pub id: String,
    pub state: JobState,
    pub command: String,
}

struct ModuleCore {
    jobs: HashMap<String, Arc<Job>>,
    commands: HashMap<String, String>,
    counter: u64,
}

/// The per-pool migration module: user-visible registry of jobs.
pub struct MigrationModule {
    context: Arc<MigrationContext>,
    core: Mutex<ModuleCore>,
}

impl MigrationModule {
    pub fn new(context: Arc<MigrationContext>) -> MigrationModule {
        MigrationModule {
            context,
            core: Mutex::new(ModuleCore {
                jobs: HashMap::new(),
                commands: HashMap::new(),
                counter: 0,
            }),
        }
    }

    fn lock_core(&self) -> MutexGuard<'_, ModuleCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Define and start a new job. Configuration errors are rejected here,
    /// before any job object exists. An explicit id may reuse the id of a
    /// terminated job.
    pub fn create_job(
        &self,
        id: Option<String>,
        definition: JobDefinition,
        concurrency: usize,
        command: String,
    ) -> Result<Arc<Job>, JobCreationError> {
        if !definition.target_mode.is_legal_for_destination() {
            return Err(JobCreationError::InvalidTargetMode(
                definition.target_mode.state,
            ));
        }
        if definition.permanent && definition.order.is_some() {
            return Err(JobCreationError::OrderedPermanentJob);
        }
        if concurrency == 0 {
            return Err(JobCreationError::InvalidConcurrency);
        }

        // A job must never select its own pool as a copy target.
        let definition = {
            let mut definition = definition;
            match GlobPattern::new(self.context.pool_name()) {
                Ok(own_pool) => {
                    definition.pool_list = Arc::new(PoolListFilter::new(
                        Arc::clone(&definition.pool_list),
                        vec![own_pool],
                        None,
                        Vec::new(),
                        None,
                    ));
                }
                Err(e) => {
                    warn!(pool = %self.context.pool_name(), error = %e,
                          "Cannot compile own-pool exclusion pattern");
                }
            }
            definition
        };

        let mut core = self.lock_core();
        let id = match id {
            Some(id) => {
                if let Some(existing) = core.jobs.get(&id)
                    && !existing.state().is_terminal()
                {
                    return Err(JobCreationError::DuplicateJobId(id));
                }
                id
            }
            None => loop {
                core.counter += 1;
                let id = core.counter.to_string();
                if !core.jobs.contains_key(&id) {
                    break id;
                }
            },
        };

        let job = Job::new(id.clone(), Arc::clone(&self.context), definition);
        job.set_concurrency(concurrency);
        job.start();

        info!(job_id = %id, "Created migration job");
        core.jobs.insert(id.clone(), Arc::clone(&job));
        core.commands.insert(id, command);
        Ok(job)
    }

    pub fn job(&self, id: &str) -> Option<Arc<Job>> {
        self.lock_core().jobs.get(id).cloned()
    }

    /// One-line summaries of all jobs, sorted by id.
    pub fn jobs(&self) -> Vec<JobSummary> {
        let core = self.lock_core();
        let mut summaries: Vec<JobSummary> = core
            .jobs
            .iter()
            .map(|(id, job)| JobSummary {
                id: id.clone(),
                state: job.state(),
                command: core.commands.get(id).cloned().unwrap_or_default(),
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    /// Remove terminated jobs from the registry. Jobs are kept for
    /// reference until explicitly cleared.
    pub fn clear(&self) {
        let mut core = self.lock_core();
        let terminal: Vec<String> = core
            .jobs
            .iter()
            .filter(|(_, job)| job.state().is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in terminal {
            core.jobs.remove(&id);
            core.commands.remove(&id);
            debug!(job_id = %id, "Cleared migration job");
        }
    }

    /// Immediately cancel all jobs. Jobs that cannot be cancelled in
    /// their present state are left alone.
    pub fn cancel_all(&self) {
        let jobs: Vec<Arc<Job>> = self.lock_core().jobs.values().cloned().collect();
        for job in jobs {
            let _ = job.cancel(true);
        }
    }

    /// Replayable command strings of permanent jobs, for the host's
    /// setup persistence. Jobs on their way out are not persisted.
    pub fn setup_commands(&self) -> Vec<String> {
        let core = self.lock_core();
        let mut commands: Vec<(String, String)> = core
            .jobs
            .iter()
            .filter(|(_, job)| {
                job.definition().permanent
                    && !job.state().is_terminal()
                    && job.state() != JobState::Cancelling
            })
            .filter_map(|(id, _)| {
                core.commands
                    .get(id)
                    .map(|command| (id.clone(), command.clone()))
            })
            .collect();
        commands.sort_by(|a, b| a.0.cmp(&b.0));
        commands.into_iter().map(|(_, command)| command).collect()
    }

    /// Dispatch an incoming terminal reply to the job waiting for it.
    pub fn message_arrived(&self, message: CopyFinishedMessage) {
        if &message.pool != self.context.pool_name() {
            return;
        }
        let jobs: Vec<Arc<Job>> = self.lock_core().jobs.values().cloned().collect();
        for job in jobs {
            job.message_arrived(message.clone());
        }
    }
}
