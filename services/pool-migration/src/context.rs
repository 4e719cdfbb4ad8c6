// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Shared context for the migration engine.
//!
//! Everything quasi-global lives here as explicitly owned, injected state:
//! the executor handle, the messaging stub, the collaborator clients, and
//! the set of files with an active outbound migration task. The engine
//! never spawns onto any runtime other than the injected handle.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use std::sync::Arc;

use tokio::runtime::Handle;

use migration_types::{PnfsId, PoolName};

use crate::config::MigrationSettings;
use crate::messaging::MessageStub;
use crate::repository::Repository;
use crate::services::{NamespaceClient, PinManagerClient, PoolTopologyClient};

/// Injected dependencies and per-pool state shared by all jobs.
pub struct MigrationContext {
    pool_name: PoolName,
    executor: Handle,
    settings: MigrationSettings,
    pool_stub: MessageStub,
    repository: Arc<dyn Repository>,
    namespace: Arc<dyn NamespaceClient>,
    topology: Arc<dyn PoolTopologyClient>,
    pin_manager: Arc<dyn PinManagerClient>,
    /// Files with an active outbound migration task on this pool
    active: Mutex<HashSet<PnfsId>>,
}

impl MigrationContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool_name: PoolName,
        executor: Handle,
        settings: MigrationSettings,
        pool_stub: MessageStub,
        repository: Arc<dyn Repository>,
        namespace: Arc<dyn NamespaceClient>,
        topology: Arc<dyn PoolTopologyClient>,
        pin_manager: Arc<dyn PinManagerClient>,
    ) -> MigrationContext {
        MigrationContext {
            pool_name,
            executor,
            settings,
            pool_stub,
            repository,
            namespace,
            topology,
            pin_manager,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn pool_name(&self) -> &PoolName {
        &self.pool_name
    }

    pub fn executor(&self) -> &Handle {
        &self.executor
    }

    pub fn settings(&self) -> &MigrationSettings {
        &self.settings
    }

    pub fn pool_stub(&self) -> &MessageStub {
        &self.pool_stub
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repository
    }

    pub fn namespace(&self) -> &Arc<dyn NamespaceClient> {
        &self.namespace
    }

    pub fn topology(&self) -> &Arc<dyn PoolTopologyClient> {
        &self.topology
    }

    pub fn pin_manager(&self) -> &Arc<dyn PinManagerClient> {
        &self.pin_manager
    }

    fn active_set(&self) -> MutexGuard<'_, HashSet<PnfsId>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim a file for an outbound migration task. Returns false if some
    /// job already holds it.
    pub fn lock(&self, pnfs_id: &PnfsId) -> bool {
        self.active_set().insert(pnfs_id.clone())
    }

    pub fn unlock(&self, pnfs_id: &PnfsId) {
        self.active_set().remove(pnfs_id);
    }

    /// Whether this pool has an active outbound migration task for the
    /// file. The destination-side handler consults this to reject
    /// cross-migration races.
    pub fn is_active(&self, pnfs_id: &PnfsId) -> bool {
        self.active_set().contains(pnfs_id)
    }
}
