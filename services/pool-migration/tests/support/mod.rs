// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! In-memory mock collaborators shared by the integration tests.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use migration_types::{
    AccessLatency, CacheEntryMode, CellPath, CopyFinishedMessage, FileAttributes, ModeState,
    PnfsId, PoolCostInfo, PoolInformation, PoolMigrationMessage, PoolName, ReplicaState,
    RetentionPolicy, StickyRecord, StorageAttributes,
};
use pool_migration::context::MigrationContext;
use pool_migration::filters::StateFilter;
use pool_migration::job::JobDefinition;
use pool_migration::messaging::{MessageEndpoint, MessageError, MessageStub};
use pool_migration::module::MigrationModule;
use pool_migration::pool_list::{PoolListByNames, RefreshablePoolList};
use pool_migration::repository::{CacheEntry, Repository, RepositoryError, RepositoryEvent};
use pool_migration::select::ProportionalSelection;
use pool_migration::server::{Disposition, MigrationServer};
use pool_migration::services::{
    ChecksumError, ChecksumService, NamespaceClient, NamespaceError, PinError, PinManagerClient,
    PoolTopologyClient, ReplicaTransferClient, TopologyError, TransferError,
};
use pool_migration::MigrationSettings;

// ============================================================================
// Entry helpers
// ============================================================================

pub fn make_attributes(id: &str, size: u64) -> FileAttributes {
    FileAttributes {
        pnfs_id: PnfsId::new(id),
        size,
        storage: StorageAttributes {
            storage_class: "exp:raw".to_string(),
            hsm: "osm".to_string(),
            access_latency: AccessLatency::Online,
            retention_policy: RetentionPolicy::Replica,
        },
        checksum: None,
    }
}

pub fn make_entry(id: &str, size: u64, state: ReplicaState) -> CacheEntry {
    CacheEntry {
        attributes: make_attributes(id, size),
        state,
        sticky: Vec::new(),
        last_access: Utc::now(),
    }
}

pub fn make_pool_info(name: &str, free: u64) -> PoolInformation {
    PoolInformation {
        name: name.to_string(),
        cost: PoolCostInfo {
            space_cost: 1.0,
            cpu_cost: 0.1,
            free,
            used: 0,
            removable: 0,
            total: free,
            gap: 0,
            breakeven: 0.0,
            lru_age_seconds: 0,
        },
    }
}

/// Poll until the condition holds; virtual time advances while waiting.
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..30_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

// ============================================================================
// Repository
// ============================================================================

pub struct MemoryRepository {
    entries: Mutex<HashMap<PnfsId, CacheEntry>>,
    events: broadcast::Sender<RepositoryEvent>,
}

impl MemoryRepository {
    pub fn new() -> Arc<MemoryRepository> {
        let (events, _) = broadcast::channel(256);
        Arc::new(MemoryRepository {
            entries: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn insert(&self, entry: CacheEntry) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(entry.pnfs_id().clone(), entry.clone());
        let _ = self.events.send(RepositoryEvent::Added(entry));
    }

    pub fn remove(&self, pnfs_id: &PnfsId) {
        let mut entries = self.entries.lock().unwrap();
        if entries.remove(pnfs_id).is_some() {
            let _ = self.events.send(RepositoryEvent::Removed(pnfs_id.clone()));
        }
    }

    pub fn get(&self, pnfs_id: &PnfsId) -> Option<CacheEntry> {
        self.entries.lock().unwrap().get(pnfs_id).cloned()
    }

    pub fn contains(&self, pnfs_id: &PnfsId) -> bool {
        self.entries.lock().unwrap().contains_key(pnfs_id)
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn list(&self) -> Result<Vec<PnfsId>, RepositoryError> {
        Ok(self.entries.lock().unwrap().keys().cloned().collect())
    }

    async fn entry(&self, pnfs_id: &PnfsId) -> Result<CacheEntry, RepositoryError> {
        self.entries
            .lock()
            .unwrap()
            .get(pnfs_id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(pnfs_id.clone()))
    }

    async fn set_state(
        &self,
        pnfs_id: &PnfsId,
        state: ReplicaState,
    ) -> Result<(), RepositoryError> {
        let mut entries = self.entries.lock().unwrap();

        if state == ReplicaState::Removed {
            return match entries.remove(pnfs_id) {
                Some(_) => {
                    let _ = self.events.send(RepositoryEvent::Removed(pnfs_id.clone()));
                    Ok(())
                }
                None => Err(RepositoryError::NotFound(pnfs_id.clone())),
            };
        }

        let entry = entries
            .get_mut(pnfs_id)
            .ok_or_else(|| RepositoryError::NotFound(pnfs_id.clone()))?;
        let old = entry.clone();
        entry.state = state;
        let new = entry.clone();
        let _ = self.events.send(RepositoryEvent::Changed {
            old: Some(old),
            new,
        });
        Ok(())
    }

    async fn set_sticky(
        &self,
        pnfs_id: &PnfsId,
        owner: &str,
        expires_at: Option<DateTime<Utc>>,
        overwrite: bool,
    ) -> Result<(), RepositoryError> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .get_mut(pnfs_id)
            .ok_or_else(|| RepositoryError::NotFound(pnfs_id.clone()))?;
        let old = entry.clone();

        let desired = StickyRecord::new(owner, expires_at);
        let expired = !desired.is_valid_at(Utc::now());
        match entry.sticky.iter().position(|r| r.owner == owner) {
            Some(index) => {
                if expired {
                    entry.sticky.remove(index);
                } else if overwrite || desired.outlives(&entry.sticky[index]) {
                    entry.sticky[index] = desired;
                }
            }
            None => {
                if !expired {
                    entry.sticky.push(desired);
                }
            }
        }

        let new = entry.clone();
        let _ = self.events.send(RepositoryEvent::Changed {
            old: Some(old),
            new,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<RepositoryEvent> {
        self.events.subscribe()
    }
}

// ============================================================================
// Namespace
// ============================================================================

pub struct MemoryNamespace {
    locations: Mutex<HashMap<PnfsId, Vec<PoolName>>>,
}

impl MemoryNamespace {
    pub fn new() -> Arc<MemoryNamespace> {
        Arc::new(MemoryNamespace {
            locations: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_locations(&self, pnfs_id: &PnfsId, pools: Vec<PoolName>) {
        self.locations
            .lock()
            .unwrap()
            .insert(pnfs_id.clone(), pools);
    }
}

#[async_trait]
impl NamespaceClient for MemoryNamespace {
    async fn locations(&self, pnfs_id: &PnfsId) -> Result<Vec<PoolName>, NamespaceError> {
        Ok(self
            .locations
            .lock()
            .unwrap()
            .get(pnfs_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ============================================================================
// Pool topology
// ============================================================================

pub struct MemoryTopology {
    pools: Mutex<Vec<PoolInformation>>,
}

impl MemoryTopology {
    pub fn new(pools: Vec<PoolInformation>) -> Arc<MemoryTopology> {
        Arc::new(MemoryTopology {
            pools: Mutex::new(pools),
        })
    }

    pub fn set_pools(&self, pools: Vec<PoolInformation>) {
        *self.pools.lock().unwrap() = pools;
    }
}

#[async_trait]
impl PoolTopologyClient for MemoryTopology {
    async fn pools_by_name(
        &self,
        names: &[String],
    ) -> Result<Vec<PoolInformation>, TopologyError> {
        Ok(self
            .pools
            .lock()
            .unwrap()
            .iter()
            .filter(|p| names.contains(&p.name))
            .cloned()
            .collect())
    }

    async fn pools_by_group(
        &self,
        _groups: &[String],
    ) -> Result<Vec<PoolInformation>, TopologyError> {
        Ok(self.pools.lock().unwrap().clone())
    }

    async fn pools_by_link(&self, _link: &str) -> Result<Vec<PoolInformation>, TopologyError> {
        Ok(self.pools.lock().unwrap().clone())
    }
}

// ============================================================================
// Transfer client, checksum engine, pin manager
// ============================================================================

/// Materializes fetched replicas into the destination repository.
pub struct MemoryTransfer {
    destination: Arc<MemoryRepository>,
    pub fetches: AtomicUsize,
    pub fetched_ids: Mutex<Vec<PnfsId>>,
    pub fail: Mutex<Option<String>>,
    pub delay: Mutex<Option<Duration>>,
}

impl MemoryTransfer {
    pub fn new(destination: Arc<MemoryRepository>) -> Arc<MemoryTransfer> {
        Arc::new(MemoryTransfer {
            destination,
            fetches: AtomicUsize::new(0),
            fetched_ids: Mutex::new(Vec::new()),
            fail: Mutex::new(None),
            delay: Mutex::new(None),
        })
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn fetch_order(&self) -> Vec<PnfsId> {
        self.fetched_ids.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplicaTransferClient for MemoryTransfer {
    async fn fetch_replica(
        &self,
        _source_pool: &PoolName,
        attributes: &FileAttributes,
        state: ReplicaState,
        sticky: &[StickyRecord],
    ) -> Result<(), TransferError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.fetched_ids
            .lock()
            .unwrap()
            .push(attributes.pnfs_id.clone());

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = self.fail.lock().unwrap().clone() {
            return Err(TransferError::Source(message));
        }

        self.destination.insert(CacheEntry {
            attributes: attributes.clone(),
            state,
            sticky: sticky.to_vec(),
            last_access: Utc::now(),
        });
        Ok(())
    }
}

pub struct MemoryChecksum {
    pub verify_on_update: bool,
    pub fail: Mutex<Option<ChecksumError>>,
    pub verifications: AtomicUsize,
}

impl MemoryChecksum {
    pub fn new() -> Arc<MemoryChecksum> {
        Arc::new(MemoryChecksum {
            verify_on_update: false,
            fail: Mutex::new(None),
            verifications: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ChecksumService for MemoryChecksum {
    fn verify_on_update(&self) -> bool {
        self.verify_on_update
    }

    async fn verify(&self, _attributes: &FileAttributes) -> Result<(), ChecksumError> {
        self.verifications.fetch_add(1, Ordering::SeqCst);
        match self.fail.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

pub struct MemoryPinManager {
    pub moves: Mutex<Vec<(PnfsId, PoolName)>>,
}

impl MemoryPinManager {
    pub fn new() -> Arc<MemoryPinManager> {
        Arc::new(MemoryPinManager {
            moves: Mutex::new(Vec::new()),
        })
    }

    pub fn move_count(&self) -> usize {
        self.moves.lock().unwrap().len()
    }
}

#[async_trait]
impl PinManagerClient for MemoryPinManager {
    fn pin_owner_prefix(&self) -> &str {
        "pin-manager"
    }

    async fn move_pin(
        &self,
        pnfs_id: &PnfsId,
        target_pool: &PoolName,
    ) -> Result<(), PinError> {
        self.moves
            .lock()
            .unwrap()
            .push((pnfs_id.clone(), target_pool.clone()));
        Ok(())
    }
}

// ============================================================================
// Loopback message endpoint
// ============================================================================

enum Route {
    Server(Arc<MigrationServer>),
    Module(Arc<MigrationModule>),
}

/// Routes protocol messages between in-process pools by cell-path
/// destination. Discarded messages never produce an acknowledgment, so
/// the sender's stub times out.
pub struct LoopbackEndpoint {
    routes: Mutex<HashMap<PoolName, Route>>,
    /// Pools that currently drop every message (simulated dead peers)
    unreachable: Mutex<Vec<PoolName>>,
    /// Terminal replies observed, for server-level tests with no module
    pub finished: Mutex<Vec<CopyFinishedMessage>>,
}

impl LoopbackEndpoint {
    pub fn new() -> Arc<LoopbackEndpoint> {
        Arc::new(LoopbackEndpoint {
            routes: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
        })
    }

    pub fn register_server(&self, pool: &str, server: Arc<MigrationServer>) {
        self.routes
            .lock()
            .unwrap()
            .insert(pool.to_string(), Route::Server(server));
    }

    pub fn register_module(&self, pool: &str, module: Arc<MigrationModule>) {
        self.routes
            .lock()
            .unwrap()
            .insert(pool.to_string(), Route::Module(module));
    }

    pub fn set_unreachable(&self, pool: &str, down: bool) {
        let mut unreachable = self.unreachable.lock().unwrap();
        if down {
            if !unreachable.contains(&pool.to_string()) {
                unreachable.push(pool.to_string());
            }
        } else {
            unreachable.retain(|p| p != pool);
        }
    }

    pub fn finished_messages(&self) -> Vec<CopyFinishedMessage> {
        self.finished.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageEndpoint for LoopbackEndpoint {
    async fn send(
        &self,
        path: &CellPath,
        message: PoolMigrationMessage,
    ) -> Result<(), MessageError> {
        let destination = path.destination().to_string();

        if self.unreachable.lock().unwrap().contains(&destination) {
            // Swallow the message; the sender's timeout does the rest.
            return std::future::pending().await;
        }

        if let PoolMigrationMessage::Finished(msg) = &message {
            self.finished.lock().unwrap().push(msg.clone());
        }

        let route = {
            let routes = self.routes.lock().unwrap();
            match routes.get(&destination) {
                Some(Route::Server(server)) => Route::Server(Arc::clone(server)),
                Some(Route::Module(module)) => Route::Module(Arc::clone(module)),
                None => return Err(MessageError::NoRoute(destination)),
            }
        };

        match route {
            Route::Server(server) => {
                let source = match &message {
                    PoolMigrationMessage::Copy(m) => m.pool.clone(),
                    PoolMigrationMessage::Update(m) => m.pool.clone(),
                    PoolMigrationMessage::Ping(m) => m.pool.clone(),
                    PoolMigrationMessage::Cancel(m) => m.pool.clone(),
                    PoolMigrationMessage::Finished(m) => m.pool.clone(),
                };
                match server.message_arrived(message, CellPath::new(source)).await {
                    Ok(Disposition::Reply) => Ok(()),
                    Ok(Disposition::Discard) => std::future::pending().await,
                    Err(failure) => Err(MessageError::Remote(failure)),
                }
            }
            Route::Module(module) => {
                if let PoolMigrationMessage::Finished(msg) = message {
                    module.message_arrived(msg);
                }
                Ok(())
            }
        }
    }
}

// ============================================================================
// Job definitions
// ============================================================================

/// A copy-to-`DEST_POOL` definition over cached/precious replicas, with
/// the pool list already refreshed so scheduling can start immediately.
pub async fn default_definition(topology: &Arc<MemoryTopology>) -> JobDefinition {
    let pool_list: Arc<dyn RefreshablePoolList> = Arc::new(PoolListByNames::new(
        Arc::clone(topology) as Arc<dyn PoolTopologyClient>,
        vec![DEST_POOL.to_string()],
    ));
    pool_list.refresh().await;
    JobDefinition {
        filters: vec![Box::new(StateFilter::new([
            ReplicaState::Cached,
            ReplicaState::Precious,
        ]))],
        source_mode: CacheEntryMode::new(ModeState::Same),
        target_mode: CacheEntryMode::new(ModeState::Cached),
        selection: Box::new(ProportionalSelection::with_seed(11)),
        pool_list,
        refresh_period: Duration::from_secs(300),
        order: None,
        permanent: false,
        eager: false,
        must_move_pins: false,
        verify_checksum: false,
    }
}

// ============================================================================
// Two-pool harness
// ============================================================================

pub const SOURCE_POOL: &str = "pool-a";
pub const DEST_POOL: &str = "pool-b";

/// A source pool (module + job engine) wired to a destination pool
/// (request handler) through the loopback endpoint.
pub struct Harness {
    pub endpoint: Arc<LoopbackEndpoint>,
    pub source_repo: Arc<MemoryRepository>,
    pub dest_repo: Arc<MemoryRepository>,
    pub namespace: Arc<MemoryNamespace>,
    pub topology: Arc<MemoryTopology>,
    pub transfer: Arc<MemoryTransfer>,
    pub checksum: Arc<MemoryChecksum>,
    pub pin_manager: Arc<MemoryPinManager>,
    pub source_context: Arc<MigrationContext>,
    pub dest_context: Arc<MigrationContext>,
    pub module: Arc<MigrationModule>,
    pub server: Arc<MigrationServer>,
}

impl Harness {
    pub fn new() -> Harness {
        let endpoint = LoopbackEndpoint::new();
        let settings = MigrationSettings::default();
        let stub = MessageStub::new(
            Arc::clone(&endpoint) as Arc<dyn MessageEndpoint>,
            settings.message_timeout,
        );

        let source_repo = MemoryRepository::new();
        let dest_repo = MemoryRepository::new();
        let namespace = MemoryNamespace::new();
        let topology = MemoryTopology::new(vec![make_pool_info(DEST_POOL, 1 << 30)]);
        let transfer = MemoryTransfer::new(Arc::clone(&dest_repo));
        let checksum = MemoryChecksum::new();
        let pin_manager = MemoryPinManager::new();

        let source_context = Arc::new(MigrationContext::new(
            SOURCE_POOL.to_string(),
            tokio::runtime::Handle::current(),
            settings.clone(),
            stub.clone(),
            Arc::clone(&source_repo) as Arc<dyn Repository>,
            Arc::clone(&namespace) as Arc<dyn NamespaceClient>,
            Arc::clone(&topology) as Arc<dyn PoolTopologyClient>,
            Arc::clone(&pin_manager) as Arc<dyn PinManagerClient>,
        ));
        let dest_context = Arc::new(MigrationContext::new(
            DEST_POOL.to_string(),
            tokio::runtime::Handle::current(),
            settings,
            stub,
            Arc::clone(&dest_repo) as Arc<dyn Repository>,
            Arc::clone(&namespace) as Arc<dyn NamespaceClient>,
            Arc::clone(&topology) as Arc<dyn PoolTopologyClient>,
            Arc::clone(&pin_manager) as Arc<dyn PinManagerClient>,
        ));

        let module = Arc::new(MigrationModule::new(Arc::clone(&source_context)));
        let server = MigrationServer::new(
            Arc::clone(&dest_context),
            Arc::clone(&transfer) as Arc<dyn ReplicaTransferClient>,
            Arc::clone(&checksum) as Arc<dyn ChecksumService>,
        );

        endpoint.register_module(SOURCE_POOL, Arc::clone(&module));
        endpoint.register_server(DEST_POOL, Arc::clone(&server));

        Harness {
            endpoint,
            source_repo,
            dest_repo,
            namespace,
            topology,
            transfer,
            checksum,
            pin_manager,
            source_context,
            dest_context,
            module,
            server,
        }
    }
}
