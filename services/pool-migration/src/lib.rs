// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Replica migration engine for a storage-pool node.
//!
//! This library copies, replicates, or relocates file replicas between
//! storage pools, atomically updating replica state on both ends. The
//! source side runs jobs: bulk operations that scan the local repository,
//! queue matching replicas, and schedule per-replica transfer tasks. The
//! destination side handles the resulting protocol messages, either
//! pulling a fresh copy via the bulk-transfer client or raising an
//! existing replica to the requested mode.
//!
//! Consistency is best-effort and retry-driven: a single coordinating
//! pool per job, idempotence via location queries, and TTL-guarded
//! messages so stale requests cannot mutate state after the sender has
//! abandoned them.
//!
//! No component spawns threads of its own; everything runs on the
//! executor handle injected through [`context::MigrationContext`], and
//! all external collaborators (namespace, pool topology, bulk transfer,
//! checksums, pin manager) are trait seams.

pub mod config;
pub mod context;
pub mod filters;
pub mod job;
pub mod messaging;
pub mod module;
pub mod pool_list;
pub mod repository;
pub mod select;
pub mod server;
pub mod services;
pub mod task;

pub use config::MigrationSettings;
pub use context::MigrationContext;
pub use job::{Job, JobDefinition, JobInfo, JobState};
pub use module::{JobCreationError, MigrationModule};
pub use server::{Disposition, MigrationServer};
pub use task::{TaskState, TaskSummary};
