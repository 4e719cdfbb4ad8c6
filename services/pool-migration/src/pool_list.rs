// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Refreshable target-pool lists.
//!
//! A job's admissible target-pool set is resolved from the pool topology
//! service by fixed pool names, by pool group, or by link. Results are
//! cached until the next explicit `refresh()`, which the owning job
//! invokes on a fixed period. The filter decorator narrows the set by
//! glob patterns and an injected predicate; the grammar producing such
//! predicates is external to this crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use regex::Regex;
use tracing::warn;

use migration_types::PoolInformation;

use crate::services::{PoolTopologyClient, TopologyError};

/// The current admissible target-pool set of a job.
#[async_trait]
pub trait RefreshablePoolList: Send + Sync {
    /// Re-query the pool topology service. A failed query keeps the
    /// previous snapshot.
    async fn refresh(&self);

    /// Whether at least one query has succeeded since creation.
    fn is_valid(&self) -> bool;

    /// Snapshot of the current pool set.
    fn pools(&self) -> Vec<PoolInformation>;
}

/// Injected boolean predicate over a pool's attributes, used for the
/// include-when/exclude-when conditions.
pub type PoolPredicate = dyn Fn(&PoolInformation) -> bool + Send + Sync;

struct PoolCache {
    valid: AtomicBool,
    pools: RwLock<Vec<PoolInformation>>,
}

impl PoolCache {
    fn new() -> PoolCache {
        PoolCache {
            valid: AtomicBool::new(false),
            pools: RwLock::new(Vec::new()),
        }
    }

    fn store(&self, pools: Vec<PoolInformation>) {
        *self
            .pools
            .write()
            .unwrap_or_else(PoisonError::into_inner) = pools;
        self.valid.store(true, Ordering::Release);
    }

    fn snapshot(&self) -> Vec<PoolInformation> {
        self.pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn log_refresh_failure(what: &str, error: &TopologyError) {
    warn!(target_set = %what, error = %error, "Pool list refresh failed, keeping previous snapshot");
}

/// Pool list resolved from a fixed set of pool names.
pub struct PoolListByNames {
    topology: Arc<dyn PoolTopologyClient>,
    names: Vec<String>,
    cache: PoolCache,
}

impl PoolListByNames {
    pub fn new(topology: Arc<dyn PoolTopologyClient>, names: Vec<String>) -> PoolListByNames {
        PoolListByNames {
            topology,
            names,
            cache: PoolCache::new(),
        }
    }
}

#[async_trait]
impl RefreshablePoolList for PoolListByNames {
    async fn refresh(&self) {
        match self.topology.pools_by_name(&self.names).await {
            Ok(pools) => self.cache.store(pools),
            Err(e) => log_refresh_failure(&self.names.join(","), &e),
        }
    }

    fn is_valid(&self) -> bool {
        self.cache.valid.load(Ordering::Acquire)
    }

    fn pools(&self) -> Vec<PoolInformation> {
        self.cache.snapshot()
    }
}

/// Pool list resolved from pool-group membership.
pub struct PoolListByPoolGroup {
    topology: Arc<dyn PoolTopologyClient>,
    groups: Vec<String>,
    cache: PoolCache,
}

impl PoolListByPoolGroup {
    pub fn new(
        topology: Arc<dyn PoolTopologyClient>,
        groups: Vec<String>,
    ) -> PoolListByPoolGroup {
        PoolListByPoolGroup {
            topology,
            groups,
            cache: PoolCache::new(),
        }
    }
}

#[async_trait]
impl RefreshablePoolList for PoolListByPoolGroup {
    async fn refresh(&self) {
        match self.topology.pools_by_group(&self.groups).await {
            Ok(pools) => self.cache.store(pools),
            Err(e) => log_refresh_failure(&self.groups.join(","), &e),
        }
    }

    fn is_valid(&self) -> bool {
        self.cache.valid.load(Ordering::Acquire)
    }

    fn pools(&self) -> Vec<PoolInformation> {
        self.cache.snapshot()
    }
}

/// Pool list resolved from link membership.
pub struct PoolListByLink {
    topology: Arc<dyn PoolTopologyClient>,
    link: String,
    cache: PoolCache,
}

impl PoolListByLink {
    pub fn new(topology: Arc<dyn PoolTopologyClient>, link: String) -> PoolListByLink {
        PoolListByLink {
            topology,
            link,
            cache: PoolCache::new(),
        }
    }
}

#[async_trait]
impl RefreshablePoolList for PoolListByLink {
    async fn refresh(&self) {
        match self.topology.pools_by_link(&self.link).await {
            Ok(pools) => self.cache.store(pools),
            Err(e) => log_refresh_failure(&self.link, &e),
        }
    }

    fn is_valid(&self) -> bool {
        self.cache.valid.load(Ordering::Acquire)
    }

    fn pools(&self) -> Vec<PoolInformation> {
        self.cache.snapshot()
    }
}

/// A glob pattern over pool names; `*` and `?` wildcards.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    regex: Regex,
}

impl GlobPattern {
    pub fn new(glob: &str) -> Result<GlobPattern, regex::Error> {
        let mut pattern = String::with_capacity(glob.len() + 2);
        pattern.push('^');
        for c in glob.chars() {
            match c {
                '*' => pattern.push_str(".*"),
                '?' => pattern.push('.'),
                c => pattern.push_str(&regex::escape(&c.to_string())),
            }
        }
        pattern.push('$');
        Ok(GlobPattern {
            regex: Regex::new(&pattern)?,
        })
    }

    pub fn matches(&self, name: &str) -> bool {
        self.regex.is_match(name)
    }
}

/// Decorator narrowing another pool list by glob include/exclude patterns
/// and injected predicates.
pub struct PoolListFilter {
    inner: Arc<dyn RefreshablePoolList>,
    exclude: Vec<GlobPattern>,
    exclude_when: Option<Arc<PoolPredicate>>,
    include: Vec<GlobPattern>,
    include_when: Option<Arc<PoolPredicate>>,
}

impl PoolListFilter {
    pub fn new(
        inner: Arc<dyn RefreshablePoolList>,
        exclude: Vec<GlobPattern>,
        exclude_when: Option<Arc<PoolPredicate>>,
        include: Vec<GlobPattern>,
        include_when: Option<Arc<PoolPredicate>>,
    ) -> PoolListFilter {
        PoolListFilter {
            inner,
            exclude,
            exclude_when,
            include,
            include_when,
        }
    }

    fn is_excluded(&self, pool: &PoolInformation) -> bool {
        if self.exclude.iter().any(|g| g.matches(&pool.name)) {
            return true;
        }
        self.exclude_when.as_ref().is_some_and(|p| p(pool))
    }

    fn is_included(&self, pool: &PoolInformation) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|g| g.matches(&pool.name)) {
            return false;
        }
        self.include_when.as_ref().is_none_or(|p| p(pool))
    }
}

#[async_trait]
impl RefreshablePoolList for PoolListFilter {
    async fn refresh(&self) {
        self.inner.refresh().await;
    }

    fn is_valid(&self) -> bool {
        self.inner.is_valid()
    }

    fn pools(&self) -> Vec<PoolInformation> {
        self.inner
            .pools()
            .into_iter()
            .filter(|p| !self.is_excluded(p) && self.is_included(p))
            .collect()
    }
}
