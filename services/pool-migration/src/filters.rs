// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Cache-entry filters.
//!
//! A job admits a replica only if every filter in its definition accepts
//! it. Filters are evaluated synchronously against the repository's view
//! of the entry, both during the initial scan and on repository change
//! events.

use std::collections::HashSet;

use chrono::Utc;

use migration_types::{AccessLatency, PnfsId, ReplicaState, RetentionPolicy};

use crate::repository::CacheEntry;

/// Predicate over a replica's metadata.
pub trait CacheEntryFilter: Send + Sync {
    fn accept(&self, entry: &CacheEntry) -> bool;
}

/// A possibly open-ended interval over `u64` values, inclusive at both
/// bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    min: Option<u64>,
    max: Option<u64>,
}

impl Interval {
    pub fn all() -> Interval {
        Interval {
            min: None,
            max: None,
        }
    }

    pub fn at_least(min: u64) -> Interval {
        Interval {
            min: Some(min),
            max: None,
        }
    }

    pub fn at_most(max: u64) -> Interval {
        Interval {
            min: None,
            max: Some(max),
        }
    }

    pub fn closed(min: u64, max: u64) -> Interval {
        Interval {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn singleton(value: u64) -> Interval {
        Interval::closed(value, value)
    }

    pub fn contains(&self, value: u64) -> bool {
        self.min.is_none_or(|min| value >= min) && self.max.is_none_or(|max| value <= max)
    }
}

/// Accepts replicas in one of the given states.
pub struct StateFilter {
    states: Vec<ReplicaState>,
}

impl StateFilter {
    pub fn new(states: impl Into<Vec<ReplicaState>>) -> StateFilter {
        StateFilter {
            states: states.into(),
        }
    }
}

impl CacheEntryFilter for StateFilter {
    fn accept(&self, entry: &CacheEntry) -> bool {
        self.states.contains(&entry.state)
    }
}

/// Accepts replicas carrying at least one unexpired sticky record.
pub struct StickyFilter;

impl CacheEntryFilter for StickyFilter {
    fn accept(&self, entry: &CacheEntry) -> bool {
        let now = Utc::now();
        entry.sticky.iter().any(|r| r.is_valid_at(now))
    }
}

/// Accepts replicas carrying an unexpired sticky record of the given owner.
pub struct StickyOwnerFilter {
    owner: String,
}

impl StickyOwnerFilter {
    pub fn new(owner: impl Into<String>) -> StickyOwnerFilter {
        StickyOwnerFilter {
            owner: owner.into(),
        }
    }
}

impl CacheEntryFilter for StickyOwnerFilter {
    fn accept(&self, entry: &CacheEntry) -> bool {
        let now = Utc::now();
        entry
            .sticky
            .iter()
            .any(|r| r.owner == self.owner && r.is_valid_at(now))
    }
}

/// Accepts replicas whose file size falls in the interval.
pub struct SizeFilter {
    interval: Interval,
}

impl SizeFilter {
    pub fn new(interval: Interval) -> SizeFilter {
        SizeFilter { interval }
    }
}

impl CacheEntryFilter for SizeFilter {
    fn accept(&self, entry: &CacheEntry) -> bool {
        self.interval.contains(entry.size())
    }
}

/// Accepts replicas whose last access lies the given number of seconds in
/// the past.
pub struct AccessedFilter {
    seconds_ago: Interval,
}

impl AccessedFilter {
    pub fn new(seconds_ago: Interval) -> AccessedFilter {
        AccessedFilter { seconds_ago }
    }
}

impl CacheEntryFilter for AccessedFilter {
    fn accept(&self, entry: &CacheEntry) -> bool {
        let elapsed = Utc::now()
            .signed_duration_since(entry.last_access)
            .num_seconds()
            .max(0) as u64;
        self.seconds_ago.contains(elapsed)
    }
}

/// Accepts replicas of files with the given access latency.
pub struct AccessLatencyFilter {
    latency: AccessLatency,
}

impl AccessLatencyFilter {
    pub fn new(latency: AccessLatency) -> AccessLatencyFilter {
        AccessLatencyFilter { latency }
    }
}

impl CacheEntryFilter for AccessLatencyFilter {
    fn accept(&self, entry: &CacheEntry) -> bool {
        entry.attributes.storage.access_latency == self.latency
    }
}

/// Accepts replicas of files with the given retention policy.
pub struct RetentionPolicyFilter {
    policy: RetentionPolicy,
}

impl RetentionPolicyFilter {
    pub fn new(policy: RetentionPolicy) -> RetentionPolicyFilter {
        RetentionPolicyFilter { policy }
    }
}

impl CacheEntryFilter for RetentionPolicyFilter {
    fn accept(&self, entry: &CacheEntry) -> bool {
        entry.attributes.storage.retention_policy == self.policy
    }
}

/// Accepts replicas of files in the given storage unit ("class@hsm").
pub struct StorageClassFilter {
    unit: String,
}

impl StorageClassFilter {
    pub fn new(unit: impl Into<String>) -> StorageClassFilter {
        StorageClassFilter { unit: unit.into() }
    }
}

impl CacheEntryFilter for StorageClassFilter {
    fn accept(&self, entry: &CacheEntry) -> bool {
        entry.attributes.storage.unit() == self.unit
    }
}

/// Accepts replicas of an explicit set of files.
pub struct PnfsIdFilter {
    ids: HashSet<PnfsId>,
}

impl PnfsIdFilter {
    pub fn new(ids: HashSet<PnfsId>) -> PnfsIdFilter {
        PnfsIdFilter { ids }
    }
}

impl CacheEntryFilter for PnfsIdFilter {
    fn accept(&self, entry: &CacheEntry) -> bool {
        self.ids.contains(entry.pnfs_id())
    }
}
