// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! Target-pool selection strategies.
//!
//! A strategy chooses one pool from a non-empty candidate list; passing an
//! empty list is a caller error and the task state machine guards against
//! it before asking.

use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use migration_types::{PoolCostInfo, PoolInformation};

const SECONDS_PER_WEEK: f64 = 7.0 * 24.0 * 3600.0;

/// Chooses one target pool from a weighted candidate list.
pub trait PoolSelectionStrategy: Send + Sync {
    /// `pools` must be non-empty.
    fn select<'a>(&self, pools: &'a [PoolInformation]) -> &'a PoolInformation;
}

/// Half-life in seconds with which removable bytes decay out of the
/// available-space estimate, derived from the pool's breakeven parameter.
fn half_life_seconds(breakeven: f64) -> Option<f64> {
    if breakeven <= 0.0 {
        // No decay; all removable space counts as available.
        None
    } else if breakeven >= 1.0 {
        Some(2.0 * SECONDS_PER_WEEK)
    } else {
        Some(SECONDS_PER_WEEK * (-std::f64::consts::LN_2 / breakeven.ln()))
    }
}

/// Removable bytes are modeled as linearly distributed in age between 0
/// and the LRU age of the pool's oldest removable byte; each byte's
/// surviving fraction decays exponentially with the pool's half-life.
fn decayed_removable(cost: &PoolCostInfo) -> f64 {
    let removable = cost.removable as f64;
    let Some(half_life) = half_life_seconds(cost.breakeven) else {
        return removable;
    };
    let lru = cost.lru_age_seconds as f64;
    if lru <= 0.0 {
        return removable;
    }
    let fraction =
        half_life / (lru * std::f64::consts::LN_2) * (1.0 - (-lru / half_life).exp2());
    removable * fraction
}

/// Selection weight of a pool: free plus decayed removable bytes, zeroed
/// out when at or below the pool's configured gap.
fn proportional_weight(cost: &PoolCostInfo) -> f64 {
    let available = cost.free as f64 + decayed_removable(cost);
    if available <= cost.gap as f64 {
        0.0
    } else {
        available
    }
}

fn lock_rng(rng: &Mutex<StdRng>) -> MutexGuard<'_, StdRng> {
    rng.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Selects a pool with probability proportional to its available space.
pub struct ProportionalSelection {
    rng: Mutex<StdRng>,
}

impl ProportionalSelection {
    pub fn new() -> ProportionalSelection {
        ProportionalSelection {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn with_seed(seed: u64) -> ProportionalSelection {
        ProportionalSelection {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for ProportionalSelection {
    fn default() -> Self {
        ProportionalSelection::new()
    }
}

impl PoolSelectionStrategy for ProportionalSelection {
    fn select<'a>(&self, pools: &'a [PoolInformation]) -> &'a PoolInformation {
        debug_assert!(!pools.is_empty());
        let weights: Vec<f64> = pools.iter().map(|p| proportional_weight(&p.cost)).collect();
        let total: f64 = weights.iter().sum();

        let mut rng = lock_rng(&self.rng);
        if total <= 0.0 {
            // Every candidate is full; fall back to a uniform pick.
            return &pools[rng.random_range(0..pools.len())];
        }

        // Roulette wheel: the first pool whose cumulative weight meets the
        // threshold wins; rounding remainders resolve to the last pool.
        let threshold = rng.random_range(0.0..total);
        let mut cumulative = 0.0;
        for (pool, weight) in pools.iter().zip(&weights) {
            cumulative += weight;
            if cumulative >= threshold && *weight > 0.0 {
                return pool;
            }
        }
        &pools[pools.len() - 1]
    }
}

/// Deterministically selects the pool with the lowest cost; ties go to the
/// earliest pool in the list.
pub struct BestSelection;

impl BestSelection {
    fn cost(pool: &PoolInformation) -> f64 {
        pool.cost.space_cost + pool.cost.cpu_cost
    }
}

impl PoolSelectionStrategy for BestSelection {
    fn select<'a>(&self, pools: &'a [PoolInformation]) -> &'a PoolInformation {
        debug_assert!(!pools.is_empty());
        let mut best = &pools[0];
        for pool in &pools[1..] {
            if BestSelection::cost(pool) < BestSelection::cost(best) {
                best = pool;
            }
        }
        best
    }
}

/// Uniform pick among the supplied pools.
pub struct RandomSelection {
    rng: Mutex<StdRng>,
}

impl RandomSelection {
    pub fn new() -> RandomSelection {
        RandomSelection {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    pub fn with_seed(seed: u64) -> RandomSelection {
        RandomSelection {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomSelection {
    fn default() -> Self {
        RandomSelection::new()
    }
}

impl PoolSelectionStrategy for RandomSelection {
    fn select<'a>(&self, pools: &'a [PoolInformation]) -> &'a PoolInformation {
        debug_assert!(!pools.is_empty());
        let mut rng = lock_rng(&self.rng);
        &pools[rng.random_range(0..pools.len())]
    }
}
