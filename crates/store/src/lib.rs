//! estack store: pod expectations bookkeeping and the published cluster state snapshot.
//!
//! Access pattern for [`Expectations`]:
//! - the reconcile path raises expectations right before it issues a create/delete call;
//! - the observation path (watch events, usually through [`spawn_observer`]) lowers them;
//! - the driver skips a resource while `fulfilled(key)` is false.
//!
//! Every read-modify-write happens under one mutex held only for the map update, so both
//! paths may run on different tasks or threads. No lock is held across an `.await`.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard};

use estack_core::ResourceKey;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

mod snapshot;

pub use snapshot::{state_channel, StateHandle, StatePublisher};

/// Actions issued for a resource but not yet seen in the informer cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Outstanding {
    pub creations: u64,
    pub deletions: u64,
}

impl Outstanding {
    pub fn is_zero(&self) -> bool {
        self.creations == 0 && self.deletions == 0
    }
}

/// Per-resource expectations. Construct one per driver and share it via `Arc`.
#[derive(Debug, Default)]
pub struct Expectations {
    counts: Mutex<FxHashMap<ResourceKey, Outstanding>>,
}

impl Expectations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn expect_deletions(&self, key: &ResourceKey, n: u64) {
        if n == 0 {
            return;
        }
        self.update(key, |o| o.deletions = o.deletions.saturating_add(n));
        counter!("expectations_raised", n, "kind" => "deletion");
    }

    pub fn expect_deletion(&self, key: &ResourceKey) {
        self.expect_deletions(key, 1);
    }

    /// Lower outstanding deletions by one; never below zero.
    pub fn observe_deletion(&self, key: &ResourceKey) {
        self.update(key, |o| o.deletions = o.deletions.saturating_sub(1));
        counter!("expectations_observed", 1u64, "kind" => "deletion");
    }

    /// Raise outstanding creations by `n`. The pod-creating reconcile path lives outside
    /// this workspace and calls this before it issues creates; the watch path lowers it.
    pub fn expect_creations(&self, key: &ResourceKey, n: u64) {
        if n == 0 {
            return;
        }
        self.update(key, |o| o.creations = o.creations.saturating_add(n));
        counter!("expectations_raised", n, "kind" => "creation");
    }

    pub fn observe_creation(&self, key: &ResourceKey) {
        self.update(key, |o| o.creations = o.creations.saturating_sub(1));
        counter!("expectations_observed", 1u64, "kind" => "creation");
    }

    /// True when nothing is outstanding for `key`, including keys never seen.
    pub fn fulfilled(&self, key: &ResourceKey) -> bool {
        self.outstanding(key).is_zero()
    }

    pub fn outstanding(&self, key: &ResourceKey) -> Outstanding {
        self.lock().get(key).copied().unwrap_or_default()
    }

    /// Drop all bookkeeping for a resource that no longer exists.
    pub fn forget(&self, key: &ResourceKey) {
        let mut map = self.lock();
        map.remove(key);
        gauge!("expectations_pending_resources", map.len() as f64);
    }

    /// Number of resources with something outstanding.
    pub fn pending_resources(&self) -> usize {
        self.lock().len()
    }

    fn update(&self, key: &ResourceKey, f: impl FnOnce(&mut Outstanding)) {
        let mut map = self.lock();
        let mut cur = map.get(key).copied().unwrap_or_default();
        f(&mut cur);
        if cur.is_zero() {
            map.remove(key);
        } else {
            map.insert(key.clone(), cur);
        }
        gauge!("expectations_pending_resources", map.len() as f64);
    }

    // Counters stay consistent even if a holder panicked mid-update: every update is a
    // single insert/remove on a copied value.
    fn lock(&self) -> MutexGuard<'_, FxHashMap<ResourceKey, Outstanding>> {
        self.counts.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A change observed in the informer cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Created(ResourceKey),
    Deleted(ResourceKey),
    /// The owning resource itself went away.
    Forgotten(ResourceKey),
}

impl Observation {
    pub fn key(&self) -> &ResourceKey {
        match self {
            Observation::Created(k) | Observation::Deleted(k) | Observation::Forgotten(k) => k,
        }
    }
}

/// Apply one observation to the tracker.
pub fn apply_observation(expectations: &Expectations, obs: &Observation) {
    match obs {
        Observation::Created(k) => expectations.observe_creation(k),
        Observation::Deleted(k) => expectations.observe_deletion(k),
        Observation::Forgotten(k) => expectations.forget(k),
    }
}

/// Spawn the observation loop. Observations are applied in arrival order; the task ends
/// once every sender is dropped and returns how many it applied.
pub fn spawn_observer(expectations: Arc<Expectations>, cap: usize) -> (mpsc::Sender<Observation>, JoinHandle<u64>) {
    let (tx, mut rx) = mpsc::channel::<Observation>(cap.max(1));
    let handle = tokio::spawn(async move {
        let mut applied = 0u64;
        while let Some(obs) = rx.recv().await {
            debug!(resource = %obs.key(), observation = ?obs, "applying observation");
            apply_observation(&expectations, &obs);
            applied += 1;
        }
        info!(applied, "observation loop stopped");
        applied
    });
    (tx, handle)
}
