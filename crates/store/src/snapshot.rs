//! Published cluster state: the observer swaps in whole snapshots, evaluators load one
//! `Arc` and keep it for the duration of an evaluation.

use std::sync::Arc;

use arc_swap::ArcSwap;
use estack_core::{ClusterState, ObservedState};
use metrics::counter;
use tokio::sync::watch;
use tracing::debug;

/// Read side. Cheap to clone.
#[derive(Clone)]
pub struct StateHandle {
    snap: Arc<ArcSwap<ObservedState>>,
    epoch_rx: watch::Receiver<u64>,
}

impl StateHandle {
    /// The current observation. Later publishes do not affect the returned value.
    pub fn current(&self) -> Arc<ObservedState> {
        self.snap.load_full()
    }

    pub fn epoch(&self) -> u64 {
        *self.epoch_rx.borrow()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }
}

/// Write side, owned by the cluster state observer.
pub struct StatePublisher {
    snap: Arc<ArcSwap<ObservedState>>,
    epoch_tx: watch::Sender<u64>,
    epoch: u64,
}

impl StatePublisher {
    pub fn publish(&mut self, state: ClusterState) {
        self.store(ObservedState::new(state));
    }

    /// Record that the last fetch failed; readers see an unknown state.
    pub fn publish_unknown(&mut self) {
        self.store(ObservedState::unknown());
    }

    fn store(&mut self, next: ObservedState) {
        self.epoch = self.epoch.saturating_add(1);
        self.snap.store(Arc::new(next));
        let _ = self.epoch_tx.send(self.epoch);
        counter!("cluster_state_published", 1u64);
        debug!(epoch = self.epoch, "cluster state published");
    }
}

/// Create a publisher/handle pair starting from an unknown state at epoch 0.
pub fn state_channel() -> (StatePublisher, StateHandle) {
    let snap = Arc::new(ArcSwap::from_pointee(ObservedState::unknown()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    (
        StatePublisher { snap: Arc::clone(&snap), epoch_tx, epoch: 0 },
        StateHandle { snap, epoch_rx },
    )
}
