//! Pod deletion safety evaluation.
//!
//! Rule: a pod may go only if the node it runs holds no shard copy, either as the current
//! `node` or as a `relocating_node`. Replicas count; so do copies still initializing.
//! Pods that do not map to any cluster node hold nothing and are deleted right away.
//!
//! Candidates are processed sequentially against a single snapshot. This module never
//! logs: callers get directives and a typed error.

use std::time::Instant;

use estack_core::{ClusterState, Directive, NodeId, NodeResolver, ObservedState, PodRef, ResourceKey, Results};
use metrics::{counter, histogram};

use crate::{DeleteError, DriverError, Options};

/// Safety classification of one deletion candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Safety {
    /// No cluster node carries the pod's identity.
    NotInCluster,
    /// The node exists but holds no shard copy.
    Evacuated(NodeId),
    /// The node holds (or is receiving) `shards` copies.
    HoldsData { node: NodeId, shards: usize },
    /// No snapshot available; placement cannot be checked.
    Unknown,
}

impl Safety {
    pub fn is_safe(&self) -> bool {
        matches!(self, Safety::NotInCluster | Safety::Evacuated(_))
    }
}

/// Classify `pod` against `state`. Pure; identical inputs give identical answers.
pub fn classify(pod: &PodRef, state: Option<&ClusterState>, resolver: &dyn NodeResolver) -> Safety {
    let Some(state) = state else { return Safety::Unknown };
    match resolver.resolve(pod, state) {
        None => Safety::NotInCluster,
        Some(node) => match state.shards_on_node(node).count() {
            0 => Safety::Evacuated(node.clone()),
            shards => Safety::HoldsData { node: node.clone(), shards },
        },
    }
}

fn record_latency(started: Instant) {
    histogram!("pod_deletion_evaluation_ms", started.elapsed().as_secs_f64() * 1000.0);
}

pub struct DefaultDriver {
    pub options: Options,
}

impl DefaultDriver {
    pub fn new(options: Options) -> Self {
        Self { options }
    }

    fn defer(&self) -> Directive {
        Directive::requeue_after(self.options.requeue_after)
    }

    /// Delete the candidates whose node holds no data.
    ///
    /// One directive is appended to `results` per candidate, in input order, and stays
    /// there even when an error is returned. A successful delete leaves one outstanding
    /// deletion expectation on `key`. Returns `inventory` minus the pods now gone.
    pub async fn attempt_pods_deletion(
        &self,
        to_delete: &[PodRef],
        observed: &ObservedState,
        inventory: &[PodRef],
        key: &ResourceKey,
        results: &mut Results,
    ) -> Result<Vec<PodRef>, DriverError> {
        let started = Instant::now();
        let state = observed.cluster_state.as_deref();
        if let Some(Err(e)) = state.map(ClusterState::validate) {
            record_latency(started);
            return Err(e.into());
        }

        let mut gone: Vec<&PodRef> = Vec::new();
        let mut failures: Vec<DeleteError> = Vec::new();
        let mut attempted = 0usize;

        for pod in to_delete {
            let safety = classify(pod, state, self.options.resolver.as_ref());
            if !safety.is_safe() {
                counter!("pod_deletions_deferred", 1u64);
                results.with_result(self.defer());
                continue;
            }

            attempted += 1;
            // Raised before the call so a watch event racing the response is not lost.
            self.options.expectations.expect_deletion(key);
            match self.options.deleter.delete_pod(pod).await {
                Ok(()) => {
                    counter!("pod_deletions_issued", 1u64);
                    gone.push(pod);
                    results.with_result(Directive::done());
                }
                Err(DeleteError::NotFound(_)) => {
                    self.options.expectations.observe_deletion(key);
                    gone.push(pod);
                    results.with_result(Directive::done());
                }
                Err(DeleteError::Replaced(_)) => {
                    // A newer pod owns the name; it gets its own evaluation on the next pass.
                    self.options.expectations.observe_deletion(key);
                    results.with_result(Directive::requeue());
                }
                Err(e) => {
                    self.options.expectations.observe_deletion(key);
                    counter!("pod_deletions_failed", 1u64);
                    failures.push(e);
                    results.with_result(self.defer());
                }
            }
        }

        record_latency(started);

        if !failures.is_empty() {
            return Err(DriverError::Deletions { attempted, failures });
        }
        Ok(inventory.iter().filter(|p| !gone.iter().any(|g| g.same_pod(p))).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use estack_core::NameResolver;

    fn state() -> ClusterState {
        serde_json::from_value(serde_json::json!({
            "nodes": {
                "busy": { "name": "es-busy" },
                "idle": { "name": "es-idle" },
                "target": { "name": "es-target" }
            },
            "routing_table": { "indices": { "i": { "shards": {
                "0": [ { "state": "RELOCATING", "primary": false, "node": "busy", "relocating_node": "target", "shard": 0, "index": "i" } ],
                "1": [ { "state": "STARTED", "primary": true, "node": "busy", "shard": 1, "index": "i" } ]
            } } } }
        }))
        .expect("state")
    }

    #[test]
    fn classification() {
        let s = state();
        let c = |name: &str| classify(&PodRef::new("default", name), Some(&s), &NameResolver);
        assert_eq!(c("es-busy"), Safety::HoldsData { node: "busy".into(), shards: 2 });
        assert_eq!(c("es-target"), Safety::HoldsData { node: "target".into(), shards: 1 });
        assert_eq!(c("es-idle"), Safety::Evacuated("idle".into()));
        assert_eq!(c("es-nope"), Safety::NotInCluster);
        assert_eq!(classify(&PodRef::new("default", "es-idle"), None, &NameResolver), Safety::Unknown);
    }

    #[test]
    fn only_absence_of_data_is_safe() {
        assert!(Safety::NotInCluster.is_safe());
        assert!(Safety::Evacuated("n".into()).is_safe());
        assert!(!Safety::HoldsData { node: "n".into(), shards: 1 }.is_safe());
        assert!(!Safety::Unknown.is_safe());
    }
}
