//! estack kubehub: pod watch wiring, inventory listing and requeue actions.

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::{Context, Result};
use estack_core::{PodRef, ResourceKey, Results};
use estack_store::Observation;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams},
    runtime::{
        controller::Action,
        watcher::{self, Event},
    },
    Client, ResourceExt,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Pod label carrying the name of the owning cluster resource.
pub const DEFAULT_CLUSTER_LABEL: &str = "elasticsearch.k8s.elastic.co/cluster-name";

/// Label used to map pods to their resource (`ESTACK_CLUSTER_LABEL`).
pub fn cluster_label() -> String {
    std::env::var("ESTACK_CLUSTER_LABEL").unwrap_or_else(|_| DEFAULT_CLUSTER_LABEL.to_string())
}

/// Resource owning `pod`, read from the cluster label.
pub fn owner_key(pod: &Pod, label: &str) -> Option<ResourceKey> {
    let ns = pod.namespace()?;
    let owner = pod.labels().get(label)?;
    Some(ResourceKey::new(ns, owner.clone()))
}

pub fn pod_ref(pod: &Pod) -> Option<PodRef> {
    let r = PodRef::new(pod.namespace()?, pod.metadata.name.clone()?);
    Some(match pod.metadata.uid.clone() {
        Some(uid) => r.with_uid(uid),
        None => r,
    })
}

/// Turns pod watch events into observations for the expectations tracker.
///
/// A pod counts as created the first time it shows up after the initial list; a relist
/// that no longer contains a known pod counts as its deletion.
#[derive(Debug)]
pub struct PodTracker {
    label: String,
    seen: FxHashMap<String, ResourceKey>,
    primed: bool,
}

impl PodTracker {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into(), seen: FxHashMap::default(), primed: false }
    }

    pub fn known(&self) -> usize {
        self.seen.len()
    }

    /// True once the initial list has been applied. Deletions of pods that were already
    /// gone by then are never reported.
    pub fn is_primed(&self) -> bool {
        self.primed
    }

    fn identity(pod: &Pod) -> Option<String> {
        pod.metadata.uid.clone().or_else(|| Some(format!("{}/{}", pod.namespace()?, pod.metadata.name.as_deref()?)))
    }

    pub fn on_event(&mut self, ev: Event<Pod>) -> Vec<Observation> {
        let mut out = Vec::new();
        match ev {
            Event::Applied(pod) => {
                if let (Some(id), Some(key)) = (Self::identity(&pod), owner_key(&pod, &self.label)) {
                    if self.seen.insert(id, key.clone()).is_none() && self.primed {
                        out.push(Observation::Created(key));
                    }
                }
            }
            Event::Deleted(pod) => {
                if let Some(key) = Self::identity(&pod).and_then(|id| self.seen.remove(&id)) {
                    out.push(Observation::Deleted(key));
                }
            }
            Event::Restarted(list) => {
                let mut next = FxHashMap::default();
                for pod in &list {
                    if let (Some(id), Some(key)) = (Self::identity(pod), owner_key(pod, &self.label)) {
                        if self.primed && !self.seen.contains_key(&id) {
                            out.push(Observation::Created(key.clone()));
                        }
                        next.insert(id, key);
                    }
                }
                for (id, key) in self.seen.drain() {
                    if !next.contains_key(&id) {
                        out.push(Observation::Deleted(key));
                    }
                }
                self.seen = next;
                self.primed = true;
            }
        }
        out
    }
}

/// Watch pods carrying `label` and forward observations until the stream ends.
///
/// `ready` fires once the initial list is in; deletions issued after that are observed.
pub async fn watch_pods(
    client: Client,
    namespace: Option<&str>,
    label: &str,
    tx: mpsc::Sender<Observation>,
    mut ready: Option<oneshot::Sender<()>>,
) -> Result<()> {
    let api: Api<Pod> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let cfg = watcher::Config::default().labels(label);
    let stream = watcher::watcher(api, cfg);
    futures::pin_mut!(stream);
    let mut tracker = PodTracker::new(label);
    info!(label = %label, ns = ?namespace, "pod watcher started");
    while let Some(ev) = stream.try_next().await.context("pod watch stream")? {
        if let Event::Restarted(list) = &ev {
            debug!(count = list.len(), "watch restart");
        }
        for obs in tracker.on_event(ev) {
            if !forward(&tx, obs).await {
                warn!("observation channel closed; stopping pod watcher");
                return Ok(());
            }
        }
        if tracker.is_primed() {
            if let Some(ready) = ready.take() {
                let _ = ready.send(());
            }
        }
    }
    warn!("pod watch stream ended");
    Ok(())
}

/// Send one observation; false once the receiving side is gone.
async fn forward(tx: &mpsc::Sender<Observation>, obs: Observation) -> bool {
    match tx.send(obs).await {
        Ok(()) => {
            counter!("pod_observations_sent", 1u64);
            true
        }
        Err(_) => {
            counter!("pod_observations_dropped", 1u64);
            false
        }
    }
}

/// Current pods of `key`, as the API server lists them.
pub async fn list_inventory(client: Client, key: &ResourceKey, label: &str) -> Result<Vec<PodRef>> {
    let api: Api<Pod> = Api::namespaced(client, &key.namespace);
    let lp = ListParams::default().labels(&format!("{}={}", label, key.name));
    let pods = api.list(&lp).await.with_context(|| format!("listing pods of {}", key))?;
    Ok(pods.items.iter().filter_map(pod_ref).collect())
}

/// Scheduler policy over collected directives: `None` when every directive is terminal,
/// otherwise the shortest requested delay.
pub fn requeue_delay(results: &Results) -> Option<Duration> {
    results.iter().filter(|d| !d.is_terminal()).map(|d| d.requeue_after).min()
}

pub fn action_for(results: &Results) -> Action {
    match requeue_delay(results) {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use estack_core::Directive;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    const LABEL: &str = DEFAULT_CLUSTER_LABEL;

    fn pod(name: &str, uid: &str, owner: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                uid: Some(uid.to_string()),
                labels: owner.map(|o| [(LABEL.to_string(), o.to_string())].into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn es() -> ResourceKey {
        ResourceKey::new("default", "es")
    }

    #[test]
    fn owner_and_ref() {
        let p = pod("es-0", "u0", Some("es"));
        assert_eq!(owner_key(&p, LABEL), Some(es()));
        assert_eq!(owner_key(&pod("x", "u", None), LABEL), None);
        assert_eq!(pod_ref(&p), Some(PodRef::new("default", "es-0").with_uid("u0")));
    }

    #[test]
    fn initial_list_is_not_a_creation() {
        let mut t = PodTracker::new(LABEL);
        let out = t.on_event(Event::Restarted(vec![pod("es-0", "u0", Some("es")), pod("es-1", "u1", Some("es"))]));
        assert!(out.is_empty());
        assert_eq!(t.known(), 2);
    }

    #[test]
    fn creations_updates_and_deletions() {
        let mut t = PodTracker::new(LABEL);
        t.on_event(Event::Restarted(vec![pod("es-0", "u0", Some("es"))]));
        assert_eq!(t.on_event(Event::Applied(pod("es-1", "u1", Some("es")))), vec![Observation::Created(es())]);
        // An update of a known pod is not a creation.
        assert!(t.on_event(Event::Applied(pod("es-1", "u1", Some("es")))).is_empty());
        assert_eq!(t.on_event(Event::Deleted(pod("es-0", "u0", Some("es")))), vec![Observation::Deleted(es())]);
        // Deleting an unknown pod yields nothing.
        assert!(t.on_event(Event::Deleted(pod("es-9", "u9", Some("es")))).is_empty());
        // Unlabelled pods are ignored.
        assert!(t.on_event(Event::Applied(pod("other", "ux", None))).is_empty());
    }

    #[test]
    fn deletion_before_the_initial_list_goes_unreported() {
        let mut t = PodTracker::new(LABEL);
        assert!(!t.is_primed());
        // es-0 was deleted before the first list came back.
        assert!(t.on_event(Event::Restarted(vec![pod("es-1", "u1", Some("es"))])).is_empty());
        assert!(t.is_primed());
        assert!(t.on_event(Event::Deleted(pod("es-0", "u0", Some("es")))).is_empty());
        // Listed before the delete, the same pod is observed.
        assert_eq!(t.on_event(Event::Deleted(pod("es-1", "u1", Some("es")))), vec![Observation::Deleted(es())]);
    }

    #[tokio::test]
    async fn forward_reports_a_closed_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(forward(&tx, Observation::Deleted(es())).await);
        assert_eq!(rx.recv().await, Some(Observation::Deleted(es())));
        drop(rx);
        assert!(!forward(&tx, Observation::Deleted(es())).await);
    }

    #[test]
    fn relist_reports_missed_events() {
        let mut t = PodTracker::new(LABEL);
        t.on_event(Event::Restarted(vec![pod("es-0", "u0", Some("es")), pod("es-1", "u1", Some("es"))]));
        let out = t.on_event(Event::Restarted(vec![pod("es-1", "u1", Some("es")), pod("es-2", "u2", Some("es"))]));
        assert_eq!(out, vec![Observation::Created(es()), Observation::Deleted(es())]);
        assert_eq!(t.known(), 2);
    }

    #[test]
    fn requeue_policy() {
        let mut r = Results::new();
        assert_eq!(requeue_delay(&r), None);
        r.with_result(Directive::done());
        assert_eq!(requeue_delay(&r), None);
        r.with_result(Directive::requeue_after(Duration::from_secs(10)));
        assert_eq!(requeue_delay(&r), Some(Duration::from_secs(10)));
        r.with_result(Directive::requeue());
        assert_eq!(requeue_delay(&r), Some(Duration::ZERO));
    }
}
