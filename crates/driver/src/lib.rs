//! estack driver: safe pod removal for a shard-replicated database cluster.
//!
//! The driver deletes a pod only when the database holds no shard copy on the node the
//! pod runs; everything else is deferred with a requeue directive.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use estack_core::{NameResolver, NodeResolver, PodRef, StateError};
use estack_store::Expectations;
use kube::{
    api::{Api, DeleteParams, Preconditions},
    Client,
};

mod deletion;

pub use deletion::{classify, DefaultDriver, Safety};

/// Deletion failure for a single pod.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeleteError {
    /// Already gone; nothing left to delete.
    #[error("pod {0} not found")]
    NotFound(String),
    /// The uid precondition did not match: the name now belongs to a newer pod.
    #[error("pod {0} was replaced before deletion")]
    Replaced(String),
    #[error("deleting pod {pod}: {message}")]
    Api { pod: String, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error("{} of {attempted} pod deletion(s) failed: {}", .failures.len(), summarize(.failures))]
    Deletions { attempted: usize, failures: Vec<DeleteError> },
}

fn summarize(failures: &[DeleteError]) -> String {
    failures.iter().map(|f| f.to_string()).collect::<Vec<_>>().join("; ")
}

/// Seam for the orchestration client's pod deletion.
#[async_trait::async_trait]
pub trait PodDeleter: Send + Sync {
    async fn delete_pod(&self, pod: &PodRef) -> Result<(), DeleteError>;
}

/// Deleter backed by the kube API.
pub struct KubePodDeleter {
    client: Client,
    grace_seconds: Option<u32>,
}

impl KubePodDeleter {
    pub fn new(client: Client) -> Self {
        Self { client, grace_seconds: None }
    }

    pub fn with_grace_seconds(mut self, grace_seconds: Option<u32>) -> Self {
        self.grace_seconds = grace_seconds;
        self
    }
}

#[async_trait::async_trait]
impl PodDeleter for KubePodDeleter {
    async fn delete_pod(&self, pod: &PodRef) -> Result<(), DeleteError> {
        use k8s_openapi::api::core::v1::Pod;
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let dp = DeleteParams {
            grace_period_seconds: self.grace_seconds,
            preconditions: pod.uid.as_ref().map(|uid| Preconditions { uid: Some(uid.clone()), resource_version: None }),
            ..Default::default()
        };
        match api.delete(&pod.name, &dp).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(DeleteError::NotFound(pod.to_string())),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(DeleteError::Replaced(pod.to_string())),
            Err(e) => Err(DeleteError::Api { pod: pod.to_string(), message: e.to_string() }),
        }
    }
}

/// Settings read from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// Delay attached to requeue directives (`ESTACK_REQUEUE_SECS`, default 10).
    pub requeue_after: Duration,
    /// Pod deletion grace period (`ESTACK_DELETE_GRACE_SECS`, unset = pod default).
    pub delete_grace_secs: Option<u32>,
}

pub const DEFAULT_REQUEUE_SECS: u64 = 10;

impl Default for DriverConfig {
    fn default() -> Self {
        Self { requeue_after: Duration::from_secs(DEFAULT_REQUEUE_SECS), delete_grace_secs: None }
    }
}

impl DriverConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let requeue_secs = get("ESTACK_REQUEUE_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_REQUEUE_SECS);
        let delete_grace_secs = get("ESTACK_DELETE_GRACE_SECS").and_then(|s| s.parse::<u32>().ok());
        Self { requeue_after: Duration::from_secs(requeue_secs), delete_grace_secs }
    }
}

/// Collaborators handed to a driver instance. Each driver owns its own tracker.
#[derive(Clone)]
pub struct Options {
    pub expectations: Arc<Expectations>,
    pub deleter: Arc<dyn PodDeleter>,
    pub resolver: Arc<dyn NodeResolver>,
    pub requeue_after: Duration,
}

impl Options {
    pub fn new(expectations: Arc<Expectations>, deleter: Arc<dyn PodDeleter>) -> Self {
        Self {
            expectations,
            deleter,
            resolver: Arc::new(NameResolver),
            requeue_after: Duration::from_secs(DEFAULT_REQUEUE_SECS),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn NodeResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_config(mut self, cfg: &DriverConfig) -> Self {
        self.requeue_after = cfg.requeue_after;
        self
    }
}
