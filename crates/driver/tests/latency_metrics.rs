#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use estack_core::{ClusterState, ObservedState, PodRef, ResourceKey, Results};
use estack_driver::{DefaultDriver, DeleteError, DriverError, Options, PodDeleter};
use estack_store::Expectations;
use metrics::{Counter, Gauge, Histogram, HistogramFn, Key, KeyName, Recorder, SharedString, Unit};

/// Counts samples recorded into the evaluation latency histogram.
#[derive(Default)]
struct LatencySamples(AtomicU64);

impl HistogramFn for LatencySamples {
    fn record(&self, _value: f64) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct LatencyRecorder(Arc<LatencySamples>);

impl Recorder for LatencyRecorder {
    fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
    fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

    fn register_counter(&self, _: &Key) -> Counter {
        Counter::noop()
    }

    fn register_gauge(&self, _: &Key) -> Gauge {
        Gauge::noop()
    }

    fn register_histogram(&self, key: &Key) -> Histogram {
        if key.name() == "pod_deletion_evaluation_ms" {
            Histogram::from_arc(Arc::clone(&self.0))
        } else {
            Histogram::noop()
        }
    }
}

struct NeverCalled;

#[async_trait]
impl PodDeleter for NeverCalled {
    async fn delete_pod(&self, pod: &PodRef) -> Result<(), DeleteError> {
        panic!("unexpected delete of {pod}");
    }
}

fn inconsistent() -> ClusterState {
    serde_json::from_value(serde_json::json!({
        "nodes": { "n1": { "name": "es-0" } },
        "routing_table": { "indices": { "i": { "shards": {
            "0": [ { "state": "STARTED", "primary": true, "node": "n1", "shard": 3, "index": "i" } ]
        } } } }
    }))
    .expect("state")
}

#[tokio::test]
async fn latency_is_recorded_for_every_evaluation() {
    let samples = Arc::new(LatencySamples::default());
    metrics::set_boxed_recorder(Box::new(LatencyRecorder(Arc::clone(&samples)))).expect("recorder installed once");

    let driver = DefaultDriver::new(Options::new(Arc::new(Expectations::new()), Arc::new(NeverCalled)));
    let key = ResourceKey::new("default", "es");
    let pods = vec![PodRef::new("default", "es-0")];

    let mut results = Results::new();
    driver
        .attempt_pods_deletion(&pods, &ObservedState::unknown(), &pods, &key, &mut results)
        .await
        .expect("deferred, not failed");
    assert_eq!(samples.0.load(Ordering::SeqCst), 1);

    let mut results = Results::new();
    let err = driver
        .attempt_pods_deletion(&pods, &ObservedState::new(inconsistent()), &pods, &key, &mut results)
        .await
        .expect_err("snapshot rejected");
    assert!(matches!(err, DriverError::State(_)));
    assert!(results.is_empty());
    assert_eq!(samples.0.load(Ordering::SeqCst), 2, "rejected snapshot still counts toward latency");
}
