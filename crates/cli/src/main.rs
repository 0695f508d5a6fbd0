use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use estack_core::{ClusterState, Directive, PodRef, ResourceKey, Results};
use estack_driver::{classify, DefaultDriver, DeleteError, DriverConfig, KubePodDeleter, Options, PodDeleter, Safety};
use estack_kubehub::{action_for, cluster_label, list_inventory, requeue_delay, watch_pods};
use estack_store::{spawn_observer, state_channel, Expectations};
use kube::Client;
use serde::Serialize;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "estackctl", version, about = "estack CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace used when a resource is given without one
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Summarize a cluster state snapshot (nodes and the shards they hold)
    State {
        /// Path to a `_cluster/state` JSON document
        file: PathBuf,
    },
    /// Evaluate pod removals against a cluster state snapshot and delete the safe ones
    Evaluate {
        /// Managed resource, "namespace/name" (or "name" with --ns)
        resource: String,
        /// Path to a `_cluster/state` JSON document
        #[arg(long = "state")]
        state: PathBuf,
        /// Candidate pod name (repeatable)
        #[arg(long = "pod", required = true)]
        pods: Vec<String>,
        /// Delete through the cluster API instead of a dry run
        #[arg(long = "live", action = ArgAction::SetTrue)]
        live: bool,
        /// With --live: wait up to N seconds for deletions to be observed
        #[arg(long = "wait-secs", default_value_t = 0)]
        wait_secs: u64,
    },
    /// Answer a bind-mount volume plugin call (e.g. "init")
    Volume {
        command: String,
    },
}

fn init_tracing() {
    let env = std::env::var("ESTACK_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("ESTACK_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid ESTACK_METRICS_ADDR; expected host:port");
        }
    }
}

fn observer_queue_cap() -> usize {
    std::env::var("ESTACK_OBSERVER_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(1024)
}

fn resource_key(raw: &str, ns: Option<&str>) -> Result<ResourceKey> {
    match ns {
        Some(ns) if !raw.contains('/') => Ok(ResourceKey::new(ns, raw)),
        _ => ResourceKey::parse(raw).ok_or_else(|| anyhow!("invalid resource: {} (expect namespace/name)", raw)),
    }
}

fn load_state(path: &Path) -> Result<ClusterState> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    ClusterState::from_slice(&bytes).with_context(|| format!("parsing cluster state from {}", path.display()))
}

/// Stands in for the cluster API outside --live.
struct DryRunDeleter;

#[async_trait::async_trait]
impl PodDeleter for DryRunDeleter {
    async fn delete_pod(&self, pod: &PodRef) -> Result<(), DeleteError> {
        info!(pod = %pod, "dry run: would delete pod");
        Ok(())
    }
}

#[derive(Serialize)]
struct NodeRow<'a> {
    id: &'a str,
    name: &'a str,
    address: &'a str,
    shards: usize,
    primaries: usize,
}

#[derive(Serialize)]
struct PodRow {
    pod: String,
    safety: String,
    directive: Directive,
}

#[derive(Serialize)]
struct EvaluateReport {
    resource: String,
    pods: Vec<PodRow>,
    remaining: Option<Vec<PodRef>>,
    requeue_after_secs: Option<f64>,
    error: Option<String>,
}

fn describe(s: &Safety) -> String {
    match s {
        Safety::NotInCluster => "not-in-cluster".to_string(),
        Safety::Evacuated(node) => format!("evacuated ({})", node),
        Safety::HoldsData { node, shards } => format!("holds {} shard(s) ({})", shards, node),
        Safety::Unknown => "unknown".to_string(),
    }
}

fn render_directive(d: &Directive) -> String {
    if d.is_terminal() {
        "done".to_string()
    } else if d.requeue_after.is_zero() {
        "requeue".to_string()
    } else {
        format!("requeue after {}s", d.requeue_after.as_secs_f64())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::State { file } => {
            let state = load_state(&file)?;
            let rows: Vec<_> = state
                .nodes
                .iter()
                .map(|(id, n)| NodeRow {
                    id,
                    name: &n.name,
                    address: &n.transport_address,
                    shards: state.shards_on_node(id).count(),
                    primaries: state.shards_on_node(id).filter(|c| c.primary && c.node.as_deref() == Some(id.as_str())).count(),
                })
                .collect();
            match cli.output {
                Output::Human => {
                    println!("cluster: {} ({}) version {}", state.cluster_name, state.cluster_uuid, state.version);
                    println!("{:<24} {:<40} {:<22} {:>6} {:>9}", "NODE", "NAME", "ADDRESS", "SHARDS", "PRIMARIES");
                    for r in &rows {
                        println!("{:<24} {:<40} {:<22} {:>6} {:>9}", r.id, r.name, r.address, r.shards, r.primaries);
                    }
                    let unassigned = state.shards().filter(|c| !c.is_assigned()).count();
                    if unassigned > 0 {
                        println!("unassigned copies: {}", unassigned);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&rows)?),
            }
        }
        Commands::Evaluate { resource, state, pods, live, wait_secs } => {
            let key = resource_key(&resource, cli.namespace.as_deref())?;
            let (mut publisher, handle) = state_channel();
            publisher.publish(load_state(&state)?);
            // One snapshot for the whole evaluation.
            let observed = handle.current();
            let cfg = DriverConfig::from_env();
            let label = cluster_label();
            let expectations = Arc::new(Expectations::new());
            info!(resource = %key, candidates = pods.len(), live, "evaluate invoked");

            let (deleter, inventory, client): (Arc<dyn PodDeleter>, Vec<PodRef>, Option<Client>) = if live {
                let client = Client::try_default().await.context("connecting to the cluster")?;
                let inventory = list_inventory(client.clone(), &key, &label).await?;
                let deleter: Arc<dyn PodDeleter> =
                    Arc::new(KubePodDeleter::new(client.clone()).with_grace_seconds(cfg.delete_grace_secs));
                (deleter, inventory, Some(client))
            } else {
                let inventory = pods.iter().map(|p| PodRef::new(&key.namespace, p)).collect();
                let deleter: Arc<dyn PodDeleter> = Arc::new(DryRunDeleter);
                (deleter, inventory, None)
            };

            // Prefer the inventory entry so the uid travels with the delete call.
            let candidates: Vec<PodRef> = pods
                .iter()
                .map(|name| {
                    inventory
                        .iter()
                        .find(|p| &p.name == name)
                        .cloned()
                        .unwrap_or_else(|| PodRef::new(&key.namespace, name))
                })
                .collect();

            // The watcher's initial list must precede the deletes: a pod already gone from
            // that list is never reported as deleted.
            let observing = match (&client, wait_secs) {
                (Some(client), secs) if secs > 0 => {
                    let (tx, observer) = spawn_observer(Arc::clone(&expectations), observer_queue_cap());
                    let (ready_tx, ready_rx) = oneshot::channel();
                    let watcher = tokio::spawn({
                        let client = client.clone();
                        let ns = key.namespace.clone();
                        let label = label.clone();
                        async move {
                            if let Err(e) = watch_pods(client, Some(&ns), &label, tx, Some(ready_tx)).await {
                                error!(error = ?e, "pod watcher failed");
                            }
                        }
                    });
                    match tokio::time::timeout(Duration::from_secs(secs), ready_rx).await {
                        Ok(Ok(())) => info!(resource = %key, "pod watcher ready"),
                        _ => warn!(resource = %key, "pod watcher not ready; deletions may go unobserved"),
                    }
                    Some((watcher, observer))
                }
                _ => None,
            };

            let driver = DefaultDriver::new(Options::new(Arc::clone(&expectations), deleter).with_config(&cfg));
            let mut results = Results::new();
            let outcome = driver.attempt_pods_deletion(&candidates, &observed, &inventory, &key, &mut results).await;
            if let Err(e) = &outcome {
                error!(resource = %key, error = %e, "pod deletion incomplete");
            }

            let safety: Vec<Safety> = candidates
                .iter()
                .map(|p| classify(p, observed.cluster_state.as_deref(), driver.options.resolver.as_ref()))
                .collect();
            let report = EvaluateReport {
                resource: key.to_string(),
                pods: candidates
                    .iter()
                    .zip(safety.iter())
                    .zip(results.iter())
                    .map(|((p, s), d)| PodRow { pod: p.name.clone(), safety: describe(s), directive: *d })
                    .collect(),
                remaining: outcome.as_ref().ok().cloned(),
                requeue_after_secs: requeue_delay(&results).map(|d| d.as_secs_f64()),
                error: outcome.as_ref().err().map(|e| e.to_string()),
            };
            match cli.output {
                Output::Human => {
                    println!("{:<40} {:<48} {}", "POD", "SAFETY", "DIRECTIVE");
                    for row in &report.pods {
                        println!("{:<40} {:<48} {}", row.pod, row.safety, render_directive(&row.directive));
                    }
                    println!("action: {:?}", action_for(&results));
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            }

            if let Some((watcher, observer)) = observing {
                let deadline = Instant::now() + Duration::from_secs(wait_secs);
                loop {
                    if expectations.fulfilled(&key) {
                        info!(resource = %key, "all deletions observed");
                        break;
                    }
                    if Instant::now() >= deadline {
                        warn!(resource = %key, outstanding = ?expectations.outstanding(&key), "timed out waiting for deletions");
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(200)) => {}
                        _ = signal::ctrl_c() => {
                            info!("Ctrl-C received; stop waiting");
                            break;
                        }
                    }
                }
                // Aborting the watcher drops the last sender, which ends the observer.
                watcher.abort();
                let _ = observer.await;
            }

            outcome?;
        }
        Commands::Volume { command } => {
            let response = estack_volume::BindMount.dispatch(&command);
            println!("{}", response.to_json());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_key_uses_default_namespace_flag() {
        assert_eq!(resource_key("es", Some("prod")).expect("ok"), ResourceKey::new("prod", "es"));
        assert_eq!(resource_key("ops/es", Some("prod")).expect("ok"), ResourceKey::new("ops", "es"));
        assert_eq!(resource_key("es", None).expect("ok"), ResourceKey::new("default", "es"));
        assert!(resource_key("a/b/c", None).is_err());
    }

    #[test]
    fn directive_rendering() {
        assert_eq!(render_directive(&Directive::done()), "done");
        assert_eq!(render_directive(&Directive::requeue()), "requeue");
        assert_eq!(render_directive(&Directive::requeue_after(Duration::from_secs(10))), "requeue after 10s");
    }
}
