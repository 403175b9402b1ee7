use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cli::Opts;
use crate::config::Config;
use crate::error::{EXIT_DEGRADED, EXIT_UNHEALTHY};
use crate::k8s::{check_move_health, ClusterClient, KubeClient, Mover};

/// The application object, which moves a batch of pods to one node.
pub struct App {
    /// The application's runtime config.
    config: Arc<Config>,
    client: Arc<dyn ClusterClient>,
    mover: Mover,

    namespace: String,
    pods: Vec<String>,
    node: String,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// The join handle of the lease reaper.
    reaper: JoinHandle<()>,
}

impl App {
    /// Create a new instance from the given command line.
    pub async fn new(config: Arc<Config>, opts: &Opts) -> Result<Self> {
        let pods = opts.pod_names()?;
        let node = opts.node_name()?.to_string();
        let client = KubeClient::connect(opts.master_url.clone(), opts.kubeconfig.as_deref())
            .await
            .context("error initializing K8s client")?;
        Ok(Self::with_client(Arc::new(client), config, opts.namespace.clone(), pods, node))
    }

    /// Create a new instance over the given cluster client.
    pub fn with_client(client: Arc<dyn ClusterClient>, config: Arc<Config>, namespace: String, pods: Vec<String>, node: String) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let mover = Mover::new(client.clone(), config.clone());
        let reaper = mover.leases().spawn_reaper(config.lease_reaper_interval(), shutdown_rx);
        Self {
            config,
            client,
            mover,
            namespace,
            pods,
            node,
            shutdown_tx,
            reaper,
        }
    }

    pub fn mover(&self) -> &Mover {
        &self.mover
    }

    /// Move every requested pod concurrently, returning the process exit code.
    pub async fn run(self) -> i32 {
        tracing::info!(namespace = %self.namespace, pods = ?self.pods, node = %self.node, "moving pods");
        let handles: Vec<_> = self
            .pods
            .iter()
            .map(|name| {
                let request = MoveRequest {
                    mover: self.mover.clone(),
                    client: self.client.clone(),
                    config: self.config.clone(),
                    namespace: self.namespace.clone(),
                    name: name.clone(),
                    node: self.node.clone(),
                };
                (name.clone(), tokio::spawn(request.run()))
            })
            .collect();

        let mut code = 0;
        for (name, handle) in handles {
            let pod_code = match handle.await {
                Ok(pod_code) => pod_code,
                Err(err) => {
                    tracing::error!(error = ?err, pod = %name, "error joining move task");
                    EXIT_DEGRADED
                }
            };
            code = code.max(pod_code);
        }
        if self.await_abandoned_leases().await {
            code = code.max(EXIT_DEGRADED);
        }

        // Begin shutdown routine.
        tracing::debug!("pod mover is shutting down");
        let _ = self.shutdown_tx.send(());
        if let Err(err) = self.reaper.await {
            tracing::error!(error = ?err, "error joining lease reaper task");
        }
        tracing::debug!(code, "pod mover shutdown complete");
        code
    }

    /// Wait for the reaper to expire any lease left behind by a move which never reached its
    /// cleanup, returning `true` if any such lease was found.
    async fn await_abandoned_leases(&self) -> bool {
        let leases = self.mover.leases();
        if leases.is_empty() {
            return false;
        }
        tracing::warn!(count = leases.len(), "moves left locks behind, waiting for them to expire");

        let interval = self.config.lease_reaper_interval();
        let deadline = Instant::now() + self.config.lease_ttl() + interval;
        while !leases.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(interval).await;
        }
        if !leases.is_empty() {
            tracing::error!(count = leases.len(), "locks still held at shutdown, parent controllers may be left invalidated");
        }
        true
    }
}

/// The move of a single pod followed by its health check.
struct MoveRequest {
    mover: Mover,
    client: Arc<dyn ClusterClient>,
    config: Arc<Config>,
    namespace: String,
    name: String,
    node: String,
}

impl MoveRequest {
    /// Run this request, returning its exit code.
    async fn run(self) -> i32 {
        let pod = format!("{}/{}", self.namespace, self.name);
        if let Err(failure) = self.mover.move_pod(&self.namespace, &self.name, &self.node).await {
            tracing::error!(error = %failure, disposition = ?failure.disposition, %pod, "error moving pod");
            return failure.disposition.exit_code();
        }

        tokio::time::sleep(self.config.health_check_delay()).await;
        match check_move_health(self.client.as_ref(), &self.namespace, &self.name, &self.node).await {
            Ok(()) => {
                tracing::info!(%pod, node = %self.node, "pod moved and running");
                0
            }
            Err(err) => {
                tracing::error!(error = ?err, %pod, "pod failed health check after move");
                EXIT_UNHEALTHY
            }
        }
    }
}
