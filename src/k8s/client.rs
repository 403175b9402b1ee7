use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use http::Uri;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{Pod, ReplicationController};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::client::Client;
use tokio::time::timeout;

use crate::k8s::{ClusterClient, ControllerKind, Workload};

/// The default timeout to use for API calls.
const API_TIMEOUT: Duration = Duration::from_secs(5);

/// A `ClusterClient` backed by a live K8s cluster.
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the given kubeconfig path, else from the default environment.
    ///
    /// A given master URL overrides the API server of whichever config is used.
    pub async fn connect(master_url: Option<Uri>, kubeconfig: Option<&str>) -> Result<Self> {
        let mut config = match (kubeconfig, master_url.as_ref()) {
            (Some(path), _) => {
                let kubeconfig = kube::config::Kubeconfig::read_from(path).context("error reading kubeconfig")?;
                kube::Config::from_custom_kubeconfig(kubeconfig, &Default::default())
                    .await
                    .context("error building K8s client config from kubeconfig")?
            }
            (None, Some(url)) => kube::Config::new(url.clone()),
            (None, None) => kube::Config::infer().await.context("error inferring K8s client config")?,
        };
        if let Some(url) = master_url {
            tracing::debug!(%url, "using K8s API server from master url");
            config.cluster_url = url;
        }
        let client = Client::try_from(config).context("error initializing K8s client")?;
        Ok(Self::new(client))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        timeout(API_TIMEOUT, self.pods(namespace).get(name))
            .await
            .context("timeout while fetching pod")?
            .with_context(|| format!("error fetching pod {}/{}", namespace, name))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_pod(&self, namespace: &str, name: &str, grace_period_seconds: i64) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(u32::try_from(grace_period_seconds.max(0)).unwrap_or(u32::MAX)),
            ..Default::default()
        };
        let res = timeout(API_TIMEOUT, self.pods(namespace).delete(name, &params))
            .await
            .context("timeout while deleting pod")?;
        match res {
            Ok(_val) => Ok(()),
            Err(err) => match err {
                kube::Error::Api(api_err) if api_err.code == http::StatusCode::NOT_FOUND => Ok(()),
                _ => Err(err).with_context(|| format!("error deleting pod {}/{}", namespace, name)),
            },
        }
    }

    #[tracing::instrument(level = "debug", skip(self, pod))]
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        if let Some(name) = pod.metadata.name.as_ref() {
            tracing::info!(%namespace, %name, "creating pod");
        }
        timeout(API_TIMEOUT, self.pods(namespace).create(&PostParams::default(), pod))
            .await
            .context("timeout while creating pod")?
            .context("error creating pod")
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_pods_in_phase(&self, namespace: &str, phase: &str) -> Result<Vec<Pod>> {
        let params = ListParams {
            field_selector: Some(format!("status.phase={}", phase)),
            ..Default::default()
        };
        timeout(API_TIMEOUT, self.pods(namespace).list(&params))
            .await
            .context("timeout while listing pods")?
            .context("error listing pods")
            .map(|list| list.items)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_workload(&self, namespace: &str, kind: ControllerKind, name: &str) -> Result<Workload> {
        match kind {
            ControllerKind::ReplicationController => {
                let api: Api<ReplicationController> = Api::namespaced(self.client.clone(), namespace);
                timeout(API_TIMEOUT, api.get(name))
                    .await
                    .context("timeout while fetching ReplicationController")?
                    .with_context(|| format!("error fetching ReplicationController {}/{}", namespace, name))
                    .map(Workload::ReplicationController)
            }
            ControllerKind::ReplicaSet => {
                let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
                timeout(API_TIMEOUT, api.get(name))
                    .await
                    .context("timeout while fetching ReplicaSet")?
                    .with_context(|| format!("error fetching ReplicaSet {}/{}", namespace, name))
                    .map(Workload::ReplicaSet)
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, workload))]
    async fn replace_workload(&self, namespace: &str, workload: &Workload) -> Result<Workload> {
        let params = PostParams::default();
        let name = workload.name();
        tracing::info!(%namespace, %name, kind = %workload.kind(), "updating controller");
        match workload {
            Workload::ReplicationController(rc) => {
                let api: Api<ReplicationController> = Api::namespaced(self.client.clone(), namespace);
                timeout(API_TIMEOUT, api.replace(name, &params, rc))
                    .await
                    .context("timeout while updating ReplicationController")?
                    .context("error updating ReplicationController")
                    .map(Workload::ReplicationController)
            }
            Workload::ReplicaSet(rs) => {
                let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
                timeout(API_TIMEOUT, api.replace(name, &params, rs))
                    .await
                    .context("timeout while updating ReplicaSet")?
                    .context("error updating ReplicaSet")
                    .map(Workload::ReplicaSet)
            }
        }
    }
}
