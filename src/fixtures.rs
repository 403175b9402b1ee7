//! An in-memory cluster used to exercise moves without a live K8s API.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetSpec};
use k8s_openapi::api::core::v1::{Pod, PodSpec, PodStatus, PodTemplateSpec, ReplicationController, ReplicationControllerSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use maplit::btreemap;

use crate::config::Config;
use crate::k8s::{ApiGeneration, ClusterClient, ControllerKind, SchedulerEncoding, Workload, PHASE_PENDING, PHASE_RUNNING};

pub const NAMESPACE: &str = "ns";
pub const RESERVED: &str = "turbo-none-exist-scheduler";

/// Build a config with default values for the given API generation.
pub fn config(generation: ApiGeneration) -> Config {
    Config {
        rust_log: "info".into(),
        lease_ttl_seconds: 60,
        lease_reaper_interval_seconds: 5,
        lock_timeout_seconds: 120,
        health_check_delay_seconds: 10,
        max_grace_period_seconds: 0,
        scheduler_name: RESERVED.into(),
        k8s_version: generation,
    }
}

/// The mutable state of a `FakeCluster`.
#[derive(Default)]
pub struct FakeState {
    /// All pods, keyed by `{namespace}/{name}`.
    pub pods: BTreeMap<String, Pod>,
    /// All controllers, keyed by kind & `{namespace}/{name}`.
    pub workloads: BTreeMap<(ControllerKind, String), Workload>,
    /// Every controller written, in order.
    pub workload_writes: Vec<Workload>,
    /// Every pod deleted along with its grace period, in order.
    pub deleted_pods: Vec<(String, i64)>,
    /// Every pod created, in order.
    pub created_pods: Vec<Pod>,
    /// The number of upcoming pod creations which will fail.
    pub create_failures: usize,
    /// The number of upcoming pod deletions which will fail.
    pub delete_failures: usize,
    /// The number of upcoming controller writes which will fail.
    pub replace_failures: usize,
}

/// A `ClusterClient` holding all objects in memory.
///
/// Pods are removed as soon as they are deleted, and created pods are immediately `Running` on
/// whichever node they were bound to.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        let mut state = self.state.lock().expect("fake cluster state poisoned");
        f(&mut state)
    }

    pub fn add_pod(&self, pod: Pod) {
        let key = key(pod.metadata.namespace.as_deref().unwrap_or_default(), pod.metadata.name.as_deref().unwrap_or_default());
        self.with_state(|state| state.pods.insert(key, pod));
    }

    pub fn add_workload(&self, workload: Workload) {
        let key = (workload.kind(), key(NAMESPACE, workload.name()));
        self.with_state(|state| state.workloads.insert(key, workload));
    }

    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.with_state(|state| state.pods.get(&key(NAMESPACE, name)).cloned())
    }

    pub fn workload(&self, kind: ControllerKind, name: &str) -> Option<Workload> {
        self.with_state(|state| state.workloads.get(&(kind, key(NAMESPACE, name))).cloned())
    }

    /// The scheduler name of every write to the target controller, in order.
    pub fn scheduler_history(&self, kind: ControllerKind, name: &str, encoding: SchedulerEncoding) -> Vec<String> {
        self.with_state(|state| {
            state
                .workload_writes
                .iter()
                .filter(|workload| workload.kind() == kind && workload.name() == name)
                .map(|workload| encoding.read(workload.template()))
                .collect()
        })
    }

    /// The total number of writes made to the cluster.
    pub fn mutations(&self) -> usize {
        self.with_state(|state| state.workload_writes.len() + state.deleted_pods.len() + state.created_pods.len())
    }
}

fn key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        match self.with_state(|state| state.pods.get(&key(namespace, name)).cloned()) {
            Some(pod) => Ok(pod),
            None => bail!("pods {:?} not found", name),
        }
    }

    async fn delete_pod(&self, namespace: &str, name: &str, grace_period_seconds: i64) -> Result<()> {
        self.with_state(|state| {
            if state.delete_failures > 0 {
                state.delete_failures -= 1;
                bail!("injected failure deleting pod {}", name);
            }
            state.pods.remove(&key(namespace, name));
            state.deleted_pods.push((name.into(), grace_period_seconds));
            Ok(())
        })
    }

    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod> {
        self.with_state(|state| {
            let name = pod.metadata.name.clone().unwrap_or_default();
            if state.create_failures > 0 {
                state.create_failures -= 1;
                bail!("injected failure creating pod {}", name);
            }
            if state.pods.contains_key(&key(namespace, &name)) {
                bail!("pods {:?} already exists", name);
            }
            let mut created = pod.clone();
            created.metadata.uid = Some(format!("uid-{}-{}", name, state.created_pods.len()));
            created.status = Some(PodStatus {
                phase: Some(PHASE_RUNNING.into()),
                ..Default::default()
            });
            state.pods.insert(key(namespace, &name), created.clone());
            state.created_pods.push(pod.clone());
            Ok(created)
        })
    }

    async fn list_pods_in_phase(&self, namespace: &str, phase: &str) -> Result<Vec<Pod>> {
        let prefix = key(namespace, "");
        Ok(self.with_state(|state| {
            state
                .pods
                .iter()
                .filter(|(key, _)| key.starts_with(&prefix))
                .map(|(_, pod)| pod)
                .filter(|pod| pod.status.as_ref().and_then(|status| status.phase.as_deref()) == Some(phase))
                .cloned()
                .collect()
        }))
    }

    async fn get_workload(&self, namespace: &str, kind: ControllerKind, name: &str) -> Result<Workload> {
        match self.with_state(|state| state.workloads.get(&(kind, key(namespace, name))).cloned()) {
            Some(workload) => Ok(workload),
            None => bail!("{} {:?} not found", kind, name),
        }
    }

    async fn replace_workload(&self, namespace: &str, workload: &Workload) -> Result<Workload> {
        self.with_state(|state| {
            if state.replace_failures > 0 {
                state.replace_failures -= 1;
                bail!("injected conflict updating {}", workload.name());
            }
            state.workloads.insert((workload.kind(), key(namespace, workload.name())), workload.clone());
            state.workload_writes.push(workload.clone());
            Ok(workload.clone())
        })
    }
}

/// Build a running standalone pod bound to the given node.
pub fn pod(name: &str, node: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(NAMESPACE.into()),
            labels: Some(btreemap! {"app".into() => "web".into()}),
            resource_version: Some("1234".into()),
            self_link: Some(format!("/api/v1/namespaces/{}/pods/{}", NAMESPACE, name)),
            uid: Some(format!("uid-{}", name)),
            generation: Some(1),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.into()),
            hostname: Some(name.into()),
            subdomain: Some("web".into()),
            termination_grace_period_seconds: Some(30),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some(PHASE_RUNNING.into()),
            ..Default::default()
        }),
    }
}

/// Build a running pod controlled by the given parent and bound to the given node.
pub fn owned_pod(name: &str, node: &str, kind: &str, owner: &str) -> Pod {
    let mut pod = pod(name, node);
    pod.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "v1".into(),
        kind: kind.into(),
        name: owner.into(),
        uid: format!("uid-{}", owner),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }]);
    pod
}

/// Build a pending pod created by the given parent while its scheduler was `scheduler`.
pub fn pending_pod(name: &str, kind: &str, owner: &str, scheduler: &str) -> Pod {
    let mut pod = owned_pod(name, "", kind, owner);
    if let Some(spec) = pod.spec.as_mut() {
        spec.node_name = None;
        spec.scheduler_name = Some(scheduler.into());
    }
    pod.status = Some(PodStatus {
        phase: Some(PHASE_PENDING.into()),
        ..Default::default()
    });
    pod
}

fn template() -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(btreemap! {"app".into() => "web".into()}),
            ..Default::default()
        }),
        spec: Some(PodSpec::default()),
    }
}

/// Build a ReplicationController using the default scheduler.
pub fn replication_controller(name: &str) -> Workload {
    Workload::ReplicationController(ReplicationController {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(NAMESPACE.into()),
            ..Default::default()
        },
        spec: Some(ReplicationControllerSpec {
            replicas: Some(2),
            template: Some(template()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Build a ReplicaSet using the default scheduler.
pub fn replica_set(name: &str) -> Workload {
    Workload::ReplicaSet(ReplicaSet {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(NAMESPACE.into()),
            ..Default::default()
        },
        spec: Some(ReplicaSetSpec {
            replicas: Some(2),
            template: Some(template()),
            ..Default::default()
        }),
        ..Default::default()
    })
}
