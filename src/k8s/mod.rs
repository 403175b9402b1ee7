//! Kubernetes integration.
//!
//! Moving a pod touches three kinds of objects: the pod itself, its parent controller (a
//! ReplicationController or ReplicaSet), and the pending pods which the parent may create while
//! its scheduler is invalidated. All access to the cluster goes through the `ClusterClient`
//! trait, which is implemented against a live cluster by `KubeClient`.

mod client;
mod coordination;
mod mover;
mod pods;
mod scheduler;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec, ReplicationController};

use crate::error::MoveError;

pub use client::KubeClient;
pub use mover::Mover;
pub use pods::check_move_health;
pub use scheduler::SchedulerEncoding;

/// The canonical kind name of a ReplicationController.
pub const KIND_REPLICATION_CONTROLLER: &str = "ReplicationController";
/// The canonical kind name of a ReplicaSet.
pub const KIND_REPLICA_SET: &str = "ReplicaSet";
/// The phase of a pod which has not yet been bound & started.
pub const PHASE_PENDING: &str = "Pending";
/// The phase of a pod which is bound & running.
pub const PHASE_RUNNING: &str = "Running";

/// The kinds of parent controllers whose scheduler may be managed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ControllerKind {
    ReplicationController,
    ReplicaSet,
}

impl ControllerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReplicationController => KIND_REPLICATION_CONTROLLER,
            Self::ReplicaSet => KIND_REPLICA_SET,
        }
    }
}

impl fmt::Display for ControllerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The owner of a pod as declared by the pod itself.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerRef {
    /// The kind of the owner, which may be a kind this system does not support.
    pub kind: String,
    /// The name of the owner.
    pub name: String,
}

/// A reference to a parent controller whose scheduler may be managed.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ControllerRef {
    pub kind: ControllerKind,
    pub namespace: String,
    pub name: String,
}

impl ControllerRef {
    /// Resolve a pod's declared owner into a supported controller reference.
    pub fn from_owner(namespace: &str, owner: &OwnerRef) -> Result<Self> {
        let kind = match owner.kind.as_str() {
            KIND_REPLICATION_CONTROLLER => ControllerKind::ReplicationController,
            KIND_REPLICA_SET => ControllerKind::ReplicaSet,
            _ => {
                return Err(MoveError::UnsupportedKind {
                    kind: owner.kind.clone(),
                    name: owner.name.clone(),
                }
                .into())
            }
        };
        Ok(Self {
            kind,
            namespace: namespace.into(),
            name: owner.name.clone(),
        })
    }

    /// The key under which moves against this controller are serialized.
    pub fn lock_key(&self) -> String {
        format!("{}-{}-{}", self.kind, self.namespace, self.name)
    }
}

impl fmt::Display for ControllerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A parent controller object of one of the supported kinds.
#[derive(Clone, Debug, PartialEq)]
pub enum Workload {
    ReplicationController(ReplicationController),
    ReplicaSet(ReplicaSet),
}

impl Workload {
    pub fn kind(&self) -> ControllerKind {
        match self {
            Self::ReplicationController(_) => ControllerKind::ReplicationController,
            Self::ReplicaSet(_) => ControllerKind::ReplicaSet,
        }
    }

    pub fn name(&self) -> &str {
        let meta = match self {
            Self::ReplicationController(rc) => &rc.metadata,
            Self::ReplicaSet(rs) => &rs.metadata,
        };
        meta.name.as_deref().unwrap_or_default()
    }

    /// The pod template of this controller, if it declares one.
    pub fn template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Self::ReplicationController(rc) => rc.spec.as_ref().and_then(|spec| spec.template.as_ref()),
            Self::ReplicaSet(rs) => rs.spec.as_ref().and_then(|spec| spec.template.as_ref()),
        }
    }

    /// The pod template of this controller, created empty if absent.
    pub fn template_mut(&mut self) -> &mut PodTemplateSpec {
        match self {
            Self::ReplicationController(rc) => rc
                .spec
                .get_or_insert_with(Default::default)
                .template
                .get_or_insert_with(Default::default),
            Self::ReplicaSet(rs) => rs
                .spec
                .get_or_insert_with(Default::default)
                .template
                .get_or_insert_with(Default::default),
        }
    }
}

/// The generation of the cluster API, which determines how a scheduler name is stored.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiGeneration {
    /// K8s < 1.6, where the scheduler name lives in a pod template annotation.
    Legacy,
    /// K8s >= 1.6, where the scheduler name is a typed pod spec field.
    Modern,
}

impl FromStr for ApiGeneration {
    type Err = anyhow::Error;

    /// Parse a dotted K8s version such as `1.5` or `1.22.3`.
    fn from_str(val: &str) -> Result<Self> {
        let mut parts = Vec::new();
        for part in val.trim().trim_start_matches('v').split('.') {
            let num: u32 = part
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid K8s version {:?}, expected a dotted version such as 1.6", val))?;
            parts.push(num);
        }
        let major = parts.first().copied().unwrap_or_default();
        let minor = parts.get(1).copied().unwrap_or_default();
        if (major, minor) >= (1, 6) {
            Ok(Self::Modern)
        } else {
            Ok(Self::Legacy)
        }
    }
}

/// The cluster operations needed to move a pod.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch the target pod.
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;
    /// Delete the target pod with the given grace period; deleting an absent pod succeeds.
    async fn delete_pod(&self, namespace: &str, name: &str, grace_period_seconds: i64) -> Result<()>;
    /// Create the given pod.
    async fn create_pod(&self, namespace: &str, pod: &Pod) -> Result<Pod>;
    /// List all pods of the namespace in the given phase.
    async fn list_pods_in_phase(&self, namespace: &str, phase: &str) -> Result<Vec<Pod>>;
    /// Fetch the target controller.
    async fn get_workload(&self, namespace: &str, kind: ControllerKind, name: &str) -> Result<Workload>;
    /// Replace the given controller, failing if it has changed since it was fetched.
    async fn replace_workload(&self, namespace: &str, workload: &Workload) -> Result<Workload>;
}
