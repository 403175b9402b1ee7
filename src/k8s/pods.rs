//! Pod level operations of a move.

use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use serde::Deserialize;

use crate::error::MoveError;
use crate::k8s::scheduler::SchedulerEncoding;
use crate::k8s::{ClusterClient, ControllerKind, OwnerRef, PHASE_PENDING, PHASE_RUNNING};
use crate::retry::{retry_during, RetryPolicy, DEFAULT_SLEEP, RETRY_LESS};

/// The legacy annotation through which a controller declared itself as a pod's creator.
pub const ANNOTATION_CREATED_BY: &str = "kubernetes.io/created-by";

/// The JSON document stored in the `kubernetes.io/created-by` annotation.
#[derive(Deserialize)]
struct SerializedReference {
    reference: CreatorReference,
}

#[derive(Deserialize)]
struct CreatorReference {
    #[serde(default)]
    kind: String,
    #[serde(default)]
    name: String,
}

/// The `{namespace}/{name}` identity of a pod.
pub fn pod_id(pod: &Pod) -> String {
    format!(
        "{}/{}",
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        pod.metadata.name.as_deref().unwrap_or_default()
    )
}

/// The node to which the given pod is bound, empty if unbound.
pub fn node_of(pod: &Pod) -> &str {
    pod.spec.as_ref().and_then(|spec| spec.node_name.as_deref()).unwrap_or_default()
}

/// Resolve the controller which owns the given pod, if any.
///
/// The controlling owner reference is preferred, falling back to the legacy `created-by`
/// annotation. A pod with neither is standalone.
pub fn parent_of(pod: &Pod) -> Result<Option<OwnerRef>> {
    let controller = pod
        .metadata
        .owner_references
        .iter()
        .flatten()
        .find(|owner| owner.controller.unwrap_or(false));
    if let Some(owner) = controller {
        return Ok(Some(OwnerRef {
            kind: owner.kind.clone(),
            name: owner.name.clone(),
        }));
    }

    let created_by = match pod.metadata.annotations.as_ref().and_then(|annotations| annotations.get(ANNOTATION_CREATED_BY)) {
        Some(created_by) => created_by,
        None => return Ok(None),
    };
    let creator: SerializedReference = serde_json::from_str(created_by).map_err(|err| MoveError::InvalidParentAnnotation {
        pod: pod_id(pod),
        reason: err.to_string(),
    })?;
    if creator.reference.name.is_empty() {
        return Ok(None);
    }
    Ok(Some(OwnerRef {
        kind: creator.reference.kind,
        name: creator.reference.name,
    }))
}

/// The grace period with which to delete the given pod, capped at `max_seconds`.
pub fn grace_period(pod: &Pod, max_seconds: i64) -> i64 {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.termination_grace_period_seconds)
        .map(|grace| grace.min(max_seconds))
        .unwrap_or(0)
        .max(0)
}

/// Build the pod which replaces the given pod, bound to `node`.
///
/// Fields which only the cluster may set are cleared, as are the host specific fields of the
/// spec, so that the replacement can be created under the same name.
pub fn build_replacement(pod: &Pod, node: &str) -> Pod {
    let mut metadata = pod.metadata.clone();
    metadata.self_link = None;
    metadata.resource_version = None;
    metadata.generation = None;
    metadata.creation_timestamp = None;
    metadata.deletion_timestamp = None;
    metadata.deletion_grace_period_seconds = None;
    metadata.managed_fields = None;
    metadata.uid = None;

    let mut spec = pod.spec.clone().unwrap_or_default();
    spec.hostname = None;
    spec.subdomain = None;
    spec.node_name = Some(node.into());

    Pod {
        metadata,
        spec: Some(spec),
        status: None,
    }
}

/// Create the replacement of a pod deleted with the given grace period.
///
/// Creation races with the cluster releasing the name of the deleted pod, so creation is
/// delayed past the grace period and then retried.
#[tracing::instrument(level = "debug", skip(client, replacement), fields(pod = %pod_id(replacement)))]
pub async fn recreate(client: &dyn ClusterClient, replacement: &Pod, grace_period_seconds: i64) -> Result<Pod> {
    let (delay, policy) = recreate_schedule(grace_period_seconds);
    tokio::time::sleep(delay).await;

    let namespace = replacement.metadata.namespace.as_deref().unwrap_or_default();
    retry_during(policy, "create pod", || client.create_pod(namespace, replacement)).await
}

/// The delay before recreating a pod deleted with the given grace period, and the retry policy
/// of its creation.
pub fn recreate_schedule(grace_period_seconds: i64) -> (Duration, RetryPolicy) {
    let grace = grace_period_seconds.max(0) as u64;
    let delay = Duration::from_secs(grace.saturating_add(1));
    let timeout = Duration::from_secs(grace.saturating_add(3)).saturating_mul(RETRY_LESS);
    (delay, RetryPolicy::new(RETRY_LESS, timeout, DEFAULT_SLEEP))
}

/// Delete the pending pods which a controller of the given kind created while its scheduler
/// was `reserved`, returning the number of pods deleted.
///
/// The real scheduler never picks these pods up, so they would otherwise stay pending.
#[tracing::instrument(level = "debug", skip(client))]
pub async fn clean_pending_pods(
    client: &dyn ClusterClient, namespace: &str, reserved: &str, kind: ControllerKind, encoding: SchedulerEncoding,
) -> Result<usize> {
    let pods = client
        .list_pods_in_phase(namespace, PHASE_PENDING)
        .await
        .context("error listing pending pods")?;

    let (mut deleted, mut error) = (0, None);
    for pod in pods.iter() {
        // Already being deleted.
        if pod.metadata.deletion_grace_period_seconds.is_some() {
            continue;
        }
        if encoding.read_pod(pod) != reserved {
            continue;
        }
        match parent_of(pod) {
            Ok(Some(owner)) if owner.kind == kind.as_str() => (),
            _ => continue,
        }

        let name = pod.metadata.name.as_deref().unwrap_or_default();
        tracing::info!(pod = %pod_id(pod), "deleting pending pod");
        if let Err(err) = client.delete_pod(namespace, name, 0).await {
            tracing::warn!(error = ?err, pod = %pod_id(pod), "error deleting pending pod");
            error = Some(err);
            continue;
        }
        deleted += 1;
    }
    match error {
        Some(err) => Err(err.context("error cleaning pending pods")),
        None => Ok(deleted),
    }
}

/// Check that the target pod is running on the given node.
#[tracing::instrument(level = "debug", skip(client))]
pub async fn check_move_health(client: &dyn ClusterClient, namespace: &str, name: &str, node: &str) -> Result<()> {
    let pod = client.get_pod(namespace, name).await?;
    let id = pod_id(&pod);
    let phase = pod.status.as_ref().and_then(|status| status.phase.as_deref()).unwrap_or_default();
    if phase != PHASE_RUNNING {
        return Err(MoveError::Unhealthy {
            pod: id,
            reason: format!("pod is not running, phase is {:?}", phase),
        }
        .into());
    }
    let current = node_of(&pod);
    if current != node {
        return Err(MoveError::Unhealthy {
            pod: id,
            reason: format!("pod is running on node {:?} instead of {:?}", current, node),
        }
        .into());
    }
    Ok(())
}
