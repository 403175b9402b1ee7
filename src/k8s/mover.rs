//! Orchestration of a single pod move.
//!
//! A standalone pod is simply deleted & recreated on the destination node. A pod owned by a
//! ReplicationController or ReplicaSet additionally requires that its parent's scheduler be
//! invalidated for the duration of the move, as the parent would otherwise immediately replace
//! the deleted pod with one placed by the real scheduler. Moves against the same parent are
//! serialized through the `LeaseMap`, and the parent's scheduler is restored on every exit path
//! once its lease has been acquired. Should the process lose track of a lease, its expiry
//! callback performs the same restoration from the reaper.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use rand::Rng;
use tokio::time::Instant;

use crate::config::Config;
use crate::error::{Disposition, MoveError, MoveFailure, MoveResult};
use crate::k8s::coordination::{LeaseGuard, LeaseMap};
use crate::k8s::pods::{self, node_of};
use crate::k8s::scheduler::{CheckOutcome, SchedulerAccessor, Unfenced};
use crate::k8s::{ClusterClient, ControllerRef, OwnerRef};
use crate::retry::{RetryPolicy, RETRY_LESS};

/// The initial delay between attempts to acquire a lock.
const LOCK_BACKOFF_MIN: Duration = Duration::from_millis(500);
/// The maximum delay between attempts to acquire a lock.
const LOCK_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// The restoration owed to a parent controller whose lease expires.
pub struct ExpiryRestore {
    accessor: SchedulerAccessor,
    reserved: String,
    /// The scheduler name replaced by the reserved name, once the replacement is made.
    previous: Mutex<Option<String>>,
}

impl ExpiryRestore {
    pub fn new(accessor: SchedulerAccessor, reserved: String) -> Self {
        Self {
            accessor,
            reserved,
            previous: Mutex::new(None),
        }
    }

    fn record(&self, previous: String) {
        *self.previous.lock().unwrap_or_else(PoisonError::into_inner) = Some(previous);
    }

    fn previous(&self) -> Option<String> {
        self.previous.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Restore the parent's scheduler after its lease has expired.
    pub async fn run(self: Arc<Self>) {
        let controller = self.accessor.controller();
        let previous = match self.previous() {
            Some(previous) => previous,
            None => {
                tracing::debug!(%controller, "lease expired before scheduler was invalidated");
                return;
            }
        };
        tracing::warn!(%controller, %previous, "lease expired, restoring scheduler name");
        match self.accessor.restore(&self.reserved, &previous, &Unfenced).await {
            Ok(true) => tracing::info!(%controller, %previous, "scheduler name restored after lease expiry"),
            Ok(false) => (),
            Err(err) => tracing::error!(error = ?err, %controller, "error restoring scheduler name after lease expiry"),
        }
    }
}

/// The mutations made to the cluster so far by a move.
#[derive(Default)]
struct Mutations {
    invalidated: bool,
    deleted: bool,
}

impl Mutations {
    /// The disposition of a failed move, given whether its cleanup succeeded.
    fn disposition(&self, cleaned_up: bool) -> Disposition {
        if !self.invalidated && !self.deleted {
            Disposition::Untouched
        } else if cleaned_up {
            Disposition::Restored
        } else {
            Disposition::Degraded
        }
    }
}

/// Moves pods to specific nodes.
#[derive(Clone)]
pub struct Mover {
    client: Arc<dyn ClusterClient>,
    leases: LeaseMap<Arc<ExpiryRestore>>,
    config: Arc<Config>,
}

impl Mover {
    /// Create a new instance.
    pub fn new(client: Arc<dyn ClusterClient>, config: Arc<Config>) -> Self {
        Self {
            client,
            leases: LeaseMap::new(config.lease_ttl()),
            config,
        }
    }

    /// The locks held over parent controllers.
    pub fn leases(&self) -> &LeaseMap<Arc<ExpiryRestore>> {
        &self.leases
    }

    /// Move the target pod to the given node, returning the recreated pod.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn move_pod(&self, namespace: &str, name: &str, node: &str) -> MoveResult<Pod> {
        let untouched = |err: anyhow::Error| MoveFailure::new(Disposition::Untouched, err);
        let pod = self
            .client
            .get_pod(namespace, name)
            .await
            .context("error fetching pod")
            .map_err(untouched)?;
        ensure_not_on_node(&pod, node).map_err(untouched)?;

        match pods::parent_of(&pod).map_err(untouched)? {
            None => {
                tracing::info!(pod = %pods::pod_id(&pod), %node, "moving standalone pod");
                self.move_standalone(namespace, name, node).await
            }
            Some(owner) => {
                tracing::info!(pod = %pods::pod_id(&pod), %node, owner_kind = %owner.kind, owner = %owner.name, "moving controlled pod");
                self.move_controlled(namespace, name, node, &owner).await
            }
        }
    }

    async fn move_standalone(&self, namespace: &str, name: &str, node: &str) -> MoveResult<Pod> {
        let mut mutations = Mutations::default();
        let res = self.relocate(namespace, name, node, &mut mutations).await;
        res.map_err(|err| MoveFailure::new(mutations.disposition(false), err))
    }

    async fn move_controlled(&self, namespace: &str, name: &str, node: &str, owner: &OwnerRef) -> MoveResult<Pod> {
        let untouched = |err: anyhow::Error| MoveFailure::new(Disposition::Untouched, err);
        let controller = ControllerRef::from_owner(namespace, owner).map_err(untouched)?;
        let accessor = SchedulerAccessor::new(self.client.clone(), controller, self.config.k8s_version);
        let restore = Arc::new(ExpiryRestore::new(accessor.clone(), self.config.scheduler_name.clone()));
        let guard = self.lock(&accessor, restore.clone()).await.map_err(untouched)?;

        let mut mutations = Mutations::default();
        let res = self.invalidate_and_relocate(&accessor, &guard, &restore, name, node, &mut mutations).await;
        let cleanup = self.cleanup(&accessor, guard, &restore).await;

        match (res, cleanup) {
            (Ok(pod), Ok(())) => Ok(pod),
            (Ok(_), Err(err)) => Err(MoveFailure::new(
                Disposition::Degraded,
                err.context(format!("pod {}/{} was moved, but its parent could not be restored", namespace, name)),
            )),
            (Err(err), cleanup) => Err(MoveFailure::new(mutations.disposition(cleanup.is_ok()), err)),
        }
    }

    /// Acquire the lock of the accessor's controller, waiting for any concurrent move to finish.
    async fn lock(&self, accessor: &SchedulerAccessor, restore: Arc<ExpiryRestore>) -> Result<LeaseGuard<Arc<ExpiryRestore>>> {
        let key = accessor.controller().lock_key();
        let timeout = self.config.lock_timeout();
        let start = Instant::now();
        let mut backoff = LOCK_BACKOFF_MIN;
        loop {
            if let Some(guard) = self.leases.acquire_guard(&key, restore.clone(), ExpiryRestore::run) {
                tracing::debug!(key = %guard.key(), version = guard.version(), "lock acquired");
                return Ok(guard);
            }
            let waited = start.elapsed();
            if waited >= timeout {
                return Err(MoveError::LockTimeout { key, waited }.into());
            }

            let jitter = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 2);
            let delay = (backoff + Duration::from_millis(jitter)).min(timeout - waited);
            tracing::debug!(%key, ?delay, "lock is held by another move, backing off");
            tokio::time::sleep(delay).await;
            backoff = (backoff * 2).min(LOCK_BACKOFF_MAX);
        }
    }

    /// Point the parent's scheduler at the reserved name, confirm it, then relocate the pod.
    async fn invalidate_and_relocate(
        &self, accessor: &SchedulerAccessor, guard: &LeaseGuard<Arc<ExpiryRestore>>, restore: &ExpiryRestore, name: &str, node: &str,
        mutations: &mut Mutations,
    ) -> Result<Pod> {
        let controller = accessor.controller();
        let reserved = &self.config.scheduler_name;
        let previous = accessor
            .update(reserved, RetryPolicy::update(RETRY_LESS), guard)
            .await
            .with_context(|| format!("error invalidating scheduler of {}", controller))?;
        restore.record(previous.clone());
        mutations.invalidated = true;
        tracing::debug!(%controller, %previous, %reserved, "scheduler invalidated");

        let outcome = accessor
            .check(reserved, RetryPolicy::check(RETRY_LESS), guard)
            .await
            .with_context(|| format!("error verifying scheduler of {}", controller))?;
        if outcome != CheckOutcome::Matched {
            tracing::warn!(%controller, ?outcome, "scheduler invalidation could not be verified");
            return Err(MoveError::InvalidationUnverified {
                controller: controller.to_string(),
                expected: reserved.clone(),
            }
            .into());
        }

        self.relocate(&controller.namespace, name, node, mutations).await
    }

    /// Restore the parent's scheduler, delete any pods stranded by the reserved scheduler, and
    /// release the lock.
    async fn cleanup(&self, accessor: &SchedulerAccessor, guard: LeaseGuard<Arc<ExpiryRestore>>, restore: &ExpiryRestore) -> Result<()> {
        let controller = accessor.controller();
        let reserved = &self.config.scheduler_name;
        let mut res = Ok(());
        if let Some(previous) = restore.previous() {
            match accessor.restore(reserved, &previous, &guard).await {
                Ok(true) => tracing::debug!(%controller, %previous, "scheduler restored"),
                Ok(false) => (),
                Err(err) => {
                    tracing::error!(error = ?err, %controller, "error restoring scheduler");
                    res = Err(err);
                }
            }
        }

        let cleaned = pods::clean_pending_pods(self.client.as_ref(), &controller.namespace, reserved, controller.kind, accessor.encoding()).await;
        match cleaned {
            Ok(0) => (),
            Ok(count) => tracing::info!(%controller, count, "deleted pending pods"),
            Err(err) => tracing::warn!(error = ?err, %controller, "error deleting pending pods"),
        }

        guard.release();
        res
    }

    /// Delete the target pod and recreate it on the given node.
    #[tracing::instrument(level = "debug", skip(self, mutations))]
    async fn relocate(&self, namespace: &str, name: &str, node: &str, mutations: &mut Mutations) -> Result<Pod> {
        let pod = self.client.get_pod(namespace, name).await.context("error fetching pod")?;
        ensure_not_on_node(&pod, node)?;
        let replacement = pods::build_replacement(&pod, node);
        let grace = pods::grace_period(&pod, self.config.max_grace_period_seconds);

        self.client
            .delete_pod(namespace, name, grace)
            .await
            .with_context(|| format!("error deleting pod {}", pods::pod_id(&pod)))?;
        mutations.deleted = true;
        tracing::debug!(pod = %pods::pod_id(&pod), grace, "pod deleted");

        let created = pods::recreate(self.client.as_ref(), &replacement, grace)
            .await
            .with_context(|| format!("error recreating pod {} on node {}", pods::pod_id(&pod), node))?;
        tracing::info!(pod = %pods::pod_id(&created), from = %node_of(&pod), to = %node, "pod moved");
        Ok(created)
    }
}

fn ensure_not_on_node(pod: &Pod, node: &str) -> Result<()> {
    if node_of(pod) == node {
        return Err(MoveError::AlreadyOnNode {
            pod: pods::pod_id(pod),
            node: node.into(),
        }
        .into());
    }
    Ok(())
}
