//! Access to the scheduler name of a parent controller.
//!
//! While a pod is moved, its parent controller's pod template is pointed at a scheduler which
//! does not exist, so that any replacement pod the controller creates in the meantime stays
//! pending instead of being placed by the real scheduler. Where the scheduler name lives depends
//! on the generation of the cluster API:
//!
//! - K8s >= 1.6 stores it in the typed `spec.schedulerName` field of the pod template.
//! - Older clusters store it in the `scheduler.alpha.kubernetes.io/name` annotation of the pod
//! template, where an absent or empty annotation means the default scheduler.
//!
//! Reads & writes of both encodings, for both supported controller kinds, go through a
//! `SchedulerAccessor`. Restoration of a scheduler, whether by a move's own cleanup or by an
//! expired lease's callback, goes through `SchedulerAccessor::restore`.

use std::sync::Arc;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};

use crate::error::MoveError;
use crate::k8s::coordination::LeaseGuard;
use crate::k8s::{ApiGeneration, ClusterClient, ControllerRef};
use crate::retry::{retry_during, RetryPolicy, RETRY_LESS, RETRY_MORE};

/// The pod template annotation holding the scheduler name on legacy clusters.
pub const SCHEDULER_ANNOTATION_KEY: &str = "scheduler.alpha.kubernetes.io/name";
/// The scheduler name reported by legacy clusters when no scheduler is assigned.
pub const LEGACY_UNASSIGNED: &str = "None";

/// The storage encoding of a scheduler name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerEncoding {
    /// The typed `schedulerName` field of the pod spec.
    SpecField,
    /// The `scheduler.alpha.kubernetes.io/name` annotation of the pod metadata.
    Annotation,
}

impl SchedulerEncoding {
    pub fn for_generation(generation: ApiGeneration) -> Self {
        match generation {
            ApiGeneration::Modern => Self::SpecField,
            ApiGeneration::Legacy => Self::Annotation,
        }
    }

    /// The value which denotes that no scheduler is assigned.
    pub fn unassigned(&self) -> &'static str {
        match self {
            Self::SpecField => "",
            Self::Annotation => LEGACY_UNASSIGNED,
        }
    }

    /// Map equivalent spellings of the unassigned value onto the canonical one.
    fn normalize<'a>(&self, name: &'a str) -> &'a str {
        match self {
            Self::Annotation if name.is_empty() => LEGACY_UNASSIGNED,
            _ => name,
        }
    }

    /// Read the scheduler name of the given pod template.
    pub fn read(&self, template: Option<&PodTemplateSpec>) -> String {
        match self {
            Self::SpecField => template
                .and_then(|template| template.spec.as_ref())
                .and_then(|spec| spec.scheduler_name.clone())
                .unwrap_or_default(),
            Self::Annotation => template
                .and_then(|template| template.metadata.as_ref())
                .and_then(|meta| meta.annotations.as_ref())
                .and_then(|annotations| annotations.get(SCHEDULER_ANNOTATION_KEY))
                .filter(|name| !name.is_empty())
                .cloned()
                .unwrap_or_else(|| LEGACY_UNASSIGNED.into()),
        }
    }

    /// Write the scheduler name of the given pod template, returning the previous name.
    pub fn write(&self, template: &mut PodTemplateSpec, name: &str) -> String {
        let previous = self.read(Some(template));
        match self {
            Self::SpecField => {
                let spec = template.spec.get_or_insert_with(Default::default);
                spec.scheduler_name = if name.is_empty() { None } else { Some(name.into()) };
            }
            Self::Annotation => {
                let meta = template.metadata.get_or_insert_with(Default::default);
                let annotations = meta.annotations.get_or_insert_with(Default::default);
                match self.normalize(name) {
                    LEGACY_UNASSIGNED => {
                        annotations.remove(SCHEDULER_ANNOTATION_KEY);
                    }
                    name => {
                        annotations.insert(SCHEDULER_ANNOTATION_KEY.into(), name.into());
                    }
                }
                if annotations.is_empty() {
                    meta.annotations = None;
                }
            }
        }
        previous
    }

    /// Read the scheduler name of the given pod, empty if none is declared.
    pub fn read_pod(&self, pod: &Pod) -> String {
        let name = match self {
            Self::SpecField => pod.spec.as_ref().and_then(|spec| spec.scheduler_name.clone()),
            Self::Annotation => pod
                .metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(SCHEDULER_ANNOTATION_KEY).cloned()),
        };
        name.unwrap_or_default()
    }
}

/// A guard checked before each attempt to read or write a scheduler name.
pub trait Fence: Send + Sync {
    /// Returns `false` if the caller may no longer act on the controller.
    fn check(&self) -> bool;
}

/// A fence which never blocks, used once a lease has already expired.
pub struct Unfenced;

impl Fence for Unfenced {
    fn check(&self) -> bool {
        true
    }
}

impl<P: Send + 'static> Fence for LeaseGuard<P> {
    fn check(&self) -> bool {
        self.renew()
    }
}

/// The outcome of checking a controller's scheduler name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The scheduler name matched the expected name.
    Matched,
    /// The scheduler name was found to be the encapsulated name.
    Mismatched(String),
    /// The fence refused the check.
    Fenced,
}

/// Reads & writes the scheduler name of one parent controller.
#[derive(Clone)]
pub struct SchedulerAccessor {
    client: Arc<dyn ClusterClient>,
    controller: ControllerRef,
    encoding: SchedulerEncoding,
}

impl SchedulerAccessor {
    /// Create a new instance for the given controller, using the encoding of the given API generation.
    pub fn new(client: Arc<dyn ClusterClient>, controller: ControllerRef, generation: ApiGeneration) -> Self {
        Self {
            client,
            controller,
            encoding: SchedulerEncoding::for_generation(generation),
        }
    }

    pub fn controller(&self) -> &ControllerRef {
        &self.controller
    }

    pub fn encoding(&self) -> SchedulerEncoding {
        self.encoding
    }

    /// Get the controller's current scheduler name.
    pub async fn get(&self) -> Result<String> {
        let workload = self
            .client
            .get_workload(&self.controller.namespace, self.controller.kind, &self.controller.name)
            .await?;
        Ok(self.encoding.read(workload.template()))
    }

    /// Set the controller's scheduler name, returning the name it replaced.
    ///
    /// If the controller already uses the given name, nothing is written and the unassigned
    /// value of this encoding is returned.
    #[tracing::instrument(level = "debug", skip(self), fields(controller = %self.controller))]
    pub async fn set(&self, name: &str) -> Result<String> {
        let name = self.encoding.normalize(name);
        let mut workload = self
            .client
            .get_workload(&self.controller.namespace, self.controller.kind, &self.controller.name)
            .await?;
        if self.encoding.read(workload.template()) == name {
            tracing::debug!("no need to update scheduler name");
            return Ok(self.encoding.unassigned().into());
        }

        let previous = self.encoding.write(workload.template_mut(), name);
        self.client
            .replace_workload(&self.controller.namespace, &workload)
            .await
            .with_context(|| format!("error updating scheduler name of {}", self.controller))?;
        tracing::info!(%previous, %name, "updated scheduler name");
        Ok(previous)
    }

    /// Check that the controller's scheduler name is `expected`, retrying failed reads.
    pub async fn check(&self, expected: &str, policy: RetryPolicy, fence: &dyn Fence) -> Result<CheckOutcome> {
        let expected = self.encoding.normalize(expected);
        retry_during(policy, "check scheduler name", || async move {
            if !fence.check() {
                return Ok(CheckOutcome::Fenced);
            }
            self.get().await.map(|current| {
                if current == expected {
                    CheckOutcome::Matched
                } else {
                    CheckOutcome::Mismatched(current)
                }
            })
        })
        .await
    }

    /// Set the controller's scheduler name, retrying failed writes, returning the name it replaced.
    pub async fn update(&self, name: &str, policy: RetryPolicy, fence: &dyn Fence) -> Result<String> {
        let previous = retry_during(policy, "update scheduler name", || async move {
            if !fence.check() {
                return Ok(None);
            }
            self.set(name).await.map(Some)
        })
        .await?;
        previous.ok_or_else(|| {
            MoveError::LeaseLost {
                key: self.controller.lock_key(),
            }
            .into()
        })
    }

    /// Restore the controller's scheduler name to `previous`, if it is still `reserved`.
    ///
    /// Returns `false` without writing anything when the scheduler name has been changed by
    /// someone else in the meantime, or when the fence refuses the check.
    #[tracing::instrument(level = "debug", skip(self, fence), fields(controller = %self.controller))]
    pub async fn restore(&self, reserved: &str, previous: &str, fence: &dyn Fence) -> Result<bool> {
        let outcome = self
            .check(reserved, RetryPolicy::check(RETRY_LESS), fence)
            .await
            .context("error checking scheduler name before restoring it")?;
        match outcome {
            CheckOutcome::Matched => (),
            CheckOutcome::Mismatched(current) => {
                tracing::info!(%current, "scheduler name was changed by another party, skipping restore");
                return Ok(false);
            }
            CheckOutcome::Fenced => {
                tracing::warn!("lock lost before restoring scheduler name, leaving restore to lock expiry");
                return Ok(false);
            }
        }

        self.update(previous, RetryPolicy::update(RETRY_MORE), fence)
            .await
            .context("error restoring scheduler name")?;
        Ok(true)
    }
}
