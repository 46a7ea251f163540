//! TransitDataset controller implementation
//!
//! This module implements the reconciliation logic for TransitDataset
//! resources. It follows the Kubernetes controller pattern: observe current
//! state, determine the next unmet step, apply it, requeue.
//!
//! The pipeline is strictly forward: input volume → data volume → processing
//! job → completion. Each reconcile performs at most one step; convergence to
//! Ready happens over several invocations, each idempotent. Status is the
//! source of truth for which children exist: a reference is written only
//! after the corresponding create succeeded. The reverse loss (child created,
//! status write lost to a crash) is recovered by scanning for children that
//! carry this dataset's controller owner reference and adopting them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    Condition, ConditionStatus, DatasetPhase, TransitDataset, TransitDatasetStatus, VolumeClaimRef,
};
use crate::job::{has_condition, processing_job, volume_claim, BuildImages, VolumeRole};
use crate::{Error, FIELD_MANAGER, ROLE_LABEL};

/// Trait abstracting Kubernetes client operations for TransitDataset
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DatasetKubeClient: Send + Sync {
    /// List volume claims carrying a controller owner reference to `owner_uid`
    async fn list_owned_claims(
        &self,
        namespace: &str,
        owner_uid: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, Error>;

    /// Create a volume claim, returning it with its server-assigned name
    async fn create_claim(
        &self,
        namespace: &str,
        claim: PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error>;

    /// List jobs carrying a controller owner reference to `owner_uid`
    async fn list_owned_jobs(&self, namespace: &str, owner_uid: &str) -> Result<Vec<Job>, Error>;

    /// Create a job, returning it with its server-assigned name
    async fn create_job(&self, namespace: &str, job: Job) -> Result<Job, Error>;

    /// Get a job by name; None if it does not exist
    async fn get_job(&self, name: &str, namespace: &str) -> Result<Option<Job>, Error>;

    /// Patch the status of a TransitDataset
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &TransitDatasetStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct DatasetKubeClientImpl {
    client: Client,
}

impl DatasetKubeClientImpl {
    /// Create a new DatasetKubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Whether the object's metadata carries a controller owner reference to `uid`
fn controlled_by(meta: &ObjectMeta, uid: &str) -> bool {
    meta.owner_references
        .as_ref()
        .map(|refs| {
            refs.iter()
                .any(|o| o.controller == Some(true) && o.uid == uid)
        })
        .unwrap_or(false)
}

#[async_trait]
impl DatasetKubeClient for DatasetKubeClientImpl {
    async fn list_owned_claims(
        &self,
        namespace: &str,
        owner_uid: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|c| controlled_by(&c.metadata, owner_uid))
            .collect())
    }

    async fn create_claim(
        &self,
        namespace: &str,
        claim: PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(api.create(&params, &claim).await?)
    }

    async fn list_owned_jobs(&self, namespace: &str, owner_uid: &str) -> Result<Vec<Job>, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|j| controlled_by(&j.metadata, owner_uid))
            .collect())
    }

    async fn create_job(&self, namespace: &str, job: Job) -> Result<Job, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(api.create(&params, &job).await?)
    }

    async fn get_job(&self, name: &str, namespace: &str) -> Result<Option<Job>, Error> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(job) => Ok(Some(job)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &TransitDatasetStatus,
    ) -> Result<(), Error> {
        let api: Api<TransitDataset> = Api::namespaced(self.client.clone(), namespace);
        let status_patch = serde_json::json!({ "status": status });
        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&status_patch),
        )
        .await?;
        Ok(())
    }
}

/// Controller context containing shared state and clients
///
/// The context is shared across all reconciliation calls and holds the
/// client plus the build tunables from the CLI.
pub struct DatasetContext {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn DatasetKubeClient>,
    /// Images for the fetch and build containers
    pub images: BuildImages,
    /// Capacity requested for each volume claim
    pub volume_size: String,
    /// Backoff applied by the error policy for retryable failures
    pub error_requeue: Duration,
}

impl DatasetContext {
    /// Create a context from a real Kubernetes client
    pub fn from_client(
        client: Client,
        images: BuildImages,
        volume_size: impl Into<String>,
        error_requeue: Duration,
    ) -> Self {
        Self {
            kube: Arc::new(DatasetKubeClientImpl::new(client)),
            images,
            volume_size: volume_size.into(),
            error_requeue,
        }
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn DatasetKubeClient>) -> Self {
        Self {
            kube,
            images: BuildImages::default(),
            volume_size: crate::DEFAULT_VOLUME_SIZE.to_string(),
            error_requeue: Duration::from_secs(5),
        }
    }
}

/// Reconcile a TransitDataset resource
///
/// Performs at most the next unmet pipeline step, persists the result to
/// status, and requeues. Terminal states (Ready, Failed) await the next
/// spec/child change.
#[instrument(skip(dataset, ctx), fields(dataset = %dataset.name_any()))]
pub async fn reconcile(
    dataset: Arc<TransitDataset>,
    ctx: Arc<DatasetContext>,
) -> Result<Action, Error> {
    let name = dataset.name_any();
    let namespace = dataset
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let uid = dataset
        .uid()
        .ok_or(Error::MissingObjectKey("metadata.uid"))?;

    if dataset.metadata.deletion_timestamp.is_some() {
        // Cascade deletion of children is the garbage collector's job.
        debug!("dataset is being deleted, nothing to do");
        return Ok(Action::await_change());
    }

    if let Err(e) = dataset.spec.validate() {
        warn!(error = %e, "dataset validation failed");
        return Ok(Action::await_change());
    }

    let status = dataset.status.clone().unwrap_or_default();

    // Readiness is monotonic: once finished, the job outcome is never
    // re-read, so a later job deletion (or anything else) cannot unset it.
    if status.finished_processing {
        debug!("dataset is ready");
        return Ok(Action::await_change());
    }
    if status.phase == DatasetPhase::Failed {
        debug!("dataset failed, awaiting operator intervention");
        return Ok(Action::await_change());
    }

    if status.input_volume.is_none() {
        let claim = ensure_input_volume(&dataset, &namespace, &uid, &ctx).await?;
        let next = status
            .input_volume(claim)
            .phase(DatasetPhase::InputProvisioning);
        ctx.kube.patch_status(&name, &namespace, &next).await?;
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    if status.data_volume.is_none() {
        let claim = ensure_data_volume(&dataset, &namespace, &uid, &ctx).await?;
        let next = status
            .data_volume(claim)
            .phase(DatasetPhase::DataProvisioning);
        ctx.kube.patch_status(&name, &namespace, &next).await?;
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    if status.job_name.is_none() {
        let job_name = ensure_processing_job(&dataset, &namespace, &uid, &status, &ctx).await?;
        let next = status.job(job_name).phase(DatasetPhase::Processing);
        ctx.kube.patch_status(&name, &namespace, &next).await?;
        return Ok(Action::requeue(Duration::from_secs(10)));
    }

    observe_completion(&dataset, &name, &namespace, &status, &ctx).await
}

/// Error policy for the dataset controller
///
/// Retryable (Kubernetes API) errors requeue with the configured backoff.
/// There is deliberately no retry ceiling, so a persistently failing object
/// keeps retrying until its spec changes or the cause clears. Everything
/// else awaits a spec change.
pub fn error_policy(dataset: Arc<TransitDataset>, error: &Error, ctx: Arc<DatasetContext>) -> Action {
    error!(
        ?error,
        dataset = %dataset.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ctx.error_requeue)
    } else {
        Action::await_change()
    }
}

/// Resolve the input volume claim: spec-supplied, adopted, or freshly created
async fn ensure_input_volume(
    dataset: &TransitDataset,
    namespace: &str,
    uid: &str,
    ctx: &DatasetContext,
) -> Result<VolumeClaimRef, Error> {
    if let Some(supplied) = &dataset.spec.input_volume {
        info!(claim = %supplied.claim_name, "using externally supplied input volume");
        return Ok(supplied.clone());
    }
    ensure_claim(dataset, namespace, uid, VolumeRole::Input, ctx).await
}

/// Resolve the data volume claim: adopted or freshly created
async fn ensure_data_volume(
    dataset: &TransitDataset,
    namespace: &str,
    uid: &str,
    ctx: &DatasetContext,
) -> Result<VolumeClaimRef, Error> {
    ensure_claim(dataset, namespace, uid, VolumeRole::Data, ctx).await
}

async fn ensure_claim(
    dataset: &TransitDataset,
    namespace: &str,
    uid: &str,
    role: VolumeRole,
    ctx: &DatasetContext,
) -> Result<VolumeClaimRef, Error> {
    // Crash recovery: a claim may exist that a lost status write never
    // recorded. Adopt it instead of creating a second one.
    let owned = ctx.kube.list_owned_claims(namespace, uid).await?;
    if let Some(existing) = owned.iter().find(|c| claim_role(c) == Some(role.as_str())) {
        let claim_name = existing.name_any();
        info!(claim = %claim_name, role = role.as_str(), "adopting existing volume claim");
        return Ok(VolumeClaimRef::new(claim_name));
    }

    let claim = volume_claim(dataset, role, &ctx.volume_size)?;
    let created = ctx.kube.create_claim(namespace, claim).await?;
    let claim_name = created.name_any();
    info!(claim = %claim_name, role = role.as_str(), "created volume claim");
    Ok(VolumeClaimRef::new(claim_name))
}

fn claim_role(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(ROLE_LABEL))
        .map(String::as_str)
}

/// Launch the processing job, adopting one an earlier invocation created
async fn ensure_processing_job(
    dataset: &TransitDataset,
    namespace: &str,
    uid: &str,
    status: &TransitDatasetStatus,
    ctx: &DatasetContext,
) -> Result<String, Error> {
    let owned = ctx.kube.list_owned_jobs(namespace, uid).await?;
    if let Some(existing) = owned.first() {
        let job_name = existing.name_any();
        info!(job = %job_name, "adopting existing processing job");
        return Ok(job_name);
    }

    let input = status
        .input_volume
        .as_ref()
        .ok_or(Error::MissingObjectKey("status.inputVolume"))?;
    let data = status
        .data_volume
        .as_ref()
        .ok_or(Error::MissingObjectKey("status.dataVolume"))?;

    let job = processing_job(dataset, &input.claim_name, &data.claim_name, &ctx.images)?;
    let created = ctx.kube.create_job(namespace, job).await?;
    let job_name = created.name_any();
    info!(job = %job_name, "created processing job");
    Ok(job_name)
}

/// Observe the processing job's completion condition
async fn observe_completion(
    dataset: &TransitDataset,
    name: &str,
    namespace: &str,
    status: &TransitDatasetStatus,
    ctx: &DatasetContext,
) -> Result<Action, Error> {
    let job_name = status
        .job_name
        .as_deref()
        .ok_or(Error::MissingObjectKey("status.jobName"))?;

    let job = match ctx.kube.get_job(job_name, namespace).await? {
        Some(job) => job,
        None => {
            // A dataset creates exactly one job, ever. If it vanished before
            // completing, the build cannot progress without operator action.
            warn!(job = %job_name, "processing job disappeared before completion");
            return Ok(Action::await_change());
        }
    };

    if has_condition(&job, "Complete") {
        info!(job = %job_name, "processing complete, dataset ready");
        let next = status
            .clone()
            .finished()
            .phase(DatasetPhase::Ready)
            .condition(Condition::new(
                "Ready",
                ConditionStatus::True,
                "JobComplete",
                "processing job completed",
            ));
        ctx.kube.patch_status(name, namespace, &next).await?;
        return Ok(Action::await_change());
    }

    if has_condition(&job, "Failed") {
        warn!(job = %job_name, dataset = %dataset.name_any(), "processing job failed");
        let next = status
            .clone()
            .phase(DatasetPhase::Failed)
            .condition(Condition::new(
                "Ready",
                ConditionStatus::False,
                "ProcessingFailed",
                "processing job reported failure",
            ));
        ctx.kube.patch_status(name, namespace, &next).await?;
        return Ok(Action::await_change());
    }

    debug!(job = %job_name, "processing job still running");
    Ok(Action::requeue(Duration::from_secs(30)))
}
