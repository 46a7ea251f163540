//! TransitService controller implementation
//!
//! This module implements the reconciliation logic for TransitService
//! resources: keep at least one dataset generation, create new generations
//! when the cron schedule fires, and keep the serving workload bound to the
//! newest ready generation.
//!
//! The controller wakes on watch events (the service itself, its owned
//! generations, its workload) and on the timer it requests for the next
//! schedule fire. Every invocation re-derives the full picture from the API
//! server; nothing is cached between calls.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    Condition, ConditionStatus, TransitDataset, TransitDatasetSpec, TransitService,
    TransitServiceStatus,
};
use crate::schedule::UpdateSchedule;
use crate::workload::{bound_generation, rebind_patch, serving_workload};
use crate::{Error, FIELD_MANAGER};

/// Default requeue when no schedule dictates an earlier wake-up
const DEFAULT_REQUEUE: Duration = Duration::from_secs(60);

/// Trait abstracting Kubernetes client operations for TransitService
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServiceKubeClient: Send + Sync {
    /// List dataset generations carrying a controller owner reference to `owner_uid`
    async fn list_owned_datasets(
        &self,
        namespace: &str,
        owner_uid: &str,
    ) -> Result<Vec<TransitDataset>, Error>;

    /// Create a dataset generation, returning it with its server-assigned name
    async fn create_dataset(
        &self,
        namespace: &str,
        dataset: TransitDataset,
    ) -> Result<TransitDataset, Error>;

    /// List serving workloads carrying a controller owner reference to `owner_uid`
    async fn list_owned_workloads(
        &self,
        namespace: &str,
        owner_uid: &str,
    ) -> Result<Vec<Deployment>, Error>;

    /// Create the serving workload, returning it with its server-assigned name
    async fn create_workload(
        &self,
        namespace: &str,
        workload: Deployment,
    ) -> Result<Deployment, Error>;

    /// Get the serving workload by name; None if it does not exist
    async fn get_workload(&self, name: &str, namespace: &str)
        -> Result<Option<Deployment>, Error>;

    /// Merge-patch the serving workload (volume rebinding)
    async fn patch_workload(
        &self,
        name: &str,
        namespace: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error>;

    /// Patch the status of a TransitService
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &TransitServiceStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct ServiceKubeClientImpl {
    client: Client,
}

impl ServiceKubeClientImpl {
    /// Create a new ServiceKubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

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
impl ServiceKubeClient for ServiceKubeClientImpl {
    async fn list_owned_datasets(
        &self,
        namespace: &str,
        owner_uid: &str,
    ) -> Result<Vec<TransitDataset>, Error> {
        let api: Api<TransitDataset> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|d| controlled_by(&d.metadata, owner_uid))
            .collect())
    }

    async fn create_dataset(
        &self,
        namespace: &str,
        dataset: TransitDataset,
    ) -> Result<TransitDataset, Error> {
        let api: Api<TransitDataset> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(api.create(&params, &dataset).await?)
    }

    async fn list_owned_workloads(
        &self,
        namespace: &str,
        owner_uid: &str,
    ) -> Result<Vec<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter(|d| controlled_by(&d.metadata, owner_uid))
            .collect())
    }

    async fn create_workload(
        &self,
        namespace: &str,
        workload: Deployment,
    ) -> Result<Deployment, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(api.create(&params, &workload).await?)
    }

    async fn get_workload(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(deploy) => Ok(Some(deploy)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_workload(
        &self,
        name: &str,
        namespace: &str,
        patch: &serde_json::Value,
    ) -> Result<(), Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        status: &TransitServiceStatus,
    ) -> Result<(), Error> {
        let api: Api<TransitService> = Api::namespaced(self.client.clone(), namespace);
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
pub struct ServiceContext {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn ServiceKubeClient>,
    /// Image the serving workload runs
    pub engine_image: String,
    /// Backoff applied by the error policy for retryable failures
    pub error_requeue: Duration,
}

impl ServiceContext {
    /// Create a context from a real Kubernetes client
    pub fn from_client(
        client: Client,
        engine_image: impl Into<String>,
        error_requeue: Duration,
    ) -> Self {
        Self {
            kube: Arc::new(ServiceKubeClientImpl::new(client)),
            engine_image: engine_image.into(),
            error_requeue,
        }
    }

    /// Create a context for testing with a mock client
    #[cfg(test)]
    pub fn for_testing(kube: Arc<dyn ServiceKubeClient>) -> Self {
        Self {
            kube,
            engine_image: crate::DEFAULT_ENGINE_IMAGE.to_string(),
            error_requeue: Duration::from_secs(5),
        }
    }
}

/// Reconcile a TransitService resource
///
/// Order matters: generations first (initial, then scheduled), selection
/// second, workload binding last, so a generation created this cycle can
/// never be selected before it is ready.
#[instrument(skip(service, ctx), fields(service = %service.name_any()))]
pub async fn reconcile(
    service: Arc<TransitService>,
    ctx: Arc<ServiceContext>,
) -> Result<Action, Error> {
    let name = service.name_any();
    let namespace = service
        .namespace()
        .ok_or(Error::MissingObjectKey("metadata.namespace"))?;
    let uid = service
        .uid()
        .ok_or(Error::MissingObjectKey("metadata.uid"))?;

    if service.metadata.deletion_timestamp.is_some() {
        debug!("service is being deleted, nothing to do");
        return Ok(Action::await_change());
    }

    if let Err(e) = service.spec.validate() {
        warn!(error = %e, "service validation failed");
        return Ok(Action::await_change());
    }

    // The owner scan is authoritative; status.datasets is a user-facing
    // record reconstructed from it below.
    let mut generations = ctx.kube.list_owned_datasets(&namespace, &uid).await?;
    generations.sort_by(|a, b| {
        creation_time(a)
            .cmp(&creation_time(b))
            .then_with(|| a.name_any().cmp(&b.name_any()))
    });

    if generations.is_empty() {
        let created = ctx
            .kube
            .create_dataset(&namespace, new_generation(&service)?)
            .await?;
        info!(generation = %created.name_any(), "created initial dataset generation");
        let status = service
            .status
            .clone()
            .unwrap_or_default()
            .record_generation(created.name_any());
        ctx.kube.patch_status(&name, &namespace, &status).await?;
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    // Scheduled regeneration. Overlap is permitted: a new generation is
    // created when due regardless of whether earlier builds finished.
    let mut requeue = DEFAULT_REQUEUE;
    if let Some(expr) = service.spec.schedule() {
        let now = Utc::now();
        // Generations are sorted, so the newest creation time is last.
        let latest = generations.iter().rev().find_map(creation_time);
        match evaluate_schedule(expr, latest, now) {
            Ok(outcome) => {
                if outcome.rebuild_due {
                    let created = ctx
                        .kube
                        .create_dataset(&namespace, new_generation(&service)?)
                        .await?;
                    info!(generation = %created.name_any(), "created scheduled dataset generation");
                    generations.push(created);
                }
                if let Some(wait) = outcome.requeue {
                    requeue = wait;
                }
            }
            Err(e) => {
                // Not fatal: the rest of reconciliation still runs, and a
                // spec fix will re-trigger via the watch.
                warn!(error = %e, schedule = expr, "malformed update schedule, skipping rebuild check");
            }
        }
    }

    let mut status = service.status.clone().unwrap_or_default();
    for generation in &generations {
        status = status.record_generation(generation.name_any());
    }

    match select_active_generation(&generations) {
        Some(selected) => {
            let workload_name =
                ensure_serving_workload(&service, selected, &namespace, &uid, &status, &ctx)
                    .await?;
            let generation_name = selected.name_any();
            status = status
                .workload(workload_name)
                .serving(generation_name.clone())
                .condition(Condition::new(
                    "Serving",
                    ConditionStatus::True,
                    "GenerationReady",
                    format!("serving dataset generation {generation_name}"),
                ));
        }
        None => {
            debug!("no ready generation yet, not touching the serving workload");
            status = status.condition(Condition::new(
                "Serving",
                ConditionStatus::False,
                "AwaitingDataset",
                "no dataset generation has finished processing",
            ));
        }
    }

    // Skip the write when nothing changed so an unchanged service produces
    // no redundant status traffic.
    if service.status.as_ref() != Some(&status) {
        ctx.kube.patch_status(&name, &namespace, &status).await?;
    }

    Ok(Action::requeue(requeue))
}

/// Error policy for the service controller
///
/// Retryable (Kubernetes API) errors requeue with the configured backoff;
/// there is no retry ceiling. Everything else awaits a spec change.
pub fn error_policy(service: Arc<TransitService>, error: &Error, ctx: Arc<ServiceContext>) -> Action {
    error!(
        ?error,
        service = %service.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(ctx.error_requeue)
    } else {
        Action::await_change()
    }
}

/// Outcome of evaluating the update schedule for one reconcile cycle
#[derive(Debug, PartialEq, Eq)]
struct ScheduleOutcome {
    /// Whether the schedule fired since the latest generation was created
    rebuild_due: bool,
    /// When to wake up for the next fire
    requeue: Option<Duration>,
}

/// Evaluate the cron schedule against the newest generation's creation time
///
/// A generation with no creation timestamp (not yet persisted) counts as
/// created now, which defers the next rebuild rather than double-firing.
fn evaluate_schedule(
    expr: &str,
    latest: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<ScheduleOutcome, Error> {
    let sched = UpdateSchedule::parse(expr)?;
    let latest = latest.unwrap_or(now);
    Ok(ScheduleOutcome {
        rebuild_due: sched.is_due(latest, now),
        requeue: sched.until_next_fire(now),
    })
}

fn creation_time(dataset: &TransitDataset) -> Option<DateTime<Utc>> {
    dataset.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

/// Build a new dataset generation from the service's spec
fn new_generation(service: &TransitService) -> Result<TransitDataset, Error> {
    let owner = service
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey("metadata.uid"))?;

    Ok(TransitDataset {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-gen-", service.name_any())),
            namespace: service.namespace(),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: TransitDatasetSpec {
            config: service.spec.config.clone(),
            input_volume: service.spec.input_volume.clone(),
        },
        status: None,
    })
}

/// Pick the generation the workload should serve: finished processing, with
/// the newest creation timestamp; equal timestamps resolve by name so the
/// choice is deterministic.
pub fn select_active_generation(generations: &[TransitDataset]) -> Option<&TransitDataset> {
    generations
        .iter()
        .filter(|g| {
            g.status
                .as_ref()
                .map(|s| s.finished_processing)
                .unwrap_or(false)
        })
        .max_by(|a, b| {
            creation_time(a)
                .cmp(&creation_time(b))
                .then_with(|| a.name_any().cmp(&b.name_any()))
        })
}

/// Create the serving workload if none exists, or re-point an existing one
/// at the selected generation. Returns the workload name for status.
async fn ensure_serving_workload(
    service: &TransitService,
    selected: &TransitDataset,
    namespace: &str,
    uid: &str,
    status: &TransitServiceStatus,
    ctx: &ServiceContext,
) -> Result<String, Error> {
    // Status reference first; owner scan as crash recovery for a created
    // workload whose status write was lost.
    let existing = match status.active_workload.as_deref() {
        Some(workload_name) => ctx.kube.get_workload(workload_name, namespace).await?,
        None => None,
    };
    let existing = match existing {
        Some(workload) => Some(workload),
        None => ctx
            .kube
            .list_owned_workloads(namespace, uid)
            .await?
            .into_iter()
            .next(),
    };

    let selected_name = selected.name_any();
    match existing {
        None => {
            let workload = serving_workload(service, selected, &ctx.engine_image)?;
            let created = ctx.kube.create_workload(namespace, workload).await?;
            let workload_name = created.name_any();
            info!(
                workload = %workload_name,
                generation = %selected_name,
                "created serving workload"
            );
            Ok(workload_name)
        }
        Some(workload) => {
            let workload_name = workload.name_any();
            if bound_generation(&workload) != Some(selected_name.as_str()) {
                let patch = rebind_patch(service, selected)?;
                ctx.kube
                    .patch_workload(&workload_name, namespace, &patch)
                    .await?;
                info!(
                    workload = %workload_name,
                    generation = %selected_name,
                    "re-pointed serving workload at newer generation"
                );
            } else {
                debug!(workload = %workload_name, "serving workload already bound to selection");
            }
            Ok(workload_name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ConfigReference, DatasetPhase, TransitDatasetStatus, TransitServiceSpec,
        VolumeClaimRef};
    use crate::GENERATION_LABEL;
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::sync::Mutex;

    fn sample_service(name: &str) -> TransitService {
        let mut svc = TransitService::new(
            name,
            TransitServiceSpec {
                config: ConfigReference::new("berlin-feeds"),
                update_schedule: None,
                input_volume: None,
            },
        );
        svc.metadata.namespace = Some("transit".to_string());
        svc.metadata.uid = Some("svc-uid".to_string());
        svc
    }

    fn generation(name: &str, created: DateTime<Utc>, finished: bool) -> TransitDataset {
        let mut ds = TransitDataset::new(
            name,
            TransitDatasetSpec {
                config: ConfigReference::new("berlin-feeds"),
                input_volume: None,
            },
        );
        ds.metadata.namespace = Some("transit".to_string());
        ds.metadata.creation_timestamp = Some(Time(created));
        let mut status = TransitDatasetStatus::with_phase(DatasetPhase::Processing)
            .input_volume(VolumeClaimRef::new(format!("{name}-input")))
            .data_volume(VolumeClaimRef::new(format!("{name}-data")))
            .job(format!("{name}-build"));
        if finished {
            status = status.finished().phase(DatasetPhase::Ready);
        }
        ds.status = Some(status);
        ds
    }

    fn named_dataset(name: &str) -> TransitDataset {
        let mut ds = TransitDataset::new(
            name,
            TransitDatasetSpec {
                config: ConfigReference::new("berlin-feeds"),
                input_volume: None,
            },
        );
        ds.metadata.creation_timestamp = Some(Time(Utc::now()));
        ds
    }

    fn named_workload(name: &str, bound_to: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(std::collections::BTreeMap::from([(
                    GENERATION_LABEL.to_string(),
                    bound_to.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn t(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 15, h, m, 0).unwrap()
    }

    #[derive(Clone, Default)]
    struct StatusCapture {
        updates: Arc<Mutex<Vec<TransitServiceStatus>>>,
    }

    impl StatusCapture {
        fn record(&self, status: TransitServiceStatus) {
            self.updates.lock().unwrap().push(status);
        }

        fn last(&self) -> Option<TransitServiceStatus> {
            self.updates.lock().unwrap().last().cloned()
        }

        fn was_updated(&self) -> bool {
            !self.updates.lock().unwrap().is_empty()
        }
    }

    fn capturing_mock() -> (MockServiceKubeClient, StatusCapture) {
        let capture = StatusCapture::default();
        let mut mock = MockServiceKubeClient::new();
        let c = capture.clone();
        mock.expect_patch_status().returning(move |_, _, status| {
            c.record(status.clone());
            Ok(())
        });
        (mock, capture)
    }

    // =========================================================================
    // Generation selection
    // =========================================================================

    #[test]
    fn selection_picks_the_newest_ready_generation() {
        let generations = vec![
            generation("gen-a", t(8, 0), true),
            generation("gen-b", t(9, 0), false),
            generation("gen-c", t(10, 0), true),
            generation("gen-d", t(11, 0), false),
        ];

        let selected = select_active_generation(&generations).unwrap();
        assert_eq!(selected.name_any(), "gen-c");
    }

    #[test]
    fn selection_breaks_timestamp_ties_by_name() {
        let generations = vec![
            generation("gen-b", t(9, 0), true),
            generation("gen-a", t(9, 0), true),
        ];

        let selected = select_active_generation(&generations).unwrap();
        assert_eq!(selected.name_any(), "gen-b");
    }

    #[test]
    fn selection_returns_none_when_nothing_is_ready() {
        let generations = vec![
            generation("gen-a", t(8, 0), false),
            generation("gen-b", t(9, 0), false),
        ];
        assert!(select_active_generation(&generations).is_none());
    }

    // =========================================================================
    // Schedule evaluation
    // =========================================================================

    #[test]
    fn rebuild_due_iff_now_reaches_next_fire() {
        // Hourly schedule, latest generation created at 10:00.
        let latest = Some(t(10, 0));

        let before = evaluate_schedule("0 * * * *", latest, t(10, 59)).unwrap();
        assert!(!before.rebuild_due);

        let after = evaluate_schedule("0 * * * *", latest, t(11, 0)).unwrap();
        assert!(after.rebuild_due);
    }

    #[test]
    fn requeue_lands_on_the_next_fire_from_now() {
        let outcome = evaluate_schedule("0 * * * *", Some(t(10, 0)), t(10, 45)).unwrap();
        assert_eq!(outcome.requeue, Some(Duration::from_secs(15 * 60)));
    }

    #[test]
    fn missing_creation_timestamp_defers_the_rebuild() {
        let outcome = evaluate_schedule("0 * * * *", None, t(10, 30)).unwrap();
        assert!(!outcome.rebuild_due);
    }

    // =========================================================================
    // Lifecycle stories (end-to-end against mock clients)
    // =========================================================================

    #[tokio::test]
    async fn new_service_creates_exactly_one_generation_and_no_workload() {
        let (mut mock, capture) = capturing_mock();
        mock.expect_list_owned_datasets().returning(|_, _| Ok(vec![]));
        mock.expect_create_dataset()
            .times(1)
            .returning(|_, ds| {
                // The generation must carry the service's config and owner ref.
                assert_eq!(ds.spec.config.name, "berlin-feeds");
                let owners = ds.metadata.owner_references.as_ref().unwrap();
                assert_eq!(owners[0].kind, "TransitService");
                assert_eq!(owners[0].controller, Some(true));
                Ok(named_dataset("berlin-gen-aaa"))
            });
        mock.expect_create_workload().never();

        let ctx = Arc::new(ServiceContext::for_testing(Arc::new(mock)));
        reconcile(Arc::new(sample_service("berlin")), ctx)
            .await
            .unwrap();

        let status = capture.last().unwrap();
        assert_eq!(status.datasets, vec!["berlin-gen-aaa"]);
        assert!(status.active_workload.is_none());
    }

    #[tokio::test]
    async fn unready_generation_means_no_workload_yet() {
        let (mut mock, capture) = capturing_mock();
        mock.expect_list_owned_datasets()
            .returning(|_, _| Ok(vec![generation("berlin-gen-aaa", t(8, 0), false)]));
        mock.expect_create_workload().never();
        mock.expect_create_dataset().never();

        let ctx = Arc::new(ServiceContext::for_testing(Arc::new(mock)));
        reconcile(Arc::new(sample_service("berlin")), ctx)
            .await
            .unwrap();

        let status = capture.last().unwrap();
        assert!(status.active_workload.is_none());
        assert_eq!(status.conditions[0].reason, "AwaitingDataset");
    }

    #[tokio::test]
    async fn first_ready_generation_gets_a_workload_bound_to_its_volumes() {
        let (mut mock, capture) = capturing_mock();
        mock.expect_list_owned_datasets()
            .returning(|_, _| Ok(vec![generation("berlin-gen-aaa", t(8, 0), true)]));
        mock.expect_list_owned_workloads().returning(|_, _| Ok(vec![]));
        mock.expect_create_workload().times(1).returning(|_, w| {
            // Bound to the selected generation's claims.
            let pod = w.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
            let claims: Vec<_> = pod
                .volumes
                .as_ref()
                .unwrap()
                .iter()
                .filter_map(|v| v.persistent_volume_claim.as_ref())
                .map(|p| p.claim_name.clone())
                .collect();
            assert!(claims.contains(&"berlin-gen-aaa-data".to_string()));
            assert!(claims.contains(&"berlin-gen-aaa-input".to_string()));
            Ok(named_workload("berlin-server-x1", "berlin-gen-aaa"))
        });

        let ctx = Arc::new(ServiceContext::for_testing(Arc::new(mock)));
        reconcile(Arc::new(sample_service("berlin")), ctx)
            .await
            .unwrap();

        let status = capture.last().unwrap();
        assert_eq!(status.active_workload.as_deref(), Some("berlin-server-x1"));
        assert_eq!(status.serving_generation.as_deref(), Some("berlin-gen-aaa"));
    }

    #[tokio::test]
    async fn newer_ready_generation_rebinds_the_existing_workload() {
        let (mut mock, capture) = capturing_mock();
        mock.expect_list_owned_datasets().returning(|_, _| {
            Ok(vec![
                generation("berlin-gen-aaa", t(8, 0), true),
                generation("berlin-gen-bbb", t(10, 0), true),
            ])
        });
        mock.expect_get_workload()
            .returning(|name, _| Ok(Some(named_workload(name, "berlin-gen-aaa"))));
        mock.expect_create_workload().never();
        mock.expect_patch_workload()
            .times(1)
            .returning(|_, _, patch| {
                assert_eq!(patch["metadata"]["labels"][GENERATION_LABEL], "berlin-gen-bbb");
                Ok(())
            });

        let mut svc = sample_service("berlin");
        svc.status = Some(
            TransitServiceStatus::default()
                .record_generation("berlin-gen-aaa")
                .workload("berlin-server-x1")
                .serving("berlin-gen-aaa"),
        );

        let ctx = Arc::new(ServiceContext::for_testing(Arc::new(mock)));
        reconcile(Arc::new(svc), ctx).await.unwrap();

        let status = capture.last().unwrap();
        assert_eq!(status.serving_generation.as_deref(), Some("berlin-gen-bbb"));
    }

    #[tokio::test]
    async fn workload_already_bound_to_selection_is_left_alone() {
        let (mut mock, capture) = capturing_mock();
        mock.expect_list_owned_datasets()
            .returning(|_, _| Ok(vec![generation("berlin-gen-aaa", t(8, 0), true)]));
        mock.expect_get_workload()
            .returning(|name, _| Ok(Some(named_workload(name, "berlin-gen-aaa"))));
        mock.expect_patch_workload().never();
        mock.expect_create_workload().never();

        let mut svc = sample_service("berlin");
        svc.status = Some(
            TransitServiceStatus::default()
                .record_generation("berlin-gen-aaa")
                .workload("berlin-server-x1")
                .serving("berlin-gen-aaa")
                .condition(Condition::new(
                    "Serving",
                    ConditionStatus::True,
                    "GenerationReady",
                    "serving dataset generation berlin-gen-aaa",
                )),
        );

        let ctx = Arc::new(ServiceContext::for_testing(Arc::new(mock)));
        reconcile(Arc::new(svc), ctx).await.unwrap();

        // Status matches reality exactly, so no redundant write happens.
        assert!(!capture.was_updated());
    }

    #[tokio::test]
    async fn lost_workload_status_write_adopts_by_owner_scan() {
        let (mut mock, capture) = capturing_mock();
        mock.expect_list_owned_datasets()
            .returning(|_, _| Ok(vec![generation("berlin-gen-aaa", t(8, 0), true)]));
        // Status has no workload reference, but a previously created one
        // exists and is found by the owner scan.
        mock.expect_list_owned_workloads()
            .returning(|_, _| Ok(vec![named_workload("berlin-server-x1", "berlin-gen-aaa")]));
        mock.expect_create_workload().never();

        let ctx = Arc::new(ServiceContext::for_testing(Arc::new(mock)));
        reconcile(Arc::new(sample_service("berlin")), ctx)
            .await
            .unwrap();

        assert_eq!(
            capture.last().unwrap().active_workload.as_deref(),
            Some("berlin-server-x1")
        );
    }

    // =========================================================================
    // Scheduling stories
    // =========================================================================

    #[tokio::test]
    async fn due_schedule_creates_an_overlapping_generation() {
        let (mut mock, _capture) = capturing_mock();
        // Latest generation is far in the past and still unready; the
        // hourly schedule fires anyway (overlap permitted).
        mock.expect_list_owned_datasets().returning(|_, _| {
            Ok(vec![generation(
                "berlin-gen-aaa",
                Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
                false,
            )])
        });
        mock.expect_create_dataset()
            .times(1)
            .returning(|_, _| Ok(named_dataset("berlin-gen-bbb")));

        let mut svc = sample_service("berlin");
        svc.spec.update_schedule = Some("0 * * * *".to_string());

        let ctx = Arc::new(ServiceContext::for_testing(Arc::new(mock)));
        let action = reconcile(Arc::new(svc), ctx).await.unwrap();

        // The controller always asks to be woken for the next fire, which
        // for an hourly schedule is less than an hour away.
        assert_ne!(action, Action::await_change());
    }

    #[tokio::test]
    async fn undue_schedule_creates_nothing() {
        let (mut mock, _capture) = capturing_mock();
        // Annual schedule with the generation created "now": next fire is
        // in the future regardless of when the test runs.
        mock.expect_list_owned_datasets()
            .returning(|_, _| Ok(vec![generation("berlin-gen-aaa", Utc::now(), false)]));
        mock.expect_create_dataset().never();

        let mut svc = sample_service("berlin");
        svc.spec.update_schedule = Some("0 0 1 1 *".to_string());

        let ctx = Arc::new(ServiceContext::for_testing(Arc::new(mock)));
        reconcile(Arc::new(svc), ctx).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_schedule_skips_rebuilds_but_still_reconciles() {
        let (mut mock, capture) = capturing_mock();
        mock.expect_list_owned_datasets()
            .returning(|_, _| Ok(vec![generation("berlin-gen-aaa", t(8, 0), true)]));
        mock.expect_list_owned_workloads().returning(|_, _| Ok(vec![]));
        mock.expect_create_dataset().never();
        mock.expect_create_workload()
            .times(1)
            .returning(|_, _| Ok(named_workload("berlin-server-x1", "berlin-gen-aaa")));

        let mut svc = sample_service("berlin");
        svc.spec.update_schedule = Some("every full hour".to_string());

        let ctx = Arc::new(ServiceContext::for_testing(Arc::new(mock)));
        let action = reconcile(Arc::new(svc), ctx).await.unwrap();

        // Workload management still happened despite the bad schedule.
        assert_eq!(
            capture.last().unwrap().active_workload.as_deref(),
            Some("berlin-server-x1")
        );
        assert_eq!(action, Action::requeue(DEFAULT_REQUEUE));
    }

    #[tokio::test]
    async fn deleted_service_is_a_noop() {
        let mock = MockServiceKubeClient::new();
        let mut svc = sample_service("berlin");
        svc.metadata.deletion_timestamp = Some(Time(Utc::now()));

        let ctx = Arc::new(ServiceContext::for_testing(Arc::new(mock)));
        let action = reconcile(Arc::new(svc), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[test]
    fn error_policy_backs_off_on_api_errors_only() {
        let ctx = Arc::new(ServiceContext::for_testing(Arc::new(
            MockServiceKubeClient::new(),
        )));
        let svc = Arc::new(sample_service("berlin"));

        let api_err = Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "the object has been modified".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }));
        assert_eq!(
            error_policy(svc.clone(), &api_err, ctx.clone()),
            Action::requeue(ctx.error_requeue)
        );

        let schedule_err = Error::schedule("bad expression");
        assert_eq!(error_policy(svc, &schedule_err, ctx), Action::await_change());
    }
}
