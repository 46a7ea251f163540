//! Serving workload construction and volume rebinding
//!
//! The serving workload is a single-replica Deployment running the routing
//! engine over a ready dataset generation's volumes. It is created once, the
//! first time a generation becomes ready, and thereafter only *re-pointed*:
//! when a newer generation is ready, its volume bindings are patched in
//! place. The `Recreate` strategy makes that patch an actual pod replacement;
//! the old pod holds the ReadWriteOnce claims until it is gone.

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{Container, ContainerPort, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

use crate::crd::{TransitDataset, TransitService};
use crate::job::{claim_volume, config_volume, mount};
use crate::{Error, GENERATION_LABEL, SERVING_PORT};

/// Volume claim names extracted from a ready generation
struct GenerationVolumes<'a> {
    input: &'a str,
    data: &'a str,
}

fn generation_volumes(generation: &TransitDataset) -> Result<GenerationVolumes<'_>, Error> {
    let status = generation
        .status
        .as_ref()
        .ok_or_else(|| Error::validation("generation has no status"))?;
    let input = status
        .input_volume
        .as_ref()
        .ok_or_else(|| Error::validation("generation has no input volume"))?;
    let data = status
        .data_volume
        .as_ref()
        .ok_or_else(|| Error::validation("generation has no data volume"))?;
    Ok(GenerationVolumes {
        input: &input.claim_name,
        data: &data.claim_name,
    })
}

fn pod_volumes(
    service: &TransitService,
    vols: &GenerationVolumes<'_>,
) -> Vec<k8s_openapi::api::core::v1::Volume> {
    vec![
        claim_volume("data-volume", vols.data),
        claim_volume("input-volume", vols.input),
        config_volume(&service.spec.config.name),
    ]
}

/// Stable selector label value for a service's workload pods
fn app_label(service: &TransitService) -> String {
    format!("{}-server", service.name_any())
}

/// Build the serving Deployment bound to the given ready generation
pub fn serving_workload(
    service: &TransitService,
    generation: &TransitDataset,
    engine_image: &str,
) -> Result<Deployment, Error> {
    let owner = service
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey("metadata.uid"))?;
    let vols = generation_volumes(generation)?;
    let app = app_label(service);

    let mut labels = BTreeMap::new();
    labels.insert("app.kubernetes.io/name".to_string(), app.clone());
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        "viaduct".to_string(),
    );
    labels.insert(GENERATION_LABEL.to_string(), generation.name_any());

    let selector = BTreeMap::from([("app.kubernetes.io/name".to_string(), app)]);

    let engine = Container {
        name: "engine".to_string(),
        image: Some(engine_image.to_string()),
        command: Some(vec![
            "/engine/routed".to_string(),
            "--config".to_string(),
            "/config/config.ini".to_string(),
        ]),
        ports: Some(vec![ContainerPort {
            container_port: SERVING_PORT,
            ..Default::default()
        }]),
        volume_mounts: Some(vec![
            mount("data-volume", "/data"),
            mount("input-volume", "/input"),
            mount("config", "/config"),
        ]),
        ..Default::default()
    };

    Ok(Deployment {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-server-", service.name_any())),
            namespace: service.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                match_expressions: None,
            },
            // Recreate: the RWO claims can only be attached to one pod, so
            // the old pod must release them before the rebound one starts.
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                rolling_update: None,
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![engine],
                    volumes: Some(pod_volumes(service, &vols)),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// The generation a deployed workload is currently bound to
pub fn bound_generation(workload: &Deployment) -> Option<&str> {
    workload
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(GENERATION_LABEL))
        .map(String::as_str)
}

/// Merge patch that re-points an existing workload at a newer generation
///
/// Replaces the pod-template volume list and the generation labels in one
/// write; a merge patch swaps the whole volumes array, so stale claim
/// bindings cannot linger.
pub fn rebind_patch(
    service: &TransitService,
    generation: &TransitDataset,
) -> Result<serde_json::Value, Error> {
    let vols = generation_volumes(generation)?;
    let volumes = serde_json::to_value(pod_volumes(service, &vols))
        .map_err(|e| Error::serialization(e.to_string()))?;

    Ok(serde_json::json!({
        "metadata": {
            "labels": { (GENERATION_LABEL): generation.name_any() }
        },
        "spec": {
            "template": {
                "metadata": {
                    "labels": { (GENERATION_LABEL): generation.name_any() }
                },
                "spec": { "volumes": volumes }
            }
        }
    }))
}
