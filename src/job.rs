//! Processing job and volume claim construction
//!
//! A dataset build runs as a single `batch/v1` Job with two phases:
//! an init container downloads the declared schedule feeds and map extracts
//! into the input volume, then the routing engine's build mode derives the
//! routing indices into the data volume. The controller only ever observes
//! the Job's overall Complete/Failed condition.

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

use crate::crd::TransitDataset;
use crate::{Error, ROLE_LABEL};

/// Container images used by the build pipeline
#[derive(Clone, Debug)]
pub struct BuildImages {
    /// Image for the fetch init container
    pub fetch: String,
    /// Image for the routing engine build container
    pub engine: String,
}

impl Default for BuildImages {
    fn default() -> Self {
        Self {
            fetch: crate::DEFAULT_FETCH_IMAGE.to_string(),
            engine: crate::DEFAULT_ENGINE_IMAGE.to_string(),
        }
    }
}

/// Role of a volume claim owned by a dataset
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VolumeRole {
    /// Raw downloaded feeds
    Input,
    /// Derived routing indices
    Data,
}

impl VolumeRole {
    /// Label value and name-prefix segment for this role
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Data => "data",
        }
    }
}

/// Build a volume claim for the given dataset and role
///
/// The claim name is generated by the API server (`<dataset>-<role>-`), never
/// derived deterministically; the owner reference plus the role label are
/// what make the claim findable again after a lost status write.
pub fn volume_claim(
    dataset: &TransitDataset,
    role: VolumeRole,
    size: &str,
) -> Result<PersistentVolumeClaim, Error> {
    let owner = dataset
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey("metadata.uid"))?;

    let mut labels = BTreeMap::new();
    labels.insert(ROLE_LABEL.to_string(), role.as_str().to_string());

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-{}-", dataset.name_any(), role.as_str())),
            namespace: dataset.namespace(),
            labels: Some(labels),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        status: None,
    })
}

/// Build the two-phase processing job for a dataset
///
/// `input_claim` and `data_claim` are the claim names already recorded in the
/// dataset's status; the job mounts them together with the dataset's config.
pub fn processing_job(
    dataset: &TransitDataset,
    input_claim: &str,
    data_claim: &str,
    images: &BuildImages,
) -> Result<Job, Error> {
    let owner = dataset
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey("metadata.uid"))?;

    let fetch = Container {
        name: "fetch".to_string(),
        image: Some(images.fetch.clone()),
        volume_mounts: Some(vec![
            mount("config", "/config"),
            mount("input-volume", "/input"),
        ]),
        ..Default::default()
    };

    let build = Container {
        name: "build".to_string(),
        image: Some(images.engine.clone()),
        command: Some(vec![
            "/engine/routed".to_string(),
            "--config".to_string(),
            "/config/config.ini".to_string(),
            "--mode".to_string(),
            "build".to_string(),
        ]),
        volume_mounts: Some(vec![
            mount("input-volume", "/input"),
            mount("data-volume", "/data"),
            mount("config", "/config"),
        ]),
        ..Default::default()
    };

    Ok(Job {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-build-", dataset.name_any())),
            namespace: dataset.namespace(),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    init_containers: Some(vec![fetch]),
                    containers: vec![build],
                    volumes: Some(vec![
                        claim_volume("input-volume", input_claim),
                        claim_volume("data-volume", data_claim),
                        config_volume(&dataset.spec.config.name),
                    ]),
                    restart_policy: Some("Never".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// Whether the job reports the given condition type with status True
pub fn has_condition(job: &Job, type_: &str) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == type_ && c.status == "True")
        })
        .unwrap_or(false)
}

pub(crate) fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

pub(crate) fn claim_volume(name: &str, claim: &str) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.to_string(),
            read_only: None,
        }),
        ..Default::default()
    }
}

pub(crate) fn config_volume(config_map: &str) -> Volume {
    Volume {
        name: "config".to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map.to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}
