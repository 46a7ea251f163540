//! TransitDataset Custom Resource Definition
//!
//! A TransitDataset is one generation of a processed routing dataset. It is
//! created by the TransitService controller and driven to readiness by the
//! dataset controller: input volume → data volume → processing job → ready.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ConfigReference, DatasetPhase, VolumeClaimRef};

/// Specification for a TransitDataset
///
/// The spec is written once at creation by the service controller and never
/// mutated afterwards; all progress is tracked in status.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "viaduct.dev",
    version = "v1alpha1",
    kind = "TransitDataset",
    plural = "transitdatasets",
    shortname = "tds",
    status = "TransitDatasetStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.finishedProcessing"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TransitDatasetSpec {
    /// ConfigMap with feed URL lists and engine build parameters
    pub config: ConfigReference,

    /// Externally supplied input volume claim
    ///
    /// When set, the dataset controller records this claim instead of
    /// provisioning a fresh input volume. The claim must already hold (or
    /// receive out-of-band) the raw feed data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_volume: Option<VolumeClaimRef>,
}

impl TransitDatasetSpec {
    /// Validate the dataset specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.config.name.is_empty() {
            return Err(crate::Error::validation("config.name must not be empty"));
        }
        Ok(())
    }
}

/// Status for a TransitDataset
///
/// Status is the single source of truth for which children have been
/// provisioned. References are written only after the corresponding create
/// succeeded, so status never names a child that does not exist; the reverse
/// (child exists, reference lost to a crash) is recovered by owner scan.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransitDatasetStatus {
    /// Current phase of the build pipeline
    #[serde(default)]
    pub phase: DatasetPhase,

    /// Claim holding the downloaded raw feeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_volume: Option<VolumeClaimRef>,

    /// Claim holding the derived routing indices
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_volume: Option<VolumeClaimRef>,

    /// Name of the processing job, once launched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,

    /// Whether the processing job has been launched
    #[serde(default)]
    pub started_processing: bool,

    /// Whether the processing job completed successfully
    ///
    /// Monotonic: once true it is never reset, even if the job object later
    /// disappears.
    #[serde(default)]
    pub finished_processing: bool,

    /// Conditions describing the dataset state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl TransitDatasetStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: DatasetPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the phase and return self for chaining
    pub fn phase(mut self, phase: DatasetPhase) -> Self {
        self.phase = phase;
        self
    }

    /// Record the input volume claim and return self for chaining
    pub fn input_volume(mut self, claim: VolumeClaimRef) -> Self {
        self.input_volume = Some(claim);
        self
    }

    /// Record the data volume claim and return self for chaining
    pub fn data_volume(mut self, claim: VolumeClaimRef) -> Self {
        self.data_volume = Some(claim);
        self
    }

    /// Record the launched job and return self for chaining
    pub fn job(mut self, name: impl Into<String>) -> Self {
        self.job_name = Some(name.into());
        self.started_processing = true;
        self
    }

    /// Mark processing finished. Readiness is monotonic, so there is no
    /// corresponding un-set operation.
    pub fn finished(mut self) -> Self {
        self.finished_processing = true;
        self
    }

    /// Add a condition, replacing any existing condition of the same type.
    /// An identical condition (apart from its transition time) is kept
    /// untouched so repeated reconciles do not churn the timestamp.
    pub fn condition(mut self, condition: Condition) -> Self {
        if let Some(existing) = self.conditions.iter().find(|c| c.type_ == condition.type_) {
            if existing.status == condition.status
                && existing.reason == condition.reason
                && existing.message == condition.message
            {
                return self;
            }
        }
        self.conditions.retain(|c| c.type_ != condition.type_);
        self.conditions.push(condition);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::ConditionStatus;

    fn sample_spec() -> TransitDatasetSpec {
        TransitDatasetSpec {
            config: ConfigReference::new("berlin-feeds"),
            input_volume: None,
        }
    }

    #[test]
    fn valid_spec_passes_validation() {
        assert!(sample_spec().validate().is_ok());
    }

    #[test]
    fn empty_config_name_is_rejected() {
        let spec = TransitDatasetSpec {
            config: ConfigReference::new(""),
            input_volume: None,
        };
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("config.name"));
    }

    #[test]
    fn status_builder_chains_accumulate() {
        let status = TransitDatasetStatus::with_phase(DatasetPhase::Processing)
            .input_volume(VolumeClaimRef::new("gen-input-x"))
            .data_volume(VolumeClaimRef::new("gen-data-y"))
            .job("gen-build-z");

        assert_eq!(status.phase, DatasetPhase::Processing);
        assert!(status.started_processing);
        assert!(!status.finished_processing);
        assert_eq!(status.job_name.as_deref(), Some("gen-build-z"));
    }

    #[test]
    fn conditions_of_same_type_replace() {
        let status = TransitDatasetStatus::default()
            .condition(Condition::new(
                "Ready",
                ConditionStatus::False,
                "JobRunning",
                "build in progress",
            ))
            .condition(Condition::new(
                "Ready",
                ConditionStatus::True,
                "JobComplete",
                "build finished",
            ));

        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, ConditionStatus::True);
    }

    #[test]
    fn status_omits_unset_references_on_the_wire() {
        let json = serde_json::to_value(TransitDatasetStatus::default()).unwrap();
        assert!(json.get("inputVolume").is_none());
        assert!(json.get("dataVolume").is_none());
        assert!(json.get("jobName").is_none());
        assert_eq!(json["startedProcessing"], false);
    }
}
