//! Supporting types shared by the Viaduct CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to the ConfigMap holding feed URL lists and build parameters
///
/// The referenced ConfigMap is mounted into both the processing job and the
/// serving workload. It carries the `schedules` and `extracts` URL lists the
/// fetch phase downloads, plus the engine configuration file.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct ConfigReference {
    /// Name of the ConfigMap (same namespace as the owning resource)
    pub name: String,
}

impl ConfigReference {
    /// Create a reference to the named ConfigMap
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Reference to a bound PersistentVolumeClaim
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimRef {
    /// Name of the claim
    pub claim_name: String,
}

impl VolumeClaimRef {
    /// Create a reference to the named claim
    pub fn new(claim_name: impl Into<String>) -> Self {
        Self {
            claim_name: claim_name.into(),
        }
    }
}

/// Dataset build lifecycle phase
///
/// Transitions are strictly forward: a dataset never moves back to an
/// earlier phase, and `Ready`/`Failed` are terminal.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[non_exhaustive]
pub enum DatasetPhase {
    /// Nothing has been provisioned yet
    #[default]
    Pending,
    /// The input volume claim is being allocated
    InputProvisioning,
    /// The data volume claim is being allocated
    DataProvisioning,
    /// The processing job is running
    Processing,
    /// The processing job completed and the dataset is servable
    Ready,
    /// The processing job reported failure
    Failed,
}

impl std::fmt::Display for DatasetPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::InputProvisioning => write!(f, "InputProvisioning"),
            Self::DataProvisioning => write!(f, "DataProvisioning"),
            Self::Processing => write!(f, "Processing"),
            Self::Ready => write!(f, "Ready"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Ready, ProcessingFailed)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }
}
