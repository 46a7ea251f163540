//! TransitService Custom Resource Definition
//!
//! A TransitService is the long-lived entity a user configures: which feeds
//! to build from, how often to rebuild, and (implicitly) that the newest
//! ready dataset generation should be served.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Condition, ConfigReference, VolumeClaimRef};

/// Specification for a TransitService
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "viaduct.dev",
    version = "v1alpha1",
    kind = "TransitService",
    plural = "transitservices",
    shortname = "tsvc",
    status = "TransitServiceStatus",
    namespaced,
    printcolumn = r#"{"name":"Schedule","type":"string","jsonPath":".spec.updateSchedule"}"#,
    printcolumn = r#"{"name":"Workload","type":"string","jsonPath":".status.activeWorkload"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TransitServiceSpec {
    /// ConfigMap with feed URL lists and engine parameters, passed through to
    /// every dataset generation and mounted into the serving workload
    pub config: ConfigReference,

    /// Cron expression (standard 5-field) for scheduled dataset rebuilds
    ///
    /// Absent or empty means: build once at creation, never rebuild.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_schedule: Option<String>,

    /// Externally supplied input volume claim, passed through to generations
    ///
    /// When set, generations skip input provisioning and read raw feeds from
    /// this claim instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_volume: Option<VolumeClaimRef>,
}

impl TransitServiceSpec {
    /// Validate the service specification
    ///
    /// A malformed cron expression is deliberately NOT a validation error:
    /// the controller logs it and skips scheduling, so the rest of the
    /// service (initial build, serving) still works.
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.config.name.is_empty() {
            return Err(crate::Error::validation("config.name must not be empty"));
        }
        Ok(())
    }

    /// The update schedule, if one is set and non-empty
    pub fn schedule(&self) -> Option<&str> {
        self.update_schedule.as_deref().filter(|s| !s.is_empty())
    }
}

/// Status for a TransitService
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransitServiceStatus {
    /// Names of owned dataset generations, in creation order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub datasets: Vec<String>,

    /// Name of the serving workload, once one exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_workload: Option<String>,

    /// Name of the generation the serving workload is bound to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serving_generation: Option<String>,

    /// Conditions describing the service state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

impl TransitServiceStatus {
    /// Record an owned generation if not already present
    pub fn record_generation(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.datasets.contains(&name) {
            self.datasets.push(name);
        }
        self
    }

    /// Record the serving workload and return self for chaining
    pub fn workload(mut self, name: impl Into<String>) -> Self {
        self.active_workload = Some(name.into());
        self
    }

    /// Record the generation currently being served
    pub fn serving(mut self, generation: impl Into<String>) -> Self {
        self.serving_generation = Some(generation.into());
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

    fn sample_spec() -> TransitServiceSpec {
        TransitServiceSpec {
            config: ConfigReference::new("berlin-feeds"),
            update_schedule: Some("0 3 * * *".to_string()),
            input_volume: None,
        }
    }

    #[test]
    fn valid_spec_passes_validation() {
        assert!(sample_spec().validate().is_ok());
    }

    #[test]
    fn empty_schedule_means_no_rebuilds() {
        let mut spec = sample_spec();
        spec.update_schedule = Some(String::new());
        assert_eq!(spec.schedule(), None);

        spec.update_schedule = None;
        assert_eq!(spec.schedule(), None);
    }

    #[test]
    fn malformed_schedule_is_not_a_validation_error() {
        // Scheduling problems are handled per-cycle by the controller, not
        // rejected up front, so the initial build still happens.
        let mut spec = sample_spec();
        spec.update_schedule = Some("not a cron line".to_string());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn record_generation_deduplicates() {
        let status = TransitServiceStatus::default()
            .record_generation("gen-a")
            .record_generation("gen-b")
            .record_generation("gen-a");

        assert_eq!(status.datasets, vec!["gen-a", "gen-b"]);
    }
}
