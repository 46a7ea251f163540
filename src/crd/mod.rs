//! Custom Resource Definitions for Viaduct
//!
//! This module contains both CRD definitions used by the Viaduct operator.

mod dataset;
mod service;
mod types;

pub use dataset::{TransitDataset, TransitDatasetSpec, TransitDatasetStatus};
pub use service::{TransitService, TransitServiceSpec, TransitServiceStatus};
pub use types::{Condition, ConditionStatus, ConfigReference, DatasetPhase, VolumeClaimRef};
