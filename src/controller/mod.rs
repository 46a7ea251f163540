//! Kubernetes controllers for Viaduct resources
//!
//! Two cooperating reconcile loops:
//!
//! - [`dataset`] drives a TransitDataset through volume provisioning, the
//!   processing job, and completion observation.
//! - [`service`] keeps generations flowing (initial build + cron rebuilds)
//!   and binds the serving workload to the newest ready generation.
//!
//! Both follow the controller pattern: observe current state, perform at most
//! the next unmet step, requeue. Neither holds state across invocations;
//! everything is re-read from the API server.

pub mod dataset;
pub mod service;

pub use dataset::{
    error_policy as dataset_error_policy, reconcile as dataset_reconcile, DatasetContext,
    DatasetKubeClient, DatasetKubeClientImpl,
};
pub use service::{
    error_policy as service_error_policy, reconcile as service_reconcile, ServiceContext,
    ServiceKubeClient, ServiceKubeClientImpl,
};
