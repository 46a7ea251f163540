//! Viaduct - Kubernetes operator for transit routing datasets
//!
//! Viaduct turns raw transit feeds (schedules, map extracts) into a served
//! routing dataset through two cooperating controllers:
//!
//! - The [`TransitDataset`](crd::TransitDataset) controller drives one dataset
//!   generation through volume provisioning, a two-phase processing job, and
//!   readiness observation.
//! - The [`TransitService`](crd::TransitService) controller keeps at least one
//!   generation around, creates new generations on a cron schedule, and binds
//!   a serving workload to the newest ready generation.
//!
//! All coordination happens through the Kubernetes API server: children carry
//! owner references back to their parents, status records what has been
//! provisioned, and every reconcile is idempotent under re-invocation and
//! crash-and-resume.
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions (TransitDataset, TransitService)
//! - [`controller`] - Reconciliation logic for both resources
//! - [`schedule`] - Cron schedule evaluation for dataset regeneration
//! - [`job`] - Processing job construction (fetch phase + build phase)
//! - [`workload`] - Serving workload construction and volume rebinding
//! - [`error`] - Error types for the operator

#![deny(missing_docs)]

pub mod controller;
pub mod crd;
pub mod error;
pub mod job;
pub mod schedule;
pub mod workload;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================
// These constants define the default values used throughout Viaduct.
// Centralizing them here ensures consistency across CRD defaults, the CLI
// surface, and test fixtures.

/// API group for all Viaduct CRDs
pub const API_GROUP: &str = "viaduct.dev";

/// Field manager used for all server-side apply and status patches
pub const FIELD_MANAGER: &str = "viaduct-controller";

/// Label carrying the role of an owned volume claim (`input` or `data`)
pub const ROLE_LABEL: &str = "viaduct.dev/role";

/// Label on the serving workload naming the dataset generation it is bound to
pub const GENERATION_LABEL: &str = "viaduct.dev/generation";

/// Default capacity requested for input and data volume claims
pub const DEFAULT_VOLUME_SIZE: &str = "10Gi";

/// Default image for the fetch init container (downloads feeds and extracts)
pub const DEFAULT_FETCH_IMAGE: &str = "ghcr.io/viaduct-transit/viaduct-fetch:0.3";

/// Default image for the routing engine (build mode and serving mode)
pub const DEFAULT_ENGINE_IMAGE: &str = "ghcr.io/viaduct-transit/routing-engine:latest";

/// Port the serving workload exposes the routing engine on
pub const SERVING_PORT: i32 = 8080;
