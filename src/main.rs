//! Viaduct Operator - builds and serves transit routing datasets

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use viaduct::controller::{
    dataset_error_policy, dataset_reconcile, service_error_policy, service_reconcile,
    DatasetContext, ServiceContext,
};
use viaduct::crd::{TransitDataset, TransitService};
use viaduct::job::BuildImages;

/// Viaduct - Kubernetes operator for transit routing datasets
#[derive(Parser, Debug)]
#[command(name = "viaduct", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Backoff between retries after a failed reconcile
    ///
    /// There is no retry ceiling: a persistently failing object retries
    /// forever at this interval. Raise it if a broken object is flooding
    /// the API server.
    #[arg(long, env = "VIADUCT_ERROR_REQUEUE_SECS", default_value = "30")]
    error_requeue_secs: u64,

    /// Image for the fetch init container
    #[arg(long, env = "VIADUCT_FETCH_IMAGE", default_value = viaduct::DEFAULT_FETCH_IMAGE)]
    fetch_image: String,

    /// Image for the routing engine (build and serve)
    #[arg(long, env = "VIADUCT_ENGINE_IMAGE", default_value = viaduct::DEFAULT_ENGINE_IMAGE)]
    engine_image: String,

    /// Capacity requested for each input/data volume claim
    #[arg(long, env = "VIADUCT_VOLUME_SIZE", default_value = viaduct::DEFAULT_VOLUME_SIZE)]
    volume_size: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        // Generate CRD YAML for both resources
        let dataset_crd = serde_yaml::to_string(&TransitDataset::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize TransitDataset CRD: {}", e))?;
        let service_crd = serde_yaml::to_string(&TransitService::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize TransitService CRD: {}", e))?;
        println!("{dataset_crd}---\n{service_crd}");
        return Ok(());
    }

    run_controllers(cli).await
}

/// Ensure both Viaduct CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply.
/// This ensures the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(viaduct::FIELD_MANAGER).force();

    tracing::info!("Installing TransitDataset CRD...");
    crds.patch(
        "transitdatasets.viaduct.dev",
        &params,
        &Patch::Apply(&TransitDataset::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install TransitDataset CRD: {}", e))?;

    tracing::info!("Installing TransitService CRD...");
    crds.patch(
        "transitservices.viaduct.dev",
        &params,
        &Patch::Apply(&TransitService::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install TransitService CRD: {}", e))?;

    tracing::info!("All Viaduct CRDs installed/updated");
    Ok(())
}

/// Run both controllers until signalled
async fn run_controllers(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("Viaduct controller starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let error_requeue = Duration::from_secs(cli.error_requeue_secs);

    let dataset_ctx = Arc::new(DatasetContext::from_client(
        client.clone(),
        BuildImages {
            fetch: cli.fetch_image,
            engine: cli.engine_image.clone(),
        },
        cli.volume_size,
        error_requeue,
    ));
    let service_ctx = Arc::new(ServiceContext::from_client(
        client.clone(),
        cli.engine_image,
        error_requeue,
    ));

    // APIs for the CRDs and the owned children (namespace-scoped, watched
    // across all namespaces; owner references filter the events).
    let datasets: Api<TransitDataset> = Api::all(client.clone());
    let services: Api<TransitService> = Api::all(client.clone());
    let claims: Api<PersistentVolumeClaim> = Api::all(client.clone());
    let jobs: Api<Job> = Api::all(client.clone());
    let deployments: Api<Deployment> = Api::all(client.clone());

    tracing::info!("Starting Viaduct controllers...");
    tracing::info!("  - TransitDataset controller");
    tracing::info!("  - TransitService controller");

    let dataset_controller = Controller::new(datasets.clone(), WatcherConfig::default())
        .owns(claims, WatcherConfig::default())
        .owns(jobs, WatcherConfig::default())
        .shutdown_on_signal()
        .run(dataset_reconcile, dataset_error_policy, dataset_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Dataset reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Dataset reconciliation error");
                }
            }
        });

    let service_controller = Controller::new(services, WatcherConfig::default())
        .owns(datasets, WatcherConfig::default())
        .owns(deployments, WatcherConfig::default())
        .shutdown_on_signal()
        .run(service_reconcile, service_error_policy, service_ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Service reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Service reconciliation error");
                }
            }
        });

    // Run both controllers concurrently
    tokio::select! {
        _ = dataset_controller => {
            tracing::info!("Dataset controller completed");
        }
        _ = service_controller => {
            tracing::info!("Service controller completed");
        }
    }

    tracing::info!("Viaduct controller shutting down");
    Ok(())
}
