//! Cluster API Cluster controller

use std::sync::Arc;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use kube::runtime::controller::Config as ControllerRuntimeConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt, Resource};
use serde::de::DeserializeOwned;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use capi_cluster_controller::config::ControllerConfig;
use capi_cluster_controller::controller::{
    control_plane_machine_to_cluster, error_policy, reconcile, Context,
};
use capi_cluster_controller::crd::{Cluster, Machine};
use capi_cluster_controller::{CONTROL_PLANE_LABEL, FIELD_MANAGER};

/// Cluster API Cluster controller
#[derive(Parser, Debug)]
#[command(name = "cluster-controller", version, about, long_about = None)]
struct Cli {
    /// Generate the Cluster CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    config: ControllerConfig,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches Clusters and their control plane Machines and reconciles
    /// them until shutdown.
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.config.log_json);

    if cli.crd {
        let crd = serde_yaml::to_string(&Cluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.config).await,
    }
}

fn init_tracing(json: bool) {
    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Ensure the Cluster CRD is installed
///
/// The controller installs its own CRD on startup using server-side apply so
/// the schema always matches the controller version. The Machine kinds belong
/// to the machine controllers and are left alone.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!("Installing Cluster CRD...");
    crds.patch(
        "clusters.cluster.x-k8s.io",
        &params,
        &Patch::Apply(&Cluster::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Cluster CRD: {}", e))?;

    Ok(())
}

/// Api scoped to the watch namespace, or cluster-wide when unset
fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

async fn run_controller(config: ControllerConfig) -> anyhow::Result<()> {
    tracing::info!(
        concurrency = config.concurrency,
        machine_pool = config.machine_pool,
        namespace = config.watch_namespace.as_deref().unwrap_or("<all>"),
        "Cluster controller starting..."
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let namespace = config.watch_namespace.as_deref();
    let clusters: Api<Cluster> = scoped_api(&client, namespace);
    let machines: Api<Machine> = scoped_api(&client, namespace);

    let ctx = Arc::new(Context::builder(client).config(config.clone()).build());

    let controller = Controller::new(clusters, WatcherConfig::default())
        .with_config(ControllerRuntimeConfig::default().concurrency(config.concurrency));
    let store = controller.store();

    controller
        .watches(
            machines,
            WatcherConfig::default().labels(CONTROL_PLANE_LABEL),
            move |machine| control_plane_machine_to_cluster(&machine, &store),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Cluster reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Cluster reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("Cluster controller shutting down");
    Ok(())
}
