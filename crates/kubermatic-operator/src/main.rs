//! Kubermatic operator - provisions and reconciles tenant Kubernetes clusters

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt, ResourceExt};

use kubermatic_cluster::resources::ControllerConfig;
use kubermatic_common::crd::{Addon, Cluster, Project, User, UserProjectBinding, UserSSHKey};
use kubermatic_common::datacenter::{load_datacenters, DatacenterMeta};
use kubermatic_common::telemetry::{init_telemetry, TelemetryConfig};
use kubermatic_rbac::migration;
use kubermatic_rbac::{MasterServices, OrphanPolicy};

mod controller_runner;

/// Kubermatic - CRD-driven operator managing tenant Kubernetes clusters
#[derive(Parser, Debug)]
#[command(name = "kubermatic-operator", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Worker partition this instance serves; clusters assigned to another
    /// worker are ignored
    #[arg(long, default_value = "")]
    worker_name: String,

    /// Base domain external cluster names are built under
    #[arg(long, default_value = "")]
    external_url: String,

    /// Path to the datacenters definition file
    #[arg(long)]
    datacenters: Option<PathBuf>,

    /// Namespace holding service account token secrets
    #[arg(long, default_value = "kubermatic")]
    namespace: String,

    /// Deploy the VPA recommender into cluster namespaces
    #[arg(long)]
    enable_vpa: bool,

    /// Registry replacing the default image registries
    #[arg(long)]
    overwrite_registry: Option<String>,

    /// NodePort range the tenant apiserver allocates from
    #[arg(long, default_value = "30000-32767")]
    nodeport_range: String,

    /// Network the VPN assigns node tunnel addresses from
    #[arg(long, default_value = "10.254.0.0/16")]
    node_access_network: String,

    /// Size of the volume backing each etcd member
    #[arg(long, default_value = "5Gi")]
    etcd_disk_size: String,

    /// PEM bundle for OIDC token verification, mounted into tenant
    /// apiservers when given
    #[arg(long)]
    oidc_ca_file: Option<PathBuf>,

    /// OTLP endpoint for trace and metric export
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    /// Seconds between tenant health re-checks
    #[arg(long, default_value_t = 10)]
    health_check_period: u64,

    /// Log and skip resources without a resolvable project instead of
    /// surfacing an error
    #[arg(long)]
    lenient_orphans: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run all controllers (default mode)
    Controller,
    /// Attach project owner references to pre-project SSH keys, then exit
    MigrateSshKeys {
        /// Log intended migrations without writing anything
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        return print_crds();
    }

    init_telemetry(TelemetryConfig {
        service_name: "kubermatic-operator".to_string(),
        otlp_endpoint: cli.otlp_endpoint.clone(),
    })?;

    match cli.command {
        Some(Commands::MigrateSshKeys { dry_run }) => run_migration(dry_run).await,
        Some(Commands::Controller) | None => run_controllers(cli).await,
    }
}

fn all_crds() -> [CustomResourceDefinition; 6] {
    [
        Cluster::crd(),
        Project::crd(),
        User::crd(),
        UserProjectBinding::crd(),
        UserSSHKey::crd(),
        Addon::crd(),
    ]
}

/// Print every CRD the operator manages, ready for kubectl apply.
fn print_crds() -> anyhow::Result<()> {
    for crd in all_crds() {
        let yaml = serde_yaml::to_string(&crd)
            .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))?;
        println!("---");
        print!("{yaml}");
    }
    Ok(())
}

/// Ensure all Kubermatic CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply.
/// This ensures the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let api: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply("kubermatic-operator").force();

    for crd in all_crds() {
        let name = crd.name_any();
        tracing::info!(crd = %name, "installing CRD");
        api.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install CRD {}: {}", name, e))?;
    }

    tracing::info!("all Kubermatic CRDs installed/updated");
    Ok(())
}

/// Controller-wide settings assembled from flags once at startup.
fn controller_config(cli: &Cli) -> anyhow::Result<ControllerConfig> {
    let oidc_ca = match &cli.oidc_ca_file {
        Some(path) => Some(std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("failed to read OIDC CA file {}: {}", path.display(), e)
        })?),
        None => None,
    };

    Ok(ControllerConfig {
        external_url: cli.external_url.clone(),
        overwrite_registry: cli.overwrite_registry.clone(),
        node_port_range: cli.nodeport_range.clone(),
        node_access_network: cli.node_access_network.clone(),
        etcd_disk_size: cli.etcd_disk_size.clone(),
        enable_vpa: cli.enable_vpa,
        oidc_ca,
    })
}

fn load_datacenter_config(cli: &Cli) -> anyhow::Result<Arc<HashMap<String, DatacenterMeta>>> {
    let datacenters = match &cli.datacenters {
        Some(path) => load_datacenters(path).map_err(|e| {
            anyhow::anyhow!("failed to load datacenters from {}: {}", path.display(), e)
        })?,
        None => {
            tracing::warn!("no datacenters file given, starting with an empty topology");
            HashMap::new()
        }
    };
    Ok(Arc::new(datacenters))
}

/// One-shot migration attaching project owner references to legacy SSH keys.
async fn run_migration(dry_run: bool) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    let master = MasterServices::from_client(&client);
    let report = migration::migrate_ssh_keys(&master, dry_run).await?;

    tracing::info!(
        examined = report.examined,
        migrated = report.migrated,
        skipped = report.skipped,
        dry_run,
        "ssh key migration finished"
    );
    Ok(())
}

/// Run in controller mode - everything watches until a shutdown signal.
async fn run_controllers(cli: Cli) -> anyhow::Result<()> {
    tracing::info!("Kubermatic operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    let datacenters = load_datacenter_config(&cli)?;
    let config = controller_config(&cli)?;
    let policy = if cli.lenient_orphans {
        OrphanPolicy::Lenient
    } else {
        OrphanPolicy::Strict
    };

    tracing::info!("Starting Kubermatic controllers...");

    let mut controllers = controller_runner::build_cluster_controllers(
        client.clone(),
        config.clone(),
        datacenters.clone(),
        cli.worker_name.clone(),
    );
    controllers.extend(controller_runner::build_monitoring_controllers(
        client.clone(),
        config,
        datacenters.clone(),
        cli.worker_name.clone(),
        Duration::from_secs(cli.health_check_period),
    ));
    controllers.extend(controller_runner::build_rbac_controllers(
        client,
        &cli.namespace,
        policy,
        datacenters.as_ref(),
    ));

    futures::future::join_all(controllers).await;

    tracing::info!("Kubermatic operator shutting down");
    Ok(())
}
