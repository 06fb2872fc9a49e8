//! Cluster lifecycle controller.
//!
//! Drives every [`Cluster`] through the phase state machine. Validating and
//! the Pending handoff are pure status work; Launching is a flat sequence of
//! idempotent ensure steps that either all succeed or abort the sync for a
//! retry; Running only watches health; UpdatingMaster re-runs the ensure
//! sequence at the new version under a rollback timeout; Deleting walks the
//! cleanup finalizers in order.
//!
//! Per-cluster syncs are serialized by the kube runtime, different clusters
//! reconcile in parallel. Every write to the Cluster object itself goes
//! through the conflict-retrying helpers in [`crate::client`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{info, instrument, warn};

use kubermatic_common::crd::{Cluster, ClusterPhase, ClusterStatus, ClusterStatusError};
use kubermatic_common::datacenter::DatacenterMeta;
use kubermatic_common::kube_utils::has_finalizer;
use kubermatic_common::metrics::ControllerMetrics;
use kubermatic_common::retry::{RetryDecision, RetryPolicy, RetryTracker};
use kubermatic_common::{
    Error, Result, CLOUD_PROVIDER_CLEANUP_FINALIZER, NAMESPACE_CLEANUP_FINALIZER,
    NODE_DELETION_FINALIZER,
};

use crate::address;
use crate::client::{
    update_cluster, update_cluster_status, AdminKubeconfigConnector, DnsResolver, SeedServices,
    SystemDnsResolver, TenantClient, TenantConnector,
};
use crate::deletion::{self, DeletionStage};
use crate::ensure::{self, EnsureOutcome};
use crate::health;
use crate::provider::CloudRegistry;
use crate::resources::{
    self, certificates, kubeconfig, openvpn, ClusterData, ControllerConfig, CA_SECRET_NAME,
    CLUSTER_INFO_CONFIG_MAP_NAME, OPENVPN_SERVICE_NAME, TENANT_OPENVPN_CONFIG_MAP_NAME,
    TENANT_OPENVPN_SECRET_NAME, TENANT_PUBLIC_NAMESPACE, TENANT_SYSTEM_NAMESPACE,
};
use crate::update;
use crate::validation;

const VALIDATING_SYNC_PERIOD: Duration = Duration::from_secs(15);
const LAUNCHING_SYNC_PERIOD: Duration = Duration::from_secs(2);
const DELETING_SYNC_PERIOD: Duration = Duration::from_secs(10);
const RUNNING_SYNC_PERIOD: Duration = Duration::from_secs(60);

/// Failed syncs per cluster before the error policy stops requeueing and
/// waits for the next watch event.
const RETRY_BUDGET: u32 = 5;

const DEFAULT_SERVICES_CIDR: &str = "10.240.16.0/20";
const DEFAULT_PODS_CIDR: &str = "172.25.0.0/16";
const DEFAULT_DNS_DOMAIN: &str = "cluster.local";

/// Cleanup finalizers in the order their stages run during deletion.
const CLEANUP_FINALIZERS: [&str; 3] = [
    NODE_DELETION_FINALIZER,
    CLOUD_PROVIDER_CLEANUP_FINALIZER,
    NAMESPACE_CLEANUP_FINALIZER,
];

/// Shared state handed to every reconcile invocation.
pub struct Context {
    /// Typed access to seed-side objects.
    pub seed: SeedServices,
    /// Datacenter topology loaded from the datacenters file.
    pub datacenters: Arc<HashMap<String, DatacenterMeta>>,
    /// Cloud provider implementations by name.
    pub providers: Arc<CloudRegistry>,
    /// Resolver for external cluster names.
    pub resolver: Arc<dyn DnsResolver>,
    /// Connection factory for tenant apiservers.
    pub tenants: Arc<dyn TenantConnector>,
    /// Controller-wide settings from flags.
    pub config: ControllerConfig,
    /// Worker partition this controller instance serves. Clusters with a
    /// different `spec.worker_name` are ignored.
    pub worker_name: String,
    /// Metric instruments.
    pub metrics: ControllerMetrics,
    /// Per-cluster retry accounting for the error policy.
    pub retries: RetryTracker,
}

impl Context {
    /// Create a builder for constructing a Context.
    pub fn builder(client: &Client, datacenters: Arc<HashMap<String, DatacenterMeta>>) -> ContextBuilder {
        ContextBuilder::new(client.clone(), datacenters)
    }
}

/// Builder assembling a [`Context`] with production defaults for every
/// collaborator that is not overridden.
pub struct ContextBuilder {
    client: Client,
    datacenters: Arc<HashMap<String, DatacenterMeta>>,
    config: ControllerConfig,
    worker_name: String,
    providers: Option<Arc<CloudRegistry>>,
    resolver: Option<Arc<dyn DnsResolver>>,
    tenants: Option<Arc<dyn TenantConnector>>,
    metrics: Option<ControllerMetrics>,
}

impl ContextBuilder {
    fn new(client: Client, datacenters: Arc<HashMap<String, DatacenterMeta>>) -> Self {
        Self {
            client,
            datacenters,
            config: ControllerConfig::default(),
            worker_name: String::new(),
            providers: None,
            resolver: None,
            tenants: None,
            metrics: None,
        }
    }

    /// Set the controller-wide settings.
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the worker partition this instance serves.
    pub fn worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    /// Override the cloud provider registry.
    pub fn providers(mut self, providers: Arc<CloudRegistry>) -> Self {
        self.providers = Some(providers);
        self
    }

    /// Override the DNS resolver.
    pub fn resolver(mut self, resolver: Arc<dyn DnsResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Override the tenant connection factory.
    pub fn tenant_connector(mut self, tenants: Arc<dyn TenantConnector>) -> Self {
        self.tenants = Some(tenants);
        self
    }

    /// Override the metric instruments.
    pub fn metrics(mut self, metrics: ControllerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the Context.
    pub fn build(self) -> Context {
        let seed = SeedServices::from_client(&self.client);
        let metrics = self.metrics.unwrap_or_else(ControllerMetrics::from_global);
        let exhausted = metrics.clone();
        let retries = RetryTracker::new(RetryPolicy::with_max_attempts(RETRY_BUDGET))
            .with_on_exhausted(Arc::new(move |_, _| {
                exhausted.record_retry_exhausted("cluster");
            }));
        let tenants = self
            .tenants
            .unwrap_or_else(|| Arc::new(AdminKubeconfigConnector::new(seed.secrets.clone())));
        let providers = self
            .providers
            .unwrap_or_else(|| Arc::new(CloudRegistry::with_defaults(self.datacenters.clone())));
        Context {
            seed,
            datacenters: self.datacenters,
            providers,
            resolver: self.resolver.unwrap_or_else(|| Arc::new(SystemDnsResolver)),
            tenants,
            config: self.config,
            worker_name: self.worker_name,
            metrics,
            retries,
        }
    }
}

/// Reconcile one Cluster.
///
/// Dispatches on the current phase and returns the requeue interval for
/// that phase. Errors abort the sync and are handled by [`error_policy`].
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    let name = cluster.name_any();

    let worker = cluster.spec.worker_name.clone().unwrap_or_default();
    if worker != ctx.worker_name {
        return Ok(Action::await_change());
    }

    let timer = ctx.metrics.reconcile_timer("cluster", name.as_str());
    match sync(&cluster, &ctx).await {
        Ok(action) => {
            timer.success();
            ctx.retries.reset(&name);
            Ok(action)
        }
        Err(error) => {
            timer.error(if error.is_retryable() {
                "transient"
            } else {
                "permanent"
            });
            Err(error)
        }
    }
}

/// Decide what happens after a failed sync.
///
/// Errors are requeued with backoff until the cluster's retry budget is
/// used up, then the cluster is left alone until the next watch event.
/// Successful syncs reset the budget.
pub fn error_policy(cluster: Arc<Cluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = cluster.name_any();
    match ctx.retries.record_failure(&name) {
        RetryDecision::Retry { attempt, backoff } => {
            warn!(cluster = %name, %error, attempt, ?backoff, "reconcile failed, requeueing");
            Action::requeue(backoff)
        }
        RetryDecision::Exhausted { attempts } => {
            warn!(cluster = %name, %error, attempts, "reconcile failed too often, waiting for the next event");
            Action::await_change()
        }
    }
}

async fn sync(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    let name = cluster.name_any();

    if cluster.metadata.deletion_timestamp.is_some() || cluster.phase() == ClusterPhase::Deleting {
        return sync_deleting(cluster, ctx).await;
    }

    if cluster.spec.pause {
        if cluster.phase() != ClusterPhase::Paused {
            info!(cluster = %name, reason = ?cluster.spec.pause_reason, "cluster paused");
            set_phase(ctx, &name, ClusterPhase::Paused).await?;
        }
        return Ok(Action::await_change());
    }

    match cluster.phase() {
        ClusterPhase::Unknown => {
            set_phase(ctx, &name, ClusterPhase::Validating).await?;
            Ok(Action::requeue(VALIDATING_SYNC_PERIOD))
        }
        ClusterPhase::Validating => sync_validating(cluster, ctx).await,
        ClusterPhase::Pending => {
            // Unconditional once validation has passed.
            set_phase(ctx, &name, ClusterPhase::Launching).await?;
            Ok(Action::requeue(LAUNCHING_SYNC_PERIOD))
        }
        ClusterPhase::Launching => sync_launching(cluster, ctx).await,
        ClusterPhase::Running => sync_running(cluster, ctx).await,
        ClusterPhase::UpdatingMaster => sync_updating(cluster, ctx).await,
        ClusterPhase::Paused => {
            info!(cluster = %name, "cluster unpaused, re-converging");
            set_phase(ctx, &name, ClusterPhase::Launching).await?;
            Ok(Action::requeue(LAUNCHING_SYNC_PERIOD))
        }
        ClusterPhase::Deleting => sync_deleting(cluster, ctx).await,
        ClusterPhase::Failed => Ok(Action::await_change()),
    }
}

async fn set_phase(ctx: &Context, name: &str, phase: ClusterPhase) -> Result<Cluster> {
    info!(cluster = %name, ?phase, "phase transition");
    update_cluster_status(ctx.seed.clusters.as_ref(), name, move |c| {
        let status = c.status.get_or_insert_with(ClusterStatus::default);
        status.transition(phase);
    })
    .await
}

/// Validating: datacenter topology and provider access data checks.
///
/// Invalid configuration is recorded on the status but never moves the
/// phase, so a fixed spec resumes exactly where it was.
async fn sync_validating(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    let name = cluster.name_any();
    match validation::validate_cluster(cluster, &ctx.datacenters, &ctx.providers).await {
        Ok(()) => {
            update_cluster_status(ctx.seed.clusters.as_ref(), &name, |c| {
                let status = c.status.get_or_insert_with(ClusterStatus::default);
                status.clear_error();
                status.transition(ClusterPhase::Pending);
            })
            .await?;
            Ok(Action::requeue(LAUNCHING_SYNC_PERIOD))
        }
        Err(error) if !error.is_retryable() => {
            warn!(cluster = %name, %error, "cluster configuration invalid");
            let message = error.to_string();
            update_cluster_status(ctx.seed.clusters.as_ref(), &name, move |c| {
                let status = c.status.get_or_insert_with(ClusterStatus::default);
                status.set_error(ClusterStatusError::InvalidConfiguration, message.clone());
            })
            .await?;
            Err(error)
        }
        Err(error) => Err(error),
    }
}

/// Launching: run the full ensure sequence, go Running once everything is
/// healthy.
async fn sync_launching(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    let name = cluster.name_any();
    let healthy = ensure_cluster(cluster, ctx).await?;
    if !healthy {
        return Ok(Action::requeue(LAUNCHING_SYNC_PERIOD));
    }

    let deployed = cluster.spec.master_version.clone();
    update_cluster_status(ctx.seed.clusters.as_ref(), &name, move |c| {
        let status = c.status.get_or_insert_with(ClusterStatus::default);
        status.clear_error();
        status.last_deployed_master_version = deployed.clone();
        status.transition(ClusterPhase::Running);
    })
    .await?;
    info!(cluster = %name, "control plane is up, cluster running");
    Ok(Action::requeue(RUNNING_SYNC_PERIOD))
}

/// Running: recompute health, persist at most one health transition per
/// sync, and pick up master version changes.
async fn sync_running(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    let name = cluster.name_any();
    let data = cluster_data(cluster.clone(), ctx)?;
    let current = health::cluster_health(
        &data,
        ctx.seed.deployments.as_ref(),
        ctx.seed.stateful_sets.as_ref(),
        Utc::now(),
    )
    .await?;
    let previous = cluster
        .status
        .as_ref()
        .map(|s| s.health.clone())
        .unwrap_or_default();
    if current != previous {
        let snapshot = current.clone();
        update_cluster_status(ctx.seed.clusters.as_ref(), &name, move |c| {
            let status = c.status.get_or_insert_with(ClusterStatus::default);
            status.health = snapshot.clone();
        })
        .await?;
        return Ok(Action::requeue(RUNNING_SYNC_PERIOD));
    }

    if current.all_healthy() && update::pending_version_change(cluster) {
        info!(
            cluster = %name,
            to = %cluster.spec.master_version,
            "master version changed, starting update"
        );
        set_phase(ctx, &name, ClusterPhase::UpdatingMaster).await?;
        return Ok(Action::requeue(LAUNCHING_SYNC_PERIOD));
    }

    Ok(Action::requeue(RUNNING_SYNC_PERIOD))
}

/// UpdatingMaster: keep converging at the wanted version, finish when the
/// rollout completed, roll back or fail on timeout.
async fn sync_updating(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    let name = cluster.name_any();
    let healthy = ensure_cluster(cluster, ctx).await?;

    let data = cluster_data(cluster.clone(), ctx)?;
    if healthy && update::master_update_done(&data, ctx.seed.deployments.as_ref()).await? {
        let deployed = cluster.spec.master_version.clone();
        info!(cluster = %name, version = %deployed, "master update finished");
        update_cluster_status(ctx.seed.clusters.as_ref(), &name, move |c| {
            let status = c.status.get_or_insert_with(ClusterStatus::default);
            status.clear_error();
            status.last_deployed_master_version = deployed.clone();
            status.transition(ClusterPhase::Running);
        })
        .await?;
        return Ok(Action::requeue(RUNNING_SYNC_PERIOD));
    }

    if update::update_timed_out(cluster, Utc::now()) {
        return match update::rollback_target(cluster) {
            Some(version) => {
                warn!(cluster = %name, to = %version, "master update timed out, rolling back");
                update_cluster(ctx.seed.clusters.as_ref(), &name, move |c| {
                    c.spec.master_version = version.clone();
                })
                .await?;
                // Restart the clock so the rollback gets a full window.
                update_cluster_status(ctx.seed.clusters.as_ref(), &name, |c| {
                    let status = c.status.get_or_insert_with(ClusterStatus::default);
                    status.last_transition_time = Some(Utc::now());
                })
                .await?;
                Ok(Action::requeue(LAUNCHING_SYNC_PERIOD))
            }
            None => {
                warn!(cluster = %name, "rollback timed out as well, failing cluster");
                update_cluster_status(ctx.seed.clusters.as_ref(), &name, |c| {
                    let status = c.status.get_or_insert_with(ClusterStatus::default);
                    status.set_error(
                        ClusterStatusError::ReconcileError,
                        "master version update timed out and the rollback did not complete",
                    );
                    status.transition(ClusterPhase::Failed);
                })
                .await?;
                Ok(Action::await_change())
            }
        };
    }

    Ok(Action::requeue(LAUNCHING_SYNC_PERIOD))
}

/// Deleting: run the cleanup stage for the first remaining finalizer, one
/// stage per sync.
async fn sync_deleting(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    let name = cluster.name_any();
    if cluster.phase() != ClusterPhase::Deleting {
        set_phase(ctx, &name, ClusterPhase::Deleting).await?;
    }

    match deletion::current_stage(cluster) {
        DeletionStage::Nodes => {
            deletion::cleanup_nodes(cluster, ctx.tenants.as_ref(), ctx.seed.clusters.as_ref())
                .await?;
            Ok(Action::requeue(DELETING_SYNC_PERIOD))
        }
        DeletionStage::CloudProvider => {
            deletion::cleanup_cloud_provider(cluster, &ctx.providers, ctx.seed.clusters.as_ref())
                .await?;
            Ok(Action::requeue(DELETING_SYNC_PERIOD))
        }
        DeletionStage::Namespace => {
            deletion::cleanup_namespace(
                cluster,
                ctx.seed.namespaces.as_ref(),
                ctx.seed.clusters.as_ref(),
            )
            .await?;
            Ok(Action::requeue(DELETING_SYNC_PERIOD))
        }
        DeletionStage::Done => Ok(Action::await_change()),
    }
}

fn cluster_data(cluster: Cluster, ctx: &Context) -> Result<ClusterData> {
    let name = cluster.name_any();
    let datacenter_name = cluster.spec.cloud.datacenter_name.clone();
    let datacenter = ctx
        .datacenters
        .get(&datacenter_name)
        .cloned()
        .ok_or_else(|| {
            Error::validation_for_field(
                &name,
                "cloud.dc",
                format!("unknown datacenter {datacenter_name:?}"),
            )
        })?;
    let seed_name = datacenter.seed.clone();
    Ok(ClusterData::new(
        cluster,
        datacenter,
        seed_name,
        ctx.config.clone(),
    ))
}

/// The flat ensure sequence shared by Launching and UpdatingMaster.
///
/// Every step is idempotent; any error aborts the pass and the next sync
/// starts over from the top. Returns whether the control plane reported
/// fully healthy after this pass.
async fn ensure_cluster(cluster: &Cluster, ctx: &Context) -> Result<bool> {
    let name = cluster.name_any();

    let mut current = ensure_finalizers(cluster, ctx).await?;
    current = ensure_namespace(&current, ctx).await?;
    current = initialize_cloud(&current, ctx).await?;
    current = ensure_address(&current, ctx).await?;
    current = ensure_network_defaults(&current, ctx).await?;

    let mut data = cluster_data(current, ctx)?;

    for creator in resources::service_account_creators() {
        let outcome = ensure::ensure(ctx.seed.service_accounts.as_ref(), &data, &creator).await?;
        ctx.metrics.record_ensure("ServiceAccount", outcome.as_label());
    }
    for creator in resources::role_creators() {
        let outcome = ensure::ensure(ctx.seed.roles.as_ref(), &data, &creator).await?;
        ctx.metrics.record_ensure("Role", outcome.as_label());
    }
    for creator in resources::role_binding_creators() {
        let outcome = ensure::ensure(ctx.seed.role_bindings.as_ref(), &data, &creator).await?;
        ctx.metrics.record_ensure("RoleBinding", outcome.as_label());
    }
    for creator in resources::cluster_role_binding_creators() {
        let outcome =
            ensure::ensure_cluster_scoped(ctx.seed.cluster_role_bindings.as_ref(), &data, &creator)
                .await?;
        ctx.metrics
            .record_ensure("ClusterRoleBinding", outcome.as_label());
    }
    for creator in resources::service_creators() {
        let outcome = ensure::ensure(ctx.seed.services.as_ref(), &data, &creator).await?;
        ctx.metrics.record_ensure("Service", outcome.as_label());
    }

    // Root CA first, every other certificate is signed against it.
    let ca_creator = certificates::root_ca_creator();
    let outcome = ensure::ensure_secret(ctx.seed.secrets.as_ref(), &data, &ca_creator).await?;
    ctx.metrics.record_ensure("Secret", outcome.as_label());
    let ca_secret = ctx
        .seed
        .secrets
        .get(data.namespace(), CA_SECRET_NAME)
        .await?
        .ok_or_else(|| {
            Error::internal_with_context(
                "launch",
                format!("root CA secret for cluster {name} vanished after ensure"),
            )
        })?;
    data.set_ca(certificates::load_root_ca(&ca_secret)?);

    for creator in resources::secret_creators() {
        let outcome = ensure::ensure_secret(ctx.seed.secrets.as_ref(), &data, &creator).await?;
        ctx.metrics.record_ensure("Secret", outcome.as_label());
    }
    for creator in resources::config_map_creators(&data) {
        let outcome =
            ensure::ensure_config_map(ctx.seed.config_maps.as_ref(), &data, &creator).await?;
        ctx.metrics.record_ensure("ConfigMap", outcome.as_label());
    }
    for creator in resources::deployment_creators(&data) {
        let outcome =
            ensure::ensure_deployment(ctx.seed.deployments.as_ref(), &data, &creator).await?;
        ctx.metrics.record_ensure("Deployment", outcome.as_label());
    }
    for creator in resources::stateful_set_creators() {
        let outcome =
            ensure::ensure_stateful_set(ctx.seed.stateful_sets.as_ref(), &data, &creator).await?;
        ctx.metrics.record_ensure("StatefulSet", outcome.as_label());
    }

    let current_health = health::cluster_health(
        &data,
        ctx.seed.deployments.as_ref(),
        ctx.seed.stateful_sets.as_ref(),
        Utc::now(),
    )
    .await?;
    let previous = data
        .cluster
        .status
        .as_ref()
        .map(|s| s.health.clone())
        .unwrap_or_default();
    if current_health != previous {
        let snapshot = current_health.clone();
        update_cluster_status(ctx.seed.clusters.as_ref(), &name, move |c| {
            let status = c.status.get_or_insert_with(ClusterStatus::default);
            status.health = snapshot.clone();
        })
        .await?;
    }

    // Objects inside the tenant cluster need its apiserver answering.
    if current_health.apiserver {
        ensure_tenant_objects(&data, ctx).await?;
    }

    Ok(current_health.all_healthy())
}

async fn ensure_finalizers(cluster: &Cluster, ctx: &Context) -> Result<Cluster> {
    let complete = CLEANUP_FINALIZERS
        .iter()
        .all(|f| has_finalizer(cluster, f));
    if complete {
        return Ok(cluster.clone());
    }
    let name = cluster.name_any();
    update_cluster(ctx.seed.clusters.as_ref(), &name, |c| {
        let finalizers = c.metadata.finalizers.get_or_insert_with(Vec::new);
        for finalizer in CLEANUP_FINALIZERS {
            if !finalizers.iter().any(|f| f == finalizer) {
                finalizers.push(finalizer.to_string());
            }
        }
    })
    .await
}

/// Create the control plane namespace and record its name on the status.
/// The name is derived from the cluster name, so both sides are idempotent.
async fn ensure_namespace(cluster: &Cluster, ctx: &Context) -> Result<Cluster> {
    let data = cluster_data(cluster.clone(), ctx)?;
    let namespace = data.namespace().to_string();
    if ctx.seed.namespaces.get(&namespace).await?.is_none() {
        info!(cluster = %data.cluster_name(), namespace = %namespace, "creating control plane namespace");
        let object = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.clone()),
                owner_references: Some(vec![data.owner_ref()]),
                ..Default::default()
            },
            ..Default::default()
        };
        ctx.seed.namespaces.create(&object).await?;
    }

    if cluster.control_plane_namespace() == Some(namespace.as_str()) {
        return Ok(cluster.clone());
    }
    let name = cluster.name_any();
    update_cluster_status(ctx.seed.clusters.as_ref(), &name, move |c| {
        let status = c.status.get_or_insert_with(ClusterStatus::default);
        status.namespace_name = namespace.clone();
    })
    .await
}

/// Give the cloud provider a chance to finish its access data, persisting
/// whatever it hands back.
async fn initialize_cloud(cluster: &Cluster, ctx: &Context) -> Result<Cluster> {
    let provider = ctx.providers.for_cluster(cluster)?;
    match provider.initialize_cloud_provider(cluster).await? {
        Some(cloud) => {
            let name = cluster.name_any();
            info!(cluster = %name, provider = provider.name(), "cloud provider initialized");
            update_cluster(ctx.seed.clusters.as_ref(), &name, move |c| {
                c.spec.cloud = cloud.clone();
            })
            .await
        }
        None => Ok(cluster.clone()),
    }
}

async fn ensure_address(cluster: &Cluster, ctx: &Context) -> Result<Cluster> {
    let data = cluster_data(cluster.clone(), ctx)?;
    match address::sync_address(
        &data,
        &ctx.datacenters,
        ctx.resolver.as_ref(),
        ctx.seed.services.as_ref(),
    )
    .await?
    {
        Some(address) => {
            let name = data.cluster_name();
            info!(
                cluster = %name,
                external_name = %address.external_name,
                ip = %address.ip,
                "cluster address changed"
            );
            update_cluster_status(ctx.seed.clusters.as_ref(), &name, move |c| {
                let status = c.status.get_or_insert_with(ClusterStatus::default);
                status.address = address.clone();
            })
            .await
        }
        None => Ok(cluster.clone()),
    }
}

async fn ensure_network_defaults(cluster: &Cluster, ctx: &Context) -> Result<Cluster> {
    let network = &cluster.spec.cluster_network;
    if !network.services.cidr_blocks.is_empty()
        && !network.pods.cidr_blocks.is_empty()
        && !network.dns_domain.is_empty()
    {
        return Ok(cluster.clone());
    }
    let name = cluster.name_any();
    info!(cluster = %name, "filling in network defaults");
    update_cluster(ctx.seed.clusters.as_ref(), &name, |c| {
        let network = &mut c.spec.cluster_network;
        if network.services.cidr_blocks.is_empty() {
            network.services.cidr_blocks = vec![DEFAULT_SERVICES_CIDR.to_string()];
        }
        if network.pods.cidr_blocks.is_empty() {
            network.pods.cidr_blocks = vec![DEFAULT_PODS_CIDR.to_string()];
        }
        if network.dns_domain.is_empty() {
            network.dns_domain = DEFAULT_DNS_DOMAIN.to_string();
        }
    })
    .await
}

/// Bootstrap objects inside the tenant cluster: the cluster-info discovery
/// ConfigMap in kube-public and the OpenVPN client material in kube-system.
async fn ensure_tenant_objects(data: &ClusterData, ctx: &Context) -> Result<()> {
    let tenant = ctx.tenants.connect(&data.cluster).await?;

    let existing = tenant
        .get_config_map(TENANT_PUBLIC_NAMESPACE, CLUSTER_INFO_CONFIG_MAP_NAME)
        .await?;
    let desired = kubeconfig::cluster_info_config_map(data, existing.as_ref())?;
    let outcome =
        ensure_tenant_config_map(tenant.as_ref(), TENANT_PUBLIC_NAMESPACE, existing, desired)
            .await?;
    ctx.metrics.record_ensure("ConfigMap", outcome.as_label());

    let existing = tenant
        .get_secret(TENANT_SYSTEM_NAMESPACE, TENANT_OPENVPN_SECRET_NAME)
        .await?;
    let desired = openvpn::tenant_client_secret(data, existing.as_ref())?;
    let outcome =
        ensure_tenant_secret(tenant.as_ref(), TENANT_SYSTEM_NAMESPACE, existing, desired).await?;
    ctx.metrics.record_ensure("Secret", outcome.as_label());

    let node_port = openvpn_node_port(data, ctx).await?;
    let existing = tenant
        .get_config_map(TENANT_SYSTEM_NAMESPACE, TENANT_OPENVPN_CONFIG_MAP_NAME)
        .await?;
    let desired = openvpn::tenant_client_config_map(data, node_port, existing.as_ref())?;
    let outcome =
        ensure_tenant_config_map(tenant.as_ref(), TENANT_SYSTEM_NAMESPACE, existing, desired)
            .await?;
    ctx.metrics.record_ensure("ConfigMap", outcome.as_label());

    Ok(())
}

async fn openvpn_node_port(data: &ClusterData, ctx: &Context) -> Result<i32> {
    let service = ctx
        .seed
        .services
        .get(data.namespace(), OPENVPN_SERVICE_NAME)
        .await?
        .ok_or_else(|| {
            Error::internal_with_context(
                "launch",
                format!(
                    "openvpn service for cluster {} not found",
                    data.cluster_name()
                ),
            )
        })?;
    service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|p| p.first())
        .and_then(|p| p.node_port)
        .filter(|p| *p != 0)
        .ok_or_else(|| {
            Error::internal_with_context(
                "launch",
                format!(
                    "openvpn service for cluster {} has no node port yet",
                    data.cluster_name()
                ),
            )
        })
}

async fn ensure_tenant_config_map(
    tenant: &dyn TenantClient,
    namespace: &str,
    existing: Option<ConfigMap>,
    mut desired: ConfigMap,
) -> Result<EnsureOutcome> {
    let checksum = ensure::config_map_checksum(&desired);
    match existing {
        None => {
            ensure::annotate_checksum(&mut desired.metadata, checksum);
            tenant.create_config_map(namespace, &desired).await?;
            Ok(EnsureOutcome::Created)
        }
        Some(existing) => {
            if ensure::existing_checksum(&existing.metadata) == Some(&checksum) {
                return Ok(EnsureOutcome::Unchanged);
            }
            ensure::annotate_checksum(&mut desired.metadata, checksum);
            tenant.update_config_map(namespace, &desired).await?;
            Ok(EnsureOutcome::Updated)
        }
    }
}

async fn ensure_tenant_secret(
    tenant: &dyn TenantClient,
    namespace: &str,
    existing: Option<Secret>,
    mut desired: Secret,
) -> Result<EnsureOutcome> {
    let checksum = ensure::secret_checksum(&desired);
    match existing {
        None => {
            ensure::annotate_checksum(&mut desired.metadata, checksum);
            tenant.create_secret(namespace, &desired).await?;
            Ok(EnsureOutcome::Created)
        }
        Some(existing) => {
            if ensure::existing_checksum(&existing.metadata) == Some(&checksum) {
                return Ok(EnsureOutcome::Unchanged);
            }
            ensure::annotate_checksum(&mut desired.metadata, checksum);
            tenant.update_secret(namespace, &desired).await?;
            Ok(EnsureOutcome::Updated)
        }
    }
}
