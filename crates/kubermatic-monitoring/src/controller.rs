//! Monitoring controller.
//!
//! Second controller over [`Cluster`] objects, converging the monitoring
//! stack in each cluster namespace. The gate is the health the lifecycle
//! controller writes: anything short of fully healthy is not an error but
//! a reason to look again after `health_check_period`, so a control plane
//! that is still launching or mid-update never consumes retry budget here.
//!
//! Phase transitions, status writes and teardown stay with the lifecycle
//! controller. This one only adds resources, and lets namespace deletion
//! collect them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{debug, instrument, warn};

use kubermatic_common::crd::Cluster;
use kubermatic_common::datacenter::DatacenterMeta;
use kubermatic_common::metrics::ControllerMetrics;
use kubermatic_common::retry::{RetryDecision, RetryPolicy, RetryTracker};
use kubermatic_common::{Error, Result};

use kubermatic_cluster::client::{
    AdminKubeconfigConnector, SeedServices, TenantClient, TenantConnector,
};
use kubermatic_cluster::ensure::{self, EnsureOutcome, NamedCreator};
use kubermatic_cluster::resources::certificates;
use kubermatic_cluster::resources::{ControllerConfig, CA_SECRET_NAME};
use kubermatic_cluster::ClusterData;

use crate::resources;

/// How often a not-yet-healthy cluster is looked at again, and the resync
/// interval once the stack is in place.
const DEFAULT_HEALTH_CHECK_PERIOD: Duration = Duration::from_secs(10);

/// Failed syncs per cluster before the error policy stops requeueing and
/// waits for the next watch event.
const RETRY_BUDGET: u32 = 5;

/// Shared state handed to every reconcile invocation.
pub struct Context {
    /// Typed access to seed-side objects.
    pub seed: SeedServices,
    /// Datacenter topology loaded from the datacenters file.
    pub datacenters: Arc<HashMap<String, DatacenterMeta>>,
    /// Connection factory for tenant apiservers.
    pub tenants: Arc<dyn TenantConnector>,
    /// Controller-wide settings from flags.
    pub config: ControllerConfig,
    /// Worker partition this controller instance serves.
    pub worker_name: String,
    /// Interval between health re-checks.
    pub health_check_period: Duration,
    /// Metric instruments.
    pub metrics: ControllerMetrics,
    /// Per-cluster retry accounting for the error policy.
    pub retries: RetryTracker,
}

impl Context {
    /// Create a builder for constructing a Context.
    pub fn builder(
        client: &Client,
        datacenters: Arc<HashMap<String, DatacenterMeta>>,
    ) -> ContextBuilder {
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
    health_check_period: Duration,
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
            health_check_period: DEFAULT_HEALTH_CHECK_PERIOD,
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

    /// Set the interval between health re-checks.
    pub fn health_check_period(mut self, period: Duration) -> Self {
        self.health_check_period = period;
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

    /// Assemble the context.
    pub fn build(self) -> Context {
        let seed = SeedServices::from_client(&self.client);
        let metrics = self.metrics.unwrap_or_else(ControllerMetrics::from_global);
        let exhausted = metrics.clone();
        let retries = RetryTracker::new(RetryPolicy::with_max_attempts(RETRY_BUDGET))
            .with_on_exhausted(Arc::new(move |_, _| {
                exhausted.record_retry_exhausted("monitoring");
            }));
        let tenants = self
            .tenants
            .unwrap_or_else(|| Arc::new(AdminKubeconfigConnector::new(seed.secrets.clone())));
        Context {
            seed,
            datacenters: self.datacenters,
            tenants,
            config: self.config,
            worker_name: self.worker_name,
            health_check_period: self.health_check_period,
            metrics,
            retries,
        }
    }
}

/// Reconcile the monitoring stack of one Cluster.
///
/// Deploys nothing until the control plane reports fully healthy, and
/// nothing at all for paused or deleted clusters.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    let name = cluster.name_any();

    let worker = cluster.spec.worker_name.clone().unwrap_or_default();
    if worker != ctx.worker_name {
        return Ok(Action::await_change());
    }

    if cluster.metadata.deletion_timestamp.is_some() || cluster.spec.pause {
        return Ok(Action::await_change());
    }

    if !cluster.all_healthy() {
        debug!(cluster = %name, "control plane not healthy yet, checking again later");
        return Ok(Action::requeue(ctx.health_check_period));
    }

    let timer = ctx.metrics.reconcile_timer("monitoring", name.as_str());
    match sync(&cluster, &ctx).await {
        Ok(()) => {
            timer.success();
            ctx.retries.reset(&name);
            Ok(Action::requeue(ctx.health_check_period))
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
/// Same budget as the lifecycle controller: bounded requeues with backoff,
/// then wait for the next watch event.
pub fn error_policy(cluster: Arc<Cluster>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = cluster.name_any();
    match ctx.retries.record_failure(&name) {
        RetryDecision::Retry { attempt, backoff } => {
            warn!(cluster = %name, %error, attempt, ?backoff, "monitoring sync failed, requeueing");
            Action::requeue(backoff)
        }
        RetryDecision::Exhausted { attempts } => {
            warn!(cluster = %name, %error, attempts, "monitoring sync failed too often, waiting for the next event");
            Action::await_change()
        }
    }
}

async fn sync(cluster: &Cluster, ctx: &Context) -> Result<()> {
    let mut data = cluster_data(cluster.clone(), ctx)?;

    // The lifecycle controller creates the CA during launch, and the
    // cluster cannot be healthy without it.
    let ca_secret = ctx
        .seed
        .secrets
        .get(data.namespace(), CA_SECRET_NAME)
        .await?
        .ok_or_else(|| {
            Error::internal_with_context(
                "monitoring",
                format!("cluster {} has no CA secret", data.cluster_name()),
            )
        })?;
    data.set_ca(certificates::load_root_ca(&ca_secret)?);

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
    for creator in resources::secret_creators(&data) {
        let outcome = ensure::ensure_secret(ctx.seed.secrets.as_ref(), &data, &creator).await?;
        ctx.metrics.record_ensure("Secret", outcome.as_label());
    }
    for creator in resources::config_map_creators() {
        let outcome =
            ensure::ensure_config_map(ctx.seed.config_maps.as_ref(), &data, &creator).await?;
        ctx.metrics.record_ensure("ConfigMap", outcome.as_label());
    }
    for creator in resources::service_creators() {
        let outcome = ensure::ensure(ctx.seed.services.as_ref(), &data, &creator).await?;
        ctx.metrics.record_ensure("Service", outcome.as_label());
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

    ensure_tenant_rbac(&data, ctx).await
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

/// Push the RBAC for the scraping identities into the tenant cluster.
async fn ensure_tenant_rbac(data: &ClusterData, ctx: &Context) -> Result<()> {
    let tenant = ctx.tenants.connect(&data.cluster).await?;

    for creator in resources::tenant_cluster_role_creators(data) {
        let outcome = ensure_tenant_cluster_role(tenant.as_ref(), data, &creator).await?;
        ctx.metrics.record_ensure("ClusterRole", outcome.as_label());
    }
    for creator in resources::tenant_cluster_role_binding_creators(data) {
        let outcome = ensure_tenant_cluster_role_binding(tenant.as_ref(), data, &creator).await?;
        ctx.metrics
            .record_ensure("ClusterRoleBinding", outcome.as_label());
    }
    Ok(())
}

async fn ensure_tenant_cluster_role(
    tenant: &dyn TenantClient,
    data: &ClusterData,
    creator: &NamedCreator<ClusterRole>,
) -> Result<EnsureOutcome> {
    match tenant.get_cluster_role(creator.name).await? {
        None => {
            let desired = (creator.create)(data, None)?;
            tenant.create_cluster_role(&desired).await?;
            Ok(EnsureOutcome::Created)
        }
        Some(existing) => {
            let desired = (creator.create)(data, Some(&existing))?;
            if desired == existing {
                Ok(EnsureOutcome::Unchanged)
            } else {
                tenant.update_cluster_role(&desired).await?;
                Ok(EnsureOutcome::Updated)
            }
        }
    }
}

async fn ensure_tenant_cluster_role_binding(
    tenant: &dyn TenantClient,
    data: &ClusterData,
    creator: &NamedCreator<ClusterRoleBinding>,
) -> Result<EnsureOutcome> {
    match tenant.get_cluster_role_binding(creator.name).await? {
        None => {
            let desired = (creator.create)(data, None)?;
            tenant.create_cluster_role_binding(&desired).await?;
            Ok(EnsureOutcome::Created)
        }
        Some(existing) => {
            let desired = (creator.create)(data, Some(&existing))?;
            if desired == existing {
                Ok(EnsureOutcome::Unchanged)
            } else {
                tenant.update_cluster_role_binding(&desired).await?;
                Ok(EnsureOutcome::Updated)
            }
        }
    }
}
