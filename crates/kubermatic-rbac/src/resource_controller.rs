//! Resource RBAC controller.
//!
//! The mirror of the project controller for the objects inside a project:
//! whenever a cluster, SSH key, membership binding, service account user
//! or token secret changes, the per-group roles and bindings naming that
//! object are converged on the cluster it lives on. One instance runs per
//! watched cluster, master or seed, each with typed watches for the kinds
//! present there. Generated objects carry owner references to the watched
//! resource, so deletion is garbage collection work and syncs skip
//! resources already going away.
//!
//! Ownership resolution prefers the Project owner reference and falls
//! back to the project-id label. What happens to resources carrying
//! neither is a policy choice: strict surfaces an error, lenient logs
//! and skips.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{instrument, warn};

use kubermatic_common::crd::{Cluster, User, UserProjectBinding, UserSSHKey};
use kubermatic_common::kube_utils::find_owner;
use kubermatic_common::metrics::ControllerMetrics;
use kubermatic_common::retry::{RetryDecision, RetryPolicy, RetryTracker};
use kubermatic_common::{
    Error, Result, KUBERMATIC_API_GROUP, PROJECT_ID_LABEL_KEY, SA_SECRETS_NAMESPACE,
    SA_SECRET_PREFIX,
};

use crate::client::ClusterProvider;
use crate::ensure;
use crate::mapper;

/// Failed syncs per resource before the error policy stops requeueing and
/// waits for the next watch event.
const RETRY_BUDGET: u32 = 5;

/// How a resource without a resolvable project is treated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OrphanPolicy {
    /// Surface an error; the retry budget bounds how often it repeats.
    #[default]
    Strict,
    /// Log the orphan and move on.
    Lenient,
}

/// Outcome of mapping a resource back to its project.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OwnerResolution {
    /// Name of the owning project.
    Resolved(String),
    /// Neither a Project owner reference nor a project-id label.
    Orphaned,
}

/// Map a resource to the project it belongs to.
///
/// The owner reference wins when it is complete; a reference missing its
/// name or uid is treated as absent and the label decides.
pub fn resolve_owning_project<T: Resource<DynamicType = ()>>(resource: &T) -> OwnerResolution {
    let refs = resource.meta().owner_references.as_deref().unwrap_or_default();
    if let Some(owner) = find_owner(refs, "Project") {
        if !owner.name.is_empty() && !owner.uid.is_empty() {
            return OwnerResolution::Resolved(owner.name.clone());
        }
    }

    if let Some(project) = resource.labels().get(PROJECT_ID_LABEL_KEY) {
        if !project.is_empty() {
            return OwnerResolution::Resolved(project.clone());
        }
    }

    OwnerResolution::Orphaned
}

/// Shared state handed to every reconcile invocation of one instance.
pub struct Context {
    /// The cluster this instance watches and writes to.
    pub provider: ClusterProvider,
    /// How orphaned resources are treated.
    pub policy: OrphanPolicy,
    /// Metric instruments.
    pub metrics: ControllerMetrics,
    /// Per-resource retry accounting for the error policy.
    pub retries: RetryTracker,
}

impl Context {
    /// Create a builder for constructing a Context.
    pub fn builder(provider: ClusterProvider) -> ContextBuilder {
        ContextBuilder::new(provider)
    }
}

/// Builder assembling a [`Context`] with production defaults.
pub struct ContextBuilder {
    provider: ClusterProvider,
    policy: OrphanPolicy,
    metrics: Option<ControllerMetrics>,
}

impl ContextBuilder {
    fn new(provider: ClusterProvider) -> Self {
        Self {
            provider,
            policy: OrphanPolicy::default(),
            metrics: None,
        }
    }

    /// Set the orphan policy.
    pub fn orphan_policy(mut self, policy: OrphanPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the metric instruments.
    pub fn metrics(mut self, metrics: ControllerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the Context.
    pub fn build(self) -> Context {
        let metrics = self.metrics.unwrap_or_else(ControllerMetrics::from_global);
        let exhausted = metrics.clone();
        let retries = RetryTracker::new(RetryPolicy::with_max_attempts(RETRY_BUDGET))
            .with_on_exhausted(Arc::new(move |_, _| {
                exhausted.record_retry_exhausted("rbac_resource");
            }));
        Context {
            provider: self.provider,
            policy: self.policy,
            metrics,
            retries,
        }
    }
}

fn retry_key<T: Resource<DynamicType = ()>>(resource: &T) -> String {
    format!("{}/{}", T::kind(&()).to_lowercase(), resource.name_any())
}

async fn observed<Fut>(ctx: &Context, key: &str, sync: Fut) -> Result<Action>
where
    Fut: std::future::Future<Output = Result<Action>>,
{
    let timer = ctx.metrics.reconcile_timer("rbac_resource", key);
    match sync.await {
        Ok(action) => {
            timer.success();
            ctx.retries.reset(key);
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

/// Reconcile one Cluster's RBAC on its seed.
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile_cluster(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    observed(&ctx, &retry_key(cluster.as_ref()), sync_cluster(&cluster, &ctx)).await
}

/// Reconcile one SSH key's RBAC on the master.
#[instrument(skip(key, ctx), fields(ssh_key = %key.name_any()))]
pub async fn reconcile_ssh_key(key: Arc<UserSSHKey>, ctx: Arc<Context>) -> Result<Action> {
    observed(&ctx, &retry_key(key.as_ref()), sync_ssh_key(&key, &ctx)).await
}

/// Reconcile one membership binding's RBAC on the master.
#[instrument(skip(binding, ctx), fields(binding = %binding.name_any()))]
pub async fn reconcile_binding(
    binding: Arc<UserProjectBinding>,
    ctx: Arc<Context>,
) -> Result<Action> {
    observed(&ctx, &retry_key(binding.as_ref()), sync_binding(&binding, &ctx)).await
}

/// Reconcile one service account token secret's RBAC on the master.
#[instrument(skip(secret, ctx), fields(secret = %secret.name_any()))]
pub async fn reconcile_secret(secret: Arc<Secret>, ctx: Arc<Context>) -> Result<Action> {
    observed(&ctx, &retry_key(secret.as_ref()), sync_secret(&secret, &ctx)).await
}

/// Reconcile one service account user's RBAC on the master.
#[instrument(skip(user, ctx), fields(user = %user.name_any()))]
pub async fn reconcile_user(user: Arc<User>, ctx: Arc<Context>) -> Result<Action> {
    observed(&ctx, &retry_key(user.as_ref()), sync_user(&user, &ctx)).await
}

/// Decide what happens after a failed sync, shared by every watch.
pub fn error_policy<T>(resource: Arc<T>, error: &Error, ctx: Arc<Context>) -> Action
where
    T: Resource<DynamicType = ()>,
{
    let key = retry_key(resource.as_ref());
    match ctx.retries.record_failure(&key) {
        RetryDecision::Retry { attempt, backoff } => {
            warn!(resource = %key, %error, attempt, ?backoff, "reconcile failed, requeueing");
            Action::requeue(backoff)
        }
        RetryDecision::Exhausted { attempts } => {
            warn!(resource = %key, %error, attempts, "reconcile failed too often, waiting for the next event");
            Action::await_change()
        }
    }
}

fn resource_owner_ref<T: Resource<DynamicType = ()>>(resource: &T) -> OwnerReference {
    mapper::owner_ref(
        &T::api_version(&()),
        &T::kind(&()),
        &resource.name_any(),
        resource.meta().uid.as_deref().unwrap_or_default(),
    )
}

fn orphaned(ctx: &Context, kind: &str, name: &str) -> Result<Action> {
    match ctx.policy {
        OrphanPolicy::Strict => Err(Error::missing_owner(kind, name)),
        OrphanPolicy::Lenient => {
            warn!(kind, name, "resource belongs to no project, skipping");
            Ok(Action::await_change())
        }
    }
}

/// Named ClusterRole and binding per group for one cluster-scoped resource.
async fn ensure_named_rbac(
    ctx: &Context,
    project: &str,
    kind: &str,
    resource_name: &str,
    owner: &OwnerReference,
) -> Result<()> {
    for prefix in mapper::ALL_GROUP_PREFIXES {
        let group = mapper::group_name(project, prefix);
        let Some(role) = mapper::named_cluster_role(
            &group,
            kind,
            KUBERMATIC_API_GROUP,
            resource_name,
            owner.clone(),
        )?
        else {
            continue;
        };
        let outcome = ensure::ensure_cluster_role(ctx.provider.rbac.as_ref(), &role).await?;
        ctx.metrics.record_ensure("ClusterRole", outcome.as_label());

        let binding =
            mapper::named_cluster_role_binding(&group, kind, resource_name, owner.clone());
        let outcome =
            ensure::ensure_named_cluster_role_binding(ctx.provider.rbac.as_ref(), &binding).await?;
        ctx.metrics.record_ensure("ClusterRoleBinding", outcome.as_label());
    }
    Ok(())
}

async fn sync_cluster(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    if cluster.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let name = cluster.name_any();
    let project = match resolve_owning_project(cluster) {
        OwnerResolution::Resolved(project) => project,
        OwnerResolution::Orphaned => return orphaned(ctx, "Cluster", &name),
    };

    let owner = resource_owner_ref(cluster);
    ensure_named_rbac(ctx, &project, "Cluster", &name, &owner).await?;
    ensure_addon_rbac(cluster, &project, ctx).await?;
    Ok(Action::await_change())
}

/// Addon roles inside the cluster namespace, once the lifecycle controller
/// has created it. Until then the next status change triggers another sync.
async fn ensure_addon_rbac(cluster: &Cluster, project: &str, ctx: &Context) -> Result<()> {
    let namespace = cluster
        .status
        .as_ref()
        .map(|status| status.namespace_name.as_str())
        .unwrap_or_default();
    if namespace.is_empty() {
        return Ok(());
    }

    for prefix in mapper::ALL_GROUP_PREFIXES {
        let group = mapper::group_name(project, prefix);
        let Some(role) =
            mapper::cluster_namespace_role(&group, "Addon", KUBERMATIC_API_GROUP, namespace)?
        else {
            continue;
        };
        let outcome = ensure::ensure_role(ctx.provider.rbac.as_ref(), namespace, &role).await?;
        ctx.metrics.record_ensure("Role", outcome.as_label());

        let binding = mapper::cluster_namespace_role_binding(&group, "Addon", namespace);
        let outcome =
            ensure::ensure_named_role_binding(ctx.provider.rbac.as_ref(), namespace, &binding)
                .await?;
        ctx.metrics.record_ensure("RoleBinding", outcome.as_label());
    }
    Ok(())
}

async fn sync_ssh_key(key: &UserSSHKey, ctx: &Context) -> Result<Action> {
    if key.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let name = key.name_any();
    let project = match resolve_owning_project(key) {
        OwnerResolution::Resolved(project) => project,
        OwnerResolution::Orphaned => return orphaned(ctx, "UserSSHKey", &name),
    };

    let owner = resource_owner_ref(key);
    ensure_named_rbac(ctx, &project, "UserSSHKey", &name, &owner).await?;
    Ok(Action::await_change())
}

async fn sync_binding(binding: &UserProjectBinding, ctx: &Context) -> Result<Action> {
    if binding.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let name = binding.name_any();
    let project = match resolve_owning_project(binding) {
        OwnerResolution::Resolved(project) => project,
        OwnerResolution::Orphaned => return orphaned(ctx, "UserProjectBinding", &name),
    };

    let owner = resource_owner_ref(binding);
    ensure_named_rbac(ctx, &project, "UserProjectBinding", &name, &owner).await?;
    Ok(Action::await_change())
}

/// Token secrets only; everything else in the watch is left alone.
async fn sync_secret(secret: &Secret, ctx: &Context) -> Result<Action> {
    if secret.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let name = secret.name_any();
    let namespace = secret.namespace().unwrap_or_default();
    if namespace != SA_SECRETS_NAMESPACE || !name.starts_with(SA_SECRET_PREFIX) {
        return Ok(Action::await_change());
    }

    let project = match resolve_owning_project(secret) {
        OwnerResolution::Resolved(project) => project,
        OwnerResolution::Orphaned => return orphaned(ctx, "Secret", &name),
    };

    let owner = resource_owner_ref(secret);
    for prefix in mapper::ALL_GROUP_PREFIXES {
        let group = mapper::group_name(&project, prefix);
        let Some(role) = mapper::named_role(&group, "Secret", "", &name, &namespace, owner.clone())?
        else {
            continue;
        };
        let outcome = ensure::ensure_role(ctx.provider.rbac.as_ref(), &namespace, &role).await?;
        ctx.metrics.record_ensure("Role", outcome.as_label());

        let binding = mapper::named_role_binding(&group, "Secret", &name, &namespace, owner.clone());
        let outcome =
            ensure::ensure_named_role_binding(ctx.provider.rbac.as_ref(), &namespace, &binding)
                .await?;
        ctx.metrics.record_ensure("RoleBinding", outcome.as_label());
    }
    Ok(Action::await_change())
}

/// Service account users only; human users get no per-object RBAC.
async fn sync_user(user: &User, ctx: &Context) -> Result<Action> {
    if user.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    if !user.is_service_account() {
        return Ok(Action::await_change());
    }

    let name = user.name_any();
    let project = match resolve_owning_project(user) {
        OwnerResolution::Resolved(project) => project,
        OwnerResolution::Orphaned => return orphaned(ctx, "User", &name),
    };

    let owner = resource_owner_ref(user);
    ensure_named_rbac(ctx, &project, "User", &name, &owner).await?;
    Ok(Action::await_change())
}
