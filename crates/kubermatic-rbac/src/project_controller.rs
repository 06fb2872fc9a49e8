//! Project RBAC controller.
//!
//! Drives every [`Project`] from Inactive to Active by synthesizing the
//! RBAC that makes the project usable: a cleanup finalizer, a membership
//! binding for the owning user, per-group ClusterRoles and bindings for
//! the project object itself, and the shared collection roles that let
//! project groups create resources. Collections whose objects live on the
//! seed clusters are converged on every seed.
//!
//! Deletion runs the mirror image under the finalizer: project clusters
//! are deleted, the project's groups are stripped out of the shared
//! bindings, and membership entries are removed from user specs. Named
//! roles and bindings carry owner references and are left to garbage
//! collection.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use rand::Rng;
use tracing::{info, instrument, warn};

use kubermatic_common::crd::{Project, ProjectPhase, UserProjectBinding, UserProjectBindingSpec};
use kubermatic_common::kube_utils::{find_owner, has_finalizer, pluralize_kind};
use kubermatic_common::metrics::ControllerMetrics;
use kubermatic_common::retry::{RetryDecision, RetryPolicy, RetryTracker};
use kubermatic_common::{
    Error, Result, KUBERMATIC_API_GROUP, KUBERMATIC_API_VERSION, RBAC_CLEANUP_FINALIZER,
    SA_SECRETS_NAMESPACE,
};

use crate::client::{ClusterProvider, MasterServices, RbacStore};
use crate::ensure;
use crate::mapper;

/// Failed syncs per project before the error policy stops requeueing and
/// waits for the next watch event.
const RETRY_BUDGET: u32 = 5;

/// Length of the generated owner membership binding name.
const OWNER_BINDING_NAME_LEN: usize = 10;

/// Where a resource collection's RBAC lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Destination {
    /// Master cluster only.
    Master,
    /// Every seed cluster.
    Seeds,
}

/// One resource kind whose collection RBAC is derived from projects.
struct ProjectResource {
    kind: &'static str,
    api_group: &'static str,
    /// Collection RBAC is namespaced when set, cluster-scoped otherwise.
    namespace: Option<&'static str>,
    destination: Destination,
}

/// Every kind carrying project-derived collection RBAC.
const PROJECT_RESOURCES: [ProjectResource; 6] = [
    ProjectResource {
        kind: "Project",
        api_group: KUBERMATIC_API_GROUP,
        namespace: None,
        destination: Destination::Master,
    },
    ProjectResource {
        kind: "UserProjectBinding",
        api_group: KUBERMATIC_API_GROUP,
        namespace: None,
        destination: Destination::Master,
    },
    ProjectResource {
        kind: "UserSSHKey",
        api_group: KUBERMATIC_API_GROUP,
        namespace: None,
        destination: Destination::Master,
    },
    ProjectResource {
        kind: "User",
        api_group: KUBERMATIC_API_GROUP,
        namespace: None,
        destination: Destination::Master,
    },
    ProjectResource {
        kind: "Cluster",
        api_group: KUBERMATIC_API_GROUP,
        namespace: None,
        destination: Destination::Seeds,
    },
    ProjectResource {
        kind: "Secret",
        api_group: "",
        namespace: Some(SA_SECRETS_NAMESPACE),
        destination: Destination::Master,
    },
];

/// Shared state handed to every reconcile invocation.
pub struct Context {
    /// Typed access to master-side objects.
    pub master: MasterServices,
    /// One provider per seed cluster.
    pub seeds: Vec<ClusterProvider>,
    /// Metric instruments.
    pub metrics: ControllerMetrics,
    /// Per-project retry accounting for the error policy.
    pub retries: RetryTracker,
}

impl Context {
    /// Create a builder for constructing a Context.
    pub fn builder(client: &Client) -> ContextBuilder {
        ContextBuilder::new(client.clone())
    }
}

/// Builder assembling a [`Context`] with production defaults for every
/// collaborator that is not overridden.
pub struct ContextBuilder {
    client: Client,
    seeds: Vec<ClusterProvider>,
    metrics: Option<ControllerMetrics>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            seeds: Vec::new(),
            metrics: None,
        }
    }

    /// Register one seed cluster.
    pub fn seed(mut self, name: impl Into<String>, client: &Client) -> Self {
        self.seeds.push(ClusterProvider::from_client(name, client));
        self
    }

    /// Register a pre-built seed provider.
    pub fn seed_provider(mut self, provider: ClusterProvider) -> Self {
        self.seeds.push(provider);
        self
    }

    /// Override the metric instruments.
    pub fn metrics(mut self, metrics: ControllerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the Context.
    pub fn build(self) -> Context {
        let master = MasterServices::from_client(&self.client);
        let metrics = self.metrics.unwrap_or_else(ControllerMetrics::from_global);
        let exhausted = metrics.clone();
        let retries = RetryTracker::new(RetryPolicy::with_max_attempts(RETRY_BUDGET))
            .with_on_exhausted(Arc::new(move |_, _| {
                exhausted.record_retry_exhausted("rbac_project");
            }));
        Context {
            master,
            seeds: self.seeds,
            metrics,
            retries,
        }
    }
}

/// Reconcile one Project.
#[instrument(skip(project, ctx), fields(project = %project.name_any()))]
pub async fn reconcile(project: Arc<Project>, ctx: Arc<Context>) -> Result<Action> {
    let name = project.name_any();

    let timer = ctx.metrics.reconcile_timer("rbac_project", name.as_str());
    match sync(&project, &ctx).await {
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
/// Errors are requeued with backoff until the project's retry budget is
/// used up, then the project is left alone until the next watch event.
pub fn error_policy(project: Arc<Project>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = project.name_any();
    match ctx.retries.record_failure(&name) {
        RetryDecision::Retry { attempt, backoff } => {
            warn!(project = %name, %error, attempt, ?backoff, "reconcile failed, requeueing");
            Action::requeue(backoff)
        }
        RetryDecision::Exhausted { attempts } => {
            warn!(project = %name, %error, attempts, "reconcile failed too often, waiting for the next event");
            Action::await_change()
        }
    }
}

async fn sync(project: &Project, ctx: &Context) -> Result<Action> {
    if project.metadata.deletion_timestamp.is_some() {
        if has_finalizer(project, RBAC_CLEANUP_FINALIZER) {
            cleanup(project, ctx).await?;
        }
        return Ok(Action::await_change());
    }

    let project = ensure_cleanup_finalizer(project, ctx).await?;
    ensure_owner_binding(&project, ctx).await?;
    ensure_project_rbac(&project, ctx).await?;
    ensure_collection_rbac(&project, ctx).await?;
    activate(&project, ctx).await?;
    Ok(Action::await_change())
}

fn project_owner_ref(project: &Project) -> OwnerReference {
    mapper::owner_ref(
        KUBERMATIC_API_VERSION,
        "Project",
        &project.name_any(),
        project.metadata.uid.as_deref().unwrap_or_default(),
    )
}

async fn ensure_cleanup_finalizer(project: &Project, ctx: &Context) -> Result<Project> {
    if has_finalizer(project, RBAC_CLEANUP_FINALIZER) {
        return Ok(project.clone());
    }

    info!(project = %project.name_any(), "adding cleanup finalizer");
    let mut updated = project.clone();
    updated
        .metadata
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(RBAC_CLEANUP_FINALIZER.to_string());
    ctx.master.projects.update(&updated).await
}

fn random_binding_name() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..OWNER_BINDING_NAME_LEN)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

/// Make sure the user owning the project is a member of its owners group.
///
/// The owning user comes from the project's owner references. Email
/// comparison is case-insensitive since emails are.
async fn ensure_owner_binding(project: &Project, ctx: &Context) -> Result<()> {
    let name = project.name_any();
    let refs = project.metadata.owner_references.as_deref().unwrap_or_default();
    let Some(owner_ref) = find_owner(refs, "User") else {
        return Err(Error::internal_with_context(
            "rbac_project",
            format!("project {} has no owner user reference", name),
        ));
    };
    let Some(owner) = ctx.master.users.get(&owner_ref.name).await? else {
        return Err(Error::internal_with_context(
            "rbac_project",
            format!("owner user {} of project {} does not exist", owner_ref.name, name),
        ));
    };

    let owners_group = mapper::group_name(&name, mapper::OWNER_GROUP_PREFIX);
    let bindings = ctx.master.bindings.list().await?;
    let already_bound = bindings.iter().any(|binding| {
        binding.spec.project_id == name
            && binding.spec.user_email.eq_ignore_ascii_case(&owner.spec.email)
            && binding.spec.group == owners_group
    });
    if already_bound {
        return Ok(());
    }

    info!(project = %name, owner = %owner.spec.email, "binding owner into the owners group");
    let mut binding = UserProjectBinding::new(
        &random_binding_name(),
        UserProjectBindingSpec {
            user_email: owner.spec.email.clone(),
            project_id: name.clone(),
            group: owners_group,
        },
    );
    binding.metadata.owner_references = Some(vec![project_owner_ref(project)]);
    binding.metadata.finalizers = Some(vec![RBAC_CLEANUP_FINALIZER.to_string()]);
    ctx.master.bindings.create(&binding).await?;
    Ok(())
}

/// ClusterRole and binding per group for the project object itself.
async fn ensure_project_rbac(project: &Project, ctx: &Context) -> Result<()> {
    let name = project.name_any();
    for prefix in mapper::ALL_GROUP_PREFIXES {
        let group = mapper::group_name(&name, prefix);
        let Some(role) = mapper::named_cluster_role(
            &group,
            "Project",
            KUBERMATIC_API_GROUP,
            &name,
            project_owner_ref(project),
        )?
        else {
            continue;
        };
        let outcome = ensure::ensure_cluster_role(ctx.master.rbac.as_ref(), &role).await?;
        ctx.metrics.record_ensure("ClusterRole", outcome.as_label());

        let binding =
            mapper::named_cluster_role_binding(&group, "Project", &name, project_owner_ref(project));
        let outcome =
            ensure::ensure_named_cluster_role_binding(ctx.master.rbac.as_ref(), &binding).await?;
        ctx.metrics.record_ensure("ClusterRoleBinding", outcome.as_label());
    }
    Ok(())
}

fn collection_stores(ctx: &Context, destination: Destination) -> Vec<&dyn RbacStore> {
    match destination {
        Destination::Master => vec![ctx.master.rbac.as_ref()],
        Destination::Seeds => ctx.seeds.iter().map(|seed| seed.rbac.as_ref()).collect(),
    }
}

/// Shared collection roles and the project's membership in their bindings.
async fn ensure_collection_rbac(project: &Project, ctx: &Context) -> Result<()> {
    let name = project.name_any();
    for resource in &PROJECT_RESOURCES {
        for prefix in mapper::ALL_GROUP_PREFIXES {
            let group = mapper::group_name(&name, prefix);
            match resource.namespace {
                Some(namespace) => {
                    let Some(role) =
                        mapper::collection_role(prefix, resource.kind, resource.api_group, namespace)?
                    else {
                        continue;
                    };
                    let outcome =
                        ensure::ensure_role(ctx.master.rbac.as_ref(), namespace, &role).await?;
                    ctx.metrics.record_ensure("Role", outcome.as_label());

                    let binding = mapper::collection_role_binding(&group, resource.kind, namespace);
                    let outcome = ensure::ensure_collection_role_binding(
                        ctx.master.rbac.as_ref(),
                        namespace,
                        &binding,
                    )
                    .await?;
                    ctx.metrics.record_ensure("RoleBinding", outcome.as_label());
                }
                None => {
                    let Some(role) =
                        mapper::collection_cluster_role(prefix, resource.kind, resource.api_group)?
                    else {
                        continue;
                    };
                    let binding = mapper::collection_cluster_role_binding(&group, resource.kind);
                    for rbac in collection_stores(ctx, resource.destination) {
                        let outcome = ensure::ensure_cluster_role(rbac, &role).await?;
                        ctx.metrics.record_ensure("ClusterRole", outcome.as_label());

                        let outcome =
                            ensure::ensure_collection_cluster_role_binding(rbac, &binding).await?;
                        ctx.metrics.record_ensure("ClusterRoleBinding", outcome.as_label());
                    }
                }
            }
        }
    }
    Ok(())
}

async fn activate(project: &Project, ctx: &Context) -> Result<()> {
    if project.is_active() {
        return Ok(());
    }

    info!(project = %project.name_any(), "RBAC in place, activating project");
    let mut updated = project.clone();
    updated.status.get_or_insert_with(Default::default).phase = ProjectPhase::Active;
    ctx.master.projects.update_status(&updated).await?;
    Ok(())
}

/// Tear down what the finalizer protects, then release the project.
async fn cleanup(project: &Project, ctx: &Context) -> Result<()> {
    let name = project.name_any();
    info!(project = %name, "cleaning up project RBAC");

    for seed in &ctx.seeds {
        for cluster in seed.clusters.list_clusters(&name).await? {
            info!(
                project = %name,
                seed = %seed.name,
                cluster = %cluster.name_any(),
                "deleting project cluster"
            );
            seed.clusters.delete_cluster(&cluster.name_any()).await?;
        }
    }

    strip_collection_subjects(project, ctx).await?;
    remove_project_from_users(project, ctx).await?;

    let mut updated = project.clone();
    if let Some(finalizers) = updated.metadata.finalizers.as_mut() {
        finalizers.retain(|finalizer| finalizer != RBAC_CLEANUP_FINALIZER);
    }
    ctx.master.projects.update(&updated).await?;
    Ok(())
}

/// Remove the project's groups from every shared collection binding,
/// leaving other projects' subjects in place.
async fn strip_collection_subjects(project: &Project, ctx: &Context) -> Result<()> {
    let name = project.name_any();
    for resource in &PROJECT_RESOURCES {
        let plural = pluralize_kind(resource.kind);
        for prefix in mapper::ALL_GROUP_PREFIXES {
            let group = mapper::group_name(&name, prefix);
            let binding_name = mapper::collection_rbac_name(&plural, prefix);
            match resource.namespace {
                Some(namespace) => {
                    if mapper::verbs_for_namespaced_collection(prefix, namespace)?.is_none() {
                        continue;
                    }
                    ensure::strip_role_binding_subject(
                        ctx.master.rbac.as_ref(),
                        namespace,
                        &binding_name,
                        &group,
                    )
                    .await?;
                }
                None => {
                    if mapper::verbs_for_collection(prefix, resource.kind)?.is_none() {
                        continue;
                    }
                    for rbac in collection_stores(ctx, resource.destination) {
                        ensure::strip_cluster_role_binding_subject(rbac, &binding_name, &group)
                            .await?;
                    }
                }
            }
        }
    }
    Ok(())
}

/// Drop the project's membership entry from every user spec.
async fn remove_project_from_users(project: &Project, ctx: &Context) -> Result<()> {
    let name = project.name_any();
    for user in ctx.master.users.list().await? {
        if !user.spec.projects.iter().any(|entry| entry.name == name) {
            continue;
        }
        info!(project = %name, user = %user.name_any(), "removing project membership from user");
        let mut updated = user.clone();
        updated.spec.projects.retain(|entry| entry.name != name);
        ctx.master.users.update(&updated).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use k8s_openapi::api::rbac::v1::{ClusterRole, Subject};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use kubermatic_common::crd::{
        Cluster, ClusterSpec, ProjectGroup, ProjectSpec, User, UserSSHKey, UserSpec,
    };
    use kubermatic_common::PROJECT_ID_LABEL_KEY;

    use crate::client::{BindingClient, ProjectClient, SeedClusterClient, SshKeyClient, UserClient};
    use crate::testing::{MemoryBindings, MemoryProjects, MemoryRbac, MemoryUsers};

    // =========================================================================
    // In-memory fakes
    // =========================================================================

    struct NoSshKeys;

    #[async_trait]
    impl SshKeyClient for NoSshKeys {
        async fn list(&self) -> Result<Vec<UserSSHKey>> {
            Ok(Vec::new())
        }

        async fn update(&self, _key: &UserSSHKey) -> Result<UserSSHKey> {
            panic!("ssh keys are not written by the project controller");
        }
    }

    #[derive(Default)]
    struct MemoryClusters {
        clusters: Mutex<Vec<Cluster>>,
        deleted: Mutex<Vec<String>>,
    }

    impl MemoryClusters {
        fn insert(&self, cluster: Cluster) {
            self.clusters.lock().unwrap().push(cluster);
        }

        fn deleted(&self) -> Vec<String> {
            self.deleted.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SeedClusterClient for MemoryClusters {
        async fn list_clusters(&self, project: &str) -> Result<Vec<Cluster>> {
            Ok(self
                .clusters
                .lock()
                .unwrap()
                .iter()
                .filter(|cluster| {
                    cluster
                        .metadata
                        .labels
                        .as_ref()
                        .and_then(|labels| labels.get(PROJECT_ID_LABEL_KEY))
                        .map(|label| label == project)
                        .unwrap_or(false)
                })
                .cloned()
                .collect())
        }

        async fn delete_cluster(&self, name: &str) -> Result<()> {
            self.deleted.lock().unwrap().push(name.to_string());
            self.clusters
                .lock()
                .unwrap()
                .retain(|cluster| cluster.name_any() != name);
            Ok(())
        }
    }

    // =========================================================================
    // Harness and fixtures
    // =========================================================================

    struct Harness {
        projects: Arc<MemoryProjects>,
        users: Arc<MemoryUsers>,
        bindings: Arc<MemoryBindings>,
        master_rbac: Arc<MemoryRbac>,
        seed_rbac: Arc<MemoryRbac>,
        seed_clusters: Arc<MemoryClusters>,
    }

    impl Harness {
        fn new() -> Self {
            let harness = Self {
                projects: Arc::new(MemoryProjects::default()),
                users: Arc::new(MemoryUsers::default()),
                bindings: Arc::new(MemoryBindings::default()),
                master_rbac: Arc::new(MemoryRbac::default()),
                seed_rbac: Arc::new(MemoryRbac::default()),
                seed_clusters: Arc::new(MemoryClusters::default()),
            };
            harness.users.insert(james());
            harness
        }

        fn context(&self) -> Arc<Context> {
            Arc::new(Context {
                master: MasterServices {
                    projects: self.projects.clone() as Arc<dyn ProjectClient>,
                    users: self.users.clone() as Arc<dyn UserClient>,
                    bindings: self.bindings.clone() as Arc<dyn BindingClient>,
                    ssh_keys: Arc::new(NoSshKeys),
                    rbac: self.master_rbac.clone() as Arc<dyn RbacStore>,
                },
                seeds: vec![ClusterProvider {
                    name: "europe-west3-c".to_string(),
                    rbac: self.seed_rbac.clone() as Arc<dyn RbacStore>,
                    clusters: self.seed_clusters.clone() as Arc<dyn SeedClusterClient>,
                }],
                metrics: ControllerMetrics::from_global(),
                retries: RetryTracker::new(RetryPolicy::with_max_attempts(RETRY_BUDGET)),
            })
        }

        fn total_rbac_writes(&self) -> usize {
            self.master_rbac.writes() + self.seed_rbac.writes()
        }
    }

    fn james() -> User {
        let mut user = User::new(
            "james",
            UserSpec {
                id: "h4sh3d".to_string(),
                name: "James Bond".to_string(),
                email: "james@kubermatic.io".to_string(),
                projects: Vec::new(),
            },
        );
        user.metadata.uid = Some("7d234c1f-0ea7-4d36-9b9c-a1b0282f8dab".to_string());
        user
    }

    fn thunderball() -> Project {
        let mut project = Project::new(
            "thunderball",
            ProjectSpec {
                name: "Operation Thunderball".to_string(),
            },
        );
        project.metadata.uid = Some("376d21ae-f5a2-4c4d-b930-5db030e6f7c8".to_string());
        project.metadata.owner_references = Some(vec![OwnerReference {
            api_version: KUBERMATIC_API_VERSION.to_string(),
            kind: "User".to_string(),
            name: "james".to_string(),
            uid: "7d234c1f-0ea7-4d36-9b9c-a1b0282f8dab".to_string(),
            ..Default::default()
        }]);
        project
    }

    fn deleted_thunderball() -> Project {
        let mut project = thunderball();
        project.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        project.metadata.finalizers = Some(vec![RBAC_CLEANUP_FINALIZER.to_string()]);
        project
    }

    fn project_cluster(name: &str) -> Cluster {
        let mut cluster = Cluster::new(name, ClusterSpec::default());
        cluster.metadata.labels = Some(BTreeMap::from([(
            PROJECT_ID_LABEL_KEY.to_string(),
            "thunderball".to_string(),
        )]));
        cluster
    }

    fn verbs(role: &ClusterRole) -> Vec<String> {
        role.rules.as_deref().unwrap_or_default()[0].verbs.clone()
    }

    fn subject_names(subjects: &Option<Vec<Subject>>) -> Vec<String> {
        subjects
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|subject| subject.name.clone())
            .collect()
    }

    // =========================================================================
    // Sync
    // =========================================================================
    //
    // Story: a fresh project becomes usable in one pass. The finalizer
    // lands first, the owning user joins the owners group, the project
    // object gets its per-group roles, the shared collections learn the
    // new groups, and the phase flips to Active.

    #[tokio::test]
    async fn test_new_project_is_activated_with_full_rbac() {
        let harness = Harness::new();
        harness.projects.insert(thunderball());
        let ctx = harness.context();

        let action = reconcile(Arc::new(thunderball()), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());

        let stored = harness.projects.stored("thunderball").unwrap();
        assert!(has_finalizer(&stored, RBAC_CLEANUP_FINALIZER));
        assert!(stored.is_active());

        // Owner membership.
        let bindings = harness.bindings.all();
        assert_eq!(bindings.len(), 1);
        let binding = &bindings[0];
        assert_eq!(binding.name_any().len(), OWNER_BINDING_NAME_LEN);
        assert_eq!(binding.spec.project_id, "thunderball");
        assert_eq!(binding.spec.user_email, "james@kubermatic.io");
        assert_eq!(binding.spec.group, "owners-thunderball");
        assert!(has_finalizer(binding, RBAC_CLEANUP_FINALIZER));
        let owner = &binding.metadata.owner_references.as_deref().unwrap()[0];
        assert_eq!(owner.kind, "Project");
        assert_eq!(owner.name, "thunderball");

        // Named project roles, one per group with its own verb set.
        let owners = harness
            .master_rbac
            .cluster_role("kubermatic:project-thunderball:owners-thunderball")
            .unwrap();
        assert_eq!(verbs(&owners), vec!["get", "update", "delete"]);
        let editors = harness
            .master_rbac
            .cluster_role("kubermatic:project-thunderball:editors-thunderball")
            .unwrap();
        assert_eq!(verbs(&editors), vec!["get", "update"]);
        let viewers = harness
            .master_rbac
            .cluster_role("kubermatic:project-thunderball:viewers-thunderball")
            .unwrap();
        assert_eq!(verbs(&viewers), vec!["get"]);

        let binding = harness
            .master_rbac
            .cluster_role_binding("kubermatic:project-thunderball:owners-thunderball")
            .unwrap();
        assert_eq!(subject_names(&binding.subjects), vec!["owners-thunderball"]);

        // Master collections carry the new groups.
        let keys = harness
            .master_rbac
            .cluster_role_binding("kubermatic:usersshkeies:owners")
            .unwrap();
        assert_eq!(subject_names(&keys.subjects), vec!["owners-thunderball"]);
        assert!(harness
            .master_rbac
            .cluster_role("kubermatic:projects:editors")
            .is_some());

        // Cluster collections live on the seed, not the master.
        assert!(harness
            .master_rbac
            .cluster_role_binding("kubermatic:clusters:owners")
            .is_none());
        let clusters = harness
            .seed_rbac
            .cluster_role_binding("kubermatic:clusters:owners")
            .unwrap();
        assert_eq!(subject_names(&clusters.subjects), vec!["owners-thunderball"]);

        // Token secrets are namespaced and owner-only.
        let secrets = harness
            .master_rbac
            .role(SA_SECRETS_NAMESPACE, "kubermatic:secrets:owners")
            .unwrap();
        assert_eq!(
            secrets.rules.as_deref().unwrap_or_default()[0].verbs,
            vec!["create"]
        );
        let secrets_binding = harness
            .master_rbac
            .role_binding(SA_SECRETS_NAMESPACE, "kubermatic:secrets:owners")
            .unwrap();
        assert_eq!(
            subject_names(&secrets_binding.subjects),
            vec!["owners-thunderball"]
        );
        assert!(harness
            .master_rbac
            .role(SA_SECRETS_NAMESPACE, "kubermatic:secrets:editors")
            .is_none());
    }

    #[tokio::test]
    async fn test_second_sync_issues_no_writes() {
        let harness = Harness::new();
        harness.projects.insert(thunderball());
        let ctx = harness.context();

        reconcile(Arc::new(thunderball()), ctx.clone()).await.unwrap();
        let rbac_writes = harness.total_rbac_writes();
        let project_writes = harness.projects.writes();

        let converged = harness.projects.stored("thunderball").unwrap();
        reconcile(Arc::new(converged), ctx).await.unwrap();

        assert_eq!(harness.total_rbac_writes(), rbac_writes);
        assert_eq!(harness.projects.writes(), project_writes);
        assert_eq!(harness.bindings.all().len(), 1);
    }

    #[tokio::test]
    async fn test_existing_owner_membership_is_recognized_across_email_case() {
        let harness = Harness::new();
        harness.projects.insert(thunderball());
        let mut existing = UserProjectBinding::new(
            "preexisting",
            UserProjectBindingSpec {
                user_email: "James@Kubermatic.IO".to_string(),
                project_id: "thunderball".to_string(),
                group: "owners-thunderball".to_string(),
            },
        );
        existing.metadata.finalizers = Some(vec![RBAC_CLEANUP_FINALIZER.to_string()]);
        harness.bindings.insert(existing);
        let ctx = harness.context();

        reconcile(Arc::new(thunderball()), ctx).await.unwrap();

        let bindings = harness.bindings.all();
        assert_eq!(bindings.len(), 1, "no second membership binding");
        assert_eq!(bindings[0].name_any(), "preexisting");
    }

    #[tokio::test]
    async fn test_project_without_an_owner_reference_fails() {
        let harness = Harness::new();
        let mut orphan = thunderball();
        orphan.metadata.owner_references = None;
        harness.projects.insert(orphan.clone());
        let ctx = harness.context();

        let error = reconcile(Arc::new(orphan), ctx).await.unwrap_err();
        assert!(error.to_string().contains("owner user"));

        // The finalizer is already in place, RBAC is not.
        let stored = harness.projects.stored("thunderball").unwrap();
        assert!(has_finalizer(&stored, RBAC_CLEANUP_FINALIZER));
        assert!(!stored.is_active());
        assert_eq!(harness.total_rbac_writes(), 0);
    }

    // =========================================================================
    // Cleanup
    // =========================================================================
    //
    // Story: deleting a project deletes its clusters on every seed, strips
    // its groups out of the shared bindings without touching other
    // projects, removes membership entries from user specs, and finally
    // releases the finalizer. Named roles are left to garbage collection.

    #[tokio::test]
    async fn test_cleanup_tears_down_and_releases_the_project() {
        let harness = Harness::new();
        harness.projects.insert(deleted_thunderball());
        harness.seed_clusters.insert(project_cluster("fqpcvnc6v"));

        let mut other = project_cluster("untouched");
        other.metadata.labels = Some(BTreeMap::from([(
            PROJECT_ID_LABEL_KEY.to_string(),
            "goldfinger".to_string(),
        )]));
        harness.seed_clusters.insert(other);

        harness.master_rbac.seed_cluster_role_binding(
            "kubermatic:usersshkeies:owners",
            &["owners-thunderball", "owners-goldfinger"],
        );
        harness
            .seed_rbac
            .seed_cluster_role_binding("kubermatic:clusters:owners", &["owners-thunderball"]);

        let mut bond = james();
        bond.spec.projects = vec![
            ProjectGroup {
                name: "thunderball".to_string(),
                group: "owners-thunderball".to_string(),
            },
            ProjectGroup {
                name: "goldfinger".to_string(),
                group: "editors-goldfinger".to_string(),
            },
        ];
        harness.users.insert(bond);
        let ctx = harness.context();

        let action = reconcile(Arc::new(deleted_thunderball()), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());

        assert_eq!(harness.seed_clusters.deleted(), vec!["fqpcvnc6v"]);

        let keys = harness
            .master_rbac
            .cluster_role_binding("kubermatic:usersshkeies:owners")
            .unwrap();
        assert_eq!(subject_names(&keys.subjects), vec!["owners-goldfinger"]);
        let clusters = harness
            .seed_rbac
            .cluster_role_binding("kubermatic:clusters:owners")
            .unwrap();
        assert!(subject_names(&clusters.subjects).is_empty());

        let bond = harness.users.stored("james").unwrap();
        assert_eq!(bond.spec.projects.len(), 1);
        assert_eq!(bond.spec.projects[0].name, "goldfinger");

        let stored = harness.projects.stored("thunderball").unwrap();
        assert!(!has_finalizer(&stored, RBAC_CLEANUP_FINALIZER));
    }

    #[tokio::test]
    async fn test_cleanup_with_nothing_left_still_releases_the_finalizer() {
        let harness = Harness::new();
        harness.projects.insert(deleted_thunderball());
        let ctx = harness.context();

        reconcile(Arc::new(deleted_thunderball()), ctx).await.unwrap();

        assert_eq!(harness.total_rbac_writes(), 0);
        assert!(harness.seed_clusters.deleted().is_empty());
        let stored = harness.projects.stored("thunderball").unwrap();
        assert!(!has_finalizer(&stored, RBAC_CLEANUP_FINALIZER));
    }

    #[tokio::test]
    async fn test_deleted_project_without_the_finalizer_is_ignored() {
        let harness = Harness::new();
        let mut released = deleted_thunderball();
        released.metadata.finalizers = None;
        harness.projects.insert(released.clone());
        let ctx = harness.context();

        let action = reconcile(Arc::new(released), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(harness.projects.writes(), 0);
        assert_eq!(harness.total_rbac_writes(), 0);
    }

    // =========================================================================
    // Error policy
    // =========================================================================

    #[tokio::test]
    async fn test_error_policy_waits_after_the_budget_is_spent() {
        let harness = Harness::new();
        let ctx = harness.context();
        let project = Arc::new(thunderball());
        let error = Error::internal_with_context("rbac_project", "owner lookup failed");

        for _ in 0..RETRY_BUDGET - 1 {
            let action = error_policy(project.clone(), &error, ctx.clone());
            assert_ne!(action, Action::await_change());
        }
        let action = error_policy(project, &error, ctx);
        assert_eq!(action, Action::await_change());
    }
}
