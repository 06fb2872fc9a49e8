//! Client seams between the RBAC controllers and the Kubernetes API.
//!
//! The controllers converge objects on the master cluster and on every seed
//! cluster, so access goes through per-kind traits that tests substitute
//! with mocks. [`MasterServices`] bundles everything touched on the master,
//! [`ClusterProvider`] the per-seed handle. The production implementations
//! are thin wrappers over `kube::Api`.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;

use kubermatic_common::crd::{Cluster, Project, User, UserProjectBinding, UserSSHKey};
use kubermatic_common::{Error, Result, PROJECT_ID_LABEL_KEY};

/// Reads and writes `Project` objects on the master.
///
/// Spec and metadata changes go through `update`, the phase through the
/// status subresource.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProjectClient: Send + Sync {
    /// Fetch a project, `None` if it does not exist.
    async fn get(&self, name: &str) -> Result<Option<Project>>;
    /// Replace a project's spec and metadata.
    async fn update(&self, project: &Project) -> Result<Project>;
    /// Replace a project's status subresource.
    async fn update_status(&self, project: &Project) -> Result<Project>;
}

/// Reads and writes `User` objects on the master.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait UserClient: Send + Sync {
    /// All users.
    async fn list(&self) -> Result<Vec<User>>;
    /// Fetch a user, `None` if it does not exist.
    async fn get(&self, name: &str) -> Result<Option<User>>;
    /// Replace a user.
    async fn update(&self, user: &User) -> Result<User>;
}

/// Reads and creates `UserProjectBinding` objects on the master.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BindingClient: Send + Sync {
    /// All membership bindings.
    async fn list(&self) -> Result<Vec<UserProjectBinding>>;
    /// Create a membership binding.
    async fn create(&self, binding: &UserProjectBinding) -> Result<UserProjectBinding>;
}

/// Reads and writes `UserSSHKey` objects on the master.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SshKeyClient: Send + Sync {
    /// All SSH keys.
    async fn list(&self) -> Result<Vec<UserSSHKey>>;
    /// Replace an SSH key.
    async fn update(&self, key: &UserSSHKey) -> Result<UserSSHKey>;
}

/// RBAC object access on one cluster, master or seed.
///
/// Roles and bindings are converged with get-compare-update, so the store
/// exposes the three primitives per kind rather than a generic apply.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RbacStore: Send + Sync {
    /// Fetch a ClusterRole, `None` if it does not exist.
    async fn get_cluster_role(&self, name: &str) -> Result<Option<ClusterRole>>;
    /// Create a ClusterRole.
    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole>;
    /// Replace a ClusterRole.
    async fn update_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole>;

    /// Fetch a ClusterRoleBinding, `None` if it does not exist.
    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>>;
    /// Create a ClusterRoleBinding.
    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding>;
    /// Replace a ClusterRoleBinding.
    async fn update_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding>;

    /// Fetch a Role, `None` if it does not exist.
    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<Role>>;
    /// Create a Role.
    async fn create_role(&self, namespace: &str, role: &Role) -> Result<Role>;
    /// Replace a Role.
    async fn update_role(&self, namespace: &str, role: &Role) -> Result<Role>;

    /// Fetch a RoleBinding, `None` if it does not exist.
    async fn get_role_binding(&self, namespace: &str, name: &str) -> Result<Option<RoleBinding>>;
    /// Create a RoleBinding.
    async fn create_role_binding(&self, namespace: &str, binding: &RoleBinding)
        -> Result<RoleBinding>;
    /// Replace a RoleBinding.
    async fn update_role_binding(&self, namespace: &str, binding: &RoleBinding)
        -> Result<RoleBinding>;
}

/// Cluster objects on one seed, as far as project cleanup needs them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SeedClusterClient: Send + Sync {
    /// Clusters labeled as belonging to the given project.
    async fn list_clusters(&self, project: &str) -> Result<Vec<Cluster>>;
    /// Delete a cluster, tolerating that it is already gone.
    async fn delete_cluster(&self, name: &str) -> Result<()>;
}

/// Production [`ProjectClient`] backed by `kube::Api`.
pub struct KubeProjectClient {
    client: Client,
}

impl KubeProjectClient {
    /// Create a project client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProjectClient for KubeProjectClient {
    async fn get(&self, name: &str) -> Result<Option<Project>> {
        let api: Api<Project> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn update(&self, project: &Project) -> Result<Project> {
        let api: Api<Project> = Api::all(self.client.clone());
        Ok(api
            .replace(&project.name_any(), &PostParams::default(), project)
            .await?)
    }

    async fn update_status(&self, project: &Project) -> Result<Project> {
        let api: Api<Project> = Api::all(self.client.clone());
        let data = serde_json::to_vec(project)
            .map_err(|e| Error::serialization_for_kind("Project", e.to_string()))?;
        Ok(api
            .replace_status(&project.name_any(), &PostParams::default(), data)
            .await?)
    }
}

/// Production [`UserClient`] backed by `kube::Api`.
pub struct KubeUserClient {
    client: Client,
}

impl KubeUserClient {
    /// Create a user client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UserClient for KubeUserClient {
    async fn list(&self) -> Result<Vec<User>> {
        let api: Api<User> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get(&self, name: &str) -> Result<Option<User>> {
        let api: Api<User> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn update(&self, user: &User) -> Result<User> {
        let api: Api<User> = Api::all(self.client.clone());
        Ok(api
            .replace(&user.name_any(), &PostParams::default(), user)
            .await?)
    }
}

/// Production [`BindingClient`] backed by `kube::Api`.
pub struct KubeBindingClient {
    client: Client,
}

impl KubeBindingClient {
    /// Create a binding client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl BindingClient for KubeBindingClient {
    async fn list(&self) -> Result<Vec<UserProjectBinding>> {
        let api: Api<UserProjectBinding> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn create(&self, binding: &UserProjectBinding) -> Result<UserProjectBinding> {
        let api: Api<UserProjectBinding> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), binding).await?)
    }
}

/// Production [`SshKeyClient`] backed by `kube::Api`.
pub struct KubeSshKeyClient {
    client: Client,
}

impl KubeSshKeyClient {
    /// Create an SSH key client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SshKeyClient for KubeSshKeyClient {
    async fn list(&self) -> Result<Vec<UserSSHKey>> {
        let api: Api<UserSSHKey> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn update(&self, key: &UserSSHKey) -> Result<UserSSHKey> {
        let api: Api<UserSSHKey> = Api::all(self.client.clone());
        Ok(api
            .replace(&key.name_any(), &PostParams::default(), key)
            .await?)
    }
}

/// Production [`RbacStore`] backed by `kube::Api`.
pub struct KubeRbacStore {
    client: Client,
}

impl KubeRbacStore {
    /// Create an RBAC store.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RbacStore for KubeRbacStore {
    async fn get_cluster_role(&self, name: &str) -> Result<Option<ClusterRole>> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), role).await?)
    }

    async fn update_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        Ok(api
            .replace(&role.name_any(), &PostParams::default(), role)
            .await?)
    }

    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), binding).await?)
    }

    async fn update_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        Ok(api
            .replace(&binding.name_any(), &PostParams::default(), binding)
            .await?)
    }

    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<Role>> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_role(&self, namespace: &str, role: &Role) -> Result<Role> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), role).await?)
    }

    async fn update_role(&self, namespace: &str, role: &Role) -> Result<Role> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .replace(&role.name_any(), &PostParams::default(), role)
            .await?)
    }

    async fn get_role_binding(&self, namespace: &str, name: &str) -> Result<Option<RoleBinding>> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<RoleBinding> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), binding).await?)
    }

    async fn update_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<RoleBinding> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .replace(&binding.name_any(), &PostParams::default(), binding)
            .await?)
    }
}

/// Production [`SeedClusterClient`] backed by `kube::Api`.
pub struct KubeSeedClusterClient {
    client: Client,
}

impl KubeSeedClusterClient {
    /// Create a seed cluster client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SeedClusterClient for KubeSeedClusterClient {
    async fn list_clusters(&self, project: &str) -> Result<Vec<Cluster>> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        let params =
            ListParams::default().labels(&format!("{}={}", PROJECT_ID_LABEL_KEY, project));
        Ok(api.list(&params).await?.items)
    }

    async fn delete_cluster(&self, name: &str) -> Result<()> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Typed clients for everything the controllers touch on the master
/// cluster. One instance is shared by all reconcilers via the context.
#[derive(Clone)]
pub struct MasterServices {
    /// Project object access.
    pub projects: Arc<dyn ProjectClient>,
    /// User object access.
    pub users: Arc<dyn UserClient>,
    /// Membership binding access.
    pub bindings: Arc<dyn BindingClient>,
    /// SSH key access.
    pub ssh_keys: Arc<dyn SshKeyClient>,
    /// RBAC objects on the master.
    pub rbac: Arc<dyn RbacStore>,
}

impl MasterServices {
    /// Build the full bundle from one master client.
    pub fn from_client(client: &Client) -> Self {
        Self {
            projects: Arc::new(KubeProjectClient::new(client.clone())),
            users: Arc::new(KubeUserClient::new(client.clone())),
            bindings: Arc::new(KubeBindingClient::new(client.clone())),
            ssh_keys: Arc::new(KubeSshKeyClient::new(client.clone())),
            rbac: Arc::new(KubeRbacStore::new(client.clone())),
        }
    }
}

/// One seed cluster as the RBAC controllers see it.
#[derive(Clone)]
pub struct ClusterProvider {
    /// Seed name, used in logs and error context.
    pub name: String,
    /// RBAC objects on the seed.
    pub rbac: Arc<dyn RbacStore>,
    /// Cluster objects on the seed.
    pub clusters: Arc<dyn SeedClusterClient>,
}

impl ClusterProvider {
    /// Build a provider from one seed client.
    pub fn from_client(name: impl Into<String>, client: &Client) -> Self {
        Self {
            name: name.into(),
            rbac: Arc::new(KubeRbacStore::new(client.clone())),
            clusters: Arc::new(KubeSeedClusterClient::new(client.clone())),
        }
    }
}
