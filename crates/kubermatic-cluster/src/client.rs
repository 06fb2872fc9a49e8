//! Client seams between the controller and the Kubernetes API.
//!
//! Reconciliation logic talks to typed stores and clients behind traits so
//! tests can substitute mocks. `KubeStore` is the production implementation,
//! a thin wrapper over `kube::Api` for any namespaced kind; cluster-scoped
//! kinds go through `KubeClusterStore`. Access to the tenant cluster is a
//! separate seam since it uses the generated admin kubeconfig rather than
//! the seed credentials.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Node, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use kubermatic_common::crd::Cluster;
use kubermatic_common::{Error, Result};

use crate::resources::ADMIN_KUBECONFIG_SECRET_NAME;

/// Conflict retries for read-modify-write cluster updates.
const CONFLICT_RETRIES: u32 = 5;
/// Fixed pause between conflict retries.
const CONFLICT_BACKOFF: Duration = Duration::from_millis(100);

/// Read and write access to one namespaced resource kind.
///
/// `get` returning `None` maps a 404 into the ensure algorithm's
/// "absent, build from nothing" branch.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Fetch an object, `None` if it does not exist.
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<T>>;
    /// Create a new object.
    async fn create(&self, namespace: &str, object: &T) -> Result<T>;
    /// Replace an existing object.
    async fn update(&self, namespace: &str, object: &T) -> Result<T>;
}

/// Read and write access to one cluster-scoped resource kind.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterObjectStore<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Fetch an object, `None` if it does not exist.
    async fn get(&self, name: &str) -> Result<Option<T>>;
    /// Create a new object.
    async fn create(&self, object: &T) -> Result<T>;
    /// Replace an existing object.
    async fn update(&self, object: &T) -> Result<T>;
    /// Delete an object. Deletion of an already absent object is not an error.
    async fn delete(&self, name: &str) -> Result<()>;
}

/// Production [`ObjectStore`] backed by `kube::Api`.
pub struct KubeStore<T> {
    client: Client,
    _kind: PhantomData<T>,
}

impl<T> KubeStore<T> {
    /// Create a store for the given kind.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<T> ObjectStore<T> for KubeStore<T>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
    T::DynamicType: Default,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<T>> {
        let api: Api<T> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create(&self, namespace: &str, object: &T) -> Result<T> {
        let api: Api<T> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), object).await?)
    }

    async fn update(&self, namespace: &str, object: &T) -> Result<T> {
        let api: Api<T> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .replace(&object.name_any(), &PostParams::default(), object)
            .await?)
    }
}

/// Production [`ClusterObjectStore`] backed by `kube::Api`.
pub struct KubeClusterStore<T> {
    client: Client,
    _kind: PhantomData<T>,
}

impl<T> KubeClusterStore<T> {
    /// Create a store for the given kind.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            _kind: PhantomData,
        }
    }
}

#[async_trait]
impl<T> ClusterObjectStore<T> for KubeClusterStore<T>
where
    T: kube::Resource<Scope = k8s_openapi::ClusterResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
    T::DynamicType: Default,
{
    async fn get(&self, name: &str) -> Result<Option<T>> {
        let api: Api<T> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn create(&self, object: &T) -> Result<T> {
        let api: Api<T> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), object).await?)
    }

    async fn update(&self, object: &T) -> Result<T> {
        let api: Api<T> = Api::all(self.client.clone());
        Ok(api
            .replace(&object.name_any(), &PostParams::default(), object)
            .await?)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let api: Api<T> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Reads and writes `Cluster` objects on the seed.
///
/// Spec and metadata changes go through `update`, phase and health changes
/// through the status subresource.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch a cluster, `None` if it does not exist.
    async fn get(&self, name: &str) -> Result<Option<Cluster>>;
    /// Replace a cluster's spec and metadata.
    async fn update(&self, cluster: &Cluster) -> Result<Cluster>;
    /// Replace a cluster's status subresource.
    async fn update_status(&self, cluster: &Cluster) -> Result<Cluster>;
}

/// Production [`ClusterClient`] backed by `kube::Api`.
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Create a cluster client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get(&self, name: &str) -> Result<Option<Cluster>> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn update(&self, cluster: &Cluster) -> Result<Cluster> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        Ok(api
            .replace(&cluster.name_any(), &PostParams::default(), cluster)
            .await?)
    }

    async fn update_status(&self, cluster: &Cluster) -> Result<Cluster> {
        let api: Api<Cluster> = Api::all(self.client.clone());
        let data = serde_json::to_vec(cluster)
            .map_err(|e| Error::serialization_for_kind("Cluster", e.to_string()))?;
        Ok(api
            .replace_status(&cluster.name_any(), &PostParams::default(), data)
            .await?)
    }
}

/// Read-modify-write a cluster with bounded conflict retry.
///
/// Always refetches before modifying so the write carries the latest
/// resourceVersion. Conflicts are retried [`CONFLICT_RETRIES`] times with a
/// fixed backoff, everything else propagates.
pub async fn update_cluster<F>(
    clusters: &dyn ClusterClient,
    name: &str,
    modify: F,
) -> Result<Cluster>
where
    F: Fn(&mut Cluster) + Send + Sync,
{
    update_with(clusters, name, modify, false).await
}

/// Like [`update_cluster`] but writing the status subresource.
pub async fn update_cluster_status<F>(
    clusters: &dyn ClusterClient,
    name: &str,
    modify: F,
) -> Result<Cluster>
where
    F: Fn(&mut Cluster) + Send + Sync,
{
    update_with(clusters, name, modify, true).await
}

async fn update_with<F>(
    clusters: &dyn ClusterClient,
    name: &str,
    modify: F,
    status_only: bool,
) -> Result<Cluster>
where
    F: Fn(&mut Cluster) + Send + Sync,
{
    let mut attempt = 0;
    loop {
        let Some(mut cluster) = clusters.get(name).await? else {
            return Err(Error::internal_with_context(
                "update_cluster",
                format!("cluster {} no longer exists", name),
            ));
        };
        modify(&mut cluster);

        let result = if status_only {
            clusters.update_status(&cluster).await
        } else {
            clusters.update(&cluster).await
        };
        match result {
            Ok(updated) => return Ok(updated),
            Err(err) if err.is_conflict() && attempt < CONFLICT_RETRIES => {
                attempt += 1;
                debug!(cluster = %name, attempt, "conflict while updating cluster, retrying");
                tokio::time::sleep(CONFLICT_BACKOFF).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Operations performed inside the tenant cluster through its apiserver.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TenantClient: Send + Sync {
    /// Fetch a ConfigMap, `None` if it does not exist.
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>>;
    /// Create a ConfigMap.
    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap>;
    /// Replace a ConfigMap.
    async fn update_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap>;
    /// Fetch a Secret, `None` if it does not exist.
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;
    /// Create a Secret.
    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret>;
    /// Replace a Secret.
    async fn update_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret>;
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
    /// Names of all Nodes currently registered with the tenant apiserver.
    async fn list_node_names(&self) -> Result<Vec<String>>;
    /// Delete a Node. Deleting an already absent Node is not an error.
    async fn delete_node(&self, name: &str) -> Result<()>;
}

/// Opens connections to tenant clusters.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TenantConnector: Send + Sync {
    /// Build a client for the given cluster's apiserver.
    async fn connect(&self, cluster: &Cluster) -> Result<Arc<dyn TenantClient>>;
}

/// [`TenantConnector`] that authenticates with the generated admin
/// kubeconfig stored in the cluster namespace.
pub struct AdminKubeconfigConnector {
    secrets: Arc<dyn ObjectStore<Secret>>,
}

impl AdminKubeconfigConnector {
    /// Create a connector reading admin kubeconfigs through the given store.
    pub fn new(secrets: Arc<dyn ObjectStore<Secret>>) -> Self {
        Self { secrets }
    }
}

#[async_trait]
impl TenantConnector for AdminKubeconfigConnector {
    async fn connect(&self, cluster: &Cluster) -> Result<Arc<dyn TenantClient>> {
        let name = cluster.name_any();
        let namespace = cluster.control_plane_namespace().ok_or_else(|| {
            Error::internal_with_context(
                "tenant_connect",
                format!("cluster {} has no namespace yet", name),
            )
        })?;

        let secret = self
            .secrets
            .get(namespace, ADMIN_KUBECONFIG_SECRET_NAME)
            .await?
            .ok_or_else(|| {
                Error::internal_with_context(
                    "tenant_connect",
                    format!("admin kubeconfig for cluster {} does not exist yet", name),
                )
            })?;

        let raw = secret
            .data
            .as_ref()
            .and_then(|data| data.get("kubeconfig"))
            .ok_or_else(|| {
                Error::internal_with_context(
                    "tenant_connect",
                    format!("admin kubeconfig secret for cluster {} has no kubeconfig key", name),
                )
            })?;

        let kubeconfig: Kubeconfig = serde_yaml::from_slice(&raw.0).map_err(|e| {
            Error::serialization_for_kind("Kubeconfig", format!("invalid admin kubeconfig: {}", e))
        })?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .map_err(|e| Error::internal_with_context("tenant_connect", e.to_string()))?;
        let client = Client::try_from(config)?;

        Ok(Arc::new(TenantKubeClient { client }))
    }
}

/// Production [`TenantClient`] over a `kube::Client` built from the admin
/// kubeconfig.
pub struct TenantKubeClient {
    client: Client,
}

#[async_trait]
impl TenantClient for TenantKubeClient {
    async fn get_config_map(&self, namespace: &str, name: &str) -> Result<Option<ConfigMap>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), config_map).await?)
    }

    async fn update_config_map(&self, namespace: &str, config_map: &ConfigMap) -> Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .replace(&config_map.name_any(), &PostParams::default(), config_map)
            .await?)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.create(&PostParams::default(), secret).await?)
    }

    async fn update_secret(&self, namespace: &str, secret: &Secret) -> Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .replace(&secret.name_any(), &PostParams::default(), secret)
            .await?)
    }

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

    async fn list_node_names(&self) -> Result<Vec<String>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes.items.iter().map(|n| n.name_any()).collect())
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Resolves the external DNS name of a cluster.
///
/// A trait so address tests do not depend on a live resolver.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// All IPv4 addresses the host resolves to, in resolver order.
    async fn lookup_ipv4(&self, host: &str) -> Result<Vec<Ipv4Addr>>;
}

/// [`DnsResolver`] using the operating system resolver.
pub struct SystemDnsResolver;

#[async_trait]
impl DnsResolver for SystemDnsResolver {
    async fn lookup_ipv4(&self, host: &str) -> Result<Vec<Ipv4Addr>> {
        let addrs = tokio::net::lookup_host((host, 0u16))
            .await
            .map_err(|e| Error::dns(host, e.to_string()))?;
        Ok(addrs
            .filter_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(*v4.ip()),
                SocketAddr::V6(_) => None,
            })
            .collect())
    }
}

/// Typed stores and clients for everything the controller touches on the
/// seed cluster. One instance is shared by all reconcilers via the context.
#[derive(Clone)]
pub struct SeedServices {
    /// Cluster object access.
    pub clusters: Arc<dyn ClusterClient>,
    /// Namespace access, used for the cluster namespace lifecycle.
    pub namespaces: Arc<dyn ClusterObjectStore<Namespace>>,
    /// ServiceAccount store scoped to cluster namespaces.
    pub service_accounts: Arc<dyn ObjectStore<ServiceAccount>>,
    /// Role store scoped to cluster namespaces.
    pub roles: Arc<dyn ObjectStore<Role>>,
    /// RoleBinding store scoped to cluster namespaces.
    pub role_bindings: Arc<dyn ObjectStore<RoleBinding>>,
    /// ClusterRoleBinding store.
    pub cluster_role_bindings: Arc<dyn ClusterObjectStore<ClusterRoleBinding>>,
    /// Service store scoped to cluster namespaces.
    pub services: Arc<dyn ObjectStore<Service>>,
    /// Secret store scoped to cluster namespaces.
    pub secrets: Arc<dyn ObjectStore<Secret>>,
    /// ConfigMap store scoped to cluster namespaces.
    pub config_maps: Arc<dyn ObjectStore<ConfigMap>>,
    /// Deployment store scoped to cluster namespaces.
    pub deployments: Arc<dyn ObjectStore<Deployment>>,
    /// StatefulSet store scoped to cluster namespaces.
    pub stateful_sets: Arc<dyn ObjectStore<StatefulSet>>,
}

impl SeedServices {
    /// Build the full bundle from one seed client.
    pub fn from_client(client: &Client) -> Self {
        Self {
            clusters: Arc::new(KubeClusterClient::new(client.clone())),
            namespaces: Arc::new(KubeClusterStore::new(client.clone())),
            service_accounts: Arc::new(KubeStore::new(client.clone())),
            roles: Arc::new(KubeStore::new(client.clone())),
            role_bindings: Arc::new(KubeStore::new(client.clone())),
            cluster_role_bindings: Arc::new(KubeClusterStore::new(client.clone())),
            services: Arc::new(KubeStore::new(client.clone())),
            secrets: Arc::new(KubeStore::new(client.clone())),
            config_maps: Arc::new(KubeStore::new(client.clone())),
            deployments: Arc::new(KubeStore::new(client.clone())),
            stateful_sets: Arc::new(KubeStore::new(client.clone())),
        }
    }
}
