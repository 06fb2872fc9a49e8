//! Cluster teardown.
//!
//! Deletion runs as ordered cleanup stages gated by finalizers on the
//! Cluster object: tenant nodes first, then cloud provider resources, then
//! the control plane namespace. One stage runs per sync, and a finalizer is
//! only dropped once its stage verifiably finished, so a controller crash
//! mid-teardown resumes where it left off.

use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use tracing::info;

use kubermatic_common::crd::Cluster;
use kubermatic_common::kube_utils::has_finalizer;
use kubermatic_common::{
    Result, CLOUD_PROVIDER_CLEANUP_FINALIZER, NAMESPACE_CLEANUP_FINALIZER, NODE_DELETION_FINALIZER,
};

use crate::client::{update_cluster, ClusterClient, ClusterObjectStore, TenantConnector};
use crate::provider::CloudRegistry;

/// Cleanup stage derived from which finalizers are still present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionStage {
    /// Tenant cluster nodes still need deleting.
    Nodes,
    /// Cloud provider resources still need cleaning up.
    CloudProvider,
    /// The control plane namespace still needs removing.
    Namespace,
    /// No cleanup finalizers left, the apiserver may collect the object.
    Done,
}

/// Which stage to run this sync. Earlier stages always win, so finalizers
/// come off in a fixed order no matter how they were added.
pub fn current_stage(cluster: &Cluster) -> DeletionStage {
    if has_finalizer(cluster, NODE_DELETION_FINALIZER) {
        DeletionStage::Nodes
    } else if has_finalizer(cluster, CLOUD_PROVIDER_CLEANUP_FINALIZER) {
        DeletionStage::CloudProvider
    } else if has_finalizer(cluster, NAMESPACE_CLEANUP_FINALIZER) {
        DeletionStage::Namespace
    } else {
        DeletionStage::Done
    }
}

async fn drop_finalizer(
    clusters: &dyn ClusterClient,
    cluster: &Cluster,
    finalizer: &str,
) -> Result<()> {
    let name = cluster.name_any();
    info!(cluster = %name, finalizer, "cleanup stage finished, dropping finalizer");
    update_cluster(clusters, &name, |c| {
        if let Some(finalizers) = c.metadata.finalizers.as_mut() {
            finalizers.retain(|f| f != finalizer);
        }
    })
    .await?;
    Ok(())
}

/// Delete the tenant cluster's nodes, dropping the finalizer once none are
/// left. Node objects linger until their machines are gone, so a sync that
/// issued deletes keeps the finalizer and re-checks on the next pass.
///
/// An apiserver that never reported healthy cannot have registered nodes;
/// connecting to it would wedge teardown, so the finalizer comes off
/// without a connection attempt.
pub async fn cleanup_nodes(
    cluster: &Cluster,
    tenants: &dyn TenantConnector,
    clusters: &dyn ClusterClient,
) -> Result<()> {
    let apiserver_was_up = cluster
        .status
        .as_ref()
        .map(|s| s.health.apiserver)
        .unwrap_or(false);
    if !apiserver_was_up {
        return drop_finalizer(clusters, cluster, NODE_DELETION_FINALIZER).await;
    }

    let tenant = tenants.connect(cluster).await?;
    let nodes = tenant.list_node_names().await?;
    if nodes.is_empty() {
        return drop_finalizer(clusters, cluster, NODE_DELETION_FINALIZER).await;
    }
    for node in &nodes {
        info!(cluster = %cluster.name_any(), node = %node, "deleting tenant node");
        tenant.delete_node(node).await?;
    }
    Ok(())
}

/// Let the cloud provider release whatever it allocated for the cluster,
/// then drop its finalizer.
pub async fn cleanup_cloud_provider(
    cluster: &Cluster,
    providers: &CloudRegistry,
    clusters: &dyn ClusterClient,
) -> Result<()> {
    let provider = providers.for_cluster(cluster)?;
    provider.cleanup_cloud_provider(cluster).await?;
    drop_finalizer(clusters, cluster, CLOUD_PROVIDER_CLEANUP_FINALIZER).await
}

/// Delete the control plane namespace, dropping the finalizer only once the
/// namespace is observed absent. Namespace deletion is asynchronous on the
/// apiserver side, so the sync that issues the delete never also drops the
/// finalizer.
pub async fn cleanup_namespace(
    cluster: &Cluster,
    namespaces: &dyn ClusterObjectStore<Namespace>,
    clusters: &dyn ClusterClient,
) -> Result<()> {
    let namespace = cluster
        .control_plane_namespace()
        .map(str::to_string)
        .unwrap_or_else(|| kubermatic_common::namespace_name(&cluster.name_any()));

    match namespaces.get(&namespace).await? {
        Some(_) => {
            info!(cluster = %cluster.name_any(), namespace = %namespace, "deleting control plane namespace");
            namespaces.delete(&namespace).await
        }
        None => drop_finalizer(clusters, cluster, NAMESPACE_CLEANUP_FINALIZER).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use kubermatic_common::crd::{ClusterHealth, ClusterStatus};

    use crate::client::{
        MockClusterClient, MockClusterObjectStore, MockTenantClient, MockTenantConnector,
    };

    fn deleting_cluster(finalizers: &[&str]) -> Cluster {
        let mut cluster = Cluster::new("fqpcvnc6v", Default::default());
        cluster.metadata.finalizers =
            Some(finalizers.iter().map(|f| f.to_string()).collect());
        cluster.status = Some(ClusterStatus {
            namespace_name: "cluster-fqpcvnc6v".to_string(),
            health: ClusterHealth {
                apiserver: true,
                ..Default::default()
            },
            ..Default::default()
        });
        cluster
    }

    fn expecting_finalizer_drop(cluster: &Cluster, dropped: &'static str) -> MockClusterClient {
        let stored = cluster.clone();
        let mut clusters = MockClusterClient::new();
        clusters
            .expect_get()
            .returning(move |_| Ok(Some(stored.clone())));
        clusters
            .expect_update()
            .withf(move |c| !c.finalizers().iter().any(|f| f == dropped))
            .returning(|c| Ok(c.clone()));
        clusters
    }

    #[test]
    fn test_stages_run_in_fixed_order() {
        let all = deleting_cluster(&[
            NODE_DELETION_FINALIZER,
            CLOUD_PROVIDER_CLEANUP_FINALIZER,
            NAMESPACE_CLEANUP_FINALIZER,
        ]);
        assert_eq!(current_stage(&all), DeletionStage::Nodes);

        // Order holds regardless of how finalizers are listed on the object.
        let shuffled = deleting_cluster(&[
            NAMESPACE_CLEANUP_FINALIZER,
            NODE_DELETION_FINALIZER,
        ]);
        assert_eq!(current_stage(&shuffled), DeletionStage::Nodes);

        let late = deleting_cluster(&[NAMESPACE_CLEANUP_FINALIZER]);
        assert_eq!(current_stage(&late), DeletionStage::Namespace);

        assert_eq!(current_stage(&deleting_cluster(&[])), DeletionStage::Done);
    }

    #[tokio::test]
    async fn test_nodes_deleted_before_finalizer_comes_off() {
        let cluster = deleting_cluster(&[NODE_DELETION_FINALIZER]);

        let mut tenant = MockTenantClient::new();
        tenant
            .expect_list_node_names()
            .returning(|| Ok(vec!["worker-0".to_string(), "worker-1".to_string()]));
        tenant.expect_delete_node().times(2).returning(|_| Ok(()));
        let tenant = Arc::new(tenant);
        let mut tenants = MockTenantConnector::new();
        let handle = Arc::clone(&tenant);
        tenants
            .expect_connect()
            .returning(move |_| Ok(Arc::clone(&handle) as Arc<dyn crate::client::TenantClient>));

        // No cluster update expected while nodes remain.
        let clusters = MockClusterClient::new();
        cleanup_nodes(&cluster, &tenants, &clusters).await.unwrap();
    }

    #[tokio::test]
    async fn test_node_finalizer_dropped_once_no_nodes_remain() {
        let cluster = deleting_cluster(&[NODE_DELETION_FINALIZER]);

        let mut tenant = MockTenantClient::new();
        tenant.expect_list_node_names().returning(|| Ok(Vec::new()));
        let tenant = Arc::new(tenant);
        let mut tenants = MockTenantConnector::new();
        let handle = Arc::clone(&tenant);
        tenants
            .expect_connect()
            .returning(move |_| Ok(Arc::clone(&handle) as Arc<dyn crate::client::TenantClient>));

        let clusters = expecting_finalizer_drop(&cluster, NODE_DELETION_FINALIZER);
        cleanup_nodes(&cluster, &tenants, &clusters).await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_tenant_does_not_wedge_node_cleanup() {
        let mut cluster = deleting_cluster(&[NODE_DELETION_FINALIZER]);
        if let Some(status) = cluster.status.as_mut() {
            status.health.apiserver = false;
        }

        // Connecting would fail forever, the connector must not be touched.
        let tenants = MockTenantConnector::new();
        let clusters = expecting_finalizer_drop(&cluster, NODE_DELETION_FINALIZER);
        cleanup_nodes(&cluster, &tenants, &clusters).await.unwrap();
    }

    #[tokio::test]
    async fn test_namespace_finalizer_deferred_until_observed_absent() {
        let cluster = deleting_cluster(&[NAMESPACE_CLEANUP_FINALIZER]);

        // First sync: the namespace is still there, delete it and keep the
        // finalizer.
        let mut namespaces = MockClusterObjectStore::<Namespace>::new();
        namespaces
            .expect_get()
            .withf(|name| name == "cluster-fqpcvnc6v")
            .returning(|_| Ok(Some(Namespace::default())));
        namespaces
            .expect_delete()
            .withf(|name| name == "cluster-fqpcvnc6v")
            .returning(|_| Ok(()));
        let clusters = MockClusterClient::new();
        cleanup_namespace(&cluster, &namespaces, &clusters)
            .await
            .unwrap();

        // Later sync: the namespace is gone, now the finalizer comes off.
        let mut namespaces = MockClusterObjectStore::<Namespace>::new();
        namespaces.expect_get().returning(|_| Ok(None));
        let clusters = expecting_finalizer_drop(&cluster, NAMESPACE_CLEANUP_FINALIZER);
        cleanup_namespace(&cluster, &namespaces, &clusters)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cloud_cleanup_releases_its_finalizer() {
        let mut cluster = deleting_cluster(&[CLOUD_PROVIDER_CLEANUP_FINALIZER]);
        cluster.spec.cloud.fake = Some(Default::default());

        let providers = CloudRegistry::with_defaults(Arc::new(Default::default()));
        let clusters = expecting_finalizer_drop(&cluster, CLOUD_PROVIDER_CLEANUP_FINALIZER);
        cleanup_cloud_provider(&cluster, &providers, &clusters)
            .await
            .unwrap();
    }
}
