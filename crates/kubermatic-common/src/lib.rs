//! Common types for Kubermatic: CRDs, errors, retry policy, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod datacenter;
pub mod error;
pub mod kube_utils;
pub mod metrics;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all Kubermatic custom resources
pub const KUBERMATIC_API_GROUP: &str = "kubermatic.k8s.io";

/// API version for all Kubermatic custom resources
pub const KUBERMATIC_API_VERSION: &str = "kubermatic.k8s.io/v1";

/// Prefix applied to annotations owned by the controllers
pub const ANNOTATION_PREFIX: &str = "kubermatic.io/";

/// Annotation holding the content checksum of Secrets and ConfigMaps
pub const CHECKSUM_ANNOTATION: &str = "kubermatic.io/checksum";

/// Label key tying a cluster-scoped resource to its owning project
pub const PROJECT_ID_LABEL_KEY: &str = "project-id";

/// Label key partitioning clusters between controller deployments
pub const WORKER_NAME_LABEL_KEY: &str = "worker-name";

/// Finalizer blocking cluster deletion until tenant nodes are gone
pub const NODE_DELETION_FINALIZER: &str = "kubermatic.io/delete-nodes";

/// Finalizer blocking cluster deletion until the cloud provider cleaned up
pub const CLOUD_PROVIDER_CLEANUP_FINALIZER: &str = "kubermatic.io/cleanup-cloud-provider";

/// Finalizer blocking cluster deletion until the control plane namespace is gone
pub const NAMESPACE_CLEANUP_FINALIZER: &str = "kubermatic.io/cleanup-namespace";

/// Finalizer placed on Projects and UserProjectBindings by the RBAC controllers
pub const RBAC_CLEANUP_FINALIZER: &str = "kubermatic.io/controller-manager-rbac-cleanup";

/// Namespace holding service-account token Secrets on the master cluster
pub const SA_SECRETS_NAMESPACE: &str = "kubermatic";

/// Name prefix marking User objects that represent service accounts
pub const SERVICE_ACCOUNT_USER_PREFIX: &str = "serviceaccount-";

/// Name prefix of Secrets carrying service-account tokens
pub const SA_SECRET_PREFIX: &str = "sa-token-";

/// Returns the control plane namespace for a cluster.
///
/// The mapping is deterministic and never changes for the lifetime of the
/// cluster; everything the controllers create for a tenant cluster lives in
/// this namespace.
pub fn namespace_name(cluster_name: &str) -> String {
    format!("cluster-{cluster_name}")
}
