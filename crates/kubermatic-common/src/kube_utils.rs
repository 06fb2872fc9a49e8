//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction with sane timeouts, finalizer handling via merge
//! patch, status sub-resource patching, and owner-reference lookup. These
//! are the primitives every controller in this workspace builds on.

use std::path::Path;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};

use crate::Error;

/// Default connection timeout for kube clients (5s is plenty for local API server)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            let mut config =
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| {
                        Error::internal_with_context(
                            "create_client",
                            format!("failed to load kubeconfig: {}", e),
                        )
                    })?;
            config.connect_timeout = Some(connect_timeout);
            config.read_timeout = Some(read_timeout);
            Client::try_from(config).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to create client: {}", e),
                )
            })
        }
        None => {
            let mut config = Config::infer().await.map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to infer config: {}", e),
                )
            })?;
            config.connect_timeout = Some(connect_timeout);
            config.read_timeout = Some(read_timeout);
            Client::try_from(config).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to create client: {}", e),
                )
            })
        }
    }
}

// =============================================================================
// Finalizers
// =============================================================================

/// True if the object carries the given finalizer
pub fn has_finalizer<T: ResourceExt>(obj: &T, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Add a finalizer to the object if not already present.
///
/// JSON merge patch replaces the whole finalizer array, so the new list is
/// computed from the object the caller just read. Returns the patched object,
/// or a clone of the input when the finalizer was already there.
pub async fn ensure_finalizer<T>(api: &Api<T>, obj: &T, finalizer: &str) -> Result<T, kube::Error>
where
    T: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    if has_finalizer(obj, finalizer) {
        return Ok(obj.clone());
    }
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
}

/// Remove a finalizer from the object if present.
///
/// Returns the patched object, or a clone of the input when the finalizer
/// was not there.
pub async fn remove_finalizer<T>(api: &Api<T>, obj: &T, finalizer: &str) -> Result<T, kube::Error>
where
    T: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    if !has_finalizer(obj, finalizer) {
        return Ok(obj.clone());
    }
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect();
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(&obj.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await
}

// =============================================================================
// Owner references
// =============================================================================

/// Find the first owner reference of the given kind within our API group.
///
/// First match wins; Kubernetes permits multiple owners but resources in
/// this workspace are owned by at most one object of any given kind.
pub fn find_owner<'a>(refs: &'a [OwnerReference], kind: &str) -> Option<&'a OwnerReference> {
    refs.iter()
        .find(|r| r.api_version == crate::KUBERMATIC_API_VERSION && r.kind == kind)
}

// =============================================================================
// Status patching
// =============================================================================

/// Patch the status sub-resource of a cluster-scoped Kubernetes resource.
///
/// Serializes `status` into `{ "status": <status> }` and applies it via
/// merge-patch. This is the standard pattern used by all controllers here.
///
/// Returns `kube::Error` so callers can map to their own error type.
pub async fn patch_cluster_resource_status<T>(
    client: &Client,
    name: &str,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> std::result::Result<(), kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::ClusterResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::all(client.clone());
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

// =============================================================================
// Object keys and resource names
// =============================================================================

/// Queue key for an object: `namespace/name`, or just `name` when cluster-scoped
pub fn object_key<T: ResourceExt>(obj: &T) -> String {
    match obj.namespace() {
        Some(ns) => format!("{}/{}", ns, obj.name_any()),
        None => obj.name_any(),
    }
}

/// Known irregular plurals, checked before the fallback rules.
///
/// `usersshkeies` is what the CRD registers; RBAC names must match it.
const KIND_PLURALS: &[(&str, &str)] = &[
    ("cluster", "clusters"),
    ("project", "projects"),
    ("user", "users"),
    ("userprojectbinding", "userprojectbindings"),
    ("usersshkey", "usersshkeies"),
    ("addon", "addons"),
    ("secret", "secrets"),
    ("configmap", "configmaps"),
];

/// Lowercase, pluralized resource name for a kind.
///
/// Looks up known kinds first, then falls back to standard English rules.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    for (singular, plural) in KIND_PLURALS {
        if *singular == lower {
            return (*plural).to_string();
        }
    }

    // Fallback: simple pluralization
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}
