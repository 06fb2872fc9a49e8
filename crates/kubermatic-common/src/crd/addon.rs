//! Addon Custom Resource Definition
//!
//! Addons live in the cluster namespace on the seed and describe optional
//! components deployed into the tenant cluster. Project members see them
//! through namespace-scoped RBAC generated by the resource controller.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for an Addon
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubermatic.k8s.io",
    version = "v1",
    kind = "Addon",
    plural = "addons",
    status = "AddonStatus",
    namespaced,
    printcolumn = r#"{"name":"Addon","type":"string","jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.cluster.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AddonSpec {
    /// Name of the addon to deploy, e.g. "canal" or "dashboard"
    #[serde(default)]
    pub name: String,
    /// The cluster this addon belongs to
    #[serde(default)]
    pub cluster: ClusterReference,
    /// Free-form values templated into the addon manifests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<serde_json::Value>,
}

/// Reference to the owning cluster object
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterReference {
    /// Name of the Cluster object
    #[serde(default)]
    pub name: String,
    /// UID of the Cluster object, guards against name reuse
    #[serde(default)]
    pub uid: String,
}

/// Status for an Addon
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AddonStatus {
    /// When the addon manifests last applied successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deployed: Option<DateTime<Utc>>,
}
