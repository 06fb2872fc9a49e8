//! Project and UserProjectBinding Custom Resource Definitions
//!
//! A Project groups clusters, SSH keys, and members for multi-tenant
//! isolation. Membership is expressed via UserProjectBinding objects that
//! bind a user email to a project with one of the well-known groups.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Life cycle phase of a project
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ProjectPhase {
    /// Created but RBAC for it has not been synthesized yet
    #[default]
    Inactive,
    /// RBAC is in place, the project is usable
    Active,
    /// Being cleaned up
    Terminating,
}

impl std::fmt::Display for ProjectPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inactive => write!(f, "Inactive"),
            Self::Active => write!(f, "Active"),
            Self::Terminating => write!(f, "Terminating"),
        }
    }
}

/// Specification for a Project
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubermatic.k8s.io",
    version = "v1",
    kind = "Project",
    plural = "projects",
    status = "ProjectStatus",
    namespaced = false,
    printcolumn = r#"{"name":"HumanReadableName","type":"string","jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    /// Human-readable project name chosen by the user
    #[serde(default)]
    pub name: String,
}

/// Status for a Project
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectStatus {
    /// Current phase of the project
    #[serde(default)]
    pub phase: ProjectPhase,
}

impl Project {
    /// True once RBAC for this project has been synthesized
    pub fn is_active(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.phase == ProjectPhase::Active)
            .unwrap_or(false)
    }
}

/// Specification for a UserProjectBinding
///
/// Binds one user (by email) to one project with a group. The binding
/// carries an OwnerReference to its project so that project deletion
/// garbage-collects memberships.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubermatic.k8s.io",
    version = "v1",
    kind = "UserProjectBinding",
    plural = "userprojectbindings",
    namespaced = false,
    printcolumn = r#"{"name":"Project","type":"string","jsonPath":".spec.projectID"}"#,
    printcolumn = r#"{"name":"Group","type":"string","jsonPath":".spec.group"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UserProjectBindingSpec {
    /// Email of the bound user
    #[serde(default)]
    pub user_email: String,
    /// Name of the bound project
    #[serde(rename = "projectID", default)]
    pub project_id: String,
    /// Actual group name, `<prefix>-<projectID>`
    #[serde(default)]
    pub group: String,
}
