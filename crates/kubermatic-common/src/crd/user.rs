//! User Custom Resource Definition
//!
//! Users are identities known to the platform. Service accounts are Users
//! whose object name carries the `serviceaccount-` prefix; they get a
//! restricted RBAC treatment.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a User
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubermatic.k8s.io",
    version = "v1",
    kind = "User",
    plural = "users",
    namespaced = false,
    printcolumn = r#"{"name":"Email","type":"string","jsonPath":".spec.email"}"#,
    printcolumn = r#"{"name":"Name","type":"string","jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    /// Stable identifier derived from the email address
    #[serde(default)]
    pub id: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Email address, the primary key for bindings
    #[serde(default)]
    pub email: String,
    /// Per-project group memberships
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub projects: Vec<ProjectGroup>,
}

/// One project membership of a user
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectGroup {
    /// Name of the project
    #[serde(default)]
    pub name: String,
    /// Actual group name, `<prefix>-<projectName>`
    #[serde(default)]
    pub group: String,
}

impl User {
    /// True for service-account users, identified by their name prefix
    pub fn is_service_account(&self) -> bool {
        self.metadata
            .name
            .as_deref()
            .map(|n| n.starts_with(crate::SERVICE_ACCOUNT_USER_PREFIX))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_account_detection_by_name_prefix() {
        let mut user = User::new("bob", UserSpec::default());
        assert!(!user.is_service_account());

        user.metadata.name = Some("serviceaccount-7f2k9".to_string());
        assert!(user.is_service_account());
    }
}
