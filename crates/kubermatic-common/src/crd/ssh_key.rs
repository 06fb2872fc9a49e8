//! UserSSHKey Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification for a UserSSHKey
///
/// SSH keys belong to a project (via OwnerReference on the object) and are
/// pushed to the machines of the clusters listed in `clusters`.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubermatic.k8s.io",
    version = "v1",
    kind = "UserSSHKey",
    plural = "usersshkeies",
    status = "UserSSHKeyStatus",
    namespaced = false,
    printcolumn = r#"{"name":"HumanReadableName","type":"string","jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"Owner","type":"string","jsonPath":".spec.owner"}"#,
    printcolumn = r#"{"name":"Fingerprint","type":"string","jsonPath":".spec.fingerprint"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct UserSSHKeySpec {
    /// Name of the owning user. Superseded by the project OwnerReference
    /// once a key has been migrated.
    #[serde(default)]
    pub owner: String,
    /// Human-readable key name chosen by the user
    #[serde(default)]
    pub name: String,
    /// MD5 fingerprint of the public key
    #[serde(default)]
    pub fingerprint: String,
    /// The public key in authorized_keys format
    #[serde(default)]
    pub public_key: String,
    /// Names of the clusters this key is deployed to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub clusters: Vec<String>,
}

/// Status for a UserSSHKey, currently empty but reserved
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserSSHKeyStatus {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plural_uses_historical_spelling() {
        use kube::Resource;
        assert_eq!(UserSSHKey::plural(&()), "usersshkeies");
    }
}
