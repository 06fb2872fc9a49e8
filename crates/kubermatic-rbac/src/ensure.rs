//! Convergence primitives for generated RBAC objects.
//!
//! Roles converge on their rules: an update replaces only the rules on a
//! copy of the live object, so labels added by operators survive. Bindings
//! converge on their subjects in two flavors. A binding scoped to one
//! resource owns its subject list outright and replaces it; collection
//! bindings are shared between projects, so a project only ever appends
//! its own group and cleanup strips exactly that group again.

use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding, Subject};
use kube::ResourceExt;
use tracing::info;

use kubermatic_common::Result;

use crate::client::RbacStore;

/// What a single ensure call did to the object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// Object did not exist and was created.
    Created,
    /// Object existed but drifted and was written back.
    Updated,
    /// Object already matched the desired state. Zero writes.
    Unchanged,
}

impl EnsureOutcome {
    /// Label for metrics and logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            EnsureOutcome::Created => "created",
            EnsureOutcome::Updated => "updated",
            EnsureOutcome::Unchanged => "unchanged",
        }
    }

    /// True when the call issued a write.
    pub fn wrote(&self) -> bool {
        !matches!(self, EnsureOutcome::Unchanged)
    }
}

/// Converge one ClusterRole on its rules.
pub async fn ensure_cluster_role(
    rbac: &dyn RbacStore,
    desired: &ClusterRole,
) -> Result<EnsureOutcome> {
    let name = desired.name_any();
    match rbac.get_cluster_role(&name).await? {
        None => {
            rbac.create_cluster_role(desired).await?;
            Ok(EnsureOutcome::Created)
        }
        Some(existing) if existing.rules == desired.rules => Ok(EnsureOutcome::Unchanged),
        Some(existing) => {
            info!(cluster_role = %name, "rules drifted, updating");
            let mut updated = existing;
            updated.rules = desired.rules.clone();
            rbac.update_cluster_role(&updated).await?;
            Ok(EnsureOutcome::Updated)
        }
    }
}

/// Converge one Role on its rules.
pub async fn ensure_role(
    rbac: &dyn RbacStore,
    namespace: &str,
    desired: &Role,
) -> Result<EnsureOutcome> {
    let name = desired.name_any();
    match rbac.get_role(namespace, &name).await? {
        None => {
            rbac.create_role(namespace, desired).await?;
            Ok(EnsureOutcome::Created)
        }
        Some(existing) if existing.rules == desired.rules => Ok(EnsureOutcome::Unchanged),
        Some(existing) => {
            info!(role = %name, namespace, "rules drifted, updating");
            let mut updated = existing;
            updated.rules = desired.rules.clone();
            rbac.update_role(namespace, &updated).await?;
            Ok(EnsureOutcome::Updated)
        }
    }
}

fn subjects_of(subjects: &Option<Vec<Subject>>) -> &[Subject] {
    subjects.as_deref().unwrap_or_default()
}

fn missing_subjects(existing: &Option<Vec<Subject>>, desired: &Option<Vec<Subject>>) -> Vec<Subject> {
    let have = subjects_of(existing);
    subjects_of(desired)
        .iter()
        .filter(|subject| !have.contains(subject))
        .cloned()
        .collect()
}

/// Converge a ClusterRoleBinding scoped to one resource. The desired
/// subject list replaces whatever is live.
pub async fn ensure_named_cluster_role_binding(
    rbac: &dyn RbacStore,
    desired: &ClusterRoleBinding,
) -> Result<EnsureOutcome> {
    let name = desired.name_any();
    match rbac.get_cluster_role_binding(&name).await? {
        None => {
            rbac.create_cluster_role_binding(desired).await?;
            Ok(EnsureOutcome::Created)
        }
        Some(existing) if existing.subjects == desired.subjects => Ok(EnsureOutcome::Unchanged),
        Some(existing) => {
            info!(cluster_role_binding = %name, "subjects drifted, updating");
            let mut updated = existing;
            updated.subjects = desired.subjects.clone();
            rbac.update_cluster_role_binding(&updated).await?;
            Ok(EnsureOutcome::Updated)
        }
    }
}

/// Converge a shared collection ClusterRoleBinding. Missing subjects are
/// appended, subjects of other projects are never touched.
pub async fn ensure_collection_cluster_role_binding(
    rbac: &dyn RbacStore,
    desired: &ClusterRoleBinding,
) -> Result<EnsureOutcome> {
    let name = desired.name_any();
    match rbac.get_cluster_role_binding(&name).await? {
        None => {
            rbac.create_cluster_role_binding(desired).await?;
            Ok(EnsureOutcome::Created)
        }
        Some(existing) => {
            let missing = missing_subjects(&existing.subjects, &desired.subjects);
            if missing.is_empty() {
                return Ok(EnsureOutcome::Unchanged);
            }
            let mut updated = existing;
            let mut subjects = updated.subjects.take().unwrap_or_default();
            subjects.extend(missing);
            updated.subjects = Some(subjects);
            rbac.update_cluster_role_binding(&updated).await?;
            Ok(EnsureOutcome::Updated)
        }
    }
}

/// Converge a RoleBinding scoped to one resource, replacing subjects.
pub async fn ensure_named_role_binding(
    rbac: &dyn RbacStore,
    namespace: &str,
    desired: &RoleBinding,
) -> Result<EnsureOutcome> {
    let name = desired.name_any();
    match rbac.get_role_binding(namespace, &name).await? {
        None => {
            rbac.create_role_binding(namespace, desired).await?;
            Ok(EnsureOutcome::Created)
        }
        Some(existing) if existing.subjects == desired.subjects => Ok(EnsureOutcome::Unchanged),
        Some(existing) => {
            info!(role_binding = %name, namespace, "subjects drifted, updating");
            let mut updated = existing;
            updated.subjects = desired.subjects.clone();
            rbac.update_role_binding(namespace, &updated).await?;
            Ok(EnsureOutcome::Updated)
        }
    }
}

/// Converge a shared namespaced collection RoleBinding, appending missing
/// subjects.
pub async fn ensure_collection_role_binding(
    rbac: &dyn RbacStore,
    namespace: &str,
    desired: &RoleBinding,
) -> Result<EnsureOutcome> {
    let name = desired.name_any();
    match rbac.get_role_binding(namespace, &name).await? {
        None => {
            rbac.create_role_binding(namespace, desired).await?;
            Ok(EnsureOutcome::Created)
        }
        Some(existing) => {
            let missing = missing_subjects(&existing.subjects, &desired.subjects);
            if missing.is_empty() {
                return Ok(EnsureOutcome::Unchanged);
            }
            let mut updated = existing;
            let mut subjects = updated.subjects.take().unwrap_or_default();
            subjects.extend(missing);
            updated.subjects = Some(subjects);
            rbac.update_role_binding(namespace, &updated).await?;
            Ok(EnsureOutcome::Updated)
        }
    }
}

fn without_group(subjects: &[Subject], group: &str) -> Vec<Subject> {
    subjects
        .iter()
        .filter(|subject| !(subject.kind == "Group" && subject.name == group))
        .cloned()
        .collect()
}

/// Remove one project group from a collection ClusterRoleBinding.
///
/// A missing binding counts as already clean, so cleanup stays idempotent
/// across partial failures. Returns whether a write happened.
pub async fn strip_cluster_role_binding_subject(
    rbac: &dyn RbacStore,
    name: &str,
    group: &str,
) -> Result<bool> {
    let Some(existing) = rbac.get_cluster_role_binding(name).await? else {
        return Ok(false);
    };

    let retained = without_group(subjects_of(&existing.subjects), group);
    if retained.len() == subjects_of(&existing.subjects).len() {
        return Ok(false);
    }

    info!(cluster_role_binding = %name, group, "removing group from subjects");
    let mut updated = existing;
    updated.subjects = Some(retained);
    rbac.update_cluster_role_binding(&updated).await?;
    Ok(true)
}

/// Remove one project group from a collection RoleBinding.
pub async fn strip_role_binding_subject(
    rbac: &dyn RbacStore,
    namespace: &str,
    name: &str,
    group: &str,
) -> Result<bool> {
    let Some(existing) = rbac.get_role_binding(namespace, name).await? else {
        return Ok(false);
    };

    let retained = without_group(subjects_of(&existing.subjects), group);
    if retained.len() == subjects_of(&existing.subjects).len() {
        return Ok(false);
    }

    info!(role_binding = %name, namespace, group, "removing group from subjects");
    let mut updated = existing;
    updated.subjects = Some(retained);
    rbac.update_role_binding(namespace, &updated).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockRbacStore;
    use crate::mapper;

    fn collection_binding(subjects: &[&str]) -> ClusterRoleBinding {
        let mut binding = mapper::collection_cluster_role_binding(subjects[0], "Cluster");
        binding.subjects = Some(subjects.iter().map(|g| mapper::group_subject(g)).collect());
        binding
    }

    // --- role convergence -------------------------------------------------

    #[tokio::test]
    async fn test_role_update_replaces_only_the_rules() {
        let owner = mapper::owner_ref("kubermatic.k8s.io/v1", "Project", "thunderball", "uid-1");
        let desired = mapper::named_cluster_role(
            "owners-thunderball",
            "Project",
            "kubermatic.k8s.io",
            "thunderball",
            owner,
        )
        .unwrap()
        .unwrap();

        // Live object carries stale rules and a label the controller does
        // not manage.
        let mut live = desired.clone();
        if let Some(rules) = live.rules.as_mut() {
            rules[0].verbs = vec!["get".to_string()];
        }
        live.metadata.labels = Some(std::collections::BTreeMap::from([(
            "added-by-operator".to_string(),
            "true".to_string(),
        )]));

        let mut rbac = MockRbacStore::new();
        rbac.expect_get_cluster_role()
            .times(1)
            .returning(move |_| Ok(Some(live.clone())));
        rbac.expect_update_cluster_role()
            .withf(|role| {
                role.rules.as_ref().map(|r| r[0].verbs.clone())
                    == Some(vec![
                        "get".to_string(),
                        "update".to_string(),
                        "delete".to_string(),
                    ])
                    && role.metadata.labels.is_some()
            })
            .times(1)
            .returning(|role| Ok(role.clone()));

        let outcome = ensure_cluster_role(&rbac, &desired).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Updated);
    }

    #[tokio::test]
    async fn test_matching_role_causes_zero_writes() {
        let owner = mapper::owner_ref("kubermatic.k8s.io/v1", "Project", "thunderball", "uid-1");
        let desired = mapper::named_cluster_role(
            "owners-thunderball",
            "Project",
            "kubermatic.k8s.io",
            "thunderball",
            owner,
        )
        .unwrap()
        .unwrap();
        let live = desired.clone();

        let mut rbac = MockRbacStore::new();
        rbac.expect_get_cluster_role()
            .times(1)
            .returning(move |_| Ok(Some(live.clone())));
        // no update expectation: a write would panic the mock

        let outcome = ensure_cluster_role(&rbac, &desired).await.unwrap();
        assert_eq!(outcome, EnsureOutcome::Unchanged);
    }

    // --- binding subjects -------------------------------------------------

    #[tokio::test]
    async fn test_collection_binding_appends_without_touching_other_projects() {
        let live = collection_binding(&["owners-thunderball"]);
        let desired = collection_binding(&["owners-goldfinger"]);

        let mut rbac = MockRbacStore::new();
        rbac.expect_get_cluster_role_binding()
            .withf(|name| name == "kubermatic:clusters:owners")
            .times(1)
            .returning(move |_| Ok(Some(live.clone())));
        rbac.expect_update_cluster_role_binding()
            .withf(|binding| {
                let names: Vec<&str> = binding
                    .subjects
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .map(|s| s.name.as_str())
                    .collect();
                names == ["owners-thunderball", "owners-goldfinger"]
            })
            .times(1)
            .returning(|binding| Ok(binding.clone()));

        let outcome = ensure_collection_cluster_role_binding(&rbac, &desired)
            .await
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::Updated);
    }

    #[tokio::test]
    async fn test_collection_binding_with_the_subject_present_is_unchanged() {
        let live = collection_binding(&["owners-thunderball", "owners-goldfinger"]);
        let desired = collection_binding(&["owners-goldfinger"]);

        let mut rbac = MockRbacStore::new();
        rbac.expect_get_cluster_role_binding()
            .times(1)
            .returning(move |_| Ok(Some(live.clone())));

        let outcome = ensure_collection_cluster_role_binding(&rbac, &desired)
            .await
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::Unchanged);
    }

    #[tokio::test]
    async fn test_named_binding_replaces_the_subject_list() {
        let owner = mapper::owner_ref("kubermatic.k8s.io/v1", "Project", "thunderball", "uid-1");
        let desired = mapper::named_cluster_role_binding(
            "owners-thunderball",
            "Project",
            "thunderball",
            owner,
        );

        let mut live = desired.clone();
        live.subjects = Some(vec![
            mapper::group_subject("owners-thunderball"),
            mapper::group_subject("stale-group"),
        ]);

        let mut rbac = MockRbacStore::new();
        rbac.expect_get_cluster_role_binding()
            .times(1)
            .returning(move |_| Ok(Some(live.clone())));
        rbac.expect_update_cluster_role_binding()
            .withf(|binding| {
                binding.subjects.as_deref().map(|s| s.len()) == Some(1)
                    && binding.subjects.as_deref().unwrap()[0].name == "owners-thunderball"
            })
            .times(1)
            .returning(|binding| Ok(binding.clone()));

        let outcome = ensure_named_cluster_role_binding(&rbac, &desired)
            .await
            .unwrap();
        assert_eq!(outcome, EnsureOutcome::Updated);
    }

    // --- cleanup ----------------------------------------------------------

    #[tokio::test]
    async fn test_strip_removes_exactly_one_group() {
        let live = collection_binding(&["owners-thunderball", "owners-goldfinger"]);

        let mut rbac = MockRbacStore::new();
        rbac.expect_get_cluster_role_binding()
            .times(1)
            .returning(move |_| Ok(Some(live.clone())));
        rbac.expect_update_cluster_role_binding()
            .withf(|binding| {
                let names: Vec<&str> = binding
                    .subjects
                    .as_deref()
                    .unwrap_or_default()
                    .iter()
                    .map(|s| s.name.as_str())
                    .collect();
                names == ["owners-goldfinger"]
            })
            .times(1)
            .returning(|binding| Ok(binding.clone()));

        let wrote = strip_cluster_role_binding_subject(
            &rbac,
            "kubermatic:clusters:owners",
            "owners-thunderball",
        )
        .await
        .unwrap();
        assert!(wrote);
    }

    #[tokio::test]
    async fn test_strip_of_a_missing_binding_is_a_no_op() {
        let mut rbac = MockRbacStore::new();
        rbac.expect_get_cluster_role_binding()
            .times(1)
            .returning(|_| Ok(None));

        let wrote = strip_cluster_role_binding_subject(
            &rbac,
            "kubermatic:clusters:owners",
            "owners-thunderball",
        )
        .await
        .unwrap();
        assert!(!wrote);
    }

    #[tokio::test]
    async fn test_strip_without_the_group_present_causes_zero_writes() {
        let live = collection_binding(&["owners-goldfinger"]);

        let mut rbac = MockRbacStore::new();
        rbac.expect_get_cluster_role_binding()
            .times(1)
            .returning(move |_| Ok(Some(live.clone())));

        let wrote = strip_cluster_role_binding_subject(
            &rbac,
            "kubermatic:clusters:owners",
            "owners-thunderball",
        )
        .await
        .unwrap();
        assert!(!wrote);
    }
}
