//! Group naming and verb policy for project RBAC.
//!
//! Every project carries three well-known groups, `owners-<project>`,
//! `editors-<project>` and `viewers-<project>`. This module maps a group
//! and a resource kind to the Kubernetes RBAC objects expressing what that
//! group may do. Verb functions return `Ok(None)` when a group gets no
//! access at all, in which case no role or binding is generated; an unknown
//! group name is an error so that a typo never silently widens access.

use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};

use kubermatic_common::kube_utils::pluralize_kind;
use kubermatic_common::{Error, Result, SA_SECRETS_NAMESPACE};

/// Group prefix for project owners.
pub const OWNER_GROUP_PREFIX: &str = "owners";
/// Group prefix for project editors.
pub const EDITOR_GROUP_PREFIX: &str = "editors";
/// Group prefix for project viewers.
pub const VIEWER_GROUP_PREFIX: &str = "viewers";

/// Every group prefix a project carries.
pub const ALL_GROUP_PREFIXES: [&str; 3] =
    [OWNER_GROUP_PREFIX, EDITOR_GROUP_PREFIX, VIEWER_GROUP_PREFIX];

/// Name prefix for all generated RBAC objects.
pub const RBAC_NAME_PREFIX: &str = "kubermatic";

/// API group of the RBAC resources themselves.
const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Full group name for a project, `<prefix>-<project>`.
pub fn group_name(project: &str, prefix: &str) -> String {
    format!("{}-{}", prefix, project)
}

/// The prefix part of a full group name, everything before the first `-`.
pub fn group_prefix(group: &str) -> &str {
    match group.find('-') {
        Some(index) => &group[..index],
        None => group,
    }
}

/// Name of a role or binding scoped to one named resource,
/// `kubermatic:<kind>-<name>:<group>`.
pub fn named_rbac_name(kind: &str, resource_name: &str, group: &str) -> String {
    format!(
        "{}:{}-{}:{}",
        RBAC_NAME_PREFIX,
        kind.to_lowercase(),
        resource_name,
        group
    )
}

/// Name of a role or binding covering a whole resource collection,
/// `kubermatic:<resource>:<prefix>`.
pub fn collection_rbac_name(resource: &str, prefix: &str) -> String {
    format!("{}:{}:{}", RBAC_NAME_PREFIX, resource, prefix)
}

/// Name of a role or binding inside a cluster namespace,
/// `kubermatic:<kind>:<prefix>`.
pub fn cluster_namespace_rbac_name(kind: &str, prefix: &str) -> String {
    format!("{}:{}:{}", RBAC_NAME_PREFIX, kind.to_lowercase(), prefix)
}

/// Owner reference pointing at the resource a role or binding is derived
/// from, so garbage collection removes generated objects with it.
pub fn owner_ref(api_version: &str, kind: &str, name: &str, uid: &str) -> OwnerReference {
    OwnerReference {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        uid: uid.to_string(),
        ..Default::default()
    }
}

/// Group subject for a binding.
pub fn group_subject(group: &str) -> Subject {
    Subject {
        api_group: Some(RBAC_API_GROUP.to_string()),
        kind: "Group".to_string(),
        name: group.to_string(),
        namespace: None,
    }
}

fn unknown_group(group: &str) -> Error {
    Error::internal_with_context("rbac_mapper", format!("unknown group name {:?}", group))
}

/// Verbs a group gets on one named resource.
///
/// Owners hold the full set. Editors cannot delete a project and cannot
/// touch memberships or service accounts at all; viewers only read and are
/// shut out of memberships and service accounts the same way.
pub fn verbs_for_named_resource(
    group: &str,
    kind: &str,
) -> Result<Option<&'static [&'static str]>> {
    if group.starts_with(OWNER_GROUP_PREFIX) {
        return Ok(Some(&["get", "update", "delete"]));
    }

    if group.starts_with(EDITOR_GROUP_PREFIX) {
        return Ok(match kind {
            "Project" => Some(&["get", "update"]),
            "UserProjectBinding" | "User" => None,
            _ => Some(&["get", "update", "delete"]),
        });
    }

    if group.starts_with(VIEWER_GROUP_PREFIX) {
        return Ok(match kind {
            "UserProjectBinding" | "User" => None,
            _ => Some(&["get"]),
        });
    }

    Err(unknown_group(group))
}

/// Verbs a group gets on a resource collection.
///
/// Creation of memberships and service accounts is reserved to owners;
/// everything else owners and editors may create and viewers may not.
pub fn verbs_for_collection(group: &str, kind: &str) -> Result<Option<&'static [&'static str]>> {
    if kind == "UserProjectBinding" || kind == "User" {
        if group.starts_with(OWNER_GROUP_PREFIX) {
            return Ok(Some(&["create"]));
        }
        if group.starts_with(EDITOR_GROUP_PREFIX) || group.starts_with(VIEWER_GROUP_PREFIX) {
            return Ok(None);
        }
        return Err(unknown_group(group));
    }

    if group.starts_with(OWNER_GROUP_PREFIX) || group.starts_with(EDITOR_GROUP_PREFIX) {
        return Ok(Some(&["create"]));
    }
    if group.starts_with(VIEWER_GROUP_PREFIX) {
        return Ok(None);
    }

    Err(unknown_group(group))
}

/// Verbs a group gets on a namespaced resource collection.
///
/// Only the service account token namespace is mapped, and only owners may
/// create there. Any other namespace is a programming error.
pub fn verbs_for_namespaced_collection(
    group: &str,
    namespace: &str,
) -> Result<Option<&'static [&'static str]>> {
    if namespace == SA_SECRETS_NAMESPACE {
        if group.starts_with(OWNER_GROUP_PREFIX) {
            return Ok(Some(&["create"]));
        }
        if group.starts_with(EDITOR_GROUP_PREFIX) || group.starts_with(VIEWER_GROUP_PREFIX) {
            return Ok(None);
        }
    }

    Err(Error::internal_with_context(
        "rbac_mapper",
        format!(
            "no verbs mapped for group {:?} in namespace {:?}",
            group, namespace
        ),
    ))
}

/// Verbs a group gets on one named resource inside a namespace.
///
/// Mirrors [`verbs_for_namespaced_collection`]: owners manage the token
/// secrets in the service account namespace, nobody else gets anything.
pub fn verbs_for_named_resource_in_namespace(
    group: &str,
    kind: &str,
    namespace: &str,
) -> Result<Option<&'static [&'static str]>> {
    if namespace == SA_SECRETS_NAMESPACE {
        if group.starts_with(OWNER_GROUP_PREFIX) && kind == "Secret" {
            return Ok(Some(&["get", "update", "delete"]));
        }
        if group.starts_with(EDITOR_GROUP_PREFIX) || group.starts_with(VIEWER_GROUP_PREFIX) {
            return Ok(None);
        }
    }

    Err(Error::internal_with_context(
        "rbac_mapper",
        format!(
            "no verbs mapped for group {:?}, kind {:?} in namespace {:?}",
            group, kind, namespace
        ),
    ))
}

/// Verbs a group gets on resources living in a cluster namespace.
///
/// Owners and editors manage addons of their clusters, viewers may list
/// and read them.
pub fn verbs_for_cluster_namespace_resource(
    group: &str,
) -> Result<Option<&'static [&'static str]>> {
    if group.starts_with(VIEWER_GROUP_PREFIX) {
        return Ok(Some(&["get", "list"]));
    }
    if group.starts_with(OWNER_GROUP_PREFIX) || group.starts_with(EDITOR_GROUP_PREFIX) {
        return Ok(Some(&["get", "list", "create", "update", "delete"]));
    }

    Err(unknown_group(group))
}

fn policy_rule(
    api_group: &str,
    resource: &str,
    resource_name: Option<&str>,
    verbs: &[&str],
) -> PolicyRule {
    PolicyRule {
        api_groups: Some(vec![api_group.to_string()]),
        resources: Some(vec![resource.to_string()]),
        resource_names: resource_name.map(|name| vec![name.to_string()]),
        verbs: verbs.iter().map(|v| (*v).to_string()).collect(),
        ..Default::default()
    }
}

fn role_ref(kind: &str, name: &str) -> RoleRef {
    RoleRef {
        api_group: RBAC_API_GROUP.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

/// ClusterRole granting a group its verbs on one named cluster-scoped
/// resource, `None` when the group gets no access.
pub fn named_cluster_role(
    group: &str,
    kind: &str,
    api_group: &str,
    resource_name: &str,
    owner: OwnerReference,
) -> Result<Option<ClusterRole>> {
    let Some(verbs) = verbs_for_named_resource(group, kind)? else {
        return Ok(None);
    };

    Ok(Some(ClusterRole {
        metadata: ObjectMeta {
            name: Some(named_rbac_name(kind, resource_name, group)),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        rules: Some(vec![policy_rule(
            api_group,
            &pluralize_kind(kind),
            Some(resource_name),
            verbs,
        )]),
        ..Default::default()
    }))
}

/// ClusterRoleBinding tying a group to its named-resource ClusterRole.
pub fn named_cluster_role_binding(
    group: &str,
    kind: &str,
    resource_name: &str,
    owner: OwnerReference,
) -> ClusterRoleBinding {
    let name = named_rbac_name(kind, resource_name, group);
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        role_ref: role_ref("ClusterRole", &name),
        subjects: Some(vec![group_subject(group)]),
    }
}

/// ClusterRole granting a group prefix its verbs on a whole collection,
/// `None` when the prefix gets no access.
///
/// Collection objects are shared by every project, so they carry no owner
/// reference and survive project deletion.
pub fn collection_cluster_role(
    prefix: &str,
    kind: &str,
    api_group: &str,
) -> Result<Option<ClusterRole>> {
    let Some(verbs) = verbs_for_collection(prefix, kind)? else {
        return Ok(None);
    };

    let resource = pluralize_kind(kind);
    Ok(Some(ClusterRole {
        metadata: ObjectMeta {
            name: Some(collection_rbac_name(&resource, prefix)),
            ..Default::default()
        },
        rules: Some(vec![policy_rule(api_group, &resource, None, verbs)]),
        ..Default::default()
    }))
}

/// ClusterRoleBinding tying one project's group to the shared collection
/// ClusterRole. The ensure step appends the subject to any existing ones.
pub fn collection_cluster_role_binding(group: &str, kind: &str) -> ClusterRoleBinding {
    let name = collection_rbac_name(&pluralize_kind(kind), group_prefix(group));
    ClusterRoleBinding {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            ..Default::default()
        },
        role_ref: role_ref("ClusterRole", &name),
        subjects: Some(vec![group_subject(group)]),
    }
}

/// Role granting a group its verbs on one named resource in a namespace,
/// `None` when the group gets no access.
pub fn named_role(
    group: &str,
    kind: &str,
    api_group: &str,
    resource_name: &str,
    namespace: &str,
    owner: OwnerReference,
) -> Result<Option<Role>> {
    let Some(verbs) = verbs_for_named_resource_in_namespace(group, kind, namespace)? else {
        return Ok(None);
    };

    Ok(Some(Role {
        metadata: ObjectMeta {
            name: Some(named_rbac_name(kind, resource_name, group)),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        rules: Some(vec![policy_rule(
            api_group,
            &pluralize_kind(kind),
            Some(resource_name),
            verbs,
        )]),
    }))
}

/// RoleBinding tying a group to its named-resource Role.
pub fn named_role_binding(
    group: &str,
    kind: &str,
    resource_name: &str,
    namespace: &str,
    owner: OwnerReference,
) -> RoleBinding {
    let name = named_rbac_name(kind, resource_name, group);
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        role_ref: role_ref("Role", &name),
        subjects: Some(vec![group_subject(group)]),
    }
}

/// Role granting a group prefix its verbs on a namespaced collection,
/// `None` when the prefix gets no access.
pub fn collection_role(
    prefix: &str,
    kind: &str,
    api_group: &str,
    namespace: &str,
) -> Result<Option<Role>> {
    let Some(verbs) = verbs_for_namespaced_collection(prefix, namespace)? else {
        return Ok(None);
    };

    let resource = pluralize_kind(kind);
    Ok(Some(Role {
        metadata: ObjectMeta {
            name: Some(collection_rbac_name(&resource, prefix)),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        rules: Some(vec![policy_rule(api_group, &resource, None, verbs)]),
    }))
}

/// RoleBinding tying one project's group to the shared namespaced
/// collection Role. The ensure step appends the subject.
pub fn collection_role_binding(group: &str, kind: &str, namespace: &str) -> RoleBinding {
    let name = collection_rbac_name(&pluralize_kind(kind), group_prefix(group));
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        role_ref: role_ref("Role", &name),
        subjects: Some(vec![group_subject(group)]),
    }
}

/// Role granting a group its verbs on a resource kind inside a cluster
/// namespace, `None` when the group gets no access.
///
/// These live and die with the cluster namespace, so no owner reference.
pub fn cluster_namespace_role(
    group: &str,
    kind: &str,
    api_group: &str,
    namespace: &str,
) -> Result<Option<Role>> {
    let Some(verbs) = verbs_for_cluster_namespace_resource(group)? else {
        return Ok(None);
    };

    Ok(Some(Role {
        metadata: ObjectMeta {
            name: Some(cluster_namespace_rbac_name(kind, group_prefix(group))),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        rules: Some(vec![policy_rule(
            api_group,
            &pluralize_kind(kind),
            None,
            verbs,
        )]),
    }))
}

/// RoleBinding tying a group to its cluster-namespace Role.
pub fn cluster_namespace_role_binding(group: &str, kind: &str, namespace: &str) -> RoleBinding {
    let name = cluster_namespace_rbac_name(kind, group_prefix(group));
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        role_ref: role_ref("Role", &name),
        subjects: Some(vec![group_subject(group)]),
    }
}
