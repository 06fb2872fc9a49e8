//! One-time adoption of pre-project SSH keys.
//!
//! Keys created before projects existed carry only the hashed id of the
//! user who uploaded them. This walks every key, finds that user, picks
//! the project the user belongs to and stamps the key with a Project
//! owner reference so the RBAC controllers start covering it. Keys
//! already owned by a project are left untouched, which makes the run
//! safe to repeat.

use kube::ResourceExt;
use tracing::{debug, info, warn};

use kubermatic_common::crd::{User, UserProjectBinding};
use kubermatic_common::{Result, KUBERMATIC_API_VERSION};

use crate::client::MasterServices;
use crate::mapper;
use crate::resource_controller::{resolve_owning_project, OwnerResolution};

/// Tally of one migration run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Keys inspected.
    pub examined: usize,
    /// Keys that received an owner reference, or would have in a dry run.
    pub migrated: usize,
    /// Keys left alone.
    pub skipped: usize,
}

/// Stamp every adoptable SSH key with its project owner reference.
pub async fn migrate_ssh_keys(master: &MasterServices, dry_run: bool) -> Result<MigrationReport> {
    let keys = master.ssh_keys.list().await?;
    let users = master.users.list().await?;
    let bindings = master.bindings.list().await?;

    let mut report = MigrationReport::default();
    for key in keys {
        report.examined += 1;
        let name = key.name_any();

        if let OwnerResolution::Resolved(project) = resolve_owning_project(&key) {
            debug!(ssh_key = %name, project = %project, "key already belongs to a project");
            report.skipped += 1;
            continue;
        }

        if key.spec.owner.is_empty() {
            warn!(ssh_key = %name, "key names no owner, cannot migrate");
            report.skipped += 1;
            continue;
        }

        let Some(user) = users.iter().find(|user| user.spec.id == key.spec.owner) else {
            warn!(
                ssh_key = %name,
                owner = %key.spec.owner,
                "owning user does not exist, cannot migrate"
            );
            report.skipped += 1;
            continue;
        };

        let Some(project_name) = project_of(user, &bindings) else {
            warn!(
                ssh_key = %name,
                user = %user.name_any(),
                "user belongs to no project, cannot migrate"
            );
            report.skipped += 1;
            continue;
        };

        let Some(project) = master.projects.get(&project_name).await? else {
            warn!(
                ssh_key = %name,
                project = %project_name,
                "owning project does not exist, cannot migrate"
            );
            report.skipped += 1;
            continue;
        };

        if dry_run {
            info!(ssh_key = %name, project = %project_name, "dry run, key was not migrated");
            report.migrated += 1;
            continue;
        }

        let mut updated = key.clone();
        updated
            .metadata
            .owner_references
            .get_or_insert_with(Vec::new)
            .push(mapper::owner_ref(
                KUBERMATIC_API_VERSION,
                "Project",
                &project_name,
                project.metadata.uid.as_deref().unwrap_or_default(),
            ));
        master.ssh_keys.update(&updated).await?;
        info!(ssh_key = %name, project = %project_name, "key adopted by its project");
        report.migrated += 1;
    }

    Ok(report)
}

/// The project a user belongs to: the first membership on the user object,
/// with the membership bindings as fallback for users whose spec was never
/// backfilled. Owner memberships win over weaker ones.
fn project_of(user: &User, bindings: &[UserProjectBinding]) -> Option<String> {
    if let Some(membership) = user.spec.projects.first() {
        return Some(membership.name.clone());
    }

    let mut fallback = None;
    for binding in bindings {
        if !binding.spec.user_email.eq_ignore_ascii_case(&user.spec.email) {
            continue;
        }
        if mapper::group_prefix(&binding.spec.group) == mapper::OWNER_GROUP_PREFIX {
            return Some(binding.spec.project_id.clone());
        }
        fallback.get_or_insert_with(|| binding.spec.project_id.clone());
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use kubermatic_common::crd::{
        Project, ProjectGroup, ProjectSpec, UserProjectBindingSpec, UserSSHKey, UserSSHKeySpec,
        UserSpec,
    };
    use kubermatic_common::PROJECT_ID_LABEL_KEY;

    use crate::client::{BindingClient, ProjectClient, RbacStore, SshKeyClient, UserClient};
    use crate::testing::{MemoryBindings, MemoryProjects, MemoryRbac, MemorySshKeys, MemoryUsers};

    struct Harness {
        projects: Arc<MemoryProjects>,
        users: Arc<MemoryUsers>,
        bindings: Arc<MemoryBindings>,
        ssh_keys: Arc<MemorySshKeys>,
    }

    impl Harness {
        fn new() -> Self {
            let harness = Self {
                projects: Arc::new(MemoryProjects::default()),
                users: Arc::new(MemoryUsers::default()),
                bindings: Arc::new(MemoryBindings::default()),
                ssh_keys: Arc::new(MemorySshKeys::default()),
            };
            harness.projects.insert(thunderball());
            harness.users.insert(james());
            harness
        }

        fn master(&self) -> MasterServices {
            MasterServices {
                projects: self.projects.clone() as Arc<dyn ProjectClient>,
                users: self.users.clone() as Arc<dyn UserClient>,
                bindings: self.bindings.clone() as Arc<dyn BindingClient>,
                ssh_keys: self.ssh_keys.clone() as Arc<dyn SshKeyClient>,
                rbac: Arc::new(MemoryRbac::default()) as Arc<dyn RbacStore>,
            }
        }
    }

    fn thunderball() -> Project {
        let mut project = Project::new(
            "thunderball",
            ProjectSpec {
                name: "Operation Thunderball".to_string(),
            },
        );
        project.metadata.uid = Some("376d21ae-f5a2-4c4d-b930-5db030e6f7c8".to_string());
        project
    }

    fn james() -> User {
        User::new(
            "james",
            UserSpec {
                id: "h4sh3d".to_string(),
                name: "James Bond".to_string(),
                email: "james@kubermatic.io".to_string(),
                projects: vec![ProjectGroup {
                    name: "thunderball".to_string(),
                    group: "owners-thunderball".to_string(),
                }],
            },
        )
    }

    fn legacy_key(name: &str) -> UserSSHKey {
        UserSSHKey::new(
            name,
            UserSSHKeySpec {
                owner: "h4sh3d".to_string(),
                name: "work laptop".to_string(),
                fingerprint: "b7:2f:a3:...".to_string(),
                public_key: "ssh-rsa AAAAB3Nza...".to_string(),
                clusters: Vec::new(),
            },
        )
    }

    #[tokio::test]
    async fn test_legacy_keys_are_adopted_exactly_once() {
        let harness = Harness::new();
        harness.ssh_keys.insert(legacy_key("key-abc123"));

        let report = migrate_ssh_keys(&harness.master(), false).await.unwrap();
        assert_eq!(
            report,
            MigrationReport {
                examined: 1,
                migrated: 1,
                skipped: 0,
            }
        );

        let key = harness.ssh_keys.stored("key-abc123").unwrap();
        let refs = key.metadata.owner_references.as_deref().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].kind, "Project");
        assert_eq!(refs[0].name, "thunderball");
        assert_eq!(refs[0].uid, "376d21ae-f5a2-4c4d-b930-5db030e6f7c8");

        // A second run recognizes the owner reference and writes nothing.
        let report = migrate_ssh_keys(&harness.master(), false).await.unwrap();
        assert_eq!(
            report,
            MigrationReport {
                examined: 1,
                migrated: 0,
                skipped: 1,
            }
        );
        assert_eq!(harness.ssh_keys.writes(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_changes_nothing() {
        let harness = Harness::new();
        harness.ssh_keys.insert(legacy_key("key-abc123"));

        let report = migrate_ssh_keys(&harness.master(), true).await.unwrap();
        assert_eq!(report.migrated, 1);
        assert_eq!(harness.ssh_keys.writes(), 0);

        let key = harness.ssh_keys.stored("key-abc123").unwrap();
        assert!(key.metadata.owner_references.is_none());
    }

    #[tokio::test]
    async fn test_membership_bindings_back_fill_the_project() {
        let harness = Harness::new();
        let mut drifted = james();
        drifted.spec.projects.clear();
        harness.users.insert(drifted);

        harness.bindings.insert(UserProjectBinding::new(
            "member-1",
            UserProjectBindingSpec {
                user_email: "James@Kubermatic.IO".to_string(),
                project_id: "goldfinger".to_string(),
                group: "editors-goldfinger".to_string(),
            },
        ));
        harness.bindings.insert(UserProjectBinding::new(
            "member-2",
            UserProjectBindingSpec {
                user_email: "james@kubermatic.io".to_string(),
                project_id: "thunderball".to_string(),
                group: "owners-thunderball".to_string(),
            },
        ));
        harness.ssh_keys.insert(legacy_key("key-abc123"));

        migrate_ssh_keys(&harness.master(), false).await.unwrap();

        // The owner membership wins over the editor one listed first.
        let key = harness.ssh_keys.stored("key-abc123").unwrap();
        assert_eq!(
            key.metadata.owner_references.as_deref().unwrap()[0].name,
            "thunderball"
        );
    }

    #[tokio::test]
    async fn test_keys_without_a_resolvable_owner_are_skipped() {
        let harness = Harness::new();

        let mut anonymous = legacy_key("key-anonymous");
        anonymous.spec.owner = String::new();
        harness.ssh_keys.insert(anonymous);

        let mut stranger = legacy_key("key-stranger");
        stranger.spec.owner = "unknown-id".to_string();
        harness.ssh_keys.insert(stranger);

        let report = migrate_ssh_keys(&harness.master(), false).await.unwrap();
        assert_eq!(
            report,
            MigrationReport {
                examined: 2,
                migrated: 0,
                skipped: 2,
            }
        );
        assert_eq!(harness.ssh_keys.writes(), 0);
    }

    #[tokio::test]
    async fn test_labeled_keys_count_as_already_owned() {
        let harness = Harness::new();
        let mut labeled = legacy_key("key-labeled");
        labeled.metadata.labels = Some(BTreeMap::from([(
            PROJECT_ID_LABEL_KEY.to_string(),
            "thunderball".to_string(),
        )]));
        harness.ssh_keys.insert(labeled);

        let report = migrate_ssh_keys(&harness.master(), false).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(harness.ssh_keys.writes(), 0);
    }
}
