//! In-memory clients shared by the controller and migration tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::api::ObjectMeta;
use kube::ResourceExt;

use kubermatic_common::crd::{Project, User, UserProjectBinding, UserSSHKey};
use kubermatic_common::Result;

use crate::client::{BindingClient, ProjectClient, RbacStore, SshKeyClient, UserClient};
use crate::mapper;

/// [`RbacStore`] over hash maps, counting writes so tests can assert that
/// a converged state causes none.
#[derive(Default)]
pub(crate) struct MemoryRbac {
    cluster_roles: Mutex<HashMap<String, ClusterRole>>,
    cluster_role_bindings: Mutex<HashMap<String, ClusterRoleBinding>>,
    roles: Mutex<HashMap<String, Role>>,
    role_bindings: Mutex<HashMap<String, RoleBinding>>,
    writes: AtomicUsize,
}

impl MemoryRbac {
    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub(crate) fn cluster_role(&self, name: &str) -> Option<ClusterRole> {
        self.cluster_roles.lock().unwrap().get(name).cloned()
    }

    pub(crate) fn cluster_role_binding(&self, name: &str) -> Option<ClusterRoleBinding> {
        self.cluster_role_bindings.lock().unwrap().get(name).cloned()
    }

    pub(crate) fn role(&self, namespace: &str, name: &str) -> Option<Role> {
        self.roles
            .lock()
            .unwrap()
            .get(&format!("{}/{}", namespace, name))
            .cloned()
    }

    pub(crate) fn role_binding(&self, namespace: &str, name: &str) -> Option<RoleBinding> {
        self.role_bindings
            .lock()
            .unwrap()
            .get(&format!("{}/{}", namespace, name))
            .cloned()
    }

    /// Plant a ClusterRoleBinding with the given group subjects, bypassing
    /// the write counter.
    pub(crate) fn seed_cluster_role_binding(&self, name: &str, groups: &[&str]) {
        let binding = ClusterRoleBinding {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            subjects: Some(groups.iter().map(|g| mapper::group_subject(g)).collect()),
            ..Default::default()
        };
        self.cluster_role_bindings
            .lock()
            .unwrap()
            .insert(name.to_string(), binding);
    }
}

#[async_trait]
impl RbacStore for MemoryRbac {
    async fn get_cluster_role(&self, name: &str) -> Result<Option<ClusterRole>> {
        Ok(self.cluster_roles.lock().unwrap().get(name).cloned())
    }

    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.cluster_roles
            .lock()
            .unwrap()
            .insert(role.name_any(), role.clone());
        Ok(role.clone())
    }

    async fn update_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.cluster_roles
            .lock()
            .unwrap()
            .insert(role.name_any(), role.clone());
        Ok(role.clone())
    }

    async fn get_cluster_role_binding(&self, name: &str) -> Result<Option<ClusterRoleBinding>> {
        Ok(self.cluster_role_bindings.lock().unwrap().get(name).cloned())
    }

    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.cluster_role_bindings
            .lock()
            .unwrap()
            .insert(binding.name_any(), binding.clone());
        Ok(binding.clone())
    }

    async fn update_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.cluster_role_bindings
            .lock()
            .unwrap()
            .insert(binding.name_any(), binding.clone());
        Ok(binding.clone())
    }

    async fn get_role(&self, namespace: &str, name: &str) -> Result<Option<Role>> {
        Ok(self
            .roles
            .lock()
            .unwrap()
            .get(&format!("{}/{}", namespace, name))
            .cloned())
    }

    async fn create_role(&self, namespace: &str, role: &Role) -> Result<Role> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.roles
            .lock()
            .unwrap()
            .insert(format!("{}/{}", namespace, role.name_any()), role.clone());
        Ok(role.clone())
    }

    async fn update_role(&self, namespace: &str, role: &Role) -> Result<Role> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.roles
            .lock()
            .unwrap()
            .insert(format!("{}/{}", namespace, role.name_any()), role.clone());
        Ok(role.clone())
    }

    async fn get_role_binding(&self, namespace: &str, name: &str) -> Result<Option<RoleBinding>> {
        Ok(self
            .role_bindings
            .lock()
            .unwrap()
            .get(&format!("{}/{}", namespace, name))
            .cloned())
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<RoleBinding> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.role_bindings.lock().unwrap().insert(
            format!("{}/{}", namespace, binding.name_any()),
            binding.clone(),
        );
        Ok(binding.clone())
    }

    async fn update_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<RoleBinding> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.role_bindings.lock().unwrap().insert(
            format!("{}/{}", namespace, binding.name_any()),
            binding.clone(),
        );
        Ok(binding.clone())
    }
}

/// [`ProjectClient`] over a hash map, counting writes.
#[derive(Default)]
pub(crate) struct MemoryProjects {
    projects: Mutex<HashMap<String, Project>>,
    writes: AtomicUsize,
}

impl MemoryProjects {
    pub(crate) fn insert(&self, project: Project) {
        self.projects
            .lock()
            .unwrap()
            .insert(project.name_any(), project);
    }

    pub(crate) fn stored(&self, name: &str) -> Option<Project> {
        self.projects.lock().unwrap().get(name).cloned()
    }

    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProjectClient for MemoryProjects {
    async fn get(&self, name: &str) -> Result<Option<Project>> {
        Ok(self.projects.lock().unwrap().get(name).cloned())
    }

    async fn update(&self, project: &Project) -> Result<Project> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.insert(project.clone());
        Ok(project.clone())
    }

    async fn update_status(&self, project: &Project) -> Result<Project> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut projects = self.projects.lock().unwrap();
        match projects.get_mut(&project.name_any()) {
            Some(existing) => {
                existing.status = project.status.clone();
                Ok(existing.clone())
            }
            None => {
                projects.insert(project.name_any(), project.clone());
                Ok(project.clone())
            }
        }
    }
}

/// [`UserClient`] over a hash map.
#[derive(Default)]
pub(crate) struct MemoryUsers {
    users: Mutex<HashMap<String, User>>,
    writes: AtomicUsize,
}

impl MemoryUsers {
    pub(crate) fn insert(&self, user: User) {
        self.users.lock().unwrap().insert(user.name_any(), user);
    }

    pub(crate) fn stored(&self, name: &str) -> Option<User> {
        self.users.lock().unwrap().get(name).cloned()
    }
}

#[async_trait]
impl UserClient for MemoryUsers {
    async fn list(&self) -> Result<Vec<User>> {
        Ok(self.users.lock().unwrap().values().cloned().collect())
    }

    async fn get(&self, name: &str) -> Result<Option<User>> {
        Ok(self.users.lock().unwrap().get(name).cloned())
    }

    async fn update(&self, user: &User) -> Result<User> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.insert(user.clone());
        Ok(user.clone())
    }
}

/// [`BindingClient`] over a vector.
#[derive(Default)]
pub(crate) struct MemoryBindings {
    bindings: Mutex<Vec<UserProjectBinding>>,
}

impl MemoryBindings {
    pub(crate) fn all(&self) -> Vec<UserProjectBinding> {
        self.bindings.lock().unwrap().clone()
    }

    pub(crate) fn insert(&self, binding: UserProjectBinding) {
        self.bindings.lock().unwrap().push(binding);
    }
}

#[async_trait]
impl BindingClient for MemoryBindings {
    async fn list(&self) -> Result<Vec<UserProjectBinding>> {
        Ok(self.bindings.lock().unwrap().clone())
    }

    async fn create(&self, binding: &UserProjectBinding) -> Result<UserProjectBinding> {
        self.bindings.lock().unwrap().push(binding.clone());
        Ok(binding.clone())
    }
}

/// [`SshKeyClient`] over a hash map, counting writes.
#[derive(Default)]
pub(crate) struct MemorySshKeys {
    keys: Mutex<HashMap<String, UserSSHKey>>,
    writes: AtomicUsize,
}

impl MemorySshKeys {
    pub(crate) fn insert(&self, key: UserSSHKey) {
        self.keys.lock().unwrap().insert(key.name_any(), key);
    }

    pub(crate) fn stored(&self, name: &str) -> Option<UserSSHKey> {
        self.keys.lock().unwrap().get(name).cloned()
    }

    pub(crate) fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SshKeyClient for MemorySshKeys {
    async fn list(&self) -> Result<Vec<UserSSHKey>> {
        Ok(self.keys.lock().unwrap().values().cloned().collect())
    }

    async fn update(&self, key: &UserSSHKey) -> Result<UserSSHKey> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.insert(key.clone());
        Ok(key.clone())
    }
}
