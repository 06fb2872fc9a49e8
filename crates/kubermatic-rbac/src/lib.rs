//! RBAC propagation for projects and their resources.
//!
//! A project groups clusters, SSH keys and members for multi-tenant
//! isolation; the access it grants is plain Kubernetes RBAC synthesized
//! from three well-known groups per project. Two controllers keep that
//! RBAC converged across the master and all seed clusters: the project
//! controller owns everything derived from a `Project` itself, the
//! resource controller owns the per-object roles and bindings of
//! everything that belongs to a project. A one-shot migration adopts SSH
//! keys created before keys carried project owner references.

pub mod client;
pub mod ensure;
pub mod mapper;
pub mod migration;
pub mod project_controller;
pub mod resource_controller;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{ClusterProvider, MasterServices};
pub use ensure::EnsureOutcome;
pub use resource_controller::OrphanPolicy;
