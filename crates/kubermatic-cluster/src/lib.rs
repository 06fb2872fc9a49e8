//! Cluster lifecycle controller for the seed cluster.
//!
//! Watches `Cluster` objects and drives each one through the phase state
//! machine (`Validating` to `Running` and onwards), materializing the tenant
//! control plane as namespaced resources on the seed: certificates and
//! kubeconfigs as Secrets, the apiserver/controller-manager/scheduler/
//! machine-controller Deployments, the etcd StatefulSet and the OpenVPN
//! tunnel that connects the seed to the tenant network.
//!
//! All writes go through the idempotent ensure machinery in [`ensure`]; the
//! individual resource builders live under [`resources`].

pub mod address;
pub mod client;
pub mod controller;
pub mod deletion;
pub mod ensure;
pub mod health;
pub mod pki;
pub mod provider;
pub mod resources;
pub mod update;
pub mod validation;

pub use controller::{error_policy, reconcile, Context, ContextBuilder};
pub use ensure::EnsureOutcome;
pub use resources::ClusterData;
