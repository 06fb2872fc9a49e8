//! Monitoring stack controller for the seed cluster.
//!
//! Runs a second controller over the same `Cluster` objects as the lifecycle
//! controller, with a disjoint resource set: once a control plane reports
//! fully healthy, a Prometheus instance and kube-state-metrics are deployed
//! into the cluster namespace and the matching RBAC is pushed into the
//! tenant cluster. Unhealthy clusters are simply re-checked later instead of
//! being treated as errors, so a launching control plane never burns through
//! the retry budget.
//!
//! The resource builders follow the same creator convention as the lifecycle
//! controller and are converged through [`kubermatic_cluster::ensure`].

pub mod controller;
pub mod resources;

pub use controller::{error_policy, reconcile, Context, ContextBuilder};
