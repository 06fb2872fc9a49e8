//! Custom Resource Definitions for Kubermatic
//!
//! This module contains all CRD definitions used by the controllers.

mod addon;
mod cluster;
mod project;
mod ssh_key;
mod types;
mod user;

pub use addon::{Addon, AddonSpec, AddonStatus, ClusterReference};
pub use cluster::{
    AwsCloudSpec, AzureCloudSpec, BringYourOwnCloudSpec, CloudSpec, Cluster, ClusterSpec,
    ClusterStatus, DigitaloceanCloudSpec, FakeCloudSpec, HetznerCloudSpec, OpenstackCloudSpec,
    VSphereCloudSpec,
};
pub use project::{
    Project, ProjectPhase, ProjectSpec, ProjectStatus, UserProjectBinding, UserProjectBindingSpec,
};
pub use ssh_key::{UserSSHKey, UserSSHKeySpec, UserSSHKeyStatus};
pub use types::{
    Bytes, ClusterAddress, ClusterHealth, ClusterNetworkingConfig, ClusterPhase,
    ClusterStatusError, KeyCert, MachineNetworkingConfig, NetworkRanges,
};
pub use user::{ProjectGroup, User, UserSpec};
