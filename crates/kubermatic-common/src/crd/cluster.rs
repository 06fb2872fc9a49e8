//! Cluster Custom Resource Definition
//!
//! A Cluster represents one tenant Kubernetes cluster whose control plane
//! runs inside a namespace on a seed cluster. The spec is written by the
//! API layer and the user; address and status are owned by the controller.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    ClusterAddress, ClusterHealth, ClusterNetworkingConfig, ClusterPhase, ClusterStatusError,
    MachineNetworkingConfig,
};

/// Specification for a Cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kubermatic.k8s.io",
    version = "v1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    namespaced = false,
    printcolumn = r#"{"name":"HumanReadableName","type":"string","jsonPath":".spec.humanReadableName"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Datacenter","type":"string","jsonPath":".spec.cloud.dc"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.masterVersion"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Cloud provider access data and the datacenter the nodes live in
    pub cloud: CloudSpec,

    /// Networking parameters for the tenant cluster
    #[serde(default)]
    pub cluster_network: ClusterNetworkingConfig,

    /// Machine networks for IPAM. When set, the machine controller runs
    /// with static address allocation from these ranges.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machine_networks: Vec<MachineNetworkingConfig>,

    /// Wanted version of the control plane
    #[serde(default)]
    pub master_version: String,

    /// Cluster name provided by the user
    #[serde(default)]
    pub human_readable_name: String,

    /// Partition key for running multiple controller instances. A controller
    /// only reconciles clusters whose worker name matches its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_name: Option<String>,

    /// Tells that this cluster is currently not managed by the controller.
    /// It indicates that the user needs to do some action to resolve the pause.
    #[serde(default)]
    pub pause: bool,

    /// The reason why the cluster is not being managed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_reason: Option<String>,
}

impl ClusterSpec {
    /// Structural validation of the spec, independent of datacenter config
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.cloud.datacenter_name.is_empty() {
            return Err(crate::Error::validation("no node datacenter set"));
        }
        let providers = self.cloud.provider_names();
        if providers.is_empty() {
            return Err(crate::Error::validation("no cloud provider configured"));
        }
        if providers.len() > 1 {
            return Err(crate::Error::validation(format!(
                "exactly one cloud provider allowed, got {}",
                providers.join(", ")
            )));
        }
        if self.master_version.is_empty() {
            return Err(crate::Error::validation("no master version set"));
        }
        Ok(())
    }
}

/// Access data to a cloud provider, mutually exclusive sections
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudSpec {
    /// Name of the node datacenter the tenant machines live in
    #[serde(rename = "dc", default)]
    pub datacenter_name: String,

    /// Synthetic provider for tests and development
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fake: Option<FakeCloudSpec>,
    /// DigitalOcean access data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digitalocean: Option<DigitaloceanCloudSpec>,
    /// Manually provisioned nodes, no provider API involved
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bringyourown: Option<BringYourOwnCloudSpec>,
    /// Amazon Web Services access data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws: Option<AwsCloudSpec>,
    /// Azure access data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure: Option<AzureCloudSpec>,
    /// Openstack access data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openstack: Option<OpenstackCloudSpec>,
    /// Hetzner access data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hetzner: Option<HetznerCloudSpec>,
    /// VSphere access data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vsphere: Option<VSphereCloudSpec>,
}

impl CloudSpec {
    /// Names of all configured provider sections
    pub fn provider_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.fake.is_some() {
            names.push("fake");
        }
        if self.digitalocean.is_some() {
            names.push("digitalocean");
        }
        if self.bringyourown.is_some() {
            names.push("bringyourown");
        }
        if self.aws.is_some() {
            names.push("aws");
        }
        if self.azure.is_some() {
            names.push("azure");
        }
        if self.openstack.is_some() {
            names.push("openstack");
        }
        if self.hetzner.is_some() {
            names.push("hetzner");
        }
        if self.vsphere.is_some() {
            names.push("vsphere");
        }
        names
    }

    /// The single configured provider name, when exactly one section is set
    pub fn provider_name(&self) -> Option<&'static str> {
        let names = self.provider_names();
        match names.as_slice() {
            [single] => Some(single),
            _ => None,
        }
    }
}

/// Access data for a fake cloud
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct FakeCloudSpec {
    /// Token handed back by the fake provider during validation
    #[serde(default)]
    pub token: String,
}

/// Access data to DigitalOcean
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct DigitaloceanCloudSpec {
    /// Token used to authenticate with the DigitalOcean API
    pub token: String,
}

/// Access data for a bring-your-own cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct BringYourOwnCloudSpec {}

/// Access data to Amazon Web Services
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AwsCloudSpec {
    /// Access key id
    #[serde(default)]
    pub access_key_id: String,
    /// Secret access key
    #[serde(default)]
    pub secret_access_key: String,
    /// VPC to place instances in
    #[serde(default)]
    pub vpc_id: String,
    /// Subnet to place instances in
    #[serde(default)]
    pub subnet_id: String,
    /// IAM role attached to instances
    #[serde(default)]
    pub role_name: String,
    /// Route table of the VPC
    #[serde(default)]
    pub route_table_id: String,
    /// Security group for instances
    #[serde(rename = "securityGroupID", default)]
    pub security_group_id: String,
    /// Availability zone for instances
    #[serde(default)]
    pub availability_zone: String,
}

/// Access credentials to Azure
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureCloudSpec {
    /// Tenant id
    #[serde(rename = "tenantID", default)]
    pub tenant_id: String,
    /// Subscription id
    #[serde(rename = "subscriptionID", default)]
    pub subscription_id: String,
    /// Client id
    #[serde(rename = "clientID", default)]
    pub client_id: String,
    /// Client secret
    #[serde(default)]
    pub client_secret: String,
    /// Resource group holding cluster resources
    #[serde(default)]
    pub resource_group: String,
}

/// Access data to an Openstack cloud
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OpenstackCloudSpec {
    /// User name
    #[serde(default)]
    pub username: String,
    /// Password
    #[serde(default)]
    pub password: String,
    /// Tenant/project to operate in
    #[serde(default)]
    pub tenant: String,
    /// Identity domain
    #[serde(default)]
    pub domain: String,
    /// Network for instances
    #[serde(default)]
    pub network: String,
    /// Floating IP pool for external addresses
    #[serde(rename = "floatingIpPool", default)]
    pub floating_ip_pool: String,
}

/// Access data to Hetzner cloud
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct HetznerCloudSpec {
    /// Token used to authenticate with the Hetzner cloud API
    pub token: String,
}

/// Access data to VSphere
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VSphereCloudSpec {
    /// User name
    #[serde(default)]
    pub username: String,
    /// Password
    #[serde(default)]
    pub password: String,
    /// Network for virtual machines
    #[serde(rename = "vmNetName", default)]
    pub vm_net_name: String,
}

/// Status of a Cluster, owned entirely by the controllers
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// When the controller last wrote this status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,

    /// Current phase of the cluster lifecycle
    #[serde(default)]
    pub phase: ClusterPhase,

    /// Health of the individual control plane components
    #[serde(default)]
    pub health: ClusterHealth,

    /// Access and address information, filled in during launch
    #[serde(default)]
    pub address: ClusterAddress,

    /// Namespace the control plane of this cluster is deployed in.
    /// Set exactly once, derived from the cluster name.
    #[serde(default)]
    pub namespace_name: String,

    /// When the phase last changed. The update phase timeout is measured
    /// against this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    /// Master version that last reached Running. The rollback target when
    /// an update times out.
    #[serde(default)]
    pub last_deployed_master_version: String,

    /// Name of the owner of this cluster
    #[serde(default)]
    pub user_name: String,

    /// Email of the owner of this cluster
    #[serde(default)]
    pub user_email: String,

    /// Error category in case the controller encountered an error.
    /// Reset once the error is resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<ClusterStatusError>,

    /// Error message in case the controller encountered an error.
    /// Reset once the error is resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ClusterStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: ClusterPhase) -> Self {
        Self {
            phase,
            last_transition_time: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Move to a new phase and stamp the transition time
    pub fn transition(&mut self, phase: ClusterPhase) {
        if self.phase != phase {
            self.phase = phase;
            self.last_transition_time = Some(Utc::now());
        }
    }

    /// Record an error on the status
    pub fn set_error(&mut self, reason: ClusterStatusError, message: impl Into<String>) {
        self.error_reason = Some(reason);
        self.error_message = Some(message.into());
    }

    /// Clear a previously recorded error
    pub fn clear_error(&mut self) {
        self.error_reason = None;
        self.error_message = None;
    }
}

impl Cluster {
    /// Current phase, `Unknown` when the status has never been written
    pub fn phase(&self) -> ClusterPhase {
        self.status
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or(ClusterPhase::Unknown)
    }

    /// True when every control plane component is healthy
    pub fn all_healthy(&self) -> bool {
        self.status
            .as_ref()
            .map(|s| s.health.all_healthy())
            .unwrap_or(false)
    }

    /// Namespace holding this cluster's control plane, when already assigned
    pub fn control_plane_namespace(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|s| s.namespace_name.as_str())
            .filter(|n| !n.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========================================================================
    // Test Fixtures
    // =========================================================================

    fn digitalocean_spec() -> ClusterSpec {
        ClusterSpec {
            cloud: CloudSpec {
                datacenter_name: "do-ams2".to_string(),
                digitalocean: Some(DigitaloceanCloudSpec {
                    token: "dop_v1_sample".to_string(),
                }),
                ..Default::default()
            },
            cluster_network: ClusterNetworkingConfig {
                services: crate::crd::NetworkRanges {
                    cidr_blocks: vec!["10.240.16.0/20".to_string()],
                },
                pods: crate::crd::NetworkRanges {
                    cidr_blocks: vec!["172.25.0.0/16".to_string()],
                },
                dns_domain: "cluster.local".to_string(),
            },
            master_version: "1.12.3".to_string(),
            human_readable_name: "thunderball".to_string(),
            ..Default::default()
        }
    }

    // =========================================================================
    // Spec Validation Stories
    // =========================================================================

    /// Story: a well-formed spec with a single provider passes validation
    #[test]
    fn story_single_provider_spec_is_valid() {
        let spec = digitalocean_spec();
        assert!(spec.validate().is_ok());
        assert_eq!(spec.cloud.provider_name(), Some("digitalocean"));
    }

    /// Story: the datacenter reference is mandatory
    ///
    /// Without a datacenter the controller cannot find provider settings,
    /// so the spec is rejected before any phase work happens.
    #[test]
    fn story_missing_datacenter_is_rejected() {
        let mut spec = digitalocean_spec();
        spec.cloud.datacenter_name = String::new();
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("no node datacenter"));
    }

    /// Story: two provider sections at once are ambiguous and rejected
    #[test]
    fn story_multiple_providers_are_rejected() {
        let mut spec = digitalocean_spec();
        spec.cloud.fake = Some(FakeCloudSpec::default());
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("exactly one cloud provider"));
        assert_eq!(spec.cloud.provider_name(), None);
    }

    #[test]
    fn test_spec_serializes_with_original_field_names() {
        let spec = digitalocean_spec();
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["cloud"]["dc"], "do-ams2");
        assert_eq!(json["masterVersion"], "1.12.3");
        assert_eq!(json["humanReadableName"], "thunderball");
        assert_eq!(
            json["clusterNetwork"]["services"]["cidrBlocks"][0],
            "10.240.16.0/20"
        );
    }

    #[test]
    fn test_status_transition_stamps_time() {
        let mut status = ClusterStatus::default();
        assert_eq!(status.phase, ClusterPhase::Unknown);
        assert!(status.last_transition_time.is_none());

        status.transition(ClusterPhase::Validating);
        assert_eq!(status.phase, ClusterPhase::Validating);
        let first = status.last_transition_time.unwrap();

        // Same phase again must not touch the timestamp
        status.transition(ClusterPhase::Validating);
        assert_eq!(status.last_transition_time.unwrap(), first);
    }

    #[test]
    fn test_error_set_and_clear() {
        let mut status = ClusterStatus::default();
        status.set_error(ClusterStatusError::InvalidConfiguration, "unknown datacenter");
        assert_eq!(
            status.error_reason,
            Some(ClusterStatusError::InvalidConfiguration)
        );

        status.clear_error();
        assert!(status.error_reason.is_none());
        assert!(status.error_message.is_none());
    }
}
