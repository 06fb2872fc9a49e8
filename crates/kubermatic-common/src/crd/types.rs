//! Shared types used across the Kubermatic CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Life cycle phase of a cluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterPhase {
    /// Not yet assigned, the controller will pick a phase on first sight
    #[default]
    Unknown,
    /// Datacenter references and cloud spec are being verified
    Validating,
    /// Verified and waiting for the controller to start launching
    Pending,
    /// Control plane resources are being created in the cluster namespace
    Launching,
    /// Control plane is up and all components are healthy
    Running,
    /// Master components are being moved to a new version
    UpdatingMaster,
    /// Cluster is parked, the controller does not touch it
    Paused,
    /// Cleanup finalizers are running before the object goes away
    Deleting,
    /// Terminal failure, requires user action
    Failed,
}

impl ClusterPhase {
    /// Lowercase label value for metrics
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Validating => "validating",
            Self::Pending => "pending",
            Self::Launching => "launching",
            Self::Running => "running",
            Self::UpdatingMaster => "updating",
            Self::Paused => "paused",
            Self::Deleting => "deleting",
            Self::Failed => "failed",
        }
    }

    /// True for phases the controller will never leave on its own
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Validating => write!(f, "Validating"),
            Self::Pending => write!(f, "Pending"),
            Self::Launching => write!(f, "Launching"),
            Self::Running => write!(f, "Running"),
            Self::UpdatingMaster => write!(f, "UpdatingMaster"),
            Self::Paused => write!(f, "Paused"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Machine-readable error category surfaced on the cluster status
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterStatusError {
    /// The spec references something that does not exist or is inconsistent
    InvalidConfiguration,
    /// A spec change the controller refuses to act on
    UnsupportedChange,
    /// Reconciliation failed; retried automatically
    ReconcileError,
}

/// Health of the individual control plane components.
///
/// `last_transition_time` records when any of the flags last flipped.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHealth {
    /// Tenant apiserver Deployment has the desired number of ready replicas
    #[serde(default)]
    pub apiserver: bool,
    /// Scheduler Deployment is ready
    #[serde(default)]
    pub scheduler: bool,
    /// Controller-manager Deployment is ready
    #[serde(default)]
    pub controller: bool,
    /// Machine-controller Deployment is ready
    #[serde(default)]
    pub machine_controller: bool,
    /// Etcd StatefulSet has all replicas ready
    #[serde(default)]
    pub etcd: bool,
    /// When any component flag last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl ClusterHealth {
    /// True when every control plane component is healthy
    pub fn all_healthy(&self) -> bool {
        self.etcd && self.machine_controller && self.controller && self.apiserver && self.scheduler
    }
}

/// Access and address information of a cluster.
///
/// Mutated only by the controller, never by the user.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAddress {
    /// URL under which the apiserver is available
    #[serde(default)]
    pub url: String,
    /// DNS name for this cluster
    #[serde(default)]
    pub external_name: String,
    /// Token for the admin kubeconfig the user can download
    #[serde(default)]
    pub admin_token: String,
    /// External IP under which the apiserver is available
    #[serde(default)]
    pub ip: String,
}

/// Ranges of network addresses
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRanges {
    /// CIDR blocks, e.g. `10.240.16.0/20`
    #[serde(default)]
    pub cidr_blocks: Vec<String>,
}

/// Networking parameters for a cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNetworkingConfig {
    /// The network ranges from which service VIPs are allocated
    #[serde(default)]
    pub services: NetworkRanges,
    /// The network ranges from which pod networks are allocated
    #[serde(default)]
    pub pods: NetworkRanges,
    /// Domain name for services
    #[serde(default)]
    pub dns_domain: String,
}

/// Networking parameters used for machine IPAM
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineNetworkingConfig {
    /// CIDR to allocate machine addresses from
    pub cidr: String,
    /// Gateway for the machines
    pub gateway: String,
    /// DNS servers handed to the machines
    #[serde(default)]
    pub dns_servers: Vec<String>,
}

/// Binary data, base64 in JSON.
///
/// Empty content round-trips as the empty string.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bytes(pub Vec<u8>);

impl Bytes {
    /// True when no data is held
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Bytes {
    fn from(v: Vec<u8>) -> Self {
        Self(v)
    }
}

impl AsRef<[u8]> for Bytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Bytes {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use base64::Engine as _;
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Bytes {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        use base64::Engine as _;
        let s = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map(Bytes)
            .map_err(serde::de::Error::custom)
    }
}

impl JsonSchema for Bytes {
    fn schema_name() -> String {
        "Bytes".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        let mut schema: schemars::schema::SchemaObject = String::json_schema(gen).into();
        schema.format = Some("byte".to_string());
        schema.into()
    }
}

/// A pair of PEM-encoded key and certificate
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyCert {
    /// Private key, PEM
    #[serde(default)]
    pub key: Bytes,
    /// Certificate, PEM
    #[serde(default)]
    pub cert: Bytes,
}

impl KeyCert {
    /// True when either half is missing
    pub fn is_empty(&self) -> bool {
        self.key.is_empty() || self.cert.is_empty()
    }
}
