//! Desired-state builders for everything living in a cluster control plane
//! namespace.
//!
//! Each component module exposes creator functions; the registry functions
//! here assemble them in the order the controller ensures them. Creators
//! are plain functions over [`ClusterData`], the bundle of everything a
//! builder may need: the cluster itself, its datacenter, the seed identity
//! and controller-wide settings.

pub mod apiserver;
pub mod certificates;
pub mod cloud_config;
pub mod controller_manager;
pub mod etcd;
pub mod kubeconfig;
pub mod machine_controller;
pub mod openvpn;
pub mod scheduler;
pub mod vpa;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};

use kubermatic_common::crd::{Cluster, ClusterAddress};
use kubermatic_common::datacenter::DatacenterMeta;
use kubermatic_common::{Error, Result};

use crate::ensure::NamedCreator;
use crate::pki::ClusterCa;

/// ClusterIP Service fronting the apiserver inside the seed.
pub const APISERVER_SERVICE_NAME: &str = "apiserver";
/// NodePort Service exposing the apiserver to the outside world.
pub const APISERVER_EXTERNAL_SERVICE_NAME: &str = "apiserver-external";
/// Headless Service governing the etcd ring.
pub const ETCD_SERVICE_NAME: &str = "etcd";
/// NodePort Service for the OpenVPN server.
pub const OPENVPN_SERVICE_NAME: &str = "openvpn-server";

/// Secret holding the cluster root CA key pair.
pub const CA_SECRET_NAME: &str = "ca";
/// Secret holding the apiserver serving certificate.
pub const APISERVER_TLS_SECRET_NAME: &str = "apiserver-tls";
/// Secret holding the client certificate the apiserver presents to kubelets.
pub const KUBELET_CLIENT_CERTIFICATES_SECRET_NAME: &str = "kubelet-client-certificates";
/// Secret holding the service account token signing key.
pub const SERVICE_ACCOUNT_KEY_SECRET_NAME: &str = "service-account-key";
/// Secret holding the static token file for the apiserver.
pub const TOKENS_SECRET_NAME: &str = "tokens";
/// Secret holding the OpenVPN server certificate.
pub const OPENVPN_SERVER_CERTIFICATES_SECRET_NAME: &str = "openvpn-server-certificates";
/// Secret holding the OpenVPN client certificate, seed-side copy.
pub const OPENVPN_CLIENT_CERTIFICATES_SECRET_NAME: &str = "openvpn-client-certificates";
/// Secret holding the admin kubeconfig.
pub const ADMIN_KUBECONFIG_SECRET_NAME: &str = "admin-kubeconfig";
/// Secret holding the scheduler kubeconfig.
pub const SCHEDULER_KUBECONFIG_SECRET_NAME: &str = "scheduler-kubeconfig";
/// Secret holding the controller-manager kubeconfig.
pub const CONTROLLER_MANAGER_KUBECONFIG_SECRET_NAME: &str = "controller-manager-kubeconfig";
/// Secret holding the machine-controller kubeconfig.
pub const MACHINE_CONTROLLER_KUBECONFIG_SECRET_NAME: &str = "machine-controller-kubeconfig";

/// ConfigMap with the provider-specific cloud config.
pub const CLOUD_CONFIG_CONFIG_MAP_NAME: &str = "cloud-config";
/// ConfigMap with per-client OpenVPN configs mounted by the server.
pub const OPENVPN_CLIENT_CONFIGS_CONFIG_MAP_NAME: &str = "openvpn-server-client-configs";
/// ConfigMap with the OIDC CA bundle mounted by the apiserver.
pub const OIDC_CA_CONFIG_MAP_NAME: &str = "oidc-ca";

/// Apiserver Deployment.
pub const APISERVER_DEPLOYMENT_NAME: &str = "apiserver";
/// Controller-manager Deployment.
pub const CONTROLLER_MANAGER_DEPLOYMENT_NAME: &str = "controller-manager";
/// Scheduler Deployment.
pub const SCHEDULER_DEPLOYMENT_NAME: &str = "scheduler";
/// Machine-controller Deployment.
pub const MACHINE_CONTROLLER_DEPLOYMENT_NAME: &str = "machine-controller";
/// OpenVPN server Deployment.
pub const OPENVPN_DEPLOYMENT_NAME: &str = "openvpn-server";
/// VPA recommender Deployment, only with the VPA feature enabled.
pub const VPA_DEPLOYMENT_NAME: &str = "vpa-recommender";

/// Etcd StatefulSet.
pub const ETCD_STATEFUL_SET_NAME: &str = "etcd";
/// Replicas in the etcd ring.
pub const ETCD_CLUSTER_SIZE: i32 = 3;

/// ServiceAccount the etcd pods run as.
pub const ETCD_SERVICE_ACCOUNT_NAME: &str = "etcd";
/// ServiceAccount the machine-controller runs as.
pub const MACHINE_CONTROLLER_SERVICE_ACCOUNT_NAME: &str = "machine-controller";
/// Role granting the machine-controller leader election in its namespace.
pub const MACHINE_CONTROLLER_ROLE_NAME: &str = "machine-controller";
/// RoleBinding attaching the machine-controller Role to its ServiceAccount.
pub const MACHINE_CONTROLLER_ROLE_BINDING_NAME: &str = "machine-controller";

/// Secure port the apiserver listens on inside its pod.
pub const APISERVER_SECURE_PORT: i32 = 6443;
/// Port of the in-namespace apiserver Service.
pub const APISERVER_SERVICE_PORT: i32 = 443;
/// Etcd client port.
pub const ETCD_CLIENT_PORT: i32 = 2379;
/// Etcd peer port.
pub const ETCD_PEER_PORT: i32 = 2380;
/// OpenVPN server port.
pub const OPENVPN_PORT: i32 = 1194;

/// ConfigMap in the tenant's kube-public with the bootstrap kubeconfig.
pub const CLUSTER_INFO_CONFIG_MAP_NAME: &str = "cluster-info";
/// Secret in the tenant's kube-system with the OpenVPN client certificate.
pub const TENANT_OPENVPN_SECRET_NAME: &str = "openvpn-client-certificates";
/// ConfigMap in the tenant's kube-system with the OpenVPN client config.
pub const TENANT_OPENVPN_CONFIG_MAP_NAME: &str = "openvpn-client-config";
/// Tenant namespace for bootstrap discovery objects.
pub const TENANT_PUBLIC_NAMESPACE: &str = "kube-public";
/// Tenant namespace for system components.
pub const TENANT_SYSTEM_NAMESPACE: &str = "kube-system";

/// Controller-wide settings fed into every creator. Populated from flags
/// at startup, fixed for the lifetime of the process.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Base domain external cluster names are built under.
    pub external_url: String,
    /// Registry replacing the default image registries when set.
    pub overwrite_registry: Option<String>,
    /// NodePort range the tenant apiserver allocates from.
    pub node_port_range: String,
    /// Network the VPN assigns node tunnel addresses from.
    pub node_access_network: String,
    /// Size of the volume backing each etcd member.
    pub etcd_disk_size: String,
    /// Deploy the VPA recommender into cluster namespaces.
    pub enable_vpa: bool,
    /// PEM bundle for OIDC token verification, mounted into the apiserver
    /// when present.
    pub oidc_ca: Option<String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            external_url: String::new(),
            overwrite_registry: None,
            node_port_range: "30000-32767".to_string(),
            node_access_network: "10.254.0.0/16".to_string(),
            etcd_disk_size: "5Gi".to_string(),
            enable_vpa: false,
            oidc_ca: None,
        }
    }
}

/// Everything a creator may need to build the desired state of an object.
pub struct ClusterData {
    /// The cluster being reconciled.
    pub cluster: Cluster,
    /// Node datacenter the cluster was placed in.
    pub datacenter: DatacenterMeta,
    /// Name of the seed this controller runs against.
    pub seed_name: String,
    /// Controller-wide settings.
    pub config: ControllerConfig,
    namespace: String,
    ca: Option<ClusterCa>,
}

impl ClusterData {
    /// Bundle up the inputs for one reconcile pass.
    pub fn new(
        cluster: Cluster,
        datacenter: DatacenterMeta,
        seed_name: impl Into<String>,
        config: ControllerConfig,
    ) -> Self {
        let namespace = cluster
            .control_plane_namespace()
            .map(str::to_string)
            .unwrap_or_else(|| kubermatic_common::namespace_name(&cluster.name_any()));
        Self {
            cluster,
            datacenter,
            seed_name: seed_name.into(),
            config,
            namespace,
            ca: None,
        }
    }

    /// Name of the cluster.
    pub fn cluster_name(&self) -> String {
        self.cluster.name_any()
    }

    /// Namespace the control plane lives in.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Wanted control plane version.
    pub fn version(&self) -> &str {
        &self.cluster.spec.master_version
    }

    /// Current address data, empty when the address sync has not run yet.
    pub fn address(&self) -> ClusterAddress {
        self.cluster
            .status
            .as_ref()
            .map(|s| s.address.clone())
            .unwrap_or_default()
    }

    /// DNS domain of the tenant cluster.
    pub fn dns_domain(&self) -> &str {
        let domain = &self.cluster.spec.cluster_network.dns_domain;
        if domain.is_empty() {
            "cluster.local"
        } else {
            domain
        }
    }

    /// Owner reference pointing at the cluster, so namespace cleanup takes
    /// every managed object with it.
    pub fn owner_ref(&self) -> OwnerReference {
        OwnerReference {
            api_version: Cluster::api_version(&()).to_string(),
            kind: Cluster::kind(&()).to_string(),
            name: self.cluster.name_any(),
            uid: self.cluster.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            ..Default::default()
        }
    }

    /// Image registry to pull from, honoring the overwrite setting.
    pub fn registry<'a>(&'a self, default: &'a str) -> &'a str {
        self.config
            .overwrite_registry
            .as_deref()
            .filter(|r| !r.is_empty())
            .unwrap_or(default)
    }

    /// Make the cluster root CA available to certificate creators.
    pub fn set_ca(&mut self, ca: ClusterCa) {
        self.ca = Some(ca);
    }

    /// The cluster root CA. Certificate creators run after the CA secret
    /// has been ensured and loaded.
    pub fn ca(&self) -> Result<&ClusterCa> {
        self.ca.as_ref().ok_or_else(|| {
            Error::internal_with_context(
                "cluster_data",
                format!("root CA for cluster {} not loaded", self.cluster_name()),
            )
        })
    }

    fn service_network(&self) -> Result<(u32, u8)> {
        let name = self.cluster_name();
        let block = self
            .cluster
            .spec
            .cluster_network
            .services
            .cidr_blocks
            .first()
            .ok_or_else(|| Error::validation_for(&name, "cluster has no service network"))?;
        parse_cidr(block)
            .ok_or_else(|| Error::validation_for(&name, format!("invalid service network {}", block)))
    }

    /// First address of the service network, the in-cluster address of the
    /// `kubernetes` Service.
    pub fn first_service_ip(&self) -> Result<Ipv4Addr> {
        let (base, prefix_len) = self.service_network()?;
        Ok(nth_ip(base, prefix_len, 1))
    }

    /// Tenth address of the service network, where cluster DNS is served.
    pub fn cluster_dns_ip(&self) -> Result<Ipv4Addr> {
        let (base, prefix_len) = self.service_network()?;
        Ok(nth_ip(base, prefix_len, 10))
    }

    /// All names and addresses the apiserver certificate must cover.
    pub fn apiserver_sans(&self) -> Result<Vec<String>> {
        let namespace = self.namespace();
        let mut sans = vec![
            "kubernetes".to_string(),
            "kubernetes.default".to_string(),
            "kubernetes.default.svc".to_string(),
            format!("kubernetes.default.svc.{}", self.dns_domain()),
            APISERVER_SERVICE_NAME.to_string(),
            format!("{}.{}", APISERVER_SERVICE_NAME, namespace),
            format!("{}.{}.svc", APISERVER_SERVICE_NAME, namespace),
            format!("{}.{}.svc.cluster.local", APISERVER_SERVICE_NAME, namespace),
            "localhost".to_string(),
            "127.0.0.1".to_string(),
            self.first_service_ip()?.to_string(),
        ];
        let address = self.address();
        if !address.external_name.is_empty() {
            sans.push(address.external_name);
        }
        if !address.ip.is_empty() {
            sans.push(address.ip);
        }
        Ok(sans)
    }

    /// URL control plane components in the cluster namespace use to reach
    /// the apiserver. The trailing dot skips resolver search domains.
    pub fn in_cluster_apiserver_url(&self) -> String {
        format!(
            "https://{}.{}.svc.cluster.local.",
            APISERVER_SERVICE_NAME,
            self.namespace()
        )
    }

    /// Client URLs of the etcd ring members.
    pub fn etcd_endpoints(&self) -> Vec<String> {
        (0..ETCD_CLUSTER_SIZE)
            .map(|i| {
                format!(
                    "http://{}-{}.{}.{}.svc.cluster.local:{}",
                    ETCD_STATEFUL_SET_NAME,
                    i,
                    ETCD_SERVICE_NAME,
                    self.namespace(),
                    ETCD_CLIENT_PORT
                )
            })
            .collect()
    }
}

pub(crate) fn parse_cidr(block: &str) -> Option<(u32, u8)> {
    let (ip, prefix_len) = block.split_once('/')?;
    let ip: Ipv4Addr = ip.parse().ok()?;
    let prefix_len: u8 = prefix_len.parse().ok()?;
    if prefix_len > 30 {
        return None;
    }
    Some((u32::from(ip), prefix_len))
}

fn nth_ip(base: u32, prefix_len: u8, offset: u32) -> Ipv4Addr {
    let mask = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len)
    };
    Ipv4Addr::from((base & mask) + offset)
}

pub fn app_labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), app.to_string())])
}

/// Stamp name, namespace, labels and ownership onto an object without
/// touching the rest of its metadata, so resourceVersion and annotations
/// survive a rebuild from the live object.
pub fn set_object_meta(meta: &mut ObjectMeta, data: &ClusterData, name: &str, app: &str) {
    meta.name = Some(name.to_string());
    meta.namespace = Some(data.namespace().to_string());
    meta.labels = Some(app_labels(app));
    meta.owner_references = Some(vec![data.owner_ref()]);
}

/// ServiceAccounts for control plane components.
pub fn service_account_creators() -> Vec<NamedCreator<ServiceAccount>> {
    vec![
        NamedCreator {
            name: ETCD_SERVICE_ACCOUNT_NAME,
            create: etcd::service_account,
        },
        NamedCreator {
            name: MACHINE_CONTROLLER_SERVICE_ACCOUNT_NAME,
            create: machine_controller::service_account,
        },
    ]
}

/// Roles for control plane components.
pub fn role_creators() -> Vec<NamedCreator<Role>> {
    vec![NamedCreator {
        name: MACHINE_CONTROLLER_ROLE_NAME,
        create: machine_controller::role,
    }]
}

/// RoleBindings for control plane components.
pub fn role_binding_creators() -> Vec<NamedCreator<RoleBinding>> {
    vec![NamedCreator {
        name: MACHINE_CONTROLLER_ROLE_BINDING_NAME,
        create: machine_controller::role_binding,
    }]
}

/// Cluster-scoped bindings for control plane components. Currently none:
/// everything the control plane needs on the seed is namespaced, and
/// tenant-side bindings belong to the monitoring controller.
pub fn cluster_role_binding_creators() -> Vec<NamedCreator<ClusterRoleBinding>> {
    Vec::new()
}

/// Services, ensured before workloads so NodePorts exist when address
/// data is read.
pub fn service_creators() -> Vec<NamedCreator<Service>> {
    vec![
        NamedCreator {
            name: APISERVER_SERVICE_NAME,
            create: apiserver::service,
        },
        NamedCreator {
            name: APISERVER_EXTERNAL_SERVICE_NAME,
            create: apiserver::external_service,
        },
        NamedCreator {
            name: OPENVPN_SERVICE_NAME,
            create: openvpn::service,
        },
        NamedCreator {
            name: ETCD_SERVICE_NAME,
            create: etcd::service,
        },
    ]
}

/// Secrets depending on the root CA, in ensure order. The CA secret itself
/// is ensured first through [`certificates::root_ca_creator`] so its key
/// pair is available here via [`ClusterData::ca`].
pub fn secret_creators() -> Vec<NamedCreator<Secret>> {
    vec![
        NamedCreator {
            name: APISERVER_TLS_SECRET_NAME,
            create: apiserver::tls_serving_certificate,
        },
        NamedCreator {
            name: KUBELET_CLIENT_CERTIFICATES_SECRET_NAME,
            create: apiserver::kubelet_client_certificate,
        },
        NamedCreator {
            name: SERVICE_ACCOUNT_KEY_SECRET_NAME,
            create: certificates::service_account_key,
        },
        NamedCreator {
            name: OPENVPN_SERVER_CERTIFICATES_SECRET_NAME,
            create: openvpn::server_certificates,
        },
        NamedCreator {
            name: OPENVPN_CLIENT_CERTIFICATES_SECRET_NAME,
            create: openvpn::client_certificates,
        },
        NamedCreator {
            name: TOKENS_SECRET_NAME,
            create: certificates::tokens,
        },
        NamedCreator {
            name: ADMIN_KUBECONFIG_SECRET_NAME,
            create: kubeconfig::admin_kubeconfig,
        },
        NamedCreator {
            name: SCHEDULER_KUBECONFIG_SECRET_NAME,
            create: kubeconfig::scheduler_kubeconfig,
        },
        NamedCreator {
            name: CONTROLLER_MANAGER_KUBECONFIG_SECRET_NAME,
            create: kubeconfig::controller_manager_kubeconfig,
        },
        NamedCreator {
            name: MACHINE_CONTROLLER_KUBECONFIG_SECRET_NAME,
            create: kubeconfig::machine_controller_kubeconfig,
        },
    ]
}

/// ConfigMaps for the control plane.
pub fn config_map_creators(data: &ClusterData) -> Vec<NamedCreator<ConfigMap>> {
    let mut creators = vec![
        NamedCreator {
            name: CLOUD_CONFIG_CONFIG_MAP_NAME,
            create: cloud_config::config_map,
        },
        NamedCreator {
            name: OPENVPN_CLIENT_CONFIGS_CONFIG_MAP_NAME,
            create: openvpn::server_client_configs,
        },
    ];
    if data.config.oidc_ca.is_some() {
        creators.push(NamedCreator {
            name: OIDC_CA_CONFIG_MAP_NAME,
            create: apiserver::oidc_ca_config_map,
        });
    }
    creators
}

/// Control plane Deployments.
pub fn deployment_creators(data: &ClusterData) -> Vec<NamedCreator<Deployment>> {
    let mut creators = vec![
        NamedCreator {
            name: APISERVER_DEPLOYMENT_NAME,
            create: apiserver::deployment,
        },
        NamedCreator {
            name: CONTROLLER_MANAGER_DEPLOYMENT_NAME,
            create: controller_manager::deployment,
        },
        NamedCreator {
            name: SCHEDULER_DEPLOYMENT_NAME,
            create: scheduler::deployment,
        },
        NamedCreator {
            name: MACHINE_CONTROLLER_DEPLOYMENT_NAME,
            create: machine_controller::deployment,
        },
        NamedCreator {
            name: OPENVPN_DEPLOYMENT_NAME,
            create: openvpn::deployment,
        },
    ];
    if data.config.enable_vpa {
        creators.push(NamedCreator {
            name: VPA_DEPLOYMENT_NAME,
            create: vpa::deployment,
        });
    }
    creators
}

/// Control plane StatefulSets.
pub fn stateful_set_creators() -> Vec<NamedCreator<StatefulSet>> {
    vec![NamedCreator {
        name: ETCD_STATEFUL_SET_NAME,
        create: etcd::stateful_set,
    }]
}

#[cfg(test)]
impl ClusterData {
    /// A launching digitalocean cluster with a synced address, matching the
    /// worked example used across the controller tests.
    pub(crate) fn for_testing() -> Self {
        use kubermatic_common::crd::{
            CloudSpec, ClusterNetworkingConfig, ClusterPhase, ClusterSpec, ClusterStatus,
            DigitaloceanCloudSpec, NetworkRanges,
        };

        let spec = ClusterSpec {
            cloud: CloudSpec {
                datacenter_name: "do-ams2".to_string(),
                digitalocean: Some(DigitaloceanCloudSpec {
                    token: "dop_v1_sample".to_string(),
                }),
                ..Default::default()
            },
            cluster_network: ClusterNetworkingConfig {
                services: NetworkRanges {
                    cidr_blocks: vec!["10.240.16.0/20".to_string()],
                },
                pods: NetworkRanges {
                    cidr_blocks: vec!["172.25.0.0/16".to_string()],
                },
                dns_domain: "cluster.local".to_string(),
            },
            master_version: "1.12.3".to_string(),
            human_readable_name: "mighty-mite".to_string(),
            ..Default::default()
        };

        let mut cluster = Cluster::new("fqpcvnc6v", spec);
        cluster.metadata.uid = Some("f7021f6b-f642-11e8-8819-42010a9c0ff1".to_string());
        cluster.status = Some(ClusterStatus {
            phase: ClusterPhase::Launching,
            namespace_name: "cluster-fqpcvnc6v".to_string(),
            address: ClusterAddress {
                url: "https://fqpcvnc6v.europe-west3-c.dev.kubermatic.io:30843".to_string(),
                external_name: "fqpcvnc6v.europe-west3-c.dev.kubermatic.io".to_string(),
                admin_token: "abc123.0123456789abcdef".to_string(),
                ip: "35.198.93.90".to_string(),
            },
            ..Default::default()
        });

        let datacenter = DatacenterMeta {
            location: "Amsterdam".to_string(),
            country: "NL".to_string(),
            seed: "europe-west3-c".to_string(),
            spec: kubermatic_common::datacenter::DatacenterSpec {
                digitalocean: Some(kubermatic_common::datacenter::DatacenterSpecDigitalocean {
                    region: "ams2".to_string(),
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let config = ControllerConfig {
            external_url: "dev.kubermatic.io".to_string(),
            ..Default::default()
        };

        Self::new(cluster, datacenter, "europe-west3-c", config)
    }
}
