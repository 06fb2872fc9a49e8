//! Builders for the monitoring resources deployed per cluster namespace.
//!
//! Same creator convention as the control plane builders: take the live
//! object if there is one, overwrite the managed fields, return the desired
//! state. Convergence happens in the controller through
//! [`kubermatic_cluster::ensure`].

pub mod ipam;
pub mod kube_state_metrics;
pub mod prometheus;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Secret, Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};

use kubermatic_cluster::ensure::NamedCreator;
use kubermatic_cluster::ClusterData;

/// Name shared by the Prometheus ServiceAccount, Role, RoleBinding, config
/// ConfigMap, Service and StatefulSet inside the cluster namespace.
pub const PROMETHEUS_NAME: &str = "prometheus";
/// Secret holding the client certificate Prometheus presents to the tenant
/// apiserver when scraping it.
pub const PROMETHEUS_APISERVER_CERTIFICATE_SECRET_NAME: &str = "prometheus-apiserver-certificate";
/// Common name in the Prometheus client certificate.
pub const PROMETHEUS_CERT_USERNAME: &str = "prometheus";
/// Port Prometheus serves its web UI and federation endpoint on.
pub const PROMETHEUS_PORT: i32 = 9090;

/// Deployment running kube-state-metrics against the tenant apiserver.
pub const KUBE_STATE_METRICS_DEPLOYMENT_NAME: &str = "kube-state-metrics";
/// Secret holding the kubeconfig kube-state-metrics connects with.
pub const KUBE_STATE_METRICS_KUBECONFIG_SECRET_NAME: &str = "kube-state-metrics-kubeconfig";
/// Common name in the kube-state-metrics client certificate, doubling as
/// the username its tenant-side RBAC binds.
pub const KUBE_STATE_METRICS_CERT_USERNAME: &str = "kube-state-metrics";
/// Tenant-side ClusterRole and ClusterRoleBinding for kube-state-metrics.
pub const KUBE_STATE_METRICS_CLUSTER_ROLE_NAME: &str = "system:kubermatic-kube-state-metrics";

/// Deployment running the IPAM controller for static machine networks.
pub const IPAM_CONTROLLER_DEPLOYMENT_NAME: &str = "ipam-controller";
/// Secret holding the kubeconfig the IPAM controller connects with.
pub const IPAM_CONTROLLER_KUBECONFIG_SECRET_NAME: &str = "ipam-controller-kubeconfig";
/// Common name in the IPAM controller client certificate and the username
/// its tenant-side RBAC binds.
pub const IPAM_CONTROLLER_CERT_USERNAME: &str = "ipam-controller";
/// Tenant-side ClusterRole and ClusterRoleBinding for the IPAM controller.
pub const IPAM_CONTROLLER_CLUSTER_ROLE_NAME: &str = "system:kubermatic-ipam-controller";

/// ServiceAccounts of the monitoring stack.
pub fn service_account_creators() -> Vec<NamedCreator<ServiceAccount>> {
    vec![NamedCreator {
        name: PROMETHEUS_NAME,
        create: prometheus::service_account,
    }]
}

/// Roles of the monitoring stack.
pub fn role_creators() -> Vec<NamedCreator<Role>> {
    vec![NamedCreator {
        name: PROMETHEUS_NAME,
        create: prometheus::role,
    }]
}

/// RoleBindings of the monitoring stack.
pub fn role_binding_creators() -> Vec<NamedCreator<RoleBinding>> {
    vec![NamedCreator {
        name: PROMETHEUS_NAME,
        create: prometheus::role_binding,
    }]
}

/// Secrets of the monitoring stack. All of them depend on the cluster CA
/// being loaded into the [`ClusterData`].
pub fn secret_creators(data: &ClusterData) -> Vec<NamedCreator<Secret>> {
    let mut creators = vec![
        NamedCreator {
            name: PROMETHEUS_APISERVER_CERTIFICATE_SECRET_NAME,
            create: prometheus::apiserver_client_certificate,
        },
        NamedCreator {
            name: KUBE_STATE_METRICS_KUBECONFIG_SECRET_NAME,
            create: kube_state_metrics::kubeconfig_secret,
        },
    ];
    if !data.cluster.spec.machine_networks.is_empty() {
        creators.push(NamedCreator {
            name: IPAM_CONTROLLER_KUBECONFIG_SECRET_NAME,
            create: ipam::kubeconfig_secret,
        });
    }
    creators
}

/// ConfigMaps of the monitoring stack.
pub fn config_map_creators() -> Vec<NamedCreator<ConfigMap>> {
    vec![NamedCreator {
        name: PROMETHEUS_NAME,
        create: prometheus::config_map,
    }]
}

/// Services of the monitoring stack.
pub fn service_creators() -> Vec<NamedCreator<Service>> {
    vec![NamedCreator {
        name: PROMETHEUS_NAME,
        create: prometheus::service,
    }]
}

/// Deployments of the monitoring stack. The IPAM controller only runs for
/// clusters with static machine networks configured.
pub fn deployment_creators(data: &ClusterData) -> Vec<NamedCreator<Deployment>> {
    let mut creators = vec![NamedCreator {
        name: KUBE_STATE_METRICS_DEPLOYMENT_NAME,
        create: kube_state_metrics::deployment,
    }];
    if !data.cluster.spec.machine_networks.is_empty() {
        creators.push(NamedCreator {
            name: IPAM_CONTROLLER_DEPLOYMENT_NAME,
            create: ipam::deployment,
        });
    }
    creators
}

/// StatefulSets of the monitoring stack.
pub fn stateful_set_creators() -> Vec<NamedCreator<StatefulSet>> {
    vec![NamedCreator {
        name: PROMETHEUS_NAME,
        create: prometheus::stateful_set,
    }]
}

/// ClusterRoles ensured inside the tenant cluster.
pub fn tenant_cluster_role_creators(data: &ClusterData) -> Vec<NamedCreator<ClusterRole>> {
    let mut creators = vec![NamedCreator {
        name: KUBE_STATE_METRICS_CLUSTER_ROLE_NAME,
        create: kube_state_metrics::cluster_role,
    }];
    if !data.cluster.spec.machine_networks.is_empty() {
        creators.push(NamedCreator {
            name: IPAM_CONTROLLER_CLUSTER_ROLE_NAME,
            create: ipam::cluster_role,
        });
    }
    creators
}

/// ClusterRoleBindings ensured inside the tenant cluster, granting the
/// certificate users their ClusterRoles.
pub fn tenant_cluster_role_binding_creators(
    data: &ClusterData,
) -> Vec<NamedCreator<ClusterRoleBinding>> {
    let mut creators = vec![NamedCreator {
        name: KUBE_STATE_METRICS_CLUSTER_ROLE_NAME,
        create: kube_state_metrics::cluster_role_binding,
    }];
    if !data.cluster.spec.machine_networks.is_empty() {
        creators.push(NamedCreator {
            name: IPAM_CONTROLLER_CLUSTER_ROLE_NAME,
            create: ipam::cluster_role_binding,
        });
    }
    creators
}

/// Tenant-side objects carry the app label but no owner reference: the
/// Cluster object lives on the seed and cannot own anything across the
/// apiserver boundary.
pub(crate) fn set_tenant_meta(
    meta: &mut k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
    name: &str,
    app: &str,
) {
    meta.name = Some(name.to_string());
    meta.labels = Some(kubermatic_cluster::resources::app_labels(app));
}

#[cfg(test)]
pub(crate) fn running_cluster_data() -> ClusterData {
    use kubermatic_common::crd::{
        CloudSpec, Cluster, ClusterAddress, ClusterHealth, ClusterNetworkingConfig, ClusterPhase,
        ClusterSpec, ClusterStatus, DigitaloceanCloudSpec, NetworkRanges,
    };
    use kubermatic_common::datacenter::{
        DatacenterMeta, DatacenterSpec, DatacenterSpecDigitalocean,
    };
    use kubermatic_cluster::resources::ControllerConfig;

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
        phase: ClusterPhase::Running,
        namespace_name: "cluster-fqpcvnc6v".to_string(),
        last_deployed_master_version: "1.12.3".to_string(),
        address: ClusterAddress {
            url: "https://fqpcvnc6v.europe-west3-c.dev.kubermatic.io:30843".to_string(),
            external_name: "fqpcvnc6v.europe-west3-c.dev.kubermatic.io".to_string(),
            admin_token: "abc123.0123456789abcdef".to_string(),
            ip: "35.198.93.90".to_string(),
        },
        health: ClusterHealth {
            apiserver: true,
            scheduler: true,
            controller: true,
            machine_controller: true,
            etcd: true,
            last_transition_time: None,
        },
        ..Default::default()
    });

    let datacenter = DatacenterMeta {
        location: "Amsterdam".to_string(),
        country: "NL".to_string(),
        seed: "europe-west3-c".to_string(),
        spec: DatacenterSpec {
            digitalocean: Some(DatacenterSpecDigitalocean {
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

    ClusterData::new(cluster, datacenter, "europe-west3-c", config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kubermatic_common::crd::MachineNetworkingConfig;

    #[test]
    fn test_ipam_controller_only_runs_for_machine_network_clusters() {
        let mut data = running_cluster_data();
        assert!(!deployment_creators(&data)
            .iter()
            .any(|c| c.name == IPAM_CONTROLLER_DEPLOYMENT_NAME));
        assert!(!secret_creators(&data)
            .iter()
            .any(|c| c.name == IPAM_CONTROLLER_KUBECONFIG_SECRET_NAME));
        assert!(!tenant_cluster_role_creators(&data)
            .iter()
            .any(|c| c.name == IPAM_CONTROLLER_CLUSTER_ROLE_NAME));

        data.cluster.spec.machine_networks = vec![MachineNetworkingConfig {
            cidr: "192.168.1.0/24".to_string(),
            gateway: "192.168.1.1".to_string(),
            dns_servers: vec!["8.8.8.8".to_string()],
        }];
        assert!(deployment_creators(&data)
            .iter()
            .any(|c| c.name == IPAM_CONTROLLER_DEPLOYMENT_NAME));
        assert!(secret_creators(&data)
            .iter()
            .any(|c| c.name == IPAM_CONTROLLER_KUBECONFIG_SECRET_NAME));
        assert!(tenant_cluster_role_creators(&data)
            .iter()
            .any(|c| c.name == IPAM_CONTROLLER_CLUSTER_ROLE_NAME));
        assert!(tenant_cluster_role_binding_creators(&data)
            .iter()
            .any(|c| c.name == IPAM_CONTROLLER_CLUSTER_ROLE_NAME));
    }
}
