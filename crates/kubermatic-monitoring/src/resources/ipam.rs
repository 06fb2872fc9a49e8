//! IPAM controller resources for clusters with static machine networks.
//!
//! Hands out addresses from the configured CIDRs to Machine objects in the
//! tenant cluster. Only deployed when `machine_networks` is non-empty; the
//! registries in [`crate::resources`] handle that gate.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, PodSpec, PodTemplateSpec, ResourceRequirements, Secret, SecretVolumeSource,
    Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use kubermatic_common::Result;
use kubermatic_cluster::resources::kubeconfig::{self, KUBECONFIG_KEY};
use kubermatic_cluster::resources::{app_labels, set_object_meta, ClusterData};

use crate::resources::{
    set_tenant_meta, IPAM_CONTROLLER_CERT_USERNAME, IPAM_CONTROLLER_CLUSTER_ROLE_NAME,
    IPAM_CONTROLLER_DEPLOYMENT_NAME, IPAM_CONTROLLER_KUBECONFIG_SECRET_NAME,
};

const IPAM_CONTROLLER_TAG: &str = "v0.2.0";

const KUBECONFIG_MOUNT_PATH: &str = "/etc/kubernetes/kubeconfig";

/// Build the kubeconfig Secret the IPAM controller connects to the tenant
/// apiserver with.
pub fn kubeconfig_secret(data: &ClusterData, existing: Option<&Secret>) -> Result<Secret> {
    kubeconfig::internal_kubeconfig(
        data,
        existing,
        IPAM_CONTROLLER_KUBECONFIG_SECRET_NAME,
        IPAM_CONTROLLER_CERT_USERNAME,
        None,
        IPAM_CONTROLLER_DEPLOYMENT_NAME,
    )
}

/// Build the IPAM controller Deployment. One `-network` flag per configured
/// machine network, as `cidr,gateway,dns1[,dns2...]`.
pub fn deployment(data: &ClusterData, existing: Option<&Deployment>) -> Result<Deployment> {
    let mut deployment = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut deployment.metadata,
        data,
        IPAM_CONTROLLER_DEPLOYMENT_NAME,
        IPAM_CONTROLLER_DEPLOYMENT_NAME,
    );

    let mut command = vec![
        "/usr/local/bin/ipam-controller".to_string(),
        format!("-kubeconfig={}/{}", KUBECONFIG_MOUNT_PATH, KUBECONFIG_KEY),
        "-logtostderr".to_string(),
        "-v=4".to_string(),
    ];
    for network in &data.cluster.spec.machine_networks {
        command.push(format!(
            "-network={},{},{}",
            network.cidr,
            network.gateway,
            network.dns_servers.join(",")
        ));
    }

    deployment.spec = Some(DeploymentSpec {
        replicas: Some(1),
        selector: LabelSelector {
            match_labels: Some(app_labels(IPAM_CONTROLLER_DEPLOYMENT_NAME)),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(app_labels(IPAM_CONTROLLER_DEPLOYMENT_NAME)),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: IPAM_CONTROLLER_DEPLOYMENT_NAME.to_string(),
                    image: Some(format!(
                        "{}/kubermatic/ipam-controller:{}",
                        data.registry("docker.io"),
                        IPAM_CONTROLLER_TAG
                    )),
                    command: Some(command),
                    volume_mounts: Some(vec![VolumeMount {
                        name: "kubeconfig".to_string(),
                        mount_path: KUBECONFIG_MOUNT_PATH.to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    }]),
                    resources: Some(ResourceRequirements {
                        requests: Some(BTreeMap::from([
                            ("cpu".to_string(), Quantity("10m".to_string())),
                            ("memory".to_string(), Quantity("32Mi".to_string())),
                        ])),
                        limits: Some(BTreeMap::from([(
                            "memory".to_string(),
                            Quantity("64Mi".to_string()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: "kubeconfig".to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(IPAM_CONTROLLER_KUBECONFIG_SECRET_NAME.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        },
        ..Default::default()
    });
    Ok(deployment)
}

/// Build the tenant-side ClusterRole for assigning addresses to Machines.
pub fn cluster_role(_data: &ClusterData, existing: Option<&ClusterRole>) -> Result<ClusterRole> {
    let mut role = existing.cloned().unwrap_or_default();
    set_tenant_meta(
        &mut role.metadata,
        IPAM_CONTROLLER_CLUSTER_ROLE_NAME,
        IPAM_CONTROLLER_DEPLOYMENT_NAME,
    );

    role.rules = Some(vec![PolicyRule {
        api_groups: Some(vec!["cluster.k8s.io".to_string()]),
        resources: Some(vec!["machines".to_string()]),
        verbs: vec![
            "get".to_string(),
            "list".to_string(),
            "watch".to_string(),
            "update".to_string(),
        ],
        ..Default::default()
    }]);
    Ok(role)
}

/// Build the tenant-side ClusterRoleBinding granting the certificate user
/// its ClusterRole.
pub fn cluster_role_binding(
    _data: &ClusterData,
    existing: Option<&ClusterRoleBinding>,
) -> Result<ClusterRoleBinding> {
    let mut binding = existing.cloned().unwrap_or_default();
    set_tenant_meta(
        &mut binding.metadata,
        IPAM_CONTROLLER_CLUSTER_ROLE_NAME,
        IPAM_CONTROLLER_DEPLOYMENT_NAME,
    );

    binding.subjects = Some(vec![Subject {
        kind: "User".to_string(),
        name: IPAM_CONTROLLER_CERT_USERNAME.to_string(),
        api_group: Some("rbac.authorization.k8s.io".to_string()),
        ..Default::default()
    }]);
    binding.role_ref = RoleRef {
        api_group: "rbac.authorization.k8s.io".to_string(),
        kind: "ClusterRole".to_string(),
        name: IPAM_CONTROLLER_CLUSTER_ROLE_NAME.to_string(),
    };
    Ok(binding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::running_cluster_data;
    use kubermatic_common::crd::MachineNetworkingConfig;

    fn data_with_networks() -> ClusterData {
        let mut data = running_cluster_data();
        data.cluster.spec.machine_networks = vec![
            MachineNetworkingConfig {
                cidr: "192.168.1.0/24".to_string(),
                gateway: "192.168.1.1".to_string(),
                dns_servers: vec!["8.8.8.8".to_string(), "8.8.4.4".to_string()],
            },
            MachineNetworkingConfig {
                cidr: "192.168.2.0/24".to_string(),
                gateway: "192.168.2.1".to_string(),
                dns_servers: vec!["8.8.8.8".to_string()],
            },
        ];
        data
    }

    #[test]
    fn test_deployment_receives_one_flag_per_network() {
        let deployment = deployment(&data_with_networks(), None).unwrap();

        let command = deployment.spec.unwrap().template.spec.unwrap().containers[0]
            .command
            .clone()
            .unwrap();
        assert!(command.contains(&"-network=192.168.1.0/24,192.168.1.1,8.8.8.8,8.8.4.4".to_string()));
        assert!(command.contains(&"-network=192.168.2.0/24,192.168.2.1,8.8.8.8".to_string()));
    }

    #[test]
    fn test_cluster_role_is_limited_to_machines() {
        let role = cluster_role(&data_with_networks(), None).unwrap();

        let rules = role.rules.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(
            rules[0].api_groups.as_ref().unwrap(),
            &vec!["cluster.k8s.io".to_string()]
        );
        assert!(!rules[0].verbs.contains(&"delete".to_string()));

        let binding = cluster_role_binding(&data_with_networks(), None).unwrap();
        assert_eq!(binding.subjects.unwrap()[0].name, "ipam-controller");
    }
}
