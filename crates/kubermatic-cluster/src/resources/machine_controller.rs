//! Machine-controller resources: ServiceAccount, leader-election RBAC and
//! the Deployment provisioning tenant nodes at the cloud provider.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, HTTPGetAction, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
    SecretVolumeSource, ServiceAccount, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use kubermatic_common::Result;

use crate::resources::kubeconfig::KUBECONFIG_KEY;
use crate::resources::{
    app_labels, set_object_meta, ClusterData, MACHINE_CONTROLLER_DEPLOYMENT_NAME,
    MACHINE_CONTROLLER_KUBECONFIG_SECRET_NAME, MACHINE_CONTROLLER_ROLE_BINDING_NAME,
    MACHINE_CONTROLLER_ROLE_NAME, MACHINE_CONTROLLER_SERVICE_ACCOUNT_NAME,
};

const MACHINE_CONTROLLER_TAG: &str = "v0.10.0";
const HEALTH_PORT: i32 = 8085;

const KUBECONFIG_MOUNT_PATH: &str = "/etc/kubernetes/kubeconfig";

/// Build the ServiceAccount the machine-controller runs as.
pub fn service_account(data: &ClusterData, existing: Option<&ServiceAccount>) -> Result<ServiceAccount> {
    let mut sa = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut sa.metadata,
        data,
        MACHINE_CONTROLLER_SERVICE_ACCOUNT_NAME,
        "machine-controller",
    );
    Ok(sa)
}

/// Build the Role granting leader election inside the cluster namespace.
pub fn role(data: &ClusterData, existing: Option<&Role>) -> Result<Role> {
    let mut role = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut role.metadata,
        data,
        MACHINE_CONTROLLER_ROLE_NAME,
        "machine-controller",
    );

    role.rules = Some(vec![
        PolicyRule {
            api_groups: Some(vec!["".to_string()]),
            resources: Some(vec!["configmaps".to_string(), "endpoints".to_string()]),
            verbs: vec![
                "get".to_string(),
                "list".to_string(),
                "watch".to_string(),
                "create".to_string(),
                "update".to_string(),
            ],
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec!["coordination.k8s.io".to_string()]),
            resources: Some(vec!["leases".to_string()]),
            verbs: vec![
                "get".to_string(),
                "create".to_string(),
                "update".to_string(),
            ],
            ..Default::default()
        },
    ]);
    Ok(role)
}

/// Build the RoleBinding attaching the leader-election Role to the
/// machine-controller ServiceAccount.
pub fn role_binding(data: &ClusterData, existing: Option<&RoleBinding>) -> Result<RoleBinding> {
    let mut binding = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut binding.metadata,
        data,
        MACHINE_CONTROLLER_ROLE_BINDING_NAME,
        "machine-controller",
    );

    binding.subjects = Some(vec![Subject {
        kind: "ServiceAccount".to_string(),
        name: MACHINE_CONTROLLER_SERVICE_ACCOUNT_NAME.to_string(),
        namespace: Some(data.namespace().to_string()),
        ..Default::default()
    }]);
    binding.role_ref = RoleRef {
        api_group: "rbac.authorization.k8s.io".to_string(),
        kind: "Role".to_string(),
        name: MACHINE_CONTROLLER_ROLE_NAME.to_string(),
    };
    Ok(binding)
}

/// Build the machine-controller Deployment.
pub fn deployment(data: &ClusterData, existing: Option<&Deployment>) -> Result<Deployment> {
    let mut deployment = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut deployment.metadata,
        data,
        MACHINE_CONTROLLER_DEPLOYMENT_NAME,
        "machine-controller",
    );

    let command = vec![
        "/usr/local/bin/machine-controller".to_string(),
        format!("-kubeconfig={}/{}", KUBECONFIG_MOUNT_PATH, KUBECONFIG_KEY),
        format!("-cluster-dns={}", data.cluster_dns_ip()?),
        format!("-internal-listen-address=0.0.0.0:{}", HEALTH_PORT),
        "-logtostderr".to_string(),
        "-v=4".to_string(),
    ];

    let probe = |path: &str, delay: i32| Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(HEALTH_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(delay),
        timeout_seconds: Some(5),
        ..Default::default()
    };

    deployment.spec = Some(DeploymentSpec {
        replicas: Some(1),
        selector: LabelSelector {
            match_labels: Some(app_labels("machine-controller")),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(app_labels("machine-controller")),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                service_account_name: Some(
                    MACHINE_CONTROLLER_SERVICE_ACCOUNT_NAME.to_string(),
                ),
                containers: vec![Container {
                    name: "machine-controller".to_string(),
                    image: Some(format!(
                        "{}/kubermatic/machine-controller:{}",
                        data.registry("docker.io"),
                        MACHINE_CONTROLLER_TAG
                    )),
                    command: Some(command),
                    readiness_probe: Some(probe("/ready", 15)),
                    liveness_probe: Some(probe("/live", 30)),
                    volume_mounts: Some(vec![VolumeMount {
                        name: "kubeconfig".to_string(),
                        mount_path: KUBECONFIG_MOUNT_PATH.to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    }]),
                    resources: Some(ResourceRequirements {
                        requests: Some(BTreeMap::from([
                            ("cpu".to_string(), Quantity("50m".to_string())),
                            ("memory".to_string(), Quantity("128Mi".to_string())),
                        ])),
                        limits: Some(BTreeMap::from([(
                            "memory".to_string(),
                            Quantity("512Mi".to_string()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: "kubeconfig".to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(MACHINE_CONTROLLER_KUBECONFIG_SECRET_NAME.to_string()),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_binding_targets_the_service_account() {
        let data = ClusterData::for_testing();
        let binding = role_binding(&data, None).unwrap();

        let subject = &binding.subjects.unwrap()[0];
        assert_eq!(subject.kind, "ServiceAccount");
        assert_eq!(subject.name, "machine-controller");
        assert_eq!(subject.namespace.as_deref(), Some("cluster-fqpcvnc6v"));
        assert_eq!(binding.role_ref.name, "machine-controller");
    }

    #[test]
    fn test_role_is_scoped_to_leader_election_resources() {
        let data = ClusterData::for_testing();
        let role = role(&data, None).unwrap();

        let rules = role.rules.unwrap();
        let core = &rules[0];
        assert!(core.resources.as_ref().unwrap().contains(&"configmaps".to_string()));
        assert!(!core.verbs.contains(&"delete".to_string()));
    }

    #[test]
    fn test_deployment_points_nodes_at_cluster_dns() {
        let data = ClusterData::for_testing();
        let deployment = deployment(&data, None).unwrap();

        let pod = deployment.spec.unwrap().template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("machine-controller"));

        let command = pod.containers[0].command.clone().unwrap();
        // 10.240.16.0/20 service network puts DNS at .10.
        assert!(command.contains(&"-cluster-dns=10.240.16.10".to_string()));
    }
}
