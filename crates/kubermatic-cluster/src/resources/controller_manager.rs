//! Controller-manager Deployment for the tenant control plane.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, HTTPGetAction, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use kubermatic_common::Result;

use crate::resources::certificates::{CA_CERT_KEY, CA_KEY_KEY, SERVICE_ACCOUNT_KEY_KEY};
use crate::resources::kubeconfig::KUBECONFIG_KEY;
use crate::resources::{
    app_labels, set_object_meta, ClusterData, CA_SECRET_NAME,
    CONTROLLER_MANAGER_DEPLOYMENT_NAME, CONTROLLER_MANAGER_KUBECONFIG_SECRET_NAME,
    SERVICE_ACCOUNT_KEY_SECRET_NAME,
};

const HEALTH_PORT: i32 = 10252;

const KUBECONFIG_MOUNT_PATH: &str = "/etc/kubernetes/kubeconfig";
const CA_MOUNT_PATH: &str = "/etc/kubernetes/ca";
const SERVICE_ACCOUNT_KEY_MOUNT_PATH: &str = "/etc/kubernetes/service-account-key";

/// Build the controller-manager Deployment.
pub fn deployment(data: &ClusterData, existing: Option<&Deployment>) -> Result<Deployment> {
    let mut deployment = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut deployment.metadata,
        data,
        CONTROLLER_MANAGER_DEPLOYMENT_NAME,
        "controller-manager",
    );

    let mut command = vec![
        "/hyperkube".to_string(),
        "controller-manager".to_string(),
        format!("--kubeconfig={}/{}", KUBECONFIG_MOUNT_PATH, KUBECONFIG_KEY),
        format!(
            "--service-account-private-key-file={}/{}",
            SERVICE_ACCOUNT_KEY_MOUNT_PATH, SERVICE_ACCOUNT_KEY_KEY
        ),
        format!("--root-ca-file={}/{}", CA_MOUNT_PATH, CA_CERT_KEY),
        format!("--cluster-signing-cert-file={}/{}", CA_MOUNT_PATH, CA_CERT_KEY),
        format!("--cluster-signing-key-file={}/{}", CA_MOUNT_PATH, CA_KEY_KEY),
        "--controllers=*,bootstrapsigner,tokencleaner".to_string(),
        "--use-service-account-credentials=true".to_string(),
        "--configure-cloud-routes=false".to_string(),
        "--v=2".to_string(),
    ];
    if let Some(pod_cidr) = data
        .cluster
        .spec
        .cluster_network
        .pods
        .cidr_blocks
        .first()
    {
        command.push(format!("--cluster-cidr={}", pod_cidr));
        command.push("--allocate-node-cidrs=true".to_string());
    }

    let probe = Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/healthz".to_string()),
            port: IntOrString::Int(HEALTH_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(15),
        timeout_seconds: Some(5),
        ..Default::default()
    };

    deployment.spec = Some(DeploymentSpec {
        replicas: Some(1),
        selector: LabelSelector {
            match_labels: Some(app_labels("controller-manager")),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(app_labels("controller-manager")),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "controller-manager".to_string(),
                    image: Some(format!(
                        "{}/hyperkube-amd64:v{}",
                        data.registry("k8s.gcr.io"),
                        data.version()
                    )),
                    command: Some(command),
                    readiness_probe: Some(probe.clone()),
                    liveness_probe: Some(probe),
                    volume_mounts: Some(vec![
                        VolumeMount {
                            name: "kubeconfig".to_string(),
                            mount_path: KUBECONFIG_MOUNT_PATH.to_string(),
                            read_only: Some(true),
                            ..Default::default()
                        },
                        VolumeMount {
                            name: "ca".to_string(),
                            mount_path: CA_MOUNT_PATH.to_string(),
                            read_only: Some(true),
                            ..Default::default()
                        },
                        VolumeMount {
                            name: "service-account-key".to_string(),
                            mount_path: SERVICE_ACCOUNT_KEY_MOUNT_PATH.to_string(),
                            read_only: Some(true),
                            ..Default::default()
                        },
                    ]),
                    resources: Some(ResourceRequirements {
                        requests: Some(BTreeMap::from([
                            ("cpu".to_string(), Quantity("100m".to_string())),
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
                volumes: Some(vec![
                    Volume {
                        name: "kubeconfig".to_string(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(
                                CONTROLLER_MANAGER_KUBECONFIG_SECRET_NAME.to_string(),
                            ),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Volume {
                        name: "ca".to_string(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(CA_SECRET_NAME.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Volume {
                        name: "service-account-key".to_string(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(SERVICE_ACCOUNT_KEY_SECRET_NAME.to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                ]),
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
    fn test_deployment_signs_with_the_cluster_ca() {
        let data = ClusterData::for_testing();
        let deployment = deployment(&data, None).unwrap();

        let command = deployment
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .containers[0]
            .command
            .clone()
            .unwrap();
        assert!(command.contains(&"--cluster-signing-cert-file=/etc/kubernetes/ca/ca.crt".to_string()));
        assert!(command.contains(&"--cluster-signing-key-file=/etc/kubernetes/ca/ca.key".to_string()));
        assert!(command.contains(&"--cluster-cidr=172.25.0.0/16".to_string()));
    }

    #[test]
    fn test_deployment_skips_node_cidrs_without_pod_network() {
        let mut data = ClusterData::for_testing();
        data.cluster.spec.cluster_network.pods.cidr_blocks.clear();

        let deployment = deployment(&data, None).unwrap();
        let command = deployment
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .containers[0]
            .command
            .clone()
            .unwrap();
        assert!(!command.iter().any(|f| f.starts_with("--cluster-cidr")));
        assert!(!command.iter().any(|f| f.starts_with("--allocate-node-cidrs")));
    }
}
