//! kube-state-metrics resources: the kubeconfig it authenticates with, the
//! Deployment on the seed and the RBAC it needs inside the tenant cluster.
//!
//! The pod runs next to the control plane but watches the tenant apiserver,
//! so its permissions live there: a ClusterRole bound to the certificate
//! user from the generated kubeconfig.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, HTTPGetAction, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, Secret, SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use kubermatic_common::Result;
use kubermatic_cluster::resources::kubeconfig::{self, KUBECONFIG_KEY};
use kubermatic_cluster::resources::{app_labels, set_object_meta, ClusterData};

use crate::resources::{
    set_tenant_meta, KUBE_STATE_METRICS_CERT_USERNAME, KUBE_STATE_METRICS_CLUSTER_ROLE_NAME,
    KUBE_STATE_METRICS_DEPLOYMENT_NAME, KUBE_STATE_METRICS_KUBECONFIG_SECRET_NAME,
};

const KUBE_STATE_METRICS_TAG: &str = "v1.5.0";
const METRICS_PORT: i32 = 8080;
const TELEMETRY_PORT: i32 = 8081;

const KUBECONFIG_MOUNT_PATH: &str = "/etc/kubernetes/kubeconfig";

/// Build the kubeconfig Secret kube-state-metrics connects to the tenant
/// apiserver with.
pub fn kubeconfig_secret(data: &ClusterData, existing: Option<&Secret>) -> Result<Secret> {
    kubeconfig::internal_kubeconfig(
        data,
        existing,
        KUBE_STATE_METRICS_KUBECONFIG_SECRET_NAME,
        KUBE_STATE_METRICS_CERT_USERNAME,
        None,
        KUBE_STATE_METRICS_DEPLOYMENT_NAME,
    )
}

/// Build the kube-state-metrics Deployment.
pub fn deployment(data: &ClusterData, existing: Option<&Deployment>) -> Result<Deployment> {
    let mut deployment = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut deployment.metadata,
        data,
        KUBE_STATE_METRICS_DEPLOYMENT_NAME,
        KUBE_STATE_METRICS_DEPLOYMENT_NAME,
    );

    let args = vec![
        format!("--kubeconfig={}/{}", KUBECONFIG_MOUNT_PATH, KUBECONFIG_KEY),
        format!("--port={}", METRICS_PORT),
        format!("--telemetry-port={}", TELEMETRY_PORT),
    ];

    let probe = |path: &str, delay: i32| Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(METRICS_PORT),
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
            match_labels: Some(app_labels(KUBE_STATE_METRICS_DEPLOYMENT_NAME)),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(app_labels(KUBE_STATE_METRICS_DEPLOYMENT_NAME)),
                // Picked up by the control-plane-pods scrape job.
                annotations: Some(BTreeMap::from([
                    ("prometheus.io/scrape".to_string(), "true".to_string()),
                    ("prometheus.io/port".to_string(), METRICS_PORT.to_string()),
                ])),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: KUBE_STATE_METRICS_DEPLOYMENT_NAME.to_string(),
                    image: Some(format!(
                        "{}/coreos/kube-state-metrics:{}",
                        data.registry("quay.io"),
                        KUBE_STATE_METRICS_TAG
                    )),
                    args: Some(args),
                    ports: Some(vec![
                        ContainerPort {
                            name: Some("metrics".to_string()),
                            container_port: METRICS_PORT,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        },
                        ContainerPort {
                            name: Some("telemetry".to_string()),
                            container_port: TELEMETRY_PORT,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        },
                    ]),
                    readiness_probe: Some(probe("/healthz", 15)),
                    liveness_probe: Some(probe("/healthz", 30)),
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
                            Quantity("128Mi".to_string()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: "kubeconfig".to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(KUBE_STATE_METRICS_KUBECONFIG_SECRET_NAME.to_string()),
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

/// Build the tenant-side ClusterRole listing everything kube-state-metrics
/// exports state for.
pub fn cluster_role(_data: &ClusterData, existing: Option<&ClusterRole>) -> Result<ClusterRole> {
    let mut role = existing.cloned().unwrap_or_default();
    set_tenant_meta(
        &mut role.metadata,
        KUBE_STATE_METRICS_CLUSTER_ROLE_NAME,
        KUBE_STATE_METRICS_DEPLOYMENT_NAME,
    );

    let watch = || {
        vec!["list".to_string(), "watch".to_string()]
    };
    role.rules = Some(vec![
        PolicyRule {
            api_groups: Some(vec!["".to_string()]),
            resources: Some(
                [
                    "configmaps",
                    "endpoints",
                    "limitranges",
                    "namespaces",
                    "nodes",
                    "persistentvolumeclaims",
                    "persistentvolumes",
                    "pods",
                    "replicationcontrollers",
                    "resourcequotas",
                    "secrets",
                    "services",
                ]
                .iter()
                .map(|r| r.to_string())
                .collect(),
            ),
            verbs: watch(),
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec!["apps".to_string(), "extensions".to_string()]),
            resources: Some(
                ["daemonsets", "deployments", "replicasets", "statefulsets"]
                    .iter()
                    .map(|r| r.to_string())
                    .collect(),
            ),
            verbs: watch(),
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec!["batch".to_string()]),
            resources: Some(vec!["cronjobs".to_string(), "jobs".to_string()]),
            verbs: watch(),
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec!["autoscaling".to_string()]),
            resources: Some(vec!["horizontalpodautoscalers".to_string()]),
            verbs: watch(),
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec!["policy".to_string()]),
            resources: Some(vec!["poddisruptionbudgets".to_string()]),
            verbs: watch(),
            ..Default::default()
        },
    ]);
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
        KUBE_STATE_METRICS_CLUSTER_ROLE_NAME,
        KUBE_STATE_METRICS_DEPLOYMENT_NAME,
    );

    binding.subjects = Some(vec![Subject {
        kind: "User".to_string(),
        name: KUBE_STATE_METRICS_CERT_USERNAME.to_string(),
        api_group: Some("rbac.authorization.k8s.io".to_string()),
        ..Default::default()
    }]);
    binding.role_ref = RoleRef {
        api_group: "rbac.authorization.k8s.io".to_string(),
        kind: "ClusterRole".to_string(),
        name: KUBE_STATE_METRICS_CLUSTER_ROLE_NAME.to_string(),
    };
    Ok(binding)
}
