//! Scheduler Deployment for the tenant control plane.

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

use crate::resources::kubeconfig::KUBECONFIG_KEY;
use crate::resources::{
    app_labels, set_object_meta, ClusterData, SCHEDULER_DEPLOYMENT_NAME,
    SCHEDULER_KUBECONFIG_SECRET_NAME,
};

const HEALTH_PORT: i32 = 10251;

const KUBECONFIG_MOUNT_PATH: &str = "/etc/kubernetes/kubeconfig";

/// Build the scheduler Deployment.
pub fn deployment(data: &ClusterData, existing: Option<&Deployment>) -> Result<Deployment> {
    let mut deployment = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut deployment.metadata,
        data,
        SCHEDULER_DEPLOYMENT_NAME,
        "scheduler",
    );

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
            match_labels: Some(app_labels("scheduler")),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(app_labels("scheduler")),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "scheduler".to_string(),
                    image: Some(format!(
                        "{}/hyperkube-amd64:v{}",
                        data.registry("k8s.gcr.io"),
                        data.version()
                    )),
                    command: Some(vec![
                        "/hyperkube".to_string(),
                        "scheduler".to_string(),
                        format!("--kubeconfig={}/{}", KUBECONFIG_MOUNT_PATH, KUBECONFIG_KEY),
                        "--v=2".to_string(),
                    ]),
                    readiness_probe: Some(probe.clone()),
                    liveness_probe: Some(probe),
                    volume_mounts: Some(vec![VolumeMount {
                        name: "kubeconfig".to_string(),
                        mount_path: KUBECONFIG_MOUNT_PATH.to_string(),
                        read_only: Some(true),
                        ..Default::default()
                    }]),
                    resources: Some(ResourceRequirements {
                        requests: Some(BTreeMap::from([
                            ("cpu".to_string(), Quantity("20m".to_string())),
                            ("memory".to_string(), Quantity("64Mi".to_string())),
                        ])),
                        limits: Some(BTreeMap::from([(
                            "memory".to_string(),
                            Quantity("256Mi".to_string()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                volumes: Some(vec![Volume {
                    name: "kubeconfig".to_string(),
                    secret: Some(SecretVolumeSource {
                        secret_name: Some(SCHEDULER_KUBECONFIG_SECRET_NAME.to_string()),
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
    fn test_deployment_talks_through_its_own_kubeconfig() {
        let data = ClusterData::for_testing();
        let deployment = deployment(&data, None).unwrap();

        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let command = pod.containers[0].command.clone().unwrap();
        assert!(command
            .contains(&"--kubeconfig=/etc/kubernetes/kubeconfig/kubeconfig".to_string()));

        let volume = &pod.volumes.unwrap()[0];
        assert_eq!(
            volume.secret.as_ref().unwrap().secret_name.as_deref(),
            Some("scheduler-kubeconfig")
        );
    }
}
