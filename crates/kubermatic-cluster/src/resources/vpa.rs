//! Vertical pod autoscaler recommender for the control plane components,
//! deployed into the cluster namespace when the controller runs with
//! `--enable-vpa`.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, HTTPGetAction, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use kubermatic_common::Result;

use crate::resources::{app_labels, set_object_meta, ClusterData, VPA_DEPLOYMENT_NAME};

const VPA_VERSION: &str = "0.2.1";
const METRICS_PORT: i32 = 8942;

/// Build the VPA recommender Deployment.
pub fn deployment(data: &ClusterData, existing: Option<&Deployment>) -> Result<Deployment> {
    let mut deployment = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut deployment.metadata,
        data,
        VPA_DEPLOYMENT_NAME,
        "vpa-recommender",
    );

    deployment.spec = Some(DeploymentSpec {
        replicas: Some(1),
        selector: LabelSelector {
            match_labels: Some(app_labels("vpa-recommender")),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(app_labels("vpa-recommender")),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "vpa-recommender".to_string(),
                    image: Some(format!(
                        "{}/vpa-recommender:{}",
                        data.registry("k8s.gcr.io"),
                        VPA_VERSION
                    )),
                    command: Some(vec![
                        "/recommender".to_string(),
                        format!("--address=:{METRICS_PORT}"),
                        "--v=2".to_string(),
                    ]),
                    readiness_probe: Some(Probe {
                        http_get: Some(HTTPGetAction {
                            path: Some("/metrics".to_string()),
                            port: IntOrString::Int(METRICS_PORT),
                            scheme: Some("HTTP".to_string()),
                            ..Default::default()
                        }),
                        initial_delay_seconds: Some(15),
                        timeout_seconds: Some(5),
                        ..Default::default()
                    }),
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
                ..Default::default()
            }),
        },
        ..Default::default()
    });
    Ok(deployment)
}
