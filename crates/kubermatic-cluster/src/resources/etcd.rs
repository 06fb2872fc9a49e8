//! Etcd ring for the tenant control plane: headless Service, ServiceAccount
//! and the StatefulSet with one persistent volume per member.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction, ObjectFieldSelector,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, Service, ServiceAccount, ServicePort, ServiceSpec, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use kubermatic_common::Result;

use crate::resources::{
    app_labels, set_object_meta, ClusterData, ETCD_CLIENT_PORT, ETCD_CLUSTER_SIZE,
    ETCD_PEER_PORT, ETCD_SERVICE_ACCOUNT_NAME, ETCD_SERVICE_NAME, ETCD_STATEFUL_SET_NAME,
};

const ETCD_VERSION: &str = "3.2.20";
const DATA_DIR: &str = "/var/run/etcd";

/// Build the ServiceAccount the etcd pods run as.
pub fn service_account(data: &ClusterData, existing: Option<&ServiceAccount>) -> Result<ServiceAccount> {
    let mut sa = existing.cloned().unwrap_or_default();
    set_object_meta(&mut sa.metadata, data, ETCD_SERVICE_ACCOUNT_NAME, "etcd");
    Ok(sa)
}

/// Build the headless Service giving each etcd member a stable DNS name.
pub fn service(data: &ClusterData, existing: Option<&Service>) -> Result<Service> {
    let mut service = existing.cloned().unwrap_or_default();
    set_object_meta(&mut service.metadata, data, ETCD_SERVICE_NAME, "etcd");

    let spec = service.spec.get_or_insert_with(ServiceSpec::default);
    spec.selector = Some(app_labels("etcd"));
    spec.cluster_ip = Some("None".to_string());
    spec.ports = Some(vec![
        ServicePort {
            name: Some("client".to_string()),
            port: ETCD_CLIENT_PORT,
            target_port: Some(IntOrString::Int(ETCD_CLIENT_PORT)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        },
        ServicePort {
            name: Some("peer".to_string()),
            port: ETCD_PEER_PORT,
            target_port: Some(IntOrString::Int(ETCD_PEER_PORT)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        },
    ]);
    Ok(service)
}

fn member_host(data: &ClusterData, member: i32) -> String {
    format!(
        "{}-{}.{}.{}.svc.cluster.local",
        ETCD_STATEFUL_SET_NAME,
        member,
        ETCD_SERVICE_NAME,
        data.namespace()
    )
}

fn initial_cluster(data: &ClusterData) -> String {
    (0..ETCD_CLUSTER_SIZE)
        .map(|i| {
            format!(
                "{}-{}=http://{}:{}",
                ETCD_STATEFUL_SET_NAME,
                i,
                member_host(data, i),
                ETCD_PEER_PORT
            )
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Build the etcd StatefulSet.
pub fn stateful_set(data: &ClusterData, existing: Option<&StatefulSet>) -> Result<StatefulSet> {
    let mut stateful_set = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut stateful_set.metadata,
        data,
        ETCD_STATEFUL_SET_NAME,
        "etcd",
    );

    let pod_domain = format!("{}.{}.svc.cluster.local", ETCD_SERVICE_NAME, data.namespace());
    let command = vec![
        "/usr/local/bin/etcd".to_string(),
        "--name=$(POD_NAME)".to_string(),
        format!("--data-dir={}", DATA_DIR),
        format!("--initial-cluster={}", initial_cluster(data)),
        "--initial-cluster-state=new".to_string(),
        format!("--initial-cluster-token={}", data.cluster_name()),
        format!(
            "--advertise-client-urls=http://$(POD_NAME).{}:{}",
            pod_domain, ETCD_CLIENT_PORT
        ),
        format!(
            "--initial-advertise-peer-urls=http://$(POD_NAME).{}:{}",
            pod_domain, ETCD_PEER_PORT
        ),
        format!("--listen-client-urls=http://0.0.0.0:{}", ETCD_CLIENT_PORT),
        format!("--listen-peer-urls=http://0.0.0.0:{}", ETCD_PEER_PORT),
    ];

    let health = Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/health".to_string()),
            port: IntOrString::Int(ETCD_CLIENT_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(15),
        timeout_seconds: Some(5),
        ..Default::default()
    };

    stateful_set.spec = Some(StatefulSetSpec {
        replicas: Some(ETCD_CLUSTER_SIZE),
        service_name: ETCD_SERVICE_NAME.to_string(),
        // All members list each other in --initial-cluster and only turn
        // healthy at quorum, so ordered startup would never get past pod 0.
        pod_management_policy: Some("Parallel".to_string()),
        selector: LabelSelector {
            match_labels: Some(app_labels("etcd")),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(app_labels("etcd")),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                service_account_name: Some(ETCD_SERVICE_ACCOUNT_NAME.to_string()),
                containers: vec![Container {
                    name: "etcd".to_string(),
                    image: Some(format!(
                        "{}/coreos/etcd:v{}",
                        data.registry("quay.io"),
                        ETCD_VERSION
                    )),
                    command: Some(command),
                    env: Some(vec![EnvVar {
                        name: "POD_NAME".to_string(),
                        value_from: Some(EnvVarSource {
                            field_ref: Some(ObjectFieldSelector {
                                field_path: "metadata.name".to_string(),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ports: Some(vec![
                        ContainerPort {
                            name: Some("client".to_string()),
                            container_port: ETCD_CLIENT_PORT,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        },
                        ContainerPort {
                            name: Some("peer".to_string()),
                            container_port: ETCD_PEER_PORT,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        },
                    ]),
                    readiness_probe: Some(health.clone()),
                    liveness_probe: Some(Probe {
                        initial_delay_seconds: Some(60),
                        ..health
                    }),
                    volume_mounts: Some(vec![VolumeMount {
                        name: "data".to_string(),
                        mount_path: DATA_DIR.to_string(),
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
                ..Default::default()
            }),
        },
        volume_claim_templates: Some(vec![PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data".to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(data.config.etcd_disk_size.clone()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]),
        ..Default::default()
    });
    Ok(stateful_set)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_is_headless() {
        let data = ClusterData::for_testing();
        let service = service(&data, None).unwrap();

        let spec = service.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].port, 2379);
        assert_eq!(ports[1].port, 2380);
    }

    #[test]
    fn test_stateful_set_forms_full_ring_from_the_start() {
        let data = ClusterData::for_testing();
        let sts = stateful_set(&data, None).unwrap();

        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.pod_management_policy.as_deref(), Some("Parallel"));

        let command = spec.template.spec.unwrap().containers[0]
            .command
            .clone()
            .unwrap();
        let initial = command
            .iter()
            .find(|flag| flag.starts_with("--initial-cluster="))
            .unwrap();
        for member in 0..3 {
            assert!(initial.contains(&format!(
                "etcd-{}=http://etcd-{}.etcd.cluster-fqpcvnc6v.svc.cluster.local:2380",
                member, member
            )));
        }
    }

    #[test]
    fn test_stateful_set_volume_claim_uses_configured_size() {
        let mut data = ClusterData::for_testing();
        data.config.etcd_disk_size = "20Gi".to_string();

        let sts = stateful_set(&data, None).unwrap();
        let claims = sts.spec.unwrap().volume_claim_templates.unwrap();
        let storage = claims[0]
            .spec
            .as_ref()
            .unwrap()
            .resources
            .as_ref()
            .unwrap()
            .requests
            .as_ref()
            .unwrap()["storage"]
            .clone();
        assert_eq!(storage.0, "20Gi");
    }

    #[test]
    fn test_members_resolve_through_headless_service() {
        let data = ClusterData::for_testing();
        assert_eq!(
            member_host(&data, 1),
            "etcd-1.etcd.cluster-fqpcvnc6v.svc.cluster.local"
        );
    }
}
