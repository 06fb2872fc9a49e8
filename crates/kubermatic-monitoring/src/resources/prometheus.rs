//! Prometheus resources: RBAC for pod discovery, the scrape configuration,
//! the apiserver client certificate and the StatefulSet itself.
//!
//! The instance is deliberately ephemeral. It keeps one hour of data on an
//! emptyDir and exists so the seed-level Prometheus can federate the
//! `kubermatic: federate` series; losing the pod loses nothing of value.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource,
    HTTPGetAction, PodSpec, PodTemplateSpec, Probe, ResourceRequirements, Secret,
    SecretVolumeSource, Service, ServiceAccount, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use serde_json::json;

use kubermatic_common::{Error, Result};
use kubermatic_cluster::pki;
use kubermatic_cluster::resources::certificates::CA_CERT_KEY;
use kubermatic_cluster::resources::{
    app_labels, set_object_meta, ClusterData, ETCD_CLIENT_PORT, ETCD_CLUSTER_SIZE,
    ETCD_SERVICE_NAME, ETCD_STATEFUL_SET_NAME,
};

use crate::resources::{
    PROMETHEUS_APISERVER_CERTIFICATE_SECRET_NAME, PROMETHEUS_CERT_USERNAME, PROMETHEUS_NAME,
    PROMETHEUS_PORT,
};

const PROMETHEUS_TAG: &str = "v2.7.1";

/// Key of the client certificate in the apiserver certificate Secret.
pub const PROMETHEUS_CLIENT_CERT_KEY: &str = "prometheus-client.crt";
/// Key of the client key in the apiserver certificate Secret.
pub const PROMETHEUS_CLIENT_KEY_KEY: &str = "prometheus-client.key";

const CONFIG_KEY: &str = "prometheus.yaml";
const RULES_KEY: &str = "rules.yaml";

const CONFIG_MOUNT_PATH: &str = "/etc/prometheus/config";
const CERT_MOUNT_PATH: &str = "/etc/kubernetes";
const DATA_DIR: &str = "/var/prometheus/data";

/// Recording rules federated by the seed Prometheus plus the etcd alerts
/// the seed Alertmanager routes. Alert names are part of the inhibition
/// config there, renaming them breaks routing.
const PROMETHEUS_RULES: &str = r#"groups:
- name: kubermatic.goprocess
  rules:
  - record: job:process_resident_memory_bytes:clone
    expr: process_resident_memory_bytes
    labels:
      kubermatic: federate
  - record: job:process_cpu_seconds_total:rate5m
    expr: rate(process_cpu_seconds_total[5m])
    labels:
      kubermatic: federate
  - record: job:process_open_fds:clone
    expr: process_open_fds
    labels:
      kubermatic: federate
- name: kubermatic.etcd
  rules:
  - alert: EtcdInsufficientMembers
    annotations:
      message: 'Etcd cluster "{{ $labels.job }}": insufficient members ({{ $value }}).'
    expr: |
      sum(up{job="etcd"} == bool 1) by (job) < ((count(up{job="etcd"}) by (job) + 1) / 2)
    for: 15m
    labels:
      severity: critical
  - alert: EtcdNoLeader
    annotations:
      message: 'Etcd cluster "{{ $labels.job }}": member {{ $labels.instance }} has no leader.'
    expr: |
      etcd_server_has_leader{job="etcd"} == 0
    for: 15m
    labels:
      severity: critical
"#;

/// Build the ServiceAccount Prometheus runs as.
pub fn service_account(data: &ClusterData, existing: Option<&ServiceAccount>) -> Result<ServiceAccount> {
    let mut sa = existing.cloned().unwrap_or_default();
    set_object_meta(&mut sa.metadata, data, PROMETHEUS_NAME, PROMETHEUS_NAME);
    Ok(sa)
}

/// Build the Role allowing pod discovery inside the cluster namespace.
pub fn role(data: &ClusterData, existing: Option<&Role>) -> Result<Role> {
    let mut role = existing.cloned().unwrap_or_default();
    set_object_meta(&mut role.metadata, data, PROMETHEUS_NAME, PROMETHEUS_NAME);

    role.rules = Some(vec![PolicyRule {
        api_groups: Some(vec!["".to_string()]),
        resources: Some(vec![
            "endpoints".to_string(),
            "pods".to_string(),
            "services".to_string(),
        ]),
        verbs: vec![
            "get".to_string(),
            "list".to_string(),
            "watch".to_string(),
        ],
        ..Default::default()
    }]);
    Ok(role)
}

/// Build the RoleBinding attaching the discovery Role to the Prometheus
/// ServiceAccount.
pub fn role_binding(data: &ClusterData, existing: Option<&RoleBinding>) -> Result<RoleBinding> {
    let mut binding = existing.cloned().unwrap_or_default();
    set_object_meta(&mut binding.metadata, data, PROMETHEUS_NAME, PROMETHEUS_NAME);

    binding.subjects = Some(vec![Subject {
        kind: "ServiceAccount".to_string(),
        name: PROMETHEUS_NAME.to_string(),
        namespace: Some(data.namespace().to_string()),
        ..Default::default()
    }]);
    binding.role_ref = RoleRef {
        api_group: "rbac.authorization.k8s.io".to_string(),
        kind: "Role".to_string(),
        name: PROMETHEUS_NAME.to_string(),
    };
    Ok(binding)
}

/// Build the Secret with the client certificate Prometheus uses against the
/// tenant apiserver. Reissued only when the existing certificate no longer
/// matches the cluster CA.
pub fn apiserver_client_certificate(
    data: &ClusterData,
    existing: Option<&Secret>,
) -> Result<Secret> {
    let mut secret = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut secret.metadata,
        data,
        PROMETHEUS_APISERVER_CERTIFICATE_SECRET_NAME,
        PROMETHEUS_NAME,
    );

    let issuer = format!("root-ca.{}", data.cluster_name());
    if let Some(cert) = secret
        .data
        .as_ref()
        .and_then(|d| d.get(PROMETHEUS_CLIENT_CERT_KEY))
    {
        if pki::client_cert_valid(&cert.0, &issuer) {
            return Ok(secret);
        }
    }

    let ca = data.ca()?;
    let key_cert = ca.issue_client_cert(PROMETHEUS_CERT_USERNAME, None)?;
    secret.data = Some(BTreeMap::from([
        (
            CA_CERT_KEY.to_string(),
            ByteString(ca.ca_cert_pem().as_bytes().to_vec()),
        ),
        (
            PROMETHEUS_CLIENT_CERT_KEY.to_string(),
            ByteString(key_cert.cert.as_ref().to_vec()),
        ),
        (
            PROMETHEUS_CLIENT_KEY_KEY.to_string(),
            ByteString(key_cert.key.as_ref().to_vec()),
        ),
    ]));
    Ok(secret)
}

/// Build the ConfigMap holding the scrape configuration and rules.
///
/// Three jobs: the etcd ring via static targets (plain HTTP, the ring has
/// no TLS), the control plane pods that require the apiserver client
/// certificate, and everything else opting in through the
/// `prometheus.io/scrape` annotation. Every series is labelled with the
/// cluster and seed name so the federating seed Prometheus can tell tenants
/// apart.
pub fn config_map(data: &ClusterData, existing: Option<&ConfigMap>) -> Result<ConfigMap> {
    let mut config_map = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut config_map.metadata,
        data,
        PROMETHEUS_NAME,
        PROMETHEUS_NAME,
    );

    let namespace = data.namespace();
    let etcd_targets: Vec<String> = (0..ETCD_CLUSTER_SIZE)
        .map(|i| {
            format!(
                "{}-{}.{}.{}.svc.cluster.local:{}",
                ETCD_STATEFUL_SET_NAME, i, ETCD_SERVICE_NAME, namespace, ETCD_CLIENT_PORT
            )
        })
        .collect();

    let pod_relabel_configs = json!([
        {
            "source_labels": ["__meta_kubernetes_pod_annotation_prometheus_io_path"],
            "action": "replace",
            "target_label": "__metrics_path__",
            "regex": "(.+)"
        },
        {
            "source_labels": ["__address__", "__meta_kubernetes_pod_annotation_prometheus_io_port"],
            "action": "replace",
            "regex": r"([^:]+)(?::\d+)?;(\d+)",
            "replacement": "$1:$2",
            "target_label": "__address__"
        },
        {
            "source_labels": ["__meta_kubernetes_namespace"],
            "action": "replace",
            "target_label": "namespace"
        },
        {
            "source_labels": ["__meta_kubernetes_pod_name"],
            "action": "replace",
            "target_label": "pod"
        },
        {
            "source_labels": ["__meta_kubernetes_pod_label_app"],
            "action": "replace",
            "target_label": "job"
        }
    ]);

    let mut control_plane_relabels = vec![json!({
        "source_labels": ["__meta_kubernetes_pod_annotation_prometheus_io_scrape_with_kube_cert"],
        "action": "keep",
        "regex": true
    })];
    let mut pods_relabels = vec![json!({
        "source_labels": ["__meta_kubernetes_pod_annotation_prometheus_io_scrape"],
        "action": "keep",
        "regex": true
    })];
    if let Some(common) = pod_relabel_configs.as_array() {
        control_plane_relabels.extend(common.iter().cloned());
        pods_relabels.extend(common.iter().cloned());
    }

    let config = json!({
        "global": {
            "evaluation_interval": "30s",
            "scrape_interval": "30s",
            "external_labels": {
                "cluster": data.cluster_name(),
                "seed_cluster": data.seed_name
            }
        },
        "rule_files": [format!("{}/{}", CONFIG_MOUNT_PATH, RULES_KEY)],
        "alerting": {
            "alertmanagers": [{
                "dns_sd_configs": [{
                    "names": ["alertmanager.monitoring.svc.cluster.local"],
                    "type": "A",
                    "port": 9093
                }]
            }]
        },
        "scrape_configs": [
            {
                "job_name": "etcd",
                "static_configs": [{"targets": etcd_targets}],
                "relabel_configs": [{
                    "source_labels": ["__address__"],
                    "regex": r"(etcd-\d+).+",
                    "action": "replace",
                    "replacement": "$1",
                    "target_label": "instance"
                }]
            },
            {
                "job_name": "kubernetes-control-plane",
                "scheme": "https",
                "tls_config": {
                    "ca_file": format!("{}/{}", CERT_MOUNT_PATH, CA_CERT_KEY),
                    "cert_file": format!("{}/{}", CERT_MOUNT_PATH, PROMETHEUS_CLIENT_CERT_KEY),
                    "key_file": format!("{}/{}", CERT_MOUNT_PATH, PROMETHEUS_CLIENT_KEY_KEY),
                    // The serving certificate carries service names, not
                    // pod IPs, which is what pod discovery dials.
                    "insecure_skip_verify": true
                },
                "kubernetes_sd_configs": [{
                    "role": "pod",
                    "namespaces": {"names": [namespace]}
                }],
                "relabel_configs": control_plane_relabels,
                "metric_relabel_configs": [
                    {
                        "source_labels": ["__name__"],
                        "regex": "apiserver_request_(duration|latencies)_.*",
                        "action": "drop"
                    },
                    {
                        "source_labels": ["__name__"],
                        "regex": "apiserver_response_sizes_.*",
                        "action": "drop"
                    }
                ]
            },
            {
                "job_name": "control-plane-pods",
                "kubernetes_sd_configs": [{
                    "role": "pod",
                    "namespaces": {"names": [namespace]}
                }],
                "relabel_configs": pods_relabels
            }
        ]
    });
    let rendered = serde_yaml::to_string(&config)
        .map_err(|e| Error::serialization_for_kind("ConfigMap", e.to_string()))?;

    config_map.data = Some(BTreeMap::from([
        (CONFIG_KEY.to_string(), rendered),
        (RULES_KEY.to_string(), PROMETHEUS_RULES.to_string()),
    ]));
    Ok(config_map)
}

/// Build the headless Service governing the StatefulSet.
pub fn service(data: &ClusterData, existing: Option<&Service>) -> Result<Service> {
    let mut service = existing.cloned().unwrap_or_default();
    set_object_meta(&mut service.metadata, data, PROMETHEUS_NAME, PROMETHEUS_NAME);

    service.spec = Some(ServiceSpec {
        cluster_ip: Some("None".to_string()),
        selector: Some(app_labels(PROMETHEUS_NAME)),
        ports: Some(vec![ServicePort {
            name: Some("web".to_string()),
            port: PROMETHEUS_PORT,
            protocol: Some("TCP".to_string()),
            target_port: Some(IntOrString::Int(PROMETHEUS_PORT)),
            ..Default::default()
        }]),
        ..Default::default()
    });
    Ok(service)
}

/// Build the Prometheus StatefulSet.
pub fn stateful_set(data: &ClusterData, existing: Option<&StatefulSet>) -> Result<StatefulSet> {
    let mut stateful_set = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut stateful_set.metadata,
        data,
        PROMETHEUS_NAME,
        PROMETHEUS_NAME,
    );

    let args = vec![
        format!("--config.file={}/{}", CONFIG_MOUNT_PATH, CONFIG_KEY),
        format!("--storage.tsdb.path={}", DATA_DIR),
        "--storage.tsdb.retention=1h".to_string(),
        "--web.enable-lifecycle".to_string(),
    ];

    let probe = |path: &str| Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(PROMETHEUS_PORT),
            scheme: Some("HTTP".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(15),
        timeout_seconds: Some(5),
        ..Default::default()
    };

    stateful_set.spec = Some(StatefulSetSpec {
        replicas: Some(1),
        service_name: PROMETHEUS_NAME.to_string(),
        selector: LabelSelector {
            match_labels: Some(app_labels(PROMETHEUS_NAME)),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(app_labels(PROMETHEUS_NAME)),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                service_account_name: Some(PROMETHEUS_NAME.to_string()),
                containers: vec![Container {
                    name: PROMETHEUS_NAME.to_string(),
                    image: Some(format!(
                        "{}/prometheus/prometheus:{}",
                        data.registry("quay.io"),
                        PROMETHEUS_TAG
                    )),
                    args: Some(args),
                    ports: Some(vec![ContainerPort {
                        name: Some("web".to_string()),
                        container_port: PROMETHEUS_PORT,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    }]),
                    readiness_probe: Some(probe("/-/ready")),
                    liveness_probe: Some(Probe {
                        initial_delay_seconds: Some(60),
                        ..probe("/-/healthy")
                    }),
                    volume_mounts: Some(vec![
                        VolumeMount {
                            name: "config".to_string(),
                            mount_path: CONFIG_MOUNT_PATH.to_string(),
                            read_only: Some(true),
                            ..Default::default()
                        },
                        VolumeMount {
                            name: "apiserver-certificates".to_string(),
                            mount_path: CERT_MOUNT_PATH.to_string(),
                            read_only: Some(true),
                            ..Default::default()
                        },
                        VolumeMount {
                            name: "data".to_string(),
                            mount_path: DATA_DIR.to_string(),
                            ..Default::default()
                        },
                    ]),
                    resources: Some(ResourceRequirements {
                        requests: Some(BTreeMap::from([
                            ("cpu".to_string(), Quantity("50m".to_string())),
                            ("memory".to_string(), Quantity("128Mi".to_string())),
                        ])),
                        limits: Some(BTreeMap::from([(
                            "memory".to_string(),
                            Quantity("1Gi".to_string()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                volumes: Some(vec![
                    Volume {
                        name: "config".to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: PROMETHEUS_NAME.to_string(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Volume {
                        name: "apiserver-certificates".to_string(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(
                                PROMETHEUS_APISERVER_CERTIFICATE_SECRET_NAME.to_string(),
                            ),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Volume {
                        name: "data".to_string(),
                        empty_dir: Some(EmptyDirVolumeSource::default()),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
        },
        ..Default::default()
    });
    Ok(stateful_set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::running_cluster_data;
    use kubermatic_cluster::pki::ClusterCa;

    fn parsed_config(data: &ClusterData) -> serde_yaml::Value {
        let config_map = config_map(data, None).unwrap();
        let raw = config_map.data.unwrap().remove(CONFIG_KEY).unwrap();
        serde_yaml::from_str(&raw).unwrap()
    }

    fn job<'a>(config: &'a serde_yaml::Value, name: &str) -> &'a serde_yaml::Value {
        config["scrape_configs"]
            .as_sequence()
            .unwrap()
            .iter()
            .find(|job| job["job_name"] == name)
            .unwrap()
    }

    #[test]
    fn test_config_scrapes_every_etcd_member() {
        let data = running_cluster_data();
        let config = parsed_config(&data);

        let targets = job(&config, "etcd")["static_configs"][0]["targets"]
            .as_sequence()
            .unwrap()
            .clone();
        assert_eq!(targets.len(), 3);
        assert_eq!(
            targets[0],
            "etcd-0.etcd.cluster-fqpcvnc6v.svc.cluster.local:2379"
        );
    }

    #[test]
    fn test_config_labels_series_for_federation() {
        let data = running_cluster_data();
        let config = parsed_config(&data);

        let labels = &config["global"]["external_labels"];
        assert_eq!(labels["cluster"], "fqpcvnc6v");
        assert_eq!(labels["seed_cluster"], "europe-west3-c");
    }

    #[test]
    fn test_control_plane_job_uses_the_client_certificate() {
        let data = running_cluster_data();
        let config = parsed_config(&data);

        let control_plane = job(&config, "kubernetes-control-plane");
        assert_eq!(
            control_plane["tls_config"]["cert_file"],
            "/etc/kubernetes/prometheus-client.crt"
        );
        assert_eq!(
            control_plane["kubernetes_sd_configs"][0]["namespaces"]["names"][0],
            "cluster-fqpcvnc6v"
        );
    }

    #[test]
    fn test_client_certificate_is_kept_while_the_ca_matches() {
        let mut data = running_cluster_data();
        data.set_ca(ClusterCa::new("fqpcvnc6v").unwrap());

        let first = apiserver_client_certificate(&data, None).unwrap();
        let second = apiserver_client_certificate(&data, Some(&first)).unwrap();
        assert_eq!(first.data, second.data);

        let other_ca = ClusterCa::new("someothercluster").unwrap();
        let mut stale = first.clone();
        stale
            .data
            .as_mut()
            .unwrap()
            .insert(
                PROMETHEUS_CLIENT_CERT_KEY.to_string(),
                ByteString(
                    other_ca
                        .issue_client_cert(PROMETHEUS_CERT_USERNAME, None)
                        .unwrap()
                        .cert
                        .as_ref()
                        .to_vec(),
                ),
            );
        let reissued = apiserver_client_certificate(&data, Some(&stale)).unwrap();
        assert_ne!(stale.data, reissued.data);
    }

    #[test]
    fn test_stateful_set_wires_config_and_certificates() {
        let data = running_cluster_data();
        let sts = stateful_set(&data, None).unwrap();

        let pod = sts.spec.unwrap().template.spec.unwrap();
        let volumes = pod.volumes.unwrap();
        assert!(volumes
            .iter()
            .any(|v| v.config_map.as_ref().map(|c| c.name.as_str()) == Some("prometheus")));
        assert!(volumes.iter().any(|v| v
            .secret
            .as_ref()
            .and_then(|s| s.secret_name.as_deref())
            == Some("prometheus-apiserver-certificate")));

        let args = pod.containers[0].args.clone().unwrap();
        assert!(args.contains(&"--config.file=/etc/prometheus/config/prometheus.yaml".to_string()));
    }

    #[test]
    fn test_service_is_headless() {
        let data = running_cluster_data();
        let service = service(&data, None).unwrap();

        let spec = service.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.ports.unwrap()[0].port, 9090);
    }
}
