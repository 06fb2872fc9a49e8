//! Apiserver resources: Services, serving and kubelet-client certificates,
//! the OIDC trust bundle and the Deployment itself.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, Secret, SecretVolumeSource, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;

use kubermatic_common::{Error, Result};

use crate::pki;
use crate::resources::{
    app_labels, set_object_meta, ClusterData, APISERVER_DEPLOYMENT_NAME,
    APISERVER_EXTERNAL_SERVICE_NAME, APISERVER_SECURE_PORT, APISERVER_SERVICE_NAME,
    APISERVER_SERVICE_PORT, APISERVER_TLS_SECRET_NAME, CA_SECRET_NAME,
    KUBELET_CLIENT_CERTIFICATES_SECRET_NAME, OIDC_CA_CONFIG_MAP_NAME,
    SERVICE_ACCOUNT_KEY_SECRET_NAME, TOKENS_SECRET_NAME,
};

/// Secret data key for the serving certificate.
pub const TLS_CERT_KEY: &str = "apiserver-tls.crt";
/// Secret data key for the serving key.
pub const TLS_KEY_KEY: &str = "apiserver-tls.key";
/// Secret data key for the kubelet client certificate.
pub const KUBELET_CLIENT_CERT_KEY: &str = "kubelet-client.crt";
/// Secret data key for the kubelet client key.
pub const KUBELET_CLIENT_KEY_KEY: &str = "kubelet-client.key";
/// ConfigMap data key for the OIDC CA bundle.
pub const OIDC_CA_KEY: &str = "ca.crt";

const KUBELET_CLIENT_COMMON_NAME: &str = "kube-apiserver-kubelet-client";

const TLS_MOUNT_PATH: &str = "/etc/kubernetes/tls";
const CA_MOUNT_PATH: &str = "/etc/kubernetes/ca";
const TOKENS_MOUNT_PATH: &str = "/etc/kubernetes/tokens";
const SERVICE_ACCOUNT_KEY_MOUNT_PATH: &str = "/etc/kubernetes/service-account-key";
const KUBELET_CLIENT_MOUNT_PATH: &str = "/etc/kubernetes/kubelet";
const OIDC_CA_MOUNT_PATH: &str = "/etc/kubernetes/oidc";

/// Build the ClusterIP Service fronting the apiserver inside the seed.
pub fn service(data: &ClusterData, existing: Option<&Service>) -> Result<Service> {
    let mut service = existing.cloned().unwrap_or_default();
    set_object_meta(&mut service.metadata, data, APISERVER_SERVICE_NAME, "apiserver");

    let spec = service.spec.get_or_insert_with(ServiceSpec::default);
    spec.selector = Some(app_labels("apiserver"));
    spec.type_ = Some("ClusterIP".to_string());
    spec.ports = Some(vec![ServicePort {
        name: Some("secure".to_string()),
        port: APISERVER_SERVICE_PORT,
        target_port: Some(IntOrString::Int(APISERVER_SECURE_PORT)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }]);
    Ok(service)
}

/// Build the NodePort Service exposing the apiserver externally. The
/// allocated NodePort is carried over so rebuilds never re-roll it.
pub fn external_service(data: &ClusterData, existing: Option<&Service>) -> Result<Service> {
    let node_port = existing
        .and_then(|s| s.spec.as_ref())
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.first())
        .and_then(|port| port.node_port);

    let mut service = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut service.metadata,
        data,
        APISERVER_EXTERNAL_SERVICE_NAME,
        "apiserver",
    );

    let spec = service.spec.get_or_insert_with(ServiceSpec::default);
    spec.selector = Some(app_labels("apiserver"));
    spec.type_ = Some("NodePort".to_string());
    spec.ports = Some(vec![ServicePort {
        name: Some("secure".to_string()),
        port: APISERVER_SECURE_PORT,
        target_port: Some(IntOrString::Int(APISERVER_SECURE_PORT)),
        protocol: Some("TCP".to_string()),
        node_port,
        ..Default::default()
    }]);
    Ok(service)
}

/// Build the serving certificate secret. Existing material is kept while
/// it is unexpired and covers every current subject name, so an address
/// change rolls the certificate automatically.
pub fn tls_serving_certificate(data: &ClusterData, existing: Option<&Secret>) -> Result<Secret> {
    let mut secret = existing.cloned().unwrap_or_default();
    set_object_meta(&mut secret.metadata, data, APISERVER_TLS_SECRET_NAME, "apiserver");

    let sans = data.apiserver_sans()?;
    if let Some(cert) = secret.data.as_ref().and_then(|d| d.get(TLS_CERT_KEY)) {
        if pki::server_cert_matches(&cert.0, &sans) {
            return Ok(secret);
        }
    }

    let key_cert = data.ca()?.issue_server_cert("kube-apiserver", &sans)?;
    secret.data = Some(BTreeMap::from([
        (
            TLS_CERT_KEY.to_string(),
            ByteString(key_cert.cert.as_ref().to_vec()),
        ),
        (
            TLS_KEY_KEY.to_string(),
            ByteString(key_cert.key.as_ref().to_vec()),
        ),
    ]));
    Ok(secret)
}

/// Build the client certificate the apiserver presents to kubelets.
pub fn kubelet_client_certificate(data: &ClusterData, existing: Option<&Secret>) -> Result<Secret> {
    let mut secret = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut secret.metadata,
        data,
        KUBELET_CLIENT_CERTIFICATES_SECRET_NAME,
        "apiserver",
    );

    let issuer = format!("root-ca.{}", data.cluster_name());
    if let Some(cert) = secret
        .data
        .as_ref()
        .and_then(|d| d.get(KUBELET_CLIENT_CERT_KEY))
    {
        if pki::client_cert_valid(&cert.0, &issuer) {
            return Ok(secret);
        }
    }

    let key_cert = data
        .ca()?
        .issue_client_cert(KUBELET_CLIENT_COMMON_NAME, Some("system:masters"))?;
    secret.data = Some(BTreeMap::from([
        (
            KUBELET_CLIENT_CERT_KEY.to_string(),
            ByteString(key_cert.cert.as_ref().to_vec()),
        ),
        (
            KUBELET_CLIENT_KEY_KEY.to_string(),
            ByteString(key_cert.key.as_ref().to_vec()),
        ),
    ]));
    Ok(secret)
}

/// Build the ConfigMap carrying the OIDC CA bundle mounted by the
/// apiserver. Only registered when the controller was started with one.
pub fn oidc_ca_config_map(data: &ClusterData, existing: Option<&ConfigMap>) -> Result<ConfigMap> {
    let mut config_map = existing.cloned().unwrap_or_default();
    set_object_meta(&mut config_map.metadata, data, OIDC_CA_CONFIG_MAP_NAME, "apiserver");

    let bundle = data.config.oidc_ca.as_ref().ok_or_else(|| {
        Error::internal_with_context("oidc_ca", "creator registered without an OIDC CA bundle")
    })?;
    config_map.data = Some(BTreeMap::from([(OIDC_CA_KEY.to_string(), bundle.clone())]));
    Ok(config_map)
}

fn secret_volume(name: &str, secret_name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: Some(true),
        ..Default::default()
    }
}

/// Build the apiserver Deployment.
pub fn deployment(data: &ClusterData, existing: Option<&Deployment>) -> Result<Deployment> {
    let mut deployment = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut deployment.metadata,
        data,
        APISERVER_DEPLOYMENT_NAME,
        "apiserver",
    );

    let address = data.address();
    let service_cidr = data
        .cluster
        .spec
        .cluster_network
        .services
        .cidr_blocks
        .first()
        .cloned()
        .ok_or_else(|| {
            Error::validation_for(data.cluster_name(), "cluster has no service network")
        })?;

    let mut command = vec![
        "/hyperkube".to_string(),
        "apiserver".to_string(),
        format!("--advertise-address={}", address.ip),
        format!("--secure-port={}", APISERVER_SECURE_PORT),
        format!("--etcd-servers={}", data.etcd_endpoints().join(",")),
        "--storage-backend=etcd3".to_string(),
        "--admission-control=NamespaceLifecycle,LimitRanger,ServiceAccount,DefaultStorageClass,MutatingAdmissionWebhook,ValidatingAdmissionWebhook,ResourceQuota".to_string(),
        "--authorization-mode=Node,RBAC".to_string(),
        format!("--external-hostname={}", address.external_name),
        format!("--token-auth-file={}/{}", TOKENS_MOUNT_PATH, super::certificates::TOKENS_FILE_KEY),
        "--enable-bootstrap-token-auth=true".to_string(),
        format!(
            "--service-account-key-file={}/{}",
            SERVICE_ACCOUNT_KEY_MOUNT_PATH,
            super::certificates::SERVICE_ACCOUNT_KEY_KEY
        ),
        format!("--service-cluster-ip-range={}", service_cidr),
        format!("--service-node-port-range={}", data.config.node_port_range),
        "--allow-privileged=true".to_string(),
        format!("--kubelet-client-certificate={}/{}", KUBELET_CLIENT_MOUNT_PATH, KUBELET_CLIENT_CERT_KEY),
        format!("--kubelet-client-key={}/{}", KUBELET_CLIENT_MOUNT_PATH, KUBELET_CLIENT_KEY_KEY),
        "--kubelet-preferred-address-types=ExternalIP,InternalIP".to_string(),
        format!("--tls-cert-file={}/{}", TLS_MOUNT_PATH, TLS_CERT_KEY),
        format!("--tls-private-key-file={}/{}", TLS_MOUNT_PATH, TLS_KEY_KEY),
        format!("--client-ca-file={}/{}", CA_MOUNT_PATH, super::certificates::CA_CERT_KEY),
        "--v=2".to_string(),
    ];

    let mut volumes = vec![
        secret_volume("tls", APISERVER_TLS_SECRET_NAME),
        secret_volume("tokens", TOKENS_SECRET_NAME),
        secret_volume("service-account-key", SERVICE_ACCOUNT_KEY_SECRET_NAME),
        secret_volume("ca", CA_SECRET_NAME),
        secret_volume("kubelet-client", KUBELET_CLIENT_CERTIFICATES_SECRET_NAME),
    ];
    let mut mounts = vec![
        mount("tls", TLS_MOUNT_PATH),
        mount("tokens", TOKENS_MOUNT_PATH),
        mount("service-account-key", SERVICE_ACCOUNT_KEY_MOUNT_PATH),
        mount("ca", CA_MOUNT_PATH),
        mount("kubelet-client", KUBELET_CLIENT_MOUNT_PATH),
    ];

    if data.config.oidc_ca.is_some() {
        command.push(format!("--oidc-ca-file={}/{}", OIDC_CA_MOUNT_PATH, OIDC_CA_KEY));
        volumes.push(Volume {
            name: "oidc-ca".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: OIDC_CA_CONFIG_MAP_NAME.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(mount("oidc-ca", OIDC_CA_MOUNT_PATH));
    }

    let probe = Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/healthz".to_string()),
            port: IntOrString::Int(APISERVER_SECURE_PORT),
            scheme: Some("HTTPS".to_string()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(15),
        timeout_seconds: Some(5),
        ..Default::default()
    };

    deployment.spec = Some(DeploymentSpec {
        replicas: Some(1),
        selector: LabelSelector {
            match_labels: Some(app_labels("apiserver")),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(app_labels("apiserver")),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "apiserver".to_string(),
                    image: Some(format!(
                        "{}/hyperkube-amd64:v{}",
                        data.registry("k8s.gcr.io"),
                        data.version()
                    )),
                    command: Some(command),
                    ports: Some(vec![ContainerPort {
                        container_port: APISERVER_SECURE_PORT,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    }]),
                    readiness_probe: Some(probe.clone()),
                    liveness_probe: Some(probe),
                    volume_mounts: Some(mounts),
                    resources: Some(ResourceRequirements {
                        requests: Some(BTreeMap::from([
                            ("cpu".to_string(), Quantity("100m".to_string())),
                            ("memory".to_string(), Quantity("256Mi".to_string())),
                        ])),
                        limits: Some(BTreeMap::from([(
                            "memory".to_string(),
                            Quantity("1Gi".to_string()),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                volumes: Some(volumes),
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
    use crate::resources::certificates;

    fn data_with_ca() -> ClusterData {
        let mut data = ClusterData::for_testing();
        let ca_secret = certificates::root_ca(&data, None).unwrap();
        data.set_ca(certificates::load_root_ca(&ca_secret).unwrap());
        data
    }

    fn command_of(deployment: &Deployment) -> Vec<String> {
        deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .map(|p| p.containers[0].command.clone().unwrap_or_default())
            .unwrap_or_default()
    }

    #[test]
    fn test_external_service_keeps_allocated_node_port() {
        let data = ClusterData::for_testing();

        let mut live = external_service(&data, None).unwrap();
        if let Some(ports) = live.spec.as_mut().and_then(|s| s.ports.as_mut()) {
            ports[0].node_port = Some(30843);
        }

        let rebuilt = external_service(&data, Some(&live)).unwrap();
        let port = rebuilt.spec.unwrap().ports.unwrap().remove(0);
        assert_eq!(port.node_port, Some(30843));
    }

    #[test]
    fn test_serving_certificate_rolls_when_address_changes() {
        let data = data_with_ca();
        let first = tls_serving_certificate(&data, None).unwrap();

        // Unchanged address keeps the key material.
        let second = tls_serving_certificate(&data, Some(&first)).unwrap();
        assert_eq!(first.data, second.data);

        // A new external name is not covered by the old certificate.
        let mut moved = data_with_ca();
        if let Some(status) = moved.cluster.status.as_mut() {
            status.address.external_name =
                "fqpcvnc6v.us-central1-b.dev.kubermatic.io".to_string();
        }
        let third = tls_serving_certificate(&moved, Some(&first)).unwrap();
        assert_ne!(first.data, third.data);
    }

    #[test]
    fn test_kubelet_client_certificate_is_stable() {
        let data = data_with_ca();
        let first = kubelet_client_certificate(&data, None).unwrap();
        let second = kubelet_client_certificate(&data, Some(&first)).unwrap();
        assert_eq!(first.data, second.data);
    }

    #[test]
    fn test_deployment_wires_pki_and_network_flags() {
        let data = data_with_ca();
        let deployment = deployment(&data, None).unwrap();
        let command = command_of(&deployment);

        assert!(command.contains(&"--advertise-address=35.198.93.90".to_string()));
        assert!(command
            .contains(&"--external-hostname=fqpcvnc6v.europe-west3-c.dev.kubermatic.io".to_string()));
        assert!(command.contains(&"--service-cluster-ip-range=10.240.16.0/20".to_string()));
        assert!(command.contains(&"--service-node-port-range=30000-32767".to_string()));
        assert!(command
            .iter()
            .any(|flag| flag.starts_with("--etcd-servers=http://etcd-0.etcd.cluster-fqpcvnc6v")));
        assert!(!command.iter().any(|flag| flag.starts_with("--oidc")));
    }

    #[test]
    fn test_deployment_mounts_oidc_bundle_when_configured() {
        let mut data = data_with_ca();
        data.config.oidc_ca = Some("-----BEGIN CERTIFICATE-----".to_string());

        let deployment = deployment(&data, None).unwrap();
        let command = command_of(&deployment);
        assert!(command.contains(&"--oidc-ca-file=/etc/kubernetes/oidc/ca.crt".to_string()));

        let volumes = deployment
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .volumes
            .unwrap();
        assert!(volumes.iter().any(|v| v.name == "oidc-ca"));
    }

    #[test]
    fn test_deployment_image_follows_master_version() {
        let mut data = data_with_ca();
        data.cluster.spec.master_version = "1.13.0".to_string();

        let deployment = deployment(&data, None).unwrap();
        let image = deployment
            .spec
            .unwrap()
            .template
            .spec
            .unwrap()
            .containers[0]
            .image
            .clone()
            .unwrap();
        assert_eq!(image, "k8s.gcr.io/hyperkube-amd64:v1.13.0");
    }
}
