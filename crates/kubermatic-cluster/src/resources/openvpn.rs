//! OpenVPN tunnel between the seed-side control plane and the tenant
//! cluster: server Service and Deployment, certificate Secrets on both
//! sides and the per-client route configuration.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PodSpec,
    PodTemplateSpec, Probe, ResourceRequirements, Secret, SecretVolumeSource, SecurityContext,
    Service, ServicePort, ServiceSpec, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;

use kubermatic_common::{Error, Result};

use crate::pki;
use crate::resources::{
    app_labels, parse_cidr, set_object_meta, ClusterData, OPENVPN_CLIENT_CERTIFICATES_SECRET_NAME,
    OPENVPN_CLIENT_CONFIGS_CONFIG_MAP_NAME, OPENVPN_DEPLOYMENT_NAME, OPENVPN_PORT,
    OPENVPN_SERVER_CERTIFICATES_SECRET_NAME, OPENVPN_SERVICE_NAME, TENANT_OPENVPN_CONFIG_MAP_NAME,
    TENANT_OPENVPN_SECRET_NAME, TENANT_SYSTEM_NAMESPACE,
};

/// Secret data key for the server certificate.
pub const SERVER_CERT_KEY: &str = "server.crt";
/// Secret data key for the server key.
pub const SERVER_KEY_KEY: &str = "server.key";
/// Secret data key for the client certificate.
pub const CLIENT_CERT_KEY: &str = "client.crt";
/// Secret data key for the client key.
pub const CLIENT_KEY_KEY: &str = "client.key";
/// Secret data key for the CA bundle shipped next to each certificate.
pub const VPN_CA_KEY: &str = "ca.crt";
/// ConfigMap data key for the tenant-side client configuration.
pub const CLIENT_CONFIG_KEY: &str = "config";

const CLIENT_COMMON_NAME: &str = "openvpn-client";
const OPENVPN_TAG: &str = "v2.4.4";

const PKI_MOUNT_PATH: &str = "/etc/openvpn/pki";
const CLIENT_CONFIG_DIR: &str = "/etc/openvpn/clients";

/// Build the NodePort Service the tenant-side client dials in through.
pub fn service(data: &ClusterData, existing: Option<&Service>) -> Result<Service> {
    let node_port = existing
        .and_then(|s| s.spec.as_ref())
        .and_then(|spec| spec.ports.as_ref())
        .and_then(|ports| ports.first())
        .and_then(|port| port.node_port);

    let mut service = existing.cloned().unwrap_or_default();
    set_object_meta(&mut service.metadata, data, OPENVPN_SERVICE_NAME, "openvpn-server");

    let spec = service.spec.get_or_insert_with(ServiceSpec::default);
    spec.selector = Some(app_labels("openvpn-server"));
    spec.type_ = Some("NodePort".to_string());
    spec.ports = Some(vec![ServicePort {
        name: Some("openvpn".to_string()),
        port: OPENVPN_PORT,
        target_port: Some(IntOrString::Int(OPENVPN_PORT)),
        protocol: Some("TCP".to_string()),
        node_port,
        ..Default::default()
    }]);
    Ok(service)
}

fn route_parts(data: &ClusterData, cidr: &str) -> Result<(String, String)> {
    let (base, prefix_len) = parse_cidr(cidr).ok_or_else(|| {
        Error::validation_for_field(
            data.cluster_name(),
            "clusterNetwork",
            format!("invalid CIDR {cidr}"),
        )
    })?;
    let mask = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - prefix_len)
    };
    Ok((
        Ipv4Addr::from(base & mask).to_string(),
        Ipv4Addr::from(mask).to_string(),
    ))
}

fn tenant_networks(data: &ClusterData) -> Result<Vec<(String, String)>> {
    let network = &data.cluster.spec.cluster_network;
    let mut routes = Vec::new();
    for cidr in network
        .services
        .cidr_blocks
        .iter()
        .chain(network.pods.cidr_blocks.iter())
    {
        routes.push(route_parts(data, cidr)?);
    }
    Ok(routes)
}

fn current_ca_matches(secret: &Secret, ca_cert_pem: &str) -> bool {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(VPN_CA_KEY))
        .map(|stored| stored.0 == ca_cert_pem.as_bytes())
        .unwrap_or(false)
}

/// Build the server certificate Secret. Reissued when the external name
/// changes or the cluster CA was rotated.
pub fn server_certificates(data: &ClusterData, existing: Option<&Secret>) -> Result<Secret> {
    let mut secret = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut secret.metadata,
        data,
        OPENVPN_SERVER_CERTIFICATES_SECRET_NAME,
        "openvpn-server",
    );

    let mut sans = vec![
        OPENVPN_SERVICE_NAME.to_string(),
        format!("{}.{}.svc.cluster.local", OPENVPN_SERVICE_NAME, data.namespace()),
    ];
    let external_name = &data.address().external_name;
    if !external_name.is_empty() {
        sans.push(external_name.clone());
    }

    let ca = data.ca()?;
    if current_ca_matches(&secret, ca.ca_cert_pem()) {
        if let Some(cert) = secret.data.as_ref().and_then(|d| d.get(SERVER_CERT_KEY)) {
            if pki::server_cert_matches(&cert.0, &sans) {
                return Ok(secret);
            }
        }
    }

    let key_cert = ca.issue_server_cert(OPENVPN_SERVICE_NAME, &sans)?;
    secret.data = Some(BTreeMap::from([
        (
            SERVER_CERT_KEY.to_string(),
            ByteString(key_cert.cert.as_ref().to_vec()),
        ),
        (
            SERVER_KEY_KEY.to_string(),
            ByteString(key_cert.key.as_ref().to_vec()),
        ),
        (
            VPN_CA_KEY.to_string(),
            ByteString(ca.ca_cert_pem().as_bytes().to_vec()),
        ),
    ]));
    Ok(secret)
}

/// Build the client certificate Secret kept in the cluster namespace and
/// mirrored into the tenant's kube-system once the apiserver is up.
pub fn client_certificates(data: &ClusterData, existing: Option<&Secret>) -> Result<Secret> {
    let mut secret = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut secret.metadata,
        data,
        OPENVPN_CLIENT_CERTIFICATES_SECRET_NAME,
        "openvpn-client",
    );

    let ca = data.ca()?;
    let issuer = format!("root-ca.{}", data.cluster_name());
    if current_ca_matches(&secret, ca.ca_cert_pem()) {
        if let Some(cert) = secret.data.as_ref().and_then(|d| d.get(CLIENT_CERT_KEY)) {
            if pki::client_cert_valid(&cert.0, &issuer) {
                return Ok(secret);
            }
        }
    }

    let key_cert = ca.issue_client_cert(CLIENT_COMMON_NAME, None)?;
    secret.data = Some(BTreeMap::from([
        (
            CLIENT_CERT_KEY.to_string(),
            ByteString(key_cert.cert.as_ref().to_vec()),
        ),
        (
            CLIENT_KEY_KEY.to_string(),
            ByteString(key_cert.key.as_ref().to_vec()),
        ),
        (
            VPN_CA_KEY.to_string(),
            ByteString(ca.ca_cert_pem().as_bytes().to_vec()),
        ),
    ]));
    Ok(secret)
}

/// Build the client-config-dir ConfigMap. The entry is keyed by the client
/// certificate CN and announces the tenant networks behind that client.
pub fn server_client_configs(data: &ClusterData, existing: Option<&ConfigMap>) -> Result<ConfigMap> {
    let mut config_map = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut config_map.metadata,
        data,
        OPENVPN_CLIENT_CONFIGS_CONFIG_MAP_NAME,
        "openvpn-server",
    );

    let mut entry = String::new();
    for (network, netmask) in tenant_networks(data)? {
        entry.push_str(&format!("iroute {network} {netmask}\n"));
    }

    config_map.data = Some(BTreeMap::from([(CLIENT_COMMON_NAME.to_string(), entry)]));
    Ok(config_map)
}

/// Build the OpenVPN server Deployment.
pub fn deployment(data: &ClusterData, existing: Option<&Deployment>) -> Result<Deployment> {
    let mut deployment = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut deployment.metadata,
        data,
        OPENVPN_DEPLOYMENT_NAME,
        "openvpn-server",
    );

    let (vpn_network, vpn_netmask) = route_parts(data, &data.config.node_access_network)?;
    let mut command = vec![
        "/usr/sbin/openvpn".to_string(),
        "--proto".to_string(),
        "tcp-server".to_string(),
        "--dev".to_string(),
        "tun".to_string(),
        "--mode".to_string(),
        "server".to_string(),
        "--lport".to_string(),
        OPENVPN_PORT.to_string(),
        "--server".to_string(),
        vpn_network,
        vpn_netmask,
        "--topology".to_string(),
        "subnet".to_string(),
        "--ca".to_string(),
        format!("{PKI_MOUNT_PATH}/{VPN_CA_KEY}"),
        "--cert".to_string(),
        format!("{PKI_MOUNT_PATH}/{SERVER_CERT_KEY}"),
        "--key".to_string(),
        format!("{PKI_MOUNT_PATH}/{SERVER_KEY_KEY}"),
        "--dh".to_string(),
        "none".to_string(),
        "--client-config-dir".to_string(),
        CLIENT_CONFIG_DIR.to_string(),
    ];
    for (network, netmask) in tenant_networks(data)? {
        command.push("--route".to_string());
        command.push(network);
        command.push(netmask);
    }

    let probe = Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(OPENVPN_PORT),
            ..Default::default()
        }),
        initial_delay_seconds: Some(5),
        timeout_seconds: Some(5),
        ..Default::default()
    };

    deployment.spec = Some(DeploymentSpec {
        replicas: Some(1),
        selector: LabelSelector {
            match_labels: Some(app_labels("openvpn-server")),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(app_labels("openvpn-server")),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "openvpn-server".to_string(),
                    image: Some(format!(
                        "{}/kubermatic/openvpn:{}",
                        data.registry("docker.io"),
                        OPENVPN_TAG
                    )),
                    command: Some(command),
                    ports: Some(vec![ContainerPort {
                        container_port: OPENVPN_PORT,
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    }]),
                    security_context: Some(SecurityContext {
                        capabilities: Some(Capabilities {
                            add: Some(vec!["NET_ADMIN".to_string()]),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    readiness_probe: Some(probe.clone()),
                    liveness_probe: Some(Probe {
                        initial_delay_seconds: Some(30),
                        ..probe
                    }),
                    volume_mounts: Some(vec![
                        VolumeMount {
                            name: "pki".to_string(),
                            mount_path: PKI_MOUNT_PATH.to_string(),
                            read_only: Some(true),
                            ..Default::default()
                        },
                        VolumeMount {
                            name: "client-configs".to_string(),
                            mount_path: CLIENT_CONFIG_DIR.to_string(),
                            read_only: Some(true),
                            ..Default::default()
                        },
                    ]),
                    resources: Some(ResourceRequirements {
                        requests: Some(BTreeMap::from([
                            ("cpu".to_string(), Quantity("20m".to_string())),
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
                volumes: Some(vec![
                    Volume {
                        name: "pki".to_string(),
                        secret: Some(SecretVolumeSource {
                            secret_name: Some(
                                OPENVPN_SERVER_CERTIFICATES_SECRET_NAME.to_string(),
                            ),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                    Volume {
                        name: "client-configs".to_string(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: OPENVPN_CLIENT_CONFIGS_CONFIG_MAP_NAME.to_string(),
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

/// Build the tenant-side copy of the client certificate Secret. Tenant
/// objects carry no owner references, the seed cluster is not visible
/// from the tenant apiserver.
pub fn tenant_client_secret(data: &ClusterData, existing: Option<&Secret>) -> Result<Secret> {
    let mut secret = existing.cloned().unwrap_or_default();
    secret.metadata.name = Some(TENANT_OPENVPN_SECRET_NAME.to_string());
    secret.metadata.namespace = Some(TENANT_SYSTEM_NAMESPACE.to_string());
    secret.metadata.labels = Some(app_labels("openvpn-client"));

    let seed_copy = client_certificates(data, None)?;
    secret.data = seed_copy.data;
    Ok(secret)
}

/// Build the tenant-side client configuration pointing back at the
/// NodePort of the seed's OpenVPN Service.
pub fn tenant_client_config_map(
    data: &ClusterData,
    node_port: i32,
    existing: Option<&ConfigMap>,
) -> Result<ConfigMap> {
    let mut config_map = existing.cloned().unwrap_or_default();
    config_map.metadata.name = Some(TENANT_OPENVPN_CONFIG_MAP_NAME.to_string());
    config_map.metadata.namespace = Some(TENANT_SYSTEM_NAMESPACE.to_string());
    config_map.metadata.labels = Some(app_labels("openvpn-client"));

    let external_name = &data.address().external_name;
    if external_name.is_empty() {
        return Err(Error::internal_with_context(
            "openvpn",
            format!(
                "cluster {} has no external name yet",
                data.cluster_name()
            ),
        ));
    }

    let config = format!(
        "client\n\
         proto tcp\n\
         dev tun\n\
         auth-nocache\n\
         remote {external_name} {node_port}\n\
         nobind\n\
         connect-timeout 5\n\
         connect-retry 1\n\
         ca '{PKI_MOUNT_PATH}/{VPN_CA_KEY}'\n\
         cert '{PKI_MOUNT_PATH}/{CLIENT_CERT_KEY}'\n\
         key '{PKI_MOUNT_PATH}/{CLIENT_KEY_KEY}'\n\
         remote-cert-tls server\n\
         status /run/openvpn-status\n\
         log /dev/stdout\n"
    );
    config_map.data = Some(BTreeMap::from([(CLIENT_CONFIG_KEY.to_string(), config)]));
    Ok(config_map)
}
