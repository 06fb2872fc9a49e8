//! Kubeconfig Secrets for everything that talks to the tenant apiserver.
//!
//! The admin kubeconfig authenticates with the cluster's admin token and
//! targets the external address; it is a pure function of the address and
//! regenerates deterministically. Component kubeconfigs authenticate with
//! client certificates against the in-namespace apiserver Service. Their
//! certificates are kept as long as they are unexpired and issued by the
//! current root CA, since issuing produces a fresh key pair every time.

use std::collections::BTreeMap;

use base64::Engine as _;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use k8s_openapi::ByteString;
use kube::config::Kubeconfig;
use serde_json::json;

use kubermatic_common::{Error, Result};

use crate::pki;
use crate::resources::{
    app_labels, set_object_meta, ClusterData, ADMIN_KUBECONFIG_SECRET_NAME,
    CLUSTER_INFO_CONFIG_MAP_NAME, CONTROLLER_MANAGER_KUBECONFIG_SECRET_NAME,
    MACHINE_CONTROLLER_KUBECONFIG_SECRET_NAME, SCHEDULER_KUBECONFIG_SECRET_NAME,
    TENANT_PUBLIC_NAMESPACE,
};

/// Key under which every kubeconfig Secret stores its payload.
pub const KUBECONFIG_KEY: &str = "kubeconfig";

const SCHEDULER_COMMON_NAME: &str = "system:kube-scheduler";
const CONTROLLER_MANAGER_COMMON_NAME: &str = "system:kube-controller-manager";
const MACHINE_CONTROLLER_COMMON_NAME: &str = "machine-controller";

enum KubeconfigAuth<'a> {
    Token(&'a str),
    ClientCert { cert: &'a [u8], key: &'a [u8] },
}

fn render_kubeconfig(
    cluster_name: &str,
    server: &str,
    ca_cert_pem: &str,
    auth: &KubeconfigAuth<'_>,
) -> Result<String> {
    let encoder = base64::engine::general_purpose::STANDARD;
    let user = match auth {
        KubeconfigAuth::Token(token) => json!({ "token": token }),
        KubeconfigAuth::ClientCert { cert, key } => json!({
            "client-certificate-data": encoder.encode(cert),
            "client-key-data": encoder.encode(key),
        }),
    };

    let config = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": cluster_name,
            "cluster": {
                "server": server,
                "certificate-authority-data": encoder.encode(ca_cert_pem.as_bytes()),
            },
        }],
        "users": [{ "name": "default", "user": user }],
        "contexts": [{
            "name": "default",
            "context": { "cluster": cluster_name, "user": "default" },
        }],
        "current-context": "default",
    });

    serde_yaml::to_string(&config)
        .map_err(|e| Error::serialization_for_kind("Kubeconfig", e.to_string()))
}

fn kubeconfig_secret_data(kubeconfig: String) -> BTreeMap<String, ByteString> {
    BTreeMap::from([(KUBECONFIG_KEY.to_string(), ByteString(kubeconfig.into_bytes()))])
}

/// Whether the stored component kubeconfig still points at the right server,
/// embeds the current CA and carries an unexpired certificate issued under
/// it. A rotated root CA shows up as an embedded-CA mismatch.
fn client_kubeconfig_still_valid(
    secret: &Secret,
    server: &str,
    cluster_name: &str,
    ca_cert_pem: &str,
) -> bool {
    let Some(raw) = secret.data.as_ref().and_then(|d| d.get(KUBECONFIG_KEY)) else {
        return false;
    };
    let Ok(config) = serde_yaml::from_slice::<Kubeconfig>(&raw.0) else {
        return false;
    };

    let Some(cluster) = config.clusters.first().and_then(|c| c.cluster.as_ref()) else {
        return false;
    };
    if cluster.server.as_deref() != Some(server) {
        return false;
    }
    let current_ca = base64::engine::general_purpose::STANDARD.encode(ca_cert_pem.as_bytes());
    if cluster.certificate_authority_data.as_deref() != Some(current_ca.as_str()) {
        return false;
    }

    let Some(cert_b64) = config
        .auth_infos
        .first()
        .and_then(|u| u.auth_info.as_ref())
        .and_then(|a| a.client_certificate_data.as_deref())
    else {
        return false;
    };
    let Ok(cert_pem) = base64::engine::general_purpose::STANDARD.decode(cert_b64) else {
        return false;
    };

    pki::client_cert_valid(&cert_pem, &format!("root-ca.{}", cluster_name))
}

/// Build a kubeconfig Secret for a control plane component, targeting the
/// in-cluster apiserver Service and authenticating with a client
/// certificate issued by the cluster CA. The certificate is reissued only
/// when the existing one no longer matches the CA or the server URL.
pub fn internal_kubeconfig(
    data: &ClusterData,
    existing: Option<&Secret>,
    secret_name: &str,
    common_name: &str,
    organization: Option<&str>,
    app: &str,
) -> Result<Secret> {
    let mut secret = existing.cloned().unwrap_or_default();
    set_object_meta(&mut secret.metadata, data, secret_name, app);

    let ca = data.ca()?;
    let server = data.in_cluster_apiserver_url();
    if client_kubeconfig_still_valid(&secret, &server, &data.cluster_name(), ca.ca_cert_pem()) {
        return Ok(secret);
    }

    let key_cert = ca.issue_client_cert(common_name, organization)?;
    let kubeconfig = render_kubeconfig(
        &data.cluster_name(),
        &server,
        ca.ca_cert_pem(),
        &KubeconfigAuth::ClientCert {
            cert: key_cert.cert.as_ref(),
            key: key_cert.key.as_ref(),
        },
    )?;
    secret.data = Some(kubeconfig_secret_data(kubeconfig));
    Ok(secret)
}

/// Build the admin kubeconfig, targeting the external address and
/// authenticating with the admin token.
pub fn admin_kubeconfig(data: &ClusterData, existing: Option<&Secret>) -> Result<Secret> {
    let mut secret = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut secret.metadata,
        data,
        ADMIN_KUBECONFIG_SECRET_NAME,
        "apiserver",
    );

    let ca = data.ca()?;
    let address = data.address();
    if address.url.is_empty() || address.admin_token.is_empty() {
        return Err(Error::internal_with_context(
            "admin_kubeconfig",
            format!("cluster {} has no synced address yet", data.cluster_name()),
        ));
    }

    let kubeconfig = render_kubeconfig(
        &data.cluster_name(),
        &address.url,
        ca.ca_cert_pem(),
        &KubeconfigAuth::Token(&address.admin_token),
    )?;
    secret.data = Some(kubeconfig_secret_data(kubeconfig));
    Ok(secret)
}

/// Build the scheduler kubeconfig.
pub fn scheduler_kubeconfig(data: &ClusterData, existing: Option<&Secret>) -> Result<Secret> {
    internal_kubeconfig(
        data,
        existing,
        SCHEDULER_KUBECONFIG_SECRET_NAME,
        SCHEDULER_COMMON_NAME,
        None,
        "scheduler",
    )
}

/// Build the controller-manager kubeconfig.
pub fn controller_manager_kubeconfig(
    data: &ClusterData,
    existing: Option<&Secret>,
) -> Result<Secret> {
    internal_kubeconfig(
        data,
        existing,
        CONTROLLER_MANAGER_KUBECONFIG_SECRET_NAME,
        CONTROLLER_MANAGER_COMMON_NAME,
        None,
        "controller-manager",
    )
}

/// Build the machine-controller kubeconfig. The organization puts the
/// machine-controller into system:masters until dedicated RBAC lands in
/// the tenant bootstrap.
pub fn machine_controller_kubeconfig(
    data: &ClusterData,
    existing: Option<&Secret>,
) -> Result<Secret> {
    internal_kubeconfig(
        data,
        existing,
        MACHINE_CONTROLLER_KUBECONFIG_SECRET_NAME,
        MACHINE_CONTROLLER_COMMON_NAME,
        Some("system:masters"),
        "machine-controller",
    )
}

/// Build the cluster-info ConfigMap published to the tenant's kube-public
/// for bootstrap discovery. Carries only the cluster section, no
/// credentials, and no owner reference since the seed is not visible from
/// the tenant apiserver.
pub fn cluster_info_config_map(data: &ClusterData, existing: Option<&ConfigMap>) -> Result<ConfigMap> {
    let mut config_map = existing.cloned().unwrap_or_default();
    config_map.metadata.name = Some(CLUSTER_INFO_CONFIG_MAP_NAME.to_string());
    config_map.metadata.namespace = Some(TENANT_PUBLIC_NAMESPACE.to_string());
    config_map.metadata.labels = Some(app_labels("cluster-info"));

    let address = data.address();
    if address.url.is_empty() {
        return Err(Error::internal_with_context(
            "cluster_info",
            format!("cluster {} has no apiserver URL yet", data.cluster_name()),
        ));
    }

    let encoder = base64::engine::general_purpose::STANDARD;
    let discovery = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{
            "name": "",
            "cluster": {
                "server": address.url,
                "certificate-authority-data": encoder.encode(data.ca()?.ca_cert_pem().as_bytes()),
            },
        }],
    });
    let rendered = serde_yaml::to_string(&discovery)
        .map_err(|e| Error::serialization_for_kind("ConfigMap", e.to_string()))?;

    config_map.data = Some(BTreeMap::from([(KUBECONFIG_KEY.to_string(), rendered)]));
    Ok(config_map)
}
