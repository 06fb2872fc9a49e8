//! Cluster PKI material persisted as Secrets.
//!
//! The root CA is generated exactly once per cluster; every later ensure
//! run finds valid key material and leaves it alone. The same preservation
//! rule applies to the service account signing key. The token file is a
//! pure function of the admin token and regenerates deterministically.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;

use kubermatic_common::crd::{Bytes, KeyCert};
use kubermatic_common::{Error, Result};

use crate::ensure::NamedCreator;
use crate::pki::{self, ClusterCa};
use crate::resources::{
    set_object_meta, ClusterData, CA_SECRET_NAME, SERVICE_ACCOUNT_KEY_SECRET_NAME,
    TOKENS_SECRET_NAME,
};

/// Secret data key for the CA certificate.
pub const CA_CERT_KEY: &str = "ca.crt";
/// Secret data key for the CA private key.
pub const CA_KEY_KEY: &str = "ca.key";
/// Secret data key for the service account signing key.
pub const SERVICE_ACCOUNT_KEY_KEY: &str = "sa.key";
/// Secret data key for the apiserver static token file.
pub const TOKENS_FILE_KEY: &str = "tokens.csv";

/// The root CA creator, ensured ahead of every other secret so dependent
/// creators can sign against it.
pub fn root_ca_creator() -> NamedCreator<Secret> {
    NamedCreator {
        name: CA_SECRET_NAME,
        create: root_ca,
    }
}

/// Build the root CA secret, generating a fresh CA only when the existing
/// key material does not parse.
pub fn root_ca(data: &ClusterData, existing: Option<&Secret>) -> Result<Secret> {
    let mut secret = existing.cloned().unwrap_or_default();
    set_object_meta(&mut secret.metadata, data, CA_SECRET_NAME, "ca");

    if load_root_ca(&secret).is_ok() {
        return Ok(secret);
    }

    let ca = ClusterCa::new(&data.cluster_name())?;
    let key_cert = ca.as_key_cert();
    secret.data = Some(BTreeMap::from([
        (
            CA_CERT_KEY.to_string(),
            ByteString(key_cert.cert.as_ref().to_vec()),
        ),
        (
            CA_KEY_KEY.to_string(),
            ByteString(key_cert.key.as_ref().to_vec()),
        ),
    ]));
    Ok(secret)
}

/// Parse the CA key pair out of its Secret.
pub fn load_root_ca(secret: &Secret) -> Result<ClusterCa> {
    let data = secret.data.as_ref().ok_or_else(|| {
        Error::internal_with_context("root_ca", "CA secret holds no data")
    })?;
    let cert = data.get(CA_CERT_KEY).ok_or_else(|| {
        Error::internal_with_context("root_ca", format!("CA secret misses {}", CA_CERT_KEY))
    })?;
    let key = data.get(CA_KEY_KEY).ok_or_else(|| {
        Error::internal_with_context("root_ca", format!("CA secret misses {}", CA_KEY_KEY))
    })?;

    let key_cert = KeyCert {
        key: Bytes::from(key.0.clone()),
        cert: Bytes::from(cert.0.clone()),
    };
    Ok(ClusterCa::from_key_cert(&key_cert)?)
}

/// Build the service account signing key secret, keeping an existing key.
pub fn service_account_key(data: &ClusterData, existing: Option<&Secret>) -> Result<Secret> {
    let mut secret = existing.cloned().unwrap_or_default();
    set_object_meta(
        &mut secret.metadata,
        data,
        SERVICE_ACCOUNT_KEY_SECRET_NAME,
        "apiserver",
    );

    let has_key = secret
        .data
        .as_ref()
        .and_then(|d| d.get(SERVICE_ACCOUNT_KEY_KEY))
        .map(|v| !v.0.is_empty())
        .unwrap_or(false);
    if has_key {
        return Ok(secret);
    }

    let key = pki::new_signing_key()?;
    secret.data = Some(BTreeMap::from([(
        SERVICE_ACCOUNT_KEY_KEY.to_string(),
        ByteString(key.0),
    )]));
    Ok(secret)
}

/// Build the static token file the apiserver authenticates the admin
/// kubeconfig against.
pub fn tokens(data: &ClusterData, existing: Option<&Secret>) -> Result<Secret> {
    let mut secret = existing.cloned().unwrap_or_default();
    set_object_meta(&mut secret.metadata, data, TOKENS_SECRET_NAME, "apiserver");

    let token = data.address().admin_token;
    if token.is_empty() {
        return Err(Error::internal_with_context(
            "tokens",
            format!("cluster {} has no admin token yet", data.cluster_name()),
        ));
    }

    let csv = format!("{},admin,10000,system:masters", token);
    secret.data = Some(BTreeMap::from([(
        TOKENS_FILE_KEY.to_string(),
        ByteString(csv.into_bytes()),
    )]));
    Ok(secret)
}
