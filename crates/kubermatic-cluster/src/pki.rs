//! Certificate and token generation for tenant control planes.
//!
//! Every cluster gets its own root CA, generated once and persisted as a
//! Secret in the cluster namespace. Serving and client certificates for the
//! control plane components are issued from that CA. The secret creators in
//! [`crate::resources`] keep existing key material when it is still valid, so
//! repeated ensure runs do not churn certificates.

use kubermatic_common::crd::{Bytes, KeyCert};
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rand::Rng;
use thiserror::Error;
use x509_parser::prelude::*;

/// Validity period for cluster root CAs (10 years).
pub const CA_VALIDITY_YEARS: i64 = 10;

/// Validity period for serving and client certificates (1 year).
pub const CERT_VALIDITY_YEARS: i64 = 1;

const ORGANIZATION: &str = "Kubermatic";

const TOKEN_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const TOKEN_ID_LEN: usize = 6;
const TOKEN_SECRET_LEN: usize = 16;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Key pair generation failed
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    /// Certificate generation or signing failed
    #[error("certificate generation failed: {0}")]
    CertificateGeneration(String),

    /// PEM or X.509 parsing error
    #[error("certificate parsing error: {0}")]
    Parse(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

fn compute_validity(years: i64) -> (::time::OffsetDateTime, ::time::OffsetDateTime) {
    let now = ::time::OffsetDateTime::now_utc();
    (now, now + ::time::Duration::days(years * 365))
}

fn dn(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

/// Parse PEM-encoded data and return the DER bytes.
pub fn parse_pem(pem_data: &[u8]) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data)
        .map_err(|e| PkiError::Parse(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Per-cluster certificate authority.
///
/// Key material is held as PEM since `rcgen::KeyPair` is not `Clone`; the
/// key pair is re-parsed for each signing operation.
#[derive(Clone)]
pub struct ClusterCa {
    ca_key_pem: String,
    ca_cert_pem: String,
}

impl ClusterCa {
    /// Create a new self-signed root CA for the given cluster.
    pub fn new(cluster_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = dn(&format!("root-ca.{}", cluster_name));
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(CA_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate()
            .map_err(|e| PkiError::KeyGeneration(format!("failed to generate CA key: {}", e)))?;
        let ca_key_pem = key_pair.serialize_pem();

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load a CA from persisted key material.
    pub fn from_key_cert(key_cert: &KeyCert) -> Result<Self> {
        let key_pem = String::from_utf8(key_cert.key.0.clone())
            .map_err(|e| PkiError::Parse(format!("CA key is not valid UTF-8: {}", e)))?;
        let cert_pem = String::from_utf8(key_cert.cert.0.clone())
            .map_err(|e| PkiError::Parse(format!("CA cert is not valid UTF-8: {}", e)))?;

        // Validate both halves parse before accepting them.
        let _ = KeyPair::from_pem(&key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to parse CA key: {}", e)))?;
        let _ = parse_pem(cert_pem.as_bytes())?;

        Ok(Self {
            ca_key_pem: key_pem,
            ca_cert_pem: cert_pem,
        })
    }

    /// The CA certificate in PEM format.
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Key and certificate as stored in the CA Secret.
    pub fn as_key_cert(&self) -> KeyCert {
        KeyCert {
            key: Bytes::from(self.ca_key_pem.clone().into_bytes()),
            cert: Bytes::from(self.ca_cert_pem.clone().into_bytes()),
        }
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::Parse(format!("failed to load CA key: {}", e)))
    }

    /// Issue a TLS serving certificate with the given SANs.
    pub fn issue_server_cert(&self, common_name: &str, sans: &[String]) -> Result<KeyCert> {
        let mut params = CertificateParams::default();
        params.distinguished_name = dn(common_name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];

        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        params.subject_alt_names = sans
            .iter()
            .map(|san| {
                if let Ok(ip) = san.parse::<std::net::IpAddr>() {
                    Ok(SanType::IpAddress(ip))
                } else {
                    Ia5String::try_from(san.clone())
                        .map(SanType::DnsName)
                        .map_err(|e| {
                            PkiError::CertificateGeneration(format!(
                                "invalid DNS name '{}': {}",
                                san, e
                            ))
                        })
                }
            })
            .collect::<Result<Vec<_>>>()?;

        self.sign(params)
    }

    /// Issue a TLS client certificate.
    ///
    /// The common name becomes the authenticated user, the organization the
    /// user's group, matching how the apiserver maps certificate identities.
    pub fn issue_client_cert(&self, common_name: &str, organization: Option<&str>) -> Result<KeyCert> {
        let mut params = CertificateParams::default();
        let mut name = DistinguishedName::new();
        name.push(
            DnType::CommonName,
            DnValue::Utf8String(common_name.to_string()),
        );
        if let Some(org) = organization {
            name.push(DnType::OrganizationName, DnValue::Utf8String(org.to_string()));
        }
        params.distinguished_name = name;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];

        let (not_before, not_after) = compute_validity(CERT_VALIDITY_YEARS);
        params.not_before = not_before;
        params.not_after = not_after;

        self.sign(params)
    }

    fn sign(&self, params: CertificateParams) -> Result<KeyCert> {
        let leaf_key = KeyPair::generate()
            .map_err(|e| PkiError::KeyGeneration(format!("failed to generate key: {}", e)))?;
        let leaf_key_pem = leaf_key.serialize_pem();

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::Parse(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| {
            PkiError::CertificateGeneration(format!("failed to sign certificate: {}", e))
        })?;

        Ok(KeyCert {
            key: Bytes::from(leaf_key_pem.into_bytes()),
            cert: Bytes::from(cert.pem().into_bytes()),
        })
    }
}

/// Generate a fresh signing key, PEM-encoded.
///
/// Used for the service account token signing key of the tenant apiserver.
pub fn new_signing_key() -> Result<Bytes> {
    let key_pair = KeyPair::generate()
        .map_err(|e| PkiError::KeyGeneration(format!("failed to generate signing key: {}", e)))?;
    Ok(Bytes::from(key_pair.serialize_pem().into_bytes()))
}

/// Generate an admin token in bootstrap token format: `[a-z0-9]{6}.[a-z0-9]{16}`.
pub fn generate_admin_token() -> String {
    let mut rng = rand::thread_rng();
    let mut pick = |len: usize| -> String {
        (0..len)
            .map(|_| TOKEN_CHARS[rng.gen_range(0..TOKEN_CHARS.len())] as char)
            .collect()
    };
    let id = pick(TOKEN_ID_LEN);
    let secret = pick(TOKEN_SECRET_LEN);
    format!("{}.{}", id, secret)
}

/// Whether a token matches the bootstrap token format.
pub fn is_admin_token(token: &str) -> bool {
    let mut parts = token.splitn(2, '.');
    let (Some(id), Some(secret)) = (parts.next(), parts.next()) else {
        return false;
    };
    id.len() == TOKEN_ID_LEN
        && secret.len() == TOKEN_SECRET_LEN
        && id.bytes().chain(secret.bytes()).all(|b| TOKEN_CHARS.contains(&b))
}

/// Whether a PEM-encoded client certificate is unexpired and was issued
/// under the given CA common name.
///
/// The kubeconfig creators use this to keep existing client certificates
/// instead of issuing fresh ones on every sync.
pub fn client_cert_valid(cert_pem: &[u8], issuer_common_name: &str) -> bool {
    let Ok(der) = parse_pem(cert_pem) else {
        return false;
    };
    let Ok((_, cert)) = X509Certificate::from_der(&der) else {
        return false;
    };

    if !cert.validity().is_valid() {
        return false;
    }

    let matches = cert
        .issuer()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(|cn| cn == issuer_common_name)
        .unwrap_or(false);
    matches
}

/// Whether a PEM-encoded certificate is unexpired and covers all given SANs.
///
/// Used by the serving certificate creators to decide if existing key
/// material can be kept when the cluster address changes.
pub fn server_cert_matches(cert_pem: &[u8], sans: &[String]) -> bool {
    let Ok(der) = parse_pem(cert_pem) else {
        return false;
    };
    let Ok((_, cert)) = X509Certificate::from_der(&der) else {
        return false;
    };

    if !cert.validity().is_valid() {
        return false;
    }

    let Ok(Some(san_ext)) = cert.subject_alternative_name() else {
        return sans.is_empty();
    };

    sans.iter().all(|san| {
        san_ext.value.general_names.iter().any(|name| match name {
            GeneralName::DNSName(dns) => *dns == san.as_str(),
            GeneralName::IPAddress(ip_bytes) => match san.parse::<std::net::IpAddr>() {
                Ok(std::net::IpAddr::V4(v4)) => *ip_bytes == v4.octets(),
                Ok(std::net::IpAddr::V6(v6)) => *ip_bytes == v6.octets(),
                Err(_) => false,
            },
            _ => false,
        })
    })
}

impl From<PkiError> for kubermatic_common::Error {
    fn from(err: PkiError) -> Self {
        kubermatic_common::Error::internal_with_context("pki", err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ca_round_trips_through_secret_data() {
        let ca = ClusterCa::new("fqpcvnc6v").unwrap();
        let stored = ca.as_key_cert();
        assert!(!stored.is_empty());

        let reloaded = ClusterCa::from_key_cert(&stored).unwrap();
        assert_eq!(reloaded.ca_cert_pem(), ca.ca_cert_pem());
    }

    #[test]
    fn test_server_cert_covers_requested_sans() {
        let ca = ClusterCa::new("fqpcvnc6v").unwrap();
        let sans = vec![
            "fqpcvnc6v.europe-west3-c.dev.kubermatic.io".to_string(),
            "10.10.10.1".to_string(),
        ];
        let cert = ca.issue_server_cert("apiserver", &sans).unwrap();

        assert!(server_cert_matches(cert.cert.as_ref(), &sans));
        assert!(!server_cert_matches(
            cert.cert.as_ref(),
            &["other.example.com".to_string()]
        ));
    }

    #[test]
    fn test_client_cert_issuance() {
        let ca = ClusterCa::new("fqpcvnc6v").unwrap();
        let cert = ca
            .issue_client_cert("system:kube-scheduler", None)
            .unwrap();
        assert!(!cert.is_empty());

        let der = parse_pem(cert.cert.as_ref()).unwrap();
        let (_, parsed) = X509Certificate::from_der(&der).unwrap();
        let cn = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or_default();
        assert_eq!(cn, "system:kube-scheduler");
    }

    #[test]
    fn test_admin_token_format() {
        let token = generate_admin_token();
        assert!(is_admin_token(&token), "generated token {:?} has wrong shape", token);

        assert!(is_admin_token("abc123.0123456789abcdef"));
        assert!(!is_admin_token("abc123"));
        assert!(!is_admin_token("ABC123.0123456789abcdef"));
        assert!(!is_admin_token("abc123.0123456789abcde"));
        assert!(!is_admin_token("abc1234.0123456789abcdef"));
    }

    #[test]
    fn test_expired_or_garbage_certs_never_match() {
        assert!(!server_cert_matches(b"not a pem", &[]));
        assert!(!server_cert_matches(b"not a pem", &["a.example.com".to_string()]));
    }

    #[test]
    fn test_client_cert_tied_to_issuing_ca() {
        let ca = ClusterCa::new("fqpcvnc6v").unwrap();
        let cert = ca.issue_client_cert("machine-controller", None).unwrap();

        assert!(client_cert_valid(cert.cert.as_ref(), "root-ca.fqpcvnc6v"));
        assert!(!client_cert_valid(cert.cert.as_ref(), "root-ca.other"));
        assert!(!client_cert_valid(b"not a pem", "root-ca.fqpcvnc6v"));
    }
}
