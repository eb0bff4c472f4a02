//! Cluster certificate authority: a self-signed root plus leaf issuance for
//! managers, workers and CLI clients. Every node and client in a cluster
//! authenticates with a cert this CA signed; there is no external PKI.

use rand::rngs::OsRng;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rsa::pkcs8::EncodePrivateKeyDer;
use rsa::RsaPrivateKey;
use time::{Duration as TimeDuration, OffsetDateTime};

use crate::error::CryptoError;

const ROOT_KEY_BITS: usize = 4096;
const LEAF_KEY_BITS: usize = 2048;
const ROOT_VALIDITY_DAYS: i64 = 365 * 10;
const LEAF_VALIDITY_DAYS: i64 = 365;
const ROTATION_WINDOW_DAYS: i64 = 30;

/// Which role a leaf certificate is issued for. Determines the extended
/// key usage set: CLI certs never need ServerAuth since a CLI never accepts
/// inbound TLS connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectClass {
    Manager,
    Worker,
    Cli,
}

pub struct IssuedCert {
    pub cert_pem: String,
    pub key_pem: String,
    pub not_after: OffsetDateTime,
}

impl IssuedCert {
    pub fn needs_rotation(&self) -> bool {
        needs_rotation(self.not_after)
    }
}

pub fn needs_rotation(not_after: OffsetDateTime) -> bool {
    OffsetDateTime::now_utc() + TimeDuration::days(ROTATION_WINDOW_DAYS) >= not_after
}

/// Renders `not_after` for persisting alongside a leaf cert/key on disk, so a
/// later process can check rotation without re-parsing the cert itself.
pub fn format_not_after(not_after: OffsetDateTime) -> String {
    not_after
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}

/// Same as `needs_rotation`, but against a persisted RFC3339 timestamp. A
/// timestamp that fails to parse is treated as due for rotation.
pub fn needs_rotation_at(not_after_rfc3339: &str) -> bool {
    match OffsetDateTime::parse(not_after_rfc3339, &time::format_description::well_known::Rfc3339) {
        Ok(not_after) => needs_rotation(not_after),
        Err(_) => true,
    }
}

pub struct CertificateAuthority {
    root: Certificate,
}

impl CertificateAuthority {
    /// Generates a new root CA: a self-signed 4096-bit RSA cert, valid for
    /// ten years, good for signing other certs but nothing else.
    pub fn generate(cluster_name: &str) -> Result<Self, CryptoError> {
        let key_pair = generate_rsa_keypair(ROOT_KEY_BITS)?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("{cluster_name} root CA"));
        dn.push(DnType::OrganizationName, "warren");

        let now = OffsetDateTime::now_utc();
        let mut params = CertificateParams::new(Vec::new());
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        params.not_before = now - TimeDuration::hours(1);
        params.not_after = now + TimeDuration::days(ROOT_VALIDITY_DAYS);
        params.key_pair = Some(key_pair);

        let root = Certificate::from_params(params)?;
        Ok(CertificateAuthority { root })
    }

    /// Reloads a previously generated CA from its stored cert and key PEM,
    /// so a manager restart doesn't mint a new root every time.
    pub fn load(cert_pem: &str, key_pem: &str) -> Result<Self, CryptoError> {
        let key_pair = KeyPair::from_pem(key_pem)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem, key_pair)?;
        let root = Certificate::from_params(params)?;
        Ok(CertificateAuthority { root })
    }

    pub fn root_cert_pem(&self) -> Result<String, CryptoError> {
        Ok(self.root.serialize_pem()?)
    }

    pub fn root_key_pem(&self) -> String {
        self.root.serialize_private_key_pem()
    }

    /// Issues a leaf certificate for the given subject, signed by this CA.
    /// `sans` should carry the node's hostname and advertised IPs so peers
    /// can validate the cert against the address they dialed.
    pub fn issue(
        &self,
        class: SubjectClass,
        common_name: &str,
        sans: &[SanType],
    ) -> Result<IssuedCert, CryptoError> {
        let key_pair = generate_rsa_keypair(LEAF_KEY_BITS)?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, common_name);

        let now = OffsetDateTime::now_utc();
        let not_before = now - TimeDuration::hours(1);
        let not_after = now + TimeDuration::days(LEAF_VALIDITY_DAYS);

        let mut params = CertificateParams::new(Vec::new());
        params.distinguished_name = dn;
        params.subject_alt_names = sans.to_vec();
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.extended_key_usages = match class {
            SubjectClass::Cli => vec![ExtendedKeyUsagePurpose::ClientAuth],
            SubjectClass::Manager | SubjectClass::Worker => vec![
                ExtendedKeyUsagePurpose::ClientAuth,
                ExtendedKeyUsagePurpose::ServerAuth,
            ],
        };
        params.not_before = not_before;
        params.not_after = not_after;
        params.key_pair = Some(key_pair);

        let cert = Certificate::from_params(params)?;
        let cert_pem = cert.serialize_pem_with_signer(&self.root)?;
        let key_pem = cert.serialize_private_key_pem();

        Ok(IssuedCert { cert_pem, key_pem, not_after })
    }
}

fn generate_rsa_keypair(bits: usize) -> Result<KeyPair, CryptoError> {
    let mut rng = OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, bits).map_err(CryptoError::RsaKeygen)?;
    let der = private_key
        .to_pkcs8_der()
        .map_err(CryptoError::Pkcs8)?;
    Ok(KeyPair::from_der(der.as_bytes())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issues_leaf_signed_by_root() {
        let ca = CertificateAuthority::generate("test-cluster").unwrap();
        let issued = ca
            .issue(SubjectClass::Worker, "worker-1", &[SanType::DnsName("worker-1".into())])
            .unwrap();
        assert!(issued.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(issued.key_pem.contains("PRIVATE KEY"));
        assert!(!issued.needs_rotation());
    }

    #[test]
    fn cli_certs_lack_server_auth() {
        let ca = CertificateAuthority::generate("test-cluster").unwrap();
        let issued = ca.issue(SubjectClass::Cli, "operator", &[]).unwrap();
        assert!(issued.cert_pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn near_expiry_cert_needs_rotation() {
        let not_after = OffsetDateTime::now_utc() + TimeDuration::days(5);
        assert!(needs_rotation(not_after));
        let not_after = OffsetDateTime::now_utc() + TimeDuration::days(200);
        assert!(!needs_rotation(not_after));
    }
}
