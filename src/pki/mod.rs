//! Workload cluster CA handling for kubeconfig generation
//!
//! Cluster API keeps each workload cluster's CA in a `<cluster>-ca` Secret.
//! When no control plane provider owns the kubeconfig, the controller loads
//! that CA and signs an admin client certificate with it.

use chrono::{Datelike, Utc};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use thiserror::Error;

/// Failures loading a CA or signing with it
#[derive(Debug, Error)]
pub enum PkiError {
    /// PEM text could not be decoded or is not a certificate
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// Private key could not be parsed or generated
    #[error("invalid private key: {0}")]
    InvalidKey(String),

    /// rcgen refused to produce a certificate
    #[error("signing failed: {0}")]
    Signing(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// DER bytes of the first PEM block in `pem_data`
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    ::pem::parse(pem_data.as_bytes())
        .map(|block| block.contents().to_vec())
        .map_err(|e| PkiError::InvalidCertificate(e.to_string()))
}

/// A workload cluster's certificate authority
pub struct CertificateAuthority {
    cert_pem: String,
    key: KeyPair,
}

/// A signed client certificate and its private key
#[derive(Clone, Debug)]
pub struct ClientCertificate {
    /// PEM-encoded certificate
    pub cert_pem: String,
    /// PEM-encoded private key
    pub key_pem: String,
}

impl CertificateAuthority {
    /// Load the CA from the `tls.crt`/`tls.key` pair of a CA Secret
    ///
    /// Both halves are parsed up front so a corrupt Secret is reported
    /// before anything is signed.
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem).map_err(|e| PkiError::InvalidKey(e.to_string()))?;
        Issuer::from_ca_cert_pem(cert_pem, &key)
            .map_err(|e| PkiError::InvalidCertificate(e.to_string()))?;
        Ok(Self {
            cert_pem: cert_pem.to_string(),
            key,
        })
    }

    /// Generate a self-signed CA valid for ten years
    pub fn generate(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = subject(common_name, None);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        valid_for_years(&mut params, 10);

        let key = KeyPair::generate().map_err(|e| PkiError::InvalidKey(e.to_string()))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| PkiError::Signing(e.to_string()))?;
        Ok(Self {
            cert_pem: cert.pem(),
            key,
        })
    }

    /// CA certificate as PEM
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// CA private key as PEM
    pub fn key_pem(&self) -> String {
        self.key.serialize_pem()
    }

    /// Sign a one-year client certificate for `user` in `group`
    ///
    /// The API server reads the CN as the user name and each O as a group,
    /// so `("kubernetes-admin", "system:masters")` is a cluster admin.
    pub fn issue_client_certificate(&self, user: &str, group: &str) -> Result<ClientCertificate> {
        let mut params = CertificateParams::default();
        params.distinguished_name = subject(user, Some(group));
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        valid_for_years(&mut params, 1);

        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &self.key)
            .map_err(|e| PkiError::InvalidCertificate(e.to_string()))?;
        let key = KeyPair::generate().map_err(|e| PkiError::InvalidKey(e.to_string()))?;
        let cert = params
            .signed_by(&key, &issuer)
            .map_err(|e| PkiError::Signing(e.to_string()))?;

        Ok(ClientCertificate {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }
}

fn subject(common_name: &str, organization: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
    if let Some(org) = organization {
        dn.push(DnType::OrganizationName, DnValue::Utf8String(org.to_string()));
    }
    dn
}

fn valid_for_years(params: &mut CertificateParams, years: i32) {
    let today = Utc::now().date_naive();
    // clamp to the 28th so the end date exists in every month
    let (month, day) = (today.month() as u8, today.day().min(28) as u8);
    params.not_before = rcgen::date_time_ymd(today.year(), month, day);
    params.not_after = rcgen::date_time_ymd(today.year() + years, month, day);
}
