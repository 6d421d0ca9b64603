//! PKI operations for the cluster trust chain.
//!
//! This module handles certificate authority operations and leaf issuance.
//! The provisioner acts as the CA: it creates (or reloads) a self-signed
//! root and issues every component and host certificate from it.
//!
//! # Trust Model
//!
//! - A single CA signs every leaf in a cluster
//! - Leaf keys are generated alongside their certificate and travel only to
//!   the hosts that run the component
//! - Server leaves carry every name the component is reached by as SANs
//! - Existing leaves are inspected (subject, SANs, signer) to decide reuse

use std::collections::BTreeSet;
use std::net::IpAddr;

use chrono::Datelike;
use rcgen::{
    string::Ia5String, BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, PublicKeyData, SanType,
};
use thiserror::Error;
use x509_parser::prelude::*;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Invalid subject alternative name
    #[error("invalid subject alternative name {name}: {reason}")]
    InvalidName { name: String, reason: String },

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// The private key belongs to a different certificate
    #[error("CA key does not match the CA certificate")]
    KeyMismatch,
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// CA validity in days.
const CA_VALIDITY_DAYS: u64 = 3650;

/// Leaf validity in days.
const LEAF_VALIDITY_DAYS: u64 = 3650;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// A single subject alternative name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SubjectName {
    Dns(String),
    Ip(IpAddr),
}

impl SubjectName {
    /// Classify a host identifier: IP literals become IP SANs, anything else DNS.
    pub fn from_host(value: &str) -> Self {
        match value.parse::<IpAddr>() {
            Ok(ip) => Self::Ip(ip),
            Err(_) => Self::Dns(value.to_string()),
        }
    }

    fn to_san(&self) -> Result<SanType> {
        match self {
            Self::Ip(ip) => Ok(SanType::IpAddress(*ip)),
            Self::Dns(name) => Ia5String::try_from(name.clone())
                .map(SanType::DnsName)
                .map_err(|e| PkiError::InvalidName {
                    name: name.clone(),
                    reason: e.to_string(),
                }),
        }
    }
}

impl std::fmt::Display for SubjectName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dns(name) => write!(f, "DNS:{}", name),
            Self::Ip(ip) => write!(f, "IP:{}", ip),
        }
    }
}

/// Certificate subject (CN and optional O).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subject {
    pub common_name: String,
    pub organization: Option<String>,
}

impl Subject {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organization: None,
        }
    }

    pub fn with_organization(mut self, organization: impl Into<String>) -> Self {
        self.organization = Some(organization.into());
        self
    }

    fn distinguished_name(&self) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(self.common_name.clone()),
        );
        if let Some(org) = &self.organization {
            dn.push(DnType::OrganizationName, DnValue::Utf8String(org.clone()));
        }
        dn
    }
}

/// How a leaf certificate will be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafUsage {
    /// Client authentication only.
    Client,
    /// Server and client authentication (peer-to-peer components).
    ServerAndClient,
}

/// Everything needed to issue one leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafRequest {
    pub subject: Subject,
    pub usage: LeafUsage,
    pub alt_names: BTreeSet<SubjectName>,
}

/// A certificate and its private key, both PEM-encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_pem: String,
}

/// Certificate Authority for issuing cluster certificates
pub struct CertificateAuthority {
    /// CA key pair serialized as PEM (we need to deserialize each time since KeyPair isn't Clone)
    ca_key_pem: String,
    /// PEM-encoded CA certificate for distribution
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        Self::with_validity_days(common_name, CA_VALIDITY_DAYS)
    }

    /// Create a new self-signed CA valid for `days` from today.
    pub fn with_validity_days(common_name: &str, days: u64) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = Subject::new(common_name).distinguished_name();

        // CA settings
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, days);

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;

        let ca_key_pem = key_pair.serialize_pem();

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load CA from PEM
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;

        let der = parse_pem(cert_pem)?;
        let (_, cert) = X509Certificate::from_der(&der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;
        if cert.public_key().raw != key.subject_public_key_info().as_slice() {
            return Err(PkiError::KeyMismatch);
        }

        Issuer::from_ca_cert_pem(cert_pem, &key)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA cert: {}", e)))?;

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// Get the CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Get the CA private key in PEM format
    pub fn ca_key_pem(&self) -> &str {
        &self.ca_key_pem
    }

    /// Load the key pair from stored PEM
    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Generate a fresh key and issue a leaf certificate for it.
    pub fn issue(&self, request: &LeafRequest) -> Result<IssuedCertificate> {
        let mut params = CertificateParams::default();
        params.distinguished_name = request.subject.distinguished_name();
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = match request.usage {
            LeafUsage::Client => vec![ExtendedKeyUsagePurpose::ClientAuth],
            LeafUsage::ServerAndClient => vec![
                ExtendedKeyUsagePurpose::ClientAuth,
                ExtendedKeyUsagePurpose::ServerAuth,
            ],
        };
        params.subject_alt_names = request
            .alt_names
            .iter()
            .map(SubjectName::to_san)
            .collect::<Result<Vec<_>>>()?;
        set_validity(&mut params, LEAF_VALIDITY_DAYS);

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate leaf key: {}", e))
        })?;

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&key_pair, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!(
                "failed to sign certificate for {}: {}",
                request.subject.common_name, e
            ))
        })?;

        Ok(IssuedCertificate {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }
}

/// Validity window starting today, `days` long.
fn set_validity(params: &mut CertificateParams, days: u64) {
    let today = chrono::Utc::now().date_naive();
    let until = today + chrono::Days::new(days);
    params.not_before = rcgen::date_time_ymd(today.year(), today.month() as u8, today.day() as u8);
    params.not_after = rcgen::date_time_ymd(until.year(), until.month() as u8, until.day() as u8);
}

/// What a certificate says about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: Subject,
    pub alt_names: BTreeSet<SubjectName>,
    pub is_ca: bool,
    /// Expiry as Unix seconds.
    pub not_after: i64,
}

/// Parse a PEM certificate and extract its subject, SANs and CA flag.
pub fn inspect_certificate(cert_pem: &str) -> Result<CertificateInfo> {
    let der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("")
        .to_string();
    let organization = cert
        .subject()
        .iter_organization()
        .next()
        .and_then(|o| o.as_str().ok())
        .map(str::to_string);

    let mut alt_names = BTreeSet::new();
    let san = cert
        .subject_alternative_name()
        .map_err(|e| PkiError::ParseError(format!("invalid SAN extension: {}", e)))?;
    if let Some(san) = san {
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(dns) => {
                    alt_names.insert(SubjectName::Dns(dns.to_string()));
                }
                GeneralName::IPAddress(bytes) => {
                    if let Some(ip) = ip_from_bytes(bytes) {
                        alt_names.insert(SubjectName::Ip(ip));
                    }
                }
                _ => {}
            }
        }
    }

    Ok(CertificateInfo {
        subject: Subject {
            common_name,
            organization,
        },
        alt_names,
        is_ca: cert.is_ca(),
        not_after: cert.validity().not_after.timestamp(),
    })
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().ok()?;
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

/// Check whether `cert_pem` carries a valid signature from `ca_cert_pem`.
pub fn verify_signed_by(cert_pem: &str, ca_cert_pem: &str) -> Result<bool> {
    let cert_der = parse_pem(cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

    let ca_der = parse_pem(ca_cert_pem)?;
    let (_, ca_cert) = X509Certificate::from_der(&ca_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

    Ok(cert.verify_signature(Some(ca_cert.public_key())).is_ok())
}

/// Check that a PEM private key parses.
pub fn validate_private_key(key_pem: &str) -> Result<()> {
    KeyPair::from_pem(key_pem)
        .map(|_| ())
        .map_err(|e| PkiError::ParseError(format!("failed to parse private key: {}", e)))
}
