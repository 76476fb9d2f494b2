//! Issued certificates and their parsed metadata

use std::fmt;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use rcgen::KeyPair;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;
use x509_parser::certificate::X509Certificate;

use super::PkiError;

/// Metadata read back from an encoded certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    /// Colon-separated hex
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub is_ca: bool,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
    subject_raw: Vec<u8>,
    issuer_raw: Vec<u8>,
}

impl CertificateInfo {
    /// Parse a DER certificate
    pub fn from_der(der: &[u8]) -> Result<Self, PkiError> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::Encoding(format!("failed to parse certificate: {}", e)))?;

        let common_name = |name: &x509_parser::x509::X509Name<'_>| {
            name.iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .unwrap_or_default()
                .to_string()
        };

        let validity = cert.validity();
        let not_before = timestamp(validity.not_before.timestamp())?;
        let not_after = timestamp(validity.not_after.timestamp())?;

        let is_ca = matches!(cert.basic_constraints(), Ok(Some(bc)) if bc.value.ca);

        let mut dns_names = Vec::new();
        let mut ip_addresses = Vec::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                match name {
                    GeneralName::DNSName(dns) => dns_names.push(dns.to_string()),
                    GeneralName::IPAddress(bytes) => {
                        if let Some(ip) = ip_from_bytes(bytes) {
                            ip_addresses.push(ip);
                        }
                    }
                    _ => {}
                }
            }
        }

        Ok(Self {
            subject: common_name(cert.subject()),
            issuer: common_name(cert.issuer()),
            serial: cert.raw_serial_as_string(),
            not_before,
            not_after,
            is_ca,
            dns_names,
            ip_addresses,
            subject_raw: cert.subject().as_raw().to_vec(),
            issuer_raw: cert.issuer().as_raw().to_vec(),
        })
    }

    /// Whether `now` falls inside the validity window
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now < self.not_after
    }

    /// Whether this certificate names `parent` as its issuer
    pub fn is_issued_by(&self, parent: &CertificateInfo) -> bool {
        self.issuer_raw == parent.subject_raw
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, PkiError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| PkiError::Encoding(format!("certificate time {} out of range", secs)))
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(IpAddr::from),
        16 => <[u8; 16]>::try_from(bytes).ok().map(IpAddr::from),
        _ => None,
    }
}

/// A private key and the certificate issued for it
///
/// Immutable once built. The key is held as PKCS#8 and never printed.
#[derive(Clone)]
pub struct IssuedCertificate {
    cert_pem: String,
    cert_der: Vec<u8>,
    key_pem: String,
    key_der: Vec<u8>,
    info: CertificateInfo,
}

impl IssuedCertificate {
    pub(crate) fn new(cert: &rcgen::Certificate, key: &KeyPair) -> Result<Self, PkiError> {
        let cert_der = cert.der().to_vec();
        let info = CertificateInfo::from_der(&cert_der)?;
        Ok(Self {
            cert_pem: cert.pem(),
            cert_der,
            key_pem: key.serialize_pem(),
            key_der: key.serialize_der(),
            info,
        })
    }

    /// Load from a PEM certificate and a PKCS#8 PEM key
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self, PkiError> {
        let (_, pem) = parse_x509_pem(cert_pem.as_bytes())
            .map_err(|e| PkiError::Encoding(format!("invalid certificate PEM: {}", e)))?;
        let key = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::Encoding(format!("invalid private key PEM: {}", e)))?;
        let info = CertificateInfo::from_der(&pem.contents)?;

        Ok(Self {
            cert_pem: cert_pem.to_string(),
            cert_der: pem.contents,
            key_pem: key.serialize_pem(),
            key_der: key.serialize_der(),
            info,
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// PKCS#8 DER
    pub fn key_der(&self) -> &[u8] {
        &self.key_der
    }

    pub fn info(&self) -> &CertificateInfo {
        &self.info
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.info.not_after
    }

    pub(crate) fn key_pair(&self) -> Result<KeyPair, PkiError> {
        KeyPair::from_pem(&self.key_pem)
            .map_err(|e| PkiError::Encoding(format!("invalid private key: {}", e)))
    }
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("subject", &self.info.subject)
            .field("issuer", &self.info.issuer)
            .field("serial", &self.info.serial)
            .field("not_after", &self.info.not_after)
            .finish_non_exhaustive()
    }
}
