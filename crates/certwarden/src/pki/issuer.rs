//! Certificate authorities and the certificates they sign

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    BasicConstraints, CertificateParams, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use time::OffsetDateTime;
use tracing::{debug, info};

use certwarden_config::SelfSignedConfig;

use super::{CertificateDesc, IssuedCertificate, PkiError};
use crate::records::SelfSigner;

/// Tolerated clock skew between this host and relying parties
const BACKDATE: time::Duration = time::Duration::minutes(5);

/// Subject and validity settings applied to everything an issuer signs
#[derive(Debug, Clone)]
pub struct IssuancePolicy {
    pub desc: CertificateDesc,
    pub root_validity_days: u32,
    pub intermediate_validity_days: u32,
    pub server_validity_days: u32,
    pub client_validity_days: u32,
}

impl Default for IssuancePolicy {
    fn default() -> Self {
        Self::from(&SelfSignedConfig::default())
    }
}

impl From<&SelfSignedConfig> for IssuancePolicy {
    fn from(config: &SelfSignedConfig) -> Self {
        Self {
            desc: CertificateDesc::from(&config.desc),
            root_validity_days: config.root_validity_days,
            intermediate_validity_days: config.intermediate_validity_days,
            server_validity_days: config.server_validity_days,
            client_validity_days: config.client_validity_days,
        }
    }
}

/// A client certificate and its PKCS#12 container
#[derive(Debug, Clone)]
pub struct ClientCertificate {
    pub certificate: IssuedCertificate,
    /// DER PKCS#12 holding the key, certificate and issuer chain
    pub pkcs12: Vec<u8>,
}

/// A certificate authority able to sign intermediates and leaves
///
/// The parent is referenced by name; the ancestor certificates (nearest
/// first) are owned so chains can be assembled without a lookup.
#[derive(Debug, Clone)]
pub struct CertificateIssuer {
    name: String,
    certificate: Arc<IssuedCertificate>,
    parent: Option<String>,
    ancestors: Vec<Arc<IssuedCertificate>>,
    policy: Arc<IssuancePolicy>,
}

impl CertificateIssuer {
    /// Create a self-signed root CA
    pub fn create_root(
        name: &str,
        common_name: &str,
        policy: Arc<IssuancePolicy>,
    ) -> Result<Self, PkiError> {
        let key = generate_key()?;
        let (not_before, not_after) = validity(policy.root_validity_days, None);
        let params = ca_params(&policy.desc, common_name, not_before, not_after);

        let cert = params.self_signed(&key)?;
        let certificate = IssuedCertificate::new(&cert, &key)?;

        info!(signer = %name, common_name = %common_name, "Created root certificate authority");

        Ok(Self {
            name: name.to_string(),
            certificate: Arc::new(certificate),
            parent: None,
            ancestors: Vec::new(),
            policy,
        })
    }

    /// Rebuild an issuer from stored parts
    pub fn from_parts(
        name: impl Into<String>,
        certificate: IssuedCertificate,
        parent: Option<&CertificateIssuer>,
        policy: Arc<IssuancePolicy>,
    ) -> Self {
        let (parent, ancestors) = match parent {
            Some(p) => (Some(p.name.clone()), p.chain()),
            None => (None, Vec::new()),
        };
        Self {
            name: name.into(),
            certificate: Arc::new(certificate),
            parent,
            ancestors,
            policy,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_name(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn certificate(&self) -> &IssuedCertificate {
        &self.certificate
    }

    pub fn ancestors(&self) -> &[Arc<IssuedCertificate>] {
        &self.ancestors
    }

    /// This issuer's certificate followed by its ancestors up to the root
    pub fn chain(&self) -> Vec<Arc<IssuedCertificate>> {
        let mut chain = Vec::with_capacity(self.ancestors.len() + 1);
        chain.push(self.certificate.clone());
        chain.extend(self.ancestors.iter().cloned());
        chain
    }

    /// Root certificate of this issuer's tree
    pub fn root(&self) -> &IssuedCertificate {
        self.ancestors.last().unwrap_or(&self.certificate)
    }

    /// PEM chain for a leaf: leaf, this issuer, ancestors
    pub fn chain_pem(&self, leaf: &IssuedCertificate) -> String {
        let mut pem = String::from(leaf.cert_pem());
        for cert in self.chain() {
            pem.push_str(cert.cert_pem());
        }
        pem
    }

    /// Persistable record for this issuer
    pub fn to_record(&self) -> SelfSigner {
        SelfSigner {
            name: self.name.clone(),
            private_key: self.certificate.key_pem().to_string(),
            certificate: self.certificate.cert_pem().to_string(),
            issuer: self.parent.clone().unwrap_or_default(),
            created_at: Utc::now().timestamp(),
        }
    }

    /// Issue an intermediate CA named after its common name
    pub fn issue_inter_cert(&self, common_name: &str) -> Result<CertificateIssuer, PkiError> {
        let now = Utc::now();
        self.ensure_can_sign(now)?;

        let key = generate_key()?;
        let (not_before, not_after) = validity(
            self.policy.intermediate_validity_days,
            Some(self.certificate.not_after()),
        );
        let params = ca_params(&self.policy.desc, common_name, not_before, not_after);
        let certificate = self.sign(params, &key)?;

        info!(
            signer = %common_name,
            parent = %self.name,
            "Issued intermediate certificate authority"
        );

        Ok(CertificateIssuer {
            name: common_name.to_string(),
            certificate: Arc::new(certificate),
            parent: Some(self.name.clone()),
            ancestors: self.chain(),
            policy: self.policy.clone(),
        })
    }

    /// Issue a serverAuth leaf whose SANs are `domains` plus `ip_addresses`
    pub fn issue_server_cert(
        &self,
        common_name: &str,
        domains: &[String],
        ip_addresses: &[IpAddr],
    ) -> Result<IssuedCertificate, PkiError> {
        if domains.is_empty() && ip_addresses.is_empty() {
            return Err(PkiError::NoIdentities);
        }
        self.ensure_can_sign(Utc::now())?;

        let key = generate_key()?;
        let (not_before, not_after) = validity(
            self.policy.server_validity_days,
            Some(self.certificate.not_after()),
        );
        let mut params = leaf_params(&self.policy.desc, common_name, not_before, not_after);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        for domain in domains {
            let name = domain.as_str().try_into().map_err(|e: rcgen::Error| {
                PkiError::InvalidName {
                    name: domain.clone(),
                    reason: e.to_string(),
                }
            })?;
            params.subject_alt_names.push(SanType::DnsName(name));
        }
        for ip in ip_addresses {
            params.subject_alt_names.push(SanType::IpAddress(*ip));
        }

        let certificate = self.sign(params, &key)?;
        debug!(
            signer = %self.name,
            common_name = %common_name,
            serial = %certificate.info().serial,
            "Issued server certificate"
        );
        Ok(certificate)
    }

    /// Issue a clientAuth leaf packaged with its chain in a PKCS#12 container
    pub fn issue_client_cert(
        &self,
        common_name: &str,
        password: &str,
    ) -> Result<ClientCertificate, PkiError> {
        validate_pkcs12_password(password)?;
        self.ensure_can_sign(Utc::now())?;

        let key = generate_key()?;
        let (not_before, not_after) = validity(
            self.policy.client_validity_days,
            Some(self.certificate.not_after()),
        );
        let mut params = leaf_params(&self.policy.desc, common_name, not_before, not_after);
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];

        let certificate = self.sign(params, &key)?;

        let chain = self.chain();
        let cas: Vec<&[u8]> = chain.iter().map(|c| c.cert_der()).collect();
        let pfx = p12::PFX::new_with_cas(
            certificate.cert_der(),
            certificate.key_der(),
            &cas,
            password,
            common_name,
        )
        .ok_or_else(|| PkiError::Encoding("failed to build PKCS#12 container".to_string()))?;

        debug!(signer = %self.name, common_name = %common_name, "Issued client certificate");

        Ok(ClientCertificate {
            certificate,
            pkcs12: pfx.to_der(),
        })
    }

    fn ensure_can_sign(&self, now: DateTime<Utc>) -> Result<(), PkiError> {
        let info = self.certificate.info();
        if !info.is_ca {
            return Err(PkiError::NotCa(self.name.clone()));
        }
        if !info.is_valid_at(now) {
            return Err(PkiError::Expired(self.name.clone()));
        }
        Ok(())
    }

    fn sign(&self, params: CertificateParams, key: &KeyPair) -> Result<IssuedCertificate, PkiError> {
        let ca_key = self.certificate.key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(self.certificate.cert_pem(), ca_key)?;
        let cert = params.signed_by(key, &issuer)?;
        IssuedCertificate::new(&cert, key)
    }
}

/// Passwords must survive the BMPString conversion PKCS#12 applies
fn validate_pkcs12_password(password: &str) -> Result<(), PkiError> {
    if password.chars().any(|c| c == '\0' || (c as u32) > 0xFFFF) {
        return Err(PkiError::Encoding(
            "PKCS#12 password contains characters outside the Basic Multilingual Plane"
                .to_string(),
        ));
    }
    Ok(())
}

fn generate_key() -> Result<KeyPair, PkiError> {
    KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(|e| PkiError::KeyGeneration(e.to_string()))
}

/// Random positive 128-bit serial
fn random_serial() -> SerialNumber {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    bytes[0] = (bytes[0] & 0x7f) | 0x40;
    SerialNumber::from_slice(&bytes)
}

/// Validity window of `days`, ending no later than the issuer's expiry
fn validity(days: u32, cap: Option<DateTime<Utc>>) -> (OffsetDateTime, OffsetDateTime) {
    let now = OffsetDateTime::now_utc();
    let mut not_after = now + time::Duration::days(i64::from(days));
    if let Some(cap) = cap.and_then(|c| OffsetDateTime::from_unix_timestamp(c.timestamp()).ok()) {
        if not_after > cap {
            not_after = cap;
        }
    }
    (now - BACKDATE, not_after)
}

fn ca_params(
    desc: &CertificateDesc,
    common_name: &str,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = desc.distinguished_name(common_name);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = not_before;
    params.not_after = not_after;
    params.serial_number = Some(random_serial());
    params.use_authority_key_identifier_extension = true;
    params
}

fn leaf_params(
    desc: &CertificateDesc,
    common_name: &str,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
) -> CertificateParams {
    let mut params = CertificateParams::default();
    params.distinguished_name = desc.distinguished_name(common_name);
    params.is_ca = IsCa::ExplicitNoCa;
    params.not_before = not_before;
    params.not_after = not_after;
    params.serial_number = Some(random_serial());
    params.use_authority_key_identifier_extension = true;
    params
}
