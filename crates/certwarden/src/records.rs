//! Persisted records
//!
//! Signers, ACME accounts and zones are protobuf messages stored
//! length-delimited as data store values. Timestamps are Unix seconds with
//! `0` meaning "unset".

use bytes::Bytes;
use chrono::{DateTime, Utc};
use prost::Message;

use certwarden_config::{ChallengeKind, ZoneConfig, ZoneMode};

use crate::error::CertError;

/// How a zone obtains its certificate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum IssuanceMode {
    Acme = 0,
    SelfSigned = 1,
}

impl IssuanceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssuanceMode::Acme => "acme",
            IssuanceMode::SelfSigned => "self-signed",
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "acme" => Some(IssuanceMode::Acme),
            "self" | "self-signed" | "selfsigned" => Some(IssuanceMode::SelfSigned),
            _ => None,
        }
    }
}

impl From<ZoneMode> for IssuanceMode {
    fn from(mode: ZoneMode) -> Self {
        match mode {
            ZoneMode::Acme => IssuanceMode::Acme,
            ZoneMode::SelfSigned => IssuanceMode::SelfSigned,
        }
    }
}

/// A certificate authority created by this system
#[derive(Clone, PartialEq, Message)]
pub struct SelfSigner {
    /// Unique signer name
    #[prost(string, tag = "1")]
    pub name: String,
    /// PKCS#8 PEM private key
    #[prost(string, tag = "2")]
    pub private_key: String,
    /// PEM certificate
    #[prost(string, tag = "3")]
    pub certificate: String,
    /// Parent signer name, empty for a root
    #[prost(string, tag = "4")]
    pub issuer: String,
    #[prost(int64, tag = "5")]
    pub created_at: i64,
}

impl SelfSigner {
    pub fn is_root(&self) -> bool {
        self.issuer.is_empty()
    }
}

/// ACME registration resource as returned by the CA
#[derive(Clone, PartialEq, Message)]
pub struct AcmeRegistration {
    #[prost(string, tag = "1")]
    pub status: String,
    #[prost(string, repeated, tag = "2")]
    pub contact: Vec<String>,
    #[prost(bool, tag = "3")]
    pub terms_of_service_agreed: bool,
    #[prost(string, tag = "4")]
    pub orders: String,
    /// Account URL
    #[prost(string, tag = "5")]
    pub uri: String,
}

/// A registered ACME account
#[derive(Clone, PartialEq, Message)]
pub struct AcmeAccount {
    #[prost(string, tag = "1")]
    pub email: String,
    #[prost(message, optional, tag = "2")]
    pub registration: Option<AcmeRegistration>,
    /// Serialized ACME client credentials, including the account signing key
    #[prost(bytes = "vec", tag = "3")]
    pub credentials: Vec<u8>,
    #[prost(int64, tag = "4")]
    pub created_at: i64,
}

/// A managed domain and its issuance state
#[derive(Clone, PartialEq, Message)]
pub struct Zone {
    /// Normalised primary domain
    #[prost(string, tag = "1")]
    pub zone: String,
    #[prost(enumeration = "IssuanceMode", tag = "2")]
    pub mode: i32,
    /// Certificate cache key of the last issued certificate, empty if never issued
    #[prost(string, tag = "3")]
    pub certificate: String,
    #[prost(int64, tag = "4")]
    pub issued_at: i64,
    #[prost(int64, tag = "5")]
    pub expires_at: i64,
    #[prost(int64, tag = "6")]
    pub renewal_due: i64,
    /// Error from the most recent failed attempt, empty after a success
    #[prost(string, tag = "7")]
    pub last_error: String,
    /// ACME account email, empty for the configured default
    #[prost(string, tag = "8")]
    pub email: String,
    /// Signer name, empty for the configured default
    #[prost(string, tag = "9")]
    pub signer: String,
    #[prost(string, repeated, tag = "10")]
    pub alt_names: Vec<String>,
    #[prost(string, repeated, tag = "11")]
    pub ip_addresses: Vec<String>,
    /// `http-01` or `dns-01`, empty for the configured default
    #[prost(string, tag = "12")]
    pub challenge: String,
    #[prost(int64, tag = "13")]
    pub first_seen: i64,
    #[prost(int64, tag = "14")]
    pub updated_at: i64,
}

impl Zone {
    /// A never-issued zone
    pub fn new(domain: impl Into<String>, mode: IssuanceMode) -> Self {
        let now = Utc::now().timestamp();
        let mut zone = Zone {
            zone: domain.into(),
            first_seen: now,
            updated_at: now,
            ..Default::default()
        };
        zone.set_mode(mode);
        zone
    }

    /// Build a zone from its seed configuration
    pub fn from_config(config: &ZoneConfig, domain: &str) -> Self {
        let mut zone = Zone::new(domain, config.mode.into());
        zone.email = config.email.clone().unwrap_or_default();
        zone.signer = config.signer.clone().unwrap_or_default();
        zone.alt_names = config.alt_names.clone();
        zone.ip_addresses = config.ip_addresses.clone();
        zone.challenge = config
            .challenge
            .map(|c| c.as_str().to_string())
            .unwrap_or_default();
        zone
    }

    /// Whether a certificate has ever been issued
    pub fn has_certificate(&self) -> bool {
        !self.certificate.is_empty()
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        from_unix(self.expires_at)
    }

    pub fn renewal_due_at(&self) -> Option<DateTime<Utc>> {
        from_unix(self.renewal_due)
    }

    pub fn first_seen_at(&self) -> Option<DateTime<Utc>> {
        from_unix(self.first_seen)
    }

    /// Whether the issued certificate is past its expiry at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires() {
            Some(expires) => expires <= now,
            None => true,
        }
    }

    /// Whether renewal (or first issuance) is due at `now`
    pub fn is_renewal_due(&self, now: DateTime<Utc>) -> bool {
        if !self.has_certificate() {
            return true;
        }
        match self.renewal_due_at() {
            Some(due) => due <= now,
            None => true,
        }
    }

    /// Challenge override, if the zone sets a recognised one
    pub fn challenge_kind(&self) -> Option<ChallengeKind> {
        if self.challenge.is_empty() {
            None
        } else {
            ChallengeKind::from_str_loose(&self.challenge)
        }
    }

    /// Primary domain followed by alt names, without duplicates
    pub fn names(&self) -> Vec<String> {
        let mut names = vec![self.zone.clone()];
        for alt in &self.alt_names {
            if !names.contains(alt) {
                names.push(alt.clone());
            }
        }
        names
    }

    /// Mark a successful issuance
    pub fn record_issued(
        &mut self,
        certificate: impl Into<String>,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
        fraction: f64,
    ) {
        let lifetime = not_after - not_before;
        let lead = chrono::Duration::seconds((lifetime.num_seconds() as f64 * fraction) as i64);

        self.certificate = certificate.into();
        self.issued_at = Utc::now().timestamp();
        self.expires_at = not_after.timestamp();
        self.renewal_due = (not_before + lead).timestamp();
        self.last_error.clear();
        self.updated_at = Utc::now().timestamp();
    }

    /// Mark a failed attempt, keeping the previous certificate in force
    pub fn record_failure(&mut self, error: impl ToString) {
        self.last_error = error.to_string();
        self.updated_at = Utc::now().timestamp();
    }
}

/// Convert Unix seconds to a timestamp, treating `0` as unset
pub fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    if secs == 0 {
        None
    } else {
        DateTime::from_timestamp(secs, 0)
    }
}

/// Encode a record as a length-delimited protobuf value
pub fn encode<M: Message>(record: &M) -> Bytes {
    Bytes::from(record.encode_length_delimited_to_vec())
}

/// Decode a length-delimited protobuf value
pub fn decode<M: Message + Default>(bytes: &[u8]) -> Result<M, CertError> {
    Ok(M::decode_length_delimited(bytes)?)
}
