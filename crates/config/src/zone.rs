//! Zone seed configuration.

use serde::{Deserialize, Serialize};

use crate::acme::ChallengeKind;

/// How a zone obtains its certificate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ZoneMode {
    #[default]
    Acme,
    SelfSigned,
}

/// A domain to manage, seeded into the repository at startup.
///
/// Seeding never overwrites issuance state of an existing zone; it only
/// creates missing zones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ZoneConfig {
    /// Primary domain, also the zone key
    pub domain: String,

    #[serde(default)]
    pub mode: ZoneMode,

    /// ACME account email (ACME mode)
    #[serde(default)]
    pub email: Option<String>,

    /// Signer name (self-signed mode)
    #[serde(default)]
    pub signer: Option<String>,

    /// Additional DNS names on the certificate
    #[serde(default)]
    pub alt_names: Vec<String>,

    /// Additional IP SANs (self-signed mode)
    #[serde(default)]
    pub ip_addresses: Vec<String>,

    /// Challenge override (ACME mode)
    #[serde(default)]
    pub challenge: Option<ChallengeKind>,
}
