//! Internal certificate authority configuration.

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Subject fields placed into every self-signed certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CertificateDescConfig {
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    #[validate(length(equal = 2))]
    pub country: Option<String>,
    #[serde(default)]
    pub province: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub zip: Option<String>,
}

/// Self-signed issuance settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SelfSignedConfig {
    /// Signer used by zones that do not name one
    #[serde(default = "default_signer")]
    #[validate(length(min = 1, max = 128))]
    pub signer: String,

    /// Create an intermediate beneath the root when bootstrapping
    #[serde(default = "default_with_intermediate")]
    pub with_intermediate: bool,

    /// Bootstrap the default signer on first use if it does not exist
    #[serde(default = "default_auto_bootstrap")]
    pub auto_bootstrap: bool,

    /// Add this host's interface addresses to self-signed server certificates
    #[serde(default)]
    pub include_local_ips: bool,

    #[serde(default = "default_root_validity_days")]
    #[validate(range(min = 1, max = 36500))]
    pub root_validity_days: u32,

    #[serde(default = "default_intermediate_validity_days")]
    #[validate(range(min = 1, max = 36500))]
    pub intermediate_validity_days: u32,

    #[serde(default = "default_leaf_validity_days")]
    #[validate(range(min = 1, max = 3650))]
    pub server_validity_days: u32,

    #[serde(default = "default_leaf_validity_days")]
    #[validate(range(min = 1, max = 3650))]
    pub client_validity_days: u32,

    /// Subject description
    #[serde(default)]
    #[validate(nested)]
    pub desc: CertificateDescConfig,
}

fn default_signer() -> String { "certwarden-ca".to_string() }
fn default_with_intermediate() -> bool { true }
fn default_auto_bootstrap() -> bool { true }
fn default_root_validity_days() -> u32 { 3650 }
fn default_intermediate_validity_days() -> u32 { 1825 }
fn default_leaf_validity_days() -> u32 { 365 }

impl Default for SelfSignedConfig {
    fn default() -> Self {
        Self {
            signer: default_signer(),
            with_intermediate: default_with_intermediate(),
            auto_bootstrap: default_auto_bootstrap(),
            include_local_ips: false,
            root_validity_days: default_root_validity_days(),
            intermediate_validity_days: default_intermediate_validity_days(),
            server_validity_days: default_leaf_validity_days(),
            client_validity_days: default_leaf_validity_days(),
            desc: CertificateDescConfig::default(),
        }
    }
}

impl SelfSignedConfig {
    /// Name given to the intermediate created under `root` at bootstrap
    pub fn intermediate_name(root: &str) -> String {
        format!("{}-intermediate", root)
    }
}
