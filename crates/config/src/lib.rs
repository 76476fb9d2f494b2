//! Certwarden configuration
//!
//! Configuration is a TOML document with one table per subsystem:
//!
//! ```toml
//! [acme]
//! email = "admin@example.com"
//! staging = true
//!
//! [self_signed]
//! signer = "certwarden-ca"
//! with_intermediate = true
//!
//! [self_signed.desc]
//! organization = "Example Corp"
//! country = "US"
//!
//! [renewal]
//! fraction = 0.6667
//! initial_backoff_secs = 60
//! max_backoff_secs = 3600
//!
//! [manager]
//! lookup_timeout_ms = 250
//!
//! [[zones]]
//! domain = "example.com"
//! mode = "acme"
//!
//! [[zones]]
//! domain = "internal.example"
//! mode = "self-signed"
//! ```
//!
//! Every field has a default, so an empty document is a valid configuration.

mod acme;
mod pki;
mod renewal;
mod zone;

pub mod validate;

pub use acme::{AcmeConfig, ChallengeKind, LETSENCRYPT_PRODUCTION, LETSENCRYPT_STAGING};
pub use pki::{CertificateDescConfig, SelfSignedConfig};
pub use renewal::{ManagerConfig, RenewalConfig};
pub use zone::{ZoneConfig, ZoneMode};

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use validator::Validate;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Document is not valid TOML for this schema
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    /// Field-level rule violated
    #[error("invalid configuration: {0}")]
    Field(#[from] validator::ValidationErrors),

    /// Cross-field or semantic rule violated
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// ACME issuance settings
    #[serde(default)]
    #[validate(nested)]
    pub acme: AcmeConfig,

    /// Internal certificate authority settings
    #[serde(default)]
    #[validate(nested)]
    pub self_signed: SelfSignedConfig,

    /// Renewal policy
    #[serde(default)]
    #[validate(nested)]
    pub renewal: RenewalConfig,

    /// Handshake-path settings
    #[serde(default)]
    #[validate(nested)]
    pub manager: ManagerConfig,

    /// Zones seeded into the repository at startup
    #[serde(default)]
    pub zones: Vec<ZoneConfig>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config = Self::from_toml(&content)?;
        info!(
            path = %path.display(),
            zones = config.zones.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        debug!(zones = config.zones.len(), "Parsed configuration document");
        Ok(config)
    }

    /// Validate field rules, then cross-field rules
    ///
    /// Lint warnings are logged but do not fail validation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Validate::validate(self)?;

        let mut result = validate::validate_zones(self);
        result.merge(validate::validate_acme(self));
        result.merge(validate::validate_self_signed(self));
        result.merge(validate::lint_config(self));

        for warning in &result.warnings {
            warn!(warning = %warning.message, "Configuration warning");
        }

        if result.errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(
                result.errors.iter().map(|e| e.to_string()).collect(),
            ))
        }
    }
}
