//! ACME issuance configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Let's Encrypt production directory
pub const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Challenge type used to prove domain control
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeKind {
    /// Token served at `/.well-known/acme-challenge/<token>`
    #[default]
    #[serde(rename = "http-01")]
    Http01,
    /// TXT record at `_acme-challenge.<domain>`
    #[serde(rename = "dns-01")]
    Dns01,
}

impl ChallengeKind {
    /// Wire name of the challenge
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::Http01 => "http-01",
            ChallengeKind::Dns01 => "dns-01",
        }
    }

    /// Parse a wire name, case-insensitively
    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http-01" | "http01" | "http" => Some(ChallengeKind::Http01),
            "dns-01" | "dns01" | "dns" => Some(ChallengeKind::Dns01),
            _ => None,
        }
    }
}

/// ACME account and order settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AcmeConfig {
    /// Explicit directory URL; overrides `staging`
    #[serde(default)]
    pub directory_url: Option<String>,

    /// Use the Let's Encrypt staging directory
    #[serde(default)]
    pub staging: bool,

    /// Default account email for zones that do not name one
    #[serde(default)]
    #[validate(email)]
    pub email: Option<String>,

    /// Agree to the CA's terms of service on registration
    #[serde(default = "default_accept_tos")]
    pub accept_tos: bool,

    /// Default challenge type
    #[serde(default)]
    pub challenge: ChallengeKind,

    /// Overall bound on one order (order, challenge, finalize, download)
    #[serde(default = "default_order_timeout_secs")]
    #[validate(range(min = 10, max = 3600))]
    pub order_timeout_secs: u64,

    /// Interval between order/authorization status polls
    #[serde(default = "default_poll_interval_ms")]
    #[validate(range(min = 100, max = 60000))]
    pub poll_interval_ms: u64,
}

fn default_accept_tos() -> bool { true }
fn default_order_timeout_secs() -> u64 { 300 }
fn default_poll_interval_ms() -> u64 { 2000 }

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            directory_url: None,
            staging: false,
            email: None,
            accept_tos: default_accept_tos(),
            challenge: ChallengeKind::default(),
            order_timeout_secs: default_order_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl AcmeConfig {
    /// Directory URL to register and order against
    pub fn directory(&self) -> &str {
        match (&self.directory_url, self.staging) {
            (Some(url), _) => url,
            (None, true) => LETSENCRYPT_STAGING,
            (None, false) => LETSENCRYPT_PRODUCTION,
        }
    }

    /// Overall order timeout
    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_secs)
    }

    /// Status poll interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
