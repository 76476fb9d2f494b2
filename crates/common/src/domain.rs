//! Normalised server names.
//!
//! TLS clients send SNI names in arbitrary case and occasionally with a
//! trailing dot. Zone records, cache entries and certificate SANs are all
//! keyed by the normalised form so that a lookup never misses on spelling.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

/// Maximum length of a DNS name in presentation form
const MAX_NAME_LEN: usize = 253;

/// Maximum length of a single DNS label
const MAX_LABEL_LEN: usize = 63;

/// Rejected server name
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid domain name '{name}': {reason}")]
pub struct InvalidDomainName {
    pub name: String,
    pub reason: &'static str,
}

/// A lower-cased DNS name (or IP literal) without a trailing dot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DomainName(String);

impl DomainName {
    /// Parse and normalise a server name
    pub fn parse(raw: &str) -> Result<Self, InvalidDomainName> {
        let trimmed = raw.trim();
        let name = trimmed.strip_suffix('.').unwrap_or(trimmed).to_ascii_lowercase();

        let invalid = |reason| InvalidDomainName {
            name: raw.to_string(),
            reason,
        };

        if name.is_empty() {
            return Err(invalid("empty name"));
        }
        if name.parse::<IpAddr>().is_ok() {
            return Ok(Self(name));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(invalid("name longer than 253 characters"));
        }

        for (index, label) in name.split('.').enumerate() {
            if label.is_empty() {
                return Err(invalid("empty label"));
            }
            if label.len() > MAX_LABEL_LEN {
                return Err(invalid("label longer than 63 characters"));
            }
            if label == "*" {
                if index != 0 {
                    return Err(invalid("wildcard only allowed as the first label"));
                }
                continue;
            }
            if label.starts_with('-') || label.ends_with('-') {
                return Err(invalid("label starts or ends with '-'"));
            }
            if !label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
            {
                return Err(invalid("label contains characters outside [a-z0-9-_]"));
            }
        }

        Ok(Self(name))
    }

    /// The normalised name
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Convert to owned String
    pub fn into_string(self) -> String {
        self.0
    }

    /// Whether this is an IP literal rather than a DNS name
    pub fn is_ip(&self) -> bool {
        self.0.parse::<IpAddr>().is_ok()
    }

    /// Whether this is a wildcard name (`*.example.com`)
    pub fn is_wildcard(&self) -> bool {
        self.0.starts_with("*.")
    }

    /// The wildcard name that would cover this one, if any
    ///
    /// `www.example.com` → `*.example.com`; single-label names and IP
    /// literals have no covering wildcard.
    pub fn wildcard_parent(&self) -> Option<DomainName> {
        if self.is_ip() || self.is_wildcard() {
            return None;
        }
        let (_, rest) = self.0.split_once('.')?;
        if !rest.contains('.') {
            return None;
        }
        Some(Self(format!("*.{}", rest)))
    }
}

impl fmt::Display for DomainName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for DomainName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DomainName {
    type Error = InvalidDomainName;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl TryFrom<&str> for DomainName {
    type Error = InvalidDomainName;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<DomainName> for String {
    fn from(name: DomainName) -> Self {
        name.0
    }
}
