//! Zone validation
//!
//! Validates zone names, duplicates and mode-specific fields.

use std::collections::HashSet;
use std::net::IpAddr;

use certwarden_common::DomainName;

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::{Config, ZoneMode};

/// Validate seeded zones
pub fn validate_zones(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let mut seen = HashSet::new();

    for zone in &config.zones {
        let domain = match DomainName::parse(&zone.domain) {
            Ok(domain) => domain,
            Err(e) => {
                result.add_error(ValidationError::new(ErrorCategory::Zone, e.to_string()));
                continue;
            }
        };

        if !seen.insert(domain.clone()) {
            result.add_error(ValidationError::new(
                ErrorCategory::Zone,
                format!("Zone '{}' is defined more than once", domain),
            ));
        }

        for alt in &zone.alt_names {
            if let Err(e) = DomainName::parse(alt) {
                result.add_error(ValidationError::new(
                    ErrorCategory::Zone,
                    format!("Zone '{}' alt name: {}", domain, e),
                ));
            }
        }

        for ip in &zone.ip_addresses {
            if ip.parse::<IpAddr>().is_err() {
                result.add_error(ValidationError::new(
                    ErrorCategory::Zone,
                    format!("Zone '{}' has invalid IP address '{}'", domain, ip),
                ));
            }
        }

        match zone.mode {
            ZoneMode::Acme => {
                if zone.email.is_none() && config.acme.email.is_none() {
                    result.add_error(ValidationError::new(
                        ErrorCategory::Zone,
                        format!(
                            "ACME zone '{}' has no email and [acme].email is not set",
                            domain
                        ),
                    ));
                }
                if domain.is_ip() {
                    result.add_error(ValidationError::new(
                        ErrorCategory::Zone,
                        format!("ACME zone '{}' cannot be an IP address", domain),
                    ));
                }
                if !zone.ip_addresses.is_empty() {
                    result.add_warning(ValidationWarning::new(format!(
                        "ACME zone '{}' lists ip_addresses, which are only used in self-signed mode",
                        domain
                    )));
                }
                if domain.is_wildcard()
                    && zone.challenge != Some(crate::ChallengeKind::Dns01)
                    && config.acme.challenge != crate::ChallengeKind::Dns01
                {
                    result.add_error(ValidationError::new(
                        ErrorCategory::Zone,
                        format!("Wildcard zone '{}' requires the dns-01 challenge", domain),
                    ));
                }
            }
            ZoneMode::SelfSigned => {
                if zone.email.is_some() || zone.challenge.is_some() {
                    result.add_warning(ValidationWarning::new(format!(
                        "Self-signed zone '{}' sets ACME-only fields",
                        domain
                    )));
                }
            }
        }
    }

    result
}
