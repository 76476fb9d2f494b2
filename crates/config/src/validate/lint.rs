//! Configuration linting for best practices
//!
//! Checks configuration for settings that work but are likely mistakes.

use super::{ValidationResult, ValidationWarning};
use crate::{Config, ZoneMode};

/// Lint configuration for best practices
pub fn lint_config(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    // A renewal window this late leaves little room for retries
    if config.renewal.fraction > 0.9 {
        result.add_warning(ValidationWarning::new(format!(
            "renewal.fraction {} leaves less than 10% of the lifetime for retries",
            config.renewal.fraction
        )));
    }

    if config.renewal.max_backoff_secs < config.renewal.tick_secs {
        result.add_warning(ValidationWarning::new(format!(
            "renewal.max_backoff_secs ({}) is shorter than tick_secs ({}); retries happen once per tick",
            config.renewal.max_backoff_secs, config.renewal.tick_secs
        )));
    }

    let has_acme_zone = config.zones.iter().any(|z| z.mode == ZoneMode::Acme);
    if has_acme_zone && !config.acme.accept_tos {
        result.add_warning(ValidationWarning::new(
            "ACME zones are configured but acme.accept_tos is false; registration will be refused",
        ));
    }

    if has_acme_zone && config.acme.staging {
        result.add_warning(ValidationWarning::new(
            "ACME staging directory is in use; issued certificates are not publicly trusted",
        ));
    }

    if config.manager.lookup_timeout_ms > 1000 {
        result.add_warning(ValidationWarning::new(format!(
            "manager.lookup_timeout_ms ({}) may stall TLS handshakes on a slow store",
            config.manager.lookup_timeout_ms
        )));
    }

    result
}
