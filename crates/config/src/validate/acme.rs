//! ACME and signer validation
//!
//! Checks the directory URL and the relationship between signer validity
//! periods.

use url::Url;

use super::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};
use crate::Config;

/// Validate ACME settings
pub fn validate_acme(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();

    let directory = config.acme.directory();
    match Url::parse(directory) {
        Ok(url) if url.scheme() == "https" => {}
        Ok(url) if url.scheme() == "http" => {
            result.add_warning(ValidationWarning::new(format!(
                "ACME directory '{}' is not served over HTTPS",
                url
            )));
        }
        Ok(url) => {
            result.add_error(ValidationError::new(
                ErrorCategory::Acme,
                format!("ACME directory '{}' has unsupported scheme", url),
            ));
        }
        Err(e) => {
            result.add_error(ValidationError::new(
                ErrorCategory::Acme,
                format!("ACME directory '{}' is not a valid URL: {}", directory, e),
            ));
        }
    }

    if config.acme.directory_url.is_some() && config.acme.staging {
        result.add_warning(ValidationWarning::new(
            "acme.staging is ignored because acme.directory_url is set",
        ));
    }

    result
}

/// Validate self-signed signer settings
pub fn validate_self_signed(config: &Config) -> ValidationResult {
    let mut result = ValidationResult::new();
    let pki = &config.self_signed;

    if pki.signer.contains('/') {
        result.add_error(ValidationError::new(
            ErrorCategory::Pki,
            format!("Signer name '{}' must not contain '/'", pki.signer),
        ));
    }

    if pki.intermediate_validity_days > pki.root_validity_days {
        result.add_warning(ValidationWarning::new(format!(
            "Intermediate validity ({} days) exceeds root validity ({} days) and will be clamped",
            pki.intermediate_validity_days, pki.root_validity_days
        )));
    }

    if pki.server_validity_days > pki.intermediate_validity_days {
        result.add_warning(ValidationWarning::new(format!(
            "Server validity ({} days) exceeds intermediate validity ({} days) and will be clamped",
            pki.server_validity_days, pki.intermediate_validity_days
        )));
    }

    if config.renewal.initial_backoff_secs > config.renewal.max_backoff_secs {
        result.add_error(ValidationError::new(
            ErrorCategory::Renewal,
            format!(
                "initial_backoff_secs ({}) exceeds max_backoff_secs ({})",
                config.renewal.initial_backoff_secs, config.renewal.max_backoff_secs
            ),
        ));
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_directory_url() {
        let mut config = Config::default();
        config.acme.directory_url = Some("not a url".to_string());
        assert!(!validate_acme(&config).is_ok());

        config.acme.directory_url = Some("ftp://acme.test/dir".to_string());
        assert!(!validate_acme(&config).is_ok());

        config.acme.directory_url = Some("http://localhost:14000/dir".to_string());
        let result = validate_acme(&config);
        assert!(result.is_ok());
        assert_eq!(result.warnings.len(), 1);
    }

    #[test]
    fn test_backoff_order() {
        let mut config = Config::default();
        config.renewal.initial_backoff_secs = 7200;
        config.renewal.max_backoff_secs = 60;
        assert!(!validate_self_signed(&config).is_ok());
    }

    #[test]
    fn test_signer_name_with_slash() {
        let mut config = Config::default();
        config.self_signed.signer = "corp/ca".to_string();
        assert!(!validate_self_signed(&config).is_ok());
    }
}
