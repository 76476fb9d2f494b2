//! ACME error types

use std::time::Duration;

use certwarden_store::StoreError;
use thiserror::Error;

/// Errors raised by the ACME adapter
#[derive(Debug, Error)]
pub enum AcmeError {
    /// The CA rejected a request or returned something unexpected
    #[error("ACME protocol error: {0}")]
    Protocol(String),

    /// A challenge could not be provisioned or failed validation
    #[error("challenge failed: {0}")]
    Challenge(String),

    /// CSR, key or downloaded certificate could not be processed
    #[error("certificate error: {0}")]
    Certificate(String),

    /// Registration refused because the terms of service were not accepted
    #[error("ACME terms of service must be accepted to register '{0}'")]
    TermsNotAccepted(String),

    /// Stored account credentials are unusable
    #[error("invalid account credentials for '{email}': {reason}")]
    Credentials { email: String, reason: String },

    #[error("ACME order timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}

impl From<instant_acme::Error> for AcmeError {
    fn from(err: instant_acme::Error) -> Self {
        AcmeError::Protocol(err.to_string())
    }
}
