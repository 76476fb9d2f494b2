//! Error types for the certificate lifecycle manager.

use std::time::Duration;

use certwarden_config::ConfigError;
use certwarden_store::StoreError;
use thiserror::Error;

use crate::acme::AcmeError;
use crate::pki::PkiError;

/// Result type for certificate operations.
pub type CertResult<T> = Result<T, CertError>;

/// Errors surfaced by the repository, issuer, service and manager.
#[derive(Debug, Error)]
pub enum CertError {
    /// Record absent
    #[error("{kind} '{key}' not found")]
    NotFound { kind: &'static str, key: String },

    /// Backend I/O failure
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// Chain or CA precondition violated
    #[error("issuance failed: {0}")]
    Issuance(String),

    /// ACME challenge could not be fulfilled or was rejected
    #[error("challenge failed: {0}")]
    Challenge(String),

    /// Certificate, key, record or PKCS#12 serialization failure
    #[error("encoding error: {0}")]
    Encoding(String),

    /// No usable certificate for a handshake; decline the connection
    #[error("no certificate available for '{0}'")]
    NoCertificate(String),

    /// ACME protocol failure other than a challenge
    #[error("ACME error: {0}")]
    Acme(String),

    /// Operation exceeded its time bound
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Malformed operator command
    #[error("{0}")]
    Command(String),
}

impl CertError {
    pub(crate) fn not_found(kind: &'static str, key: impl Into<String>) -> Self {
        CertError::NotFound {
            kind,
            key: key.into(),
        }
    }

    /// Whether retrying later may succeed
    ///
    /// Storage, challenge, protocol and timeout failures are transient;
    /// precondition and encoding failures are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CertError::Storage(_)
                | CertError::Challenge(_)
                | CertError::Acme(_)
                | CertError::Timeout(_)
        )
    }
}

impl From<PkiError> for CertError {
    fn from(err: PkiError) -> Self {
        match err {
            PkiError::Encoding(msg) => CertError::Encoding(msg),
            other => CertError::Issuance(other.to_string()),
        }
    }
}

impl From<AcmeError> for CertError {
    fn from(err: AcmeError) -> Self {
        match err {
            AcmeError::Challenge(msg) => CertError::Challenge(msg),
            AcmeError::Timeout(after) => CertError::Timeout(after),
            AcmeError::Certificate(msg) => CertError::Encoding(msg),
            AcmeError::Storage(e) => CertError::Storage(e),
            other => CertError::Acme(other.to_string()),
        }
    }
}

impl From<prost::DecodeError> for CertError {
    fn from(err: prost::DecodeError) -> Self {
        CertError::Encoding(format!("failed to decode record: {}", err))
    }
}
