use thiserror::Error;

/// Errors raised while creating or loading certificates.
#[derive(Debug, Error)]
pub enum PkiError {
    #[error("failed to generate key: {0}")]
    KeyGeneration(String),

    #[error("failed to sign certificate: {0}")]
    Signing(String),

    /// Issuer cannot sign: not a CA
    #[error("issuer '{0}' is not a certificate authority")]
    NotCa(String),

    /// Issuer cannot sign: outside its validity window
    #[error("issuer '{0}' is not valid at this time")]
    Expired(String),

    #[error("certificate needs at least one DNS name or IP address")]
    NoIdentities,

    #[error("invalid subject alternative name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("signer '{0}' does not exist")]
    UnknownSigner(String),

    #[error("signer chain of '{0}' contains a cycle")]
    SignerCycle(String),

    /// Stored certificate does not chain to its recorded parent
    #[error("signer '{name}' was not issued by '{parent}'")]
    ChainMismatch { name: String, parent: String },

    #[error("{0}")]
    Encoding(String),
}

impl From<rcgen::Error> for PkiError {
    fn from(err: rcgen::Error) -> Self {
        PkiError::Signing(err.to_string())
    }
}
