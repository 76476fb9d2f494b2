//! Private PKI
//!
//! Root and intermediate certificate authorities, server and client leaves,
//! and PKCS#12 packaging. Every key is ECDSA P-256 signed with SHA-256 and
//! every serial is a random positive 128-bit integer.
//!
//! # Architecture
//!
//! ```text
//! SelfSigner records ──► IssuerArena ──► CertificateIssuer ──► IssuedCertificate
//!                                              │
//!                                              └──► CertificateIssuer (intermediate)
//! ```

mod arena;
mod desc;
mod error;
mod issued;
mod issuer;

pub use arena::IssuerArena;
pub use desc::{local_ip_addresses, CertificateDesc};
pub use error::PkiError;
pub use issued::{CertificateInfo, IssuedCertificate};
pub use issuer::{CertificateIssuer, ClientCertificate, IssuancePolicy};
