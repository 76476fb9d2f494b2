//! Certwarden Library
//!
//! On-demand TLS certificates for a fleet of domains, issued either by an
//! ACME certificate authority or by an internal self-signed CA hierarchy.
//!
//! - **Repository**: signers, ACME accounts, zones and certificate bundles
//!   kept in a pluggable key-value store, with a zone change watch
//! - **PKI**: root and intermediate CAs, server certificates and PKCS#12
//!   client certificates
//! - **ACME**: account registration and the order flow over HTTP-01 or DNS-01
//! - **Service**: issuance, renewal and operator commands
//! - **Manager**: handshake-path lookups, cache invalidation and the
//!   background renewal loop
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use certwarden::{CertificateManager, CertificateRepository, CertificateService};
//! use certwarden::acme::{Http01Challenges, InstantAcmeProvider};
//! use certwarden_store::MemoryDataStore;
//!
//! let config = Arc::new(certwarden_config::Config::default());
//! let repo = CertificateRepository::new(Arc::new(MemoryDataStore::new()));
//! let acme = InstantAcmeProvider::new(&config.acme, Http01Challenges::new());
//! let service = Arc::new(CertificateService::new(repo, Arc::new(acme), config));
//!
//! let manager = CertificateManager::new(service);
//! manager.start().await?;
//! let key = manager.get_certificate("www.example.com").await?;
//! ```

// ============================================================================
// Module Declarations
// ============================================================================

pub mod acme;
pub mod error;
pub mod manager;
pub mod pki;
pub mod records;
pub mod repository;
pub mod service;

// ============================================================================
// Public API Re-exports
// ============================================================================

// Errors
pub use error::{CertError, CertResult};

// Persisted records
pub use records::{AcmeAccount, AcmeRegistration, IssuanceMode, SelfSigner, Zone};

// Storage
pub use repository::{CertificateRepository, ZoneEvent, ZoneEventKind, ZoneWatch};

// Issuance
pub use service::{CertificateService, RenewalOutcome, ServiceCommand};

// Handshake path
pub use manager::{CachedCertificate, CertificateManager, ManagerCommand, ManagerSettings, SniResolver};
