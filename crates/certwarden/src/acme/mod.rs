//! ACME certificate issuance
//!
//! # Components
//!
//! - [`AcmeProvider`]: account registration and the order flow
//! - [`InstantAcmeProvider`]: `instant-acme` implementation of the provider
//! - [`Http01Challenges`]: token table for `/.well-known/acme-challenge/`
//! - [`DnsProvider`]: TXT record publisher for dns-01
//! - [`CertificateCache`]: bundle storage shared with the certificate manager

mod cache;
mod challenge;
mod client;
mod error;

pub use cache::{CertificateBundle, CertificateCache, RepositoryCache};
pub use challenge::{
    dns01_record_name, DnsProvider, Http01Challenges, ACME_CHALLENGE_PREFIX, DEFAULT_CHALLENGE_TTL,
};
pub use client::{AcmeCertificate, AcmeProvider, InstantAcmeProvider, RegisteredAccount};
pub use error::AcmeError;
