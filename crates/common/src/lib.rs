//! Common utilities shared by the Certwarden crates.
//!
//! - [`BackoffPolicy`] / [`Backoff`]: bounded exponential retry delays used by
//!   the renewal loop and by store watch resubscription
//! - [`DomainName`]: normalised TLS server names used as cache and zone keys

pub mod backoff;
pub mod domain;

pub use backoff::{Backoff, BackoffPolicy};
pub use domain::{DomainName, InvalidDomainName};
