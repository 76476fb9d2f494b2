//! ACME challenge fulfilment
//!
//! HTTP-01 tokens are kept in a shared table that the external HTTP
//! listener consults for `/.well-known/acme-challenge/<token>`. DNS-01 records
//! are delegated to a [`DnsProvider`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use super::AcmeError;

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// How long a registered token stays servable
pub const DEFAULT_CHALLENGE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
struct PendingChallenge {
    key_authorization: String,
    expires: Instant,
}

/// Pending HTTP-01 challenge responses
///
/// Cloning shares the table, so the ACME client and the HTTP listener can
/// each hold a handle.
#[derive(Debug, Clone, Default)]
pub struct Http01Challenges {
    pending: Arc<DashMap<String, PendingChallenge>>,
}

impl Http01Challenges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `key_authorization` for `token` until `ttl` elapses
    pub fn add(&self, token: &str, key_authorization: &str, ttl: Duration) {
        debug!(token = %token, "Registering HTTP-01 challenge");
        self.pending.insert(
            token.to_string(),
            PendingChallenge {
                key_authorization: key_authorization.to_string(),
                expires: Instant::now() + ttl,
            },
        );
    }

    pub fn remove(&self, token: &str) {
        if self.pending.remove(token).is_some() {
            debug!(token = %token, "Removed HTTP-01 challenge");
        }
    }

    /// Key authorization for `token`, if registered and not expired
    pub fn response(&self, token: &str) -> Option<String> {
        let found = self.pending.get(token).map(|entry| entry.clone());
        match found {
            Some(pending) if pending.expires > Instant::now() => {
                trace!(token = %token, "HTTP-01 token found");
                Some(pending.key_authorization)
            }
            Some(_) => {
                self.pending.remove(token);
                trace!(token = %token, "HTTP-01 token expired");
                None
            }
            None => {
                trace!(token = %token, "HTTP-01 token not found");
                None
            }
        }
    }

    /// Response body for a request path, if it is a pending challenge
    pub fn respond_to_path(&self, path: &str) -> Option<String> {
        Self::extract_token(path).and_then(|token| self.response(token))
    }

    /// Token part of a challenge request path
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.pending.len();
        self.pending.retain(|_, pending| pending.expires > now);
        before - self.pending.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&self) {
        let count = self.pending.len();
        self.pending.clear();
        if count > 0 {
            debug!(cleared = count, "Cleared pending HTTP-01 challenges");
        }
    }
}

/// Publishes DNS-01 TXT records
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Create or replace the TXT record at `fqdn`
    async fn set_txt(&self, fqdn: &str, value: &str) -> Result<(), AcmeError>;

    /// Remove the TXT record at `fqdn`
    async fn remove_txt(&self, fqdn: &str) -> Result<(), AcmeError>;
}

/// Name of the DNS-01 record for `domain`
///
/// Wildcard identifiers validate at the parent name.
pub fn dns01_record_name(domain: &str) -> String {
    let base = domain.strip_prefix("*.").unwrap_or(domain);
    format!("_acme-challenge.{}", base)
}
