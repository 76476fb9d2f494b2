//! Certificate repository
//!
//! Typed access to signers, ACME accounts, zones and cached certificate
//! bundles on top of a pluggable [`DataStore`]. Each record type lives in its
//! own key namespace:
//!
//! ```text
//! signer/<name>      SelfSigner
//! account/<email>    AcmeAccount
//! zone/<domain>      Zone
//! cache/<name>       PEM certificate bundle
//! ```
//!
//! Every save is a single `put`, so a record is either fully visible or not
//! at all.

mod watch;

pub use watch::{ZoneEvent, ZoneEventKind, ZoneWatch};

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use prost::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use certwarden_common::BackoffPolicy;
use certwarden_store::DataStore;

use crate::error::{CertError, CertResult};
use crate::records::{self, AcmeAccount, SelfSigner, Zone};

pub const SIGNER_PREFIX: &str = "signer/";
pub const ACCOUNT_PREFIX: &str = "account/";
pub const ZONE_PREFIX: &str = "zone/";
pub const CACHE_PREFIX: &str = "cache/";

/// Typed record access over a swappable data store
#[derive(Clone)]
pub struct CertificateRepository {
    inner: Arc<Inner>,
}

struct Inner {
    backend: RwLock<Arc<dyn DataStore>>,
    resubscribe: BackoffPolicy,
}

impl CertificateRepository {
    pub fn new(backend: Arc<dyn DataStore>) -> Self {
        Self::with_resubscribe_policy(
            backend,
            BackoffPolicy::new(
                std::time::Duration::from_millis(100),
                std::time::Duration::from_secs(30),
            ),
        )
    }

    /// Repository whose zone watches resubscribe with `policy`
    pub fn with_resubscribe_policy(backend: Arc<dyn DataStore>, policy: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend: RwLock::new(backend),
                resubscribe: policy,
            }),
        }
    }

    /// Current data store
    pub fn backend(&self) -> Arc<dyn DataStore> {
        self.inner.backend.read().clone()
    }

    /// Replace the data store; existing watches move over on their next resubscribe
    pub fn set_backend(&self, backend: Arc<dyn DataStore>) {
        info!(backend = %backend.name(), "Switching repository backend");
        *self.inner.backend.write() = backend;
    }

    // =========================================================================
    // Self signers
    // =========================================================================

    pub async fn save_self_signer(&self, signer: &SelfSigner) -> CertResult<()> {
        self.save(SIGNER_PREFIX, &signer.name, signer).await
    }

    pub async fn find_self_signer(&self, name: &str) -> CertResult<Option<SelfSigner>> {
        self.find(SIGNER_PREFIX, name).await
    }

    /// Visit signers whose name starts with `prefix`; stop when `visit` returns false
    pub async fn list_self_signers<F>(&self, prefix: &str, visit: F) -> CertResult<()>
    where
        F: FnMut(SelfSigner) -> bool + Send,
    {
        self.list(SIGNER_PREFIX, prefix, visit).await
    }

    pub async fn delete_self_signer(&self, name: &str) -> CertResult<()> {
        self.delete(SIGNER_PREFIX, name).await
    }

    pub async fn all_self_signers(&self) -> CertResult<Vec<SelfSigner>> {
        let mut signers = Vec::new();
        self.list_self_signers("", |s| {
            signers.push(s);
            true
        })
        .await?;
        Ok(signers)
    }

    // =========================================================================
    // ACME accounts
    // =========================================================================

    pub async fn save_acme_account(&self, account: &AcmeAccount) -> CertResult<()> {
        self.save(ACCOUNT_PREFIX, &account.email, account).await
    }

    pub async fn find_acme_account(&self, email: &str) -> CertResult<Option<AcmeAccount>> {
        self.find(ACCOUNT_PREFIX, email).await
    }

    pub async fn list_acme_accounts<F>(&self, prefix: &str, visit: F) -> CertResult<()>
    where
        F: FnMut(AcmeAccount) -> bool + Send,
    {
        self.list(ACCOUNT_PREFIX, prefix, visit).await
    }

    pub async fn delete_acme_account(&self, email: &str) -> CertResult<()> {
        self.delete(ACCOUNT_PREFIX, email).await
    }

    // =========================================================================
    // Zones
    // =========================================================================

    pub async fn save_zone(&self, zone: &Zone) -> CertResult<()> {
        self.save(ZONE_PREFIX, &zone.zone, zone).await
    }

    pub async fn find_zone(&self, domain: &str) -> CertResult<Option<Zone>> {
        self.find(ZONE_PREFIX, domain).await
    }

    pub async fn list_zones<F>(&self, prefix: &str, visit: F) -> CertResult<()>
    where
        F: FnMut(Zone) -> bool + Send,
    {
        self.list(ZONE_PREFIX, prefix, visit).await
    }

    pub async fn delete_zone(&self, domain: &str) -> CertResult<()> {
        self.delete(ZONE_PREFIX, domain).await
    }

    pub async fn all_zones(&self) -> CertResult<Vec<Zone>> {
        let mut zones = Vec::new();
        self.list_zones("", |z| {
            zones.push(z);
            true
        })
        .await?;
        Ok(zones)
    }

    /// Stream zone changes until `cancel` fires or the watch is dropped
    pub async fn watch_zones(&self, cancel: CancellationToken) -> CertResult<ZoneWatch> {
        let stream = self.backend().watch(ZONE_PREFIX).await?;
        let known = self.all_zones().await?.into_iter().map(|z| z.zone).collect();
        Ok(watch::spawn(
            self.clone(),
            stream,
            known,
            cancel,
            self.inner.resubscribe.clone(),
        ))
    }

    // =========================================================================
    // Certificate cache
    // =========================================================================

    pub async fn get_cached(&self, name: &str) -> CertResult<Option<Bytes>> {
        let key = key(CACHE_PREFIX, name)?;
        Ok(self.backend().get(&key).await?)
    }

    pub async fn put_cached(&self, name: &str, value: Bytes) -> CertResult<()> {
        let key = key(CACHE_PREFIX, name)?;
        trace!(key = %key, bytes = value.len(), "Writing cache entry");
        Ok(self.backend().put(&key, value).await?)
    }

    pub async fn delete_cached(&self, name: &str) -> CertResult<()> {
        let key = key(CACHE_PREFIX, name)?;
        Ok(self.backend().delete(&key).await?)
    }

    // =========================================================================
    // Generic record access
    // =========================================================================

    async fn save<M: Message>(&self, prefix: &str, id: &str, record: &M) -> CertResult<()> {
        let key = key(prefix, id)?;
        self.backend().put(&key, records::encode(record)).await?;
        debug!(key = %key, "Saved record");
        Ok(())
    }

    async fn find<M: Message + Default>(&self, prefix: &str, id: &str) -> CertResult<Option<M>> {
        let key = key(prefix, id)?;
        match self.backend().get(&key).await? {
            Some(bytes) => Ok(Some(records::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list<M, F>(&self, namespace: &str, prefix: &str, mut visit: F) -> CertResult<()>
    where
        M: Message + Default,
        F: FnMut(M) -> bool + Send,
    {
        let entries = self.backend().scan(&format!("{}{}", namespace, prefix)).await?;
        for (_, bytes) in entries {
            let record = records::decode(&bytes)?;
            if !visit(record) {
                break;
            }
        }
        Ok(())
    }

    async fn delete(&self, prefix: &str, id: &str) -> CertResult<()> {
        let key = key(prefix, id)?;
        self.backend().delete(&key).await?;
        debug!(key = %key, "Deleted record");
        Ok(())
    }
}

impl fmt::Debug for CertificateRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateRepository")
            .field("backend", &self.backend().name())
            .finish()
    }
}

fn key(prefix: &str, id: &str) -> CertResult<String> {
    if id.is_empty() {
        return Err(CertError::Command(format!(
            "empty record name in namespace '{}'",
            prefix.trim_end_matches('/')
        )));
    }
    Ok(format!("{}{}", prefix, id))
}
