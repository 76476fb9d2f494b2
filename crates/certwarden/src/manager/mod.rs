//! Certificate manager
//!
//! Serves certificates to TLS handshakes from an in-memory cache and keeps
//! every zone's certificate fresh in the background.
//!
//! # Architecture
//!
//! ```text
//!   TLS handshake ──► get_certificate ──► hot cache (DashMap)
//!                                              │ miss (bounded by lookup timeout)
//!                                              ▼
//!                                   zone record + cached bundle
//!
//!   zone watch ────► invalidate / warm hot cache, re-index alt names
//!   renewal loop ──► CertificateService::renew_certificate (one per zone)
//! ```
//!
//! The handshake path never issues certificates; it only ever returns a
//! certificate or [`CertError::NoCertificate`].

mod command;
mod renewal;
mod resolver;

pub use command::ManagerCommand;
pub use resolver::SniResolver;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rustls::sign::CertifiedKey;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use certwarden_common::{BackoffPolicy, DomainName};
use certwarden_config::Config;

use crate::acme::CertificateBundle;
use crate::error::{CertError, CertResult};
use crate::pki::CertificateInfo;
use crate::records::Zone;
use crate::repository::{ZoneEvent, ZoneEventKind, ZoneWatch};
use crate::service::CertificateService;

use renewal::RetryState;

/// Scheduling and lookup settings
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub lookup_timeout: Duration,
    pub unknown_capacity: usize,
    pub tick: Duration,
    pub backoff: BackoffPolicy,
    pub issue_missing: bool,
}

impl From<&Config> for ManagerSettings {
    fn from(config: &Config) -> Self {
        Self {
            lookup_timeout: config.manager.lookup_timeout(),
            unknown_capacity: config.manager.unknown_capacity,
            tick: config.renewal.tick(),
            backoff: config.renewal.backoff(),
            issue_missing: config.renewal.issue_missing,
        }
    }
}

/// A certificate ready to hand to a TLS server
#[derive(Clone)]
pub struct CachedCertificate {
    pub domain: String,
    pub key: Arc<CertifiedKey>,
    pub leaf: CertificateInfo,
    pub chain_len: usize,
}

impl CachedCertificate {
    fn from_bundle(domain: &str, bundle: &CertificateBundle) -> CertResult<Self> {
        Ok(Self {
            domain: domain.to_string(),
            key: bundle.certified_key()?,
            leaf: bundle.leaf().clone(),
            chain_len: bundle.chain_len(),
        })
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.leaf.is_valid_at(now)
    }
}

impl std::fmt::Debug for CachedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedCertificate")
            .field("domain", &self.domain)
            .field("serial", &self.leaf.serial)
            .field("not_after", &self.leaf.not_after)
            .field("chain_len", &self.chain_len)
            .finish()
    }
}

/// Handshake-facing certificate manager
///
/// Cheap to clone; clones share the cache and background tasks.
#[derive(Clone)]
pub struct CertificateManager {
    inner: Arc<Inner>,
}

struct Inner {
    service: Arc<CertificateService>,
    settings: ManagerSettings,
    /// Hot cache by zone domain
    cache: DashMap<String, CachedCertificate>,
    /// Alt name to the zone whose certificate carries it
    aliases: DashMap<String, String>,
    /// Bumped by every invalidation; a load that straddles one is not cached
    generations: DashMap<String, u64>,
    /// Handshake names with no zone, with first-seen time
    unknown: DashMap<String, DateTime<Utc>>,
    /// Zones with a renewal in progress
    in_flight: DashMap<String, ()>,
    /// Backoff state of zones whose last renewal failed
    retries: DashMap<String, RetryState>,
    cancel: CancellationToken,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CertificateManager {
    pub fn new(service: Arc<CertificateService>) -> Self {
        let settings = ManagerSettings::from(service.config());
        Self::with_settings(service, settings)
    }

    pub fn with_settings(service: Arc<CertificateService>, settings: ManagerSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                service,
                settings,
                cache: DashMap::new(),
                aliases: DashMap::new(),
                generations: DashMap::new(),
                unknown: DashMap::new(),
                in_flight: DashMap::new(),
                retries: DashMap::new(),
                cancel: CancellationToken::new(),
                started: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn service(&self) -> &Arc<CertificateService> {
        &self.inner.service
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.inner.settings
    }

    // =========================================================================
    // Handshake path
    // =========================================================================

    /// Certificate for a TLS server name
    ///
    /// Cache hits are answered without touching the store. Misses read the
    /// zone and its bundle under the lookup timeout. Absence, expiry, errors
    /// and timeouts all decline with [`CertError::NoCertificate`].
    pub async fn get_certificate(&self, server_name: &str) -> CertResult<Arc<CertifiedKey>> {
        let decline = || CertError::NoCertificate(server_name.to_string());
        let name = DomainName::parse(server_name).map_err(|_| decline())?;

        if let Some(hit) = self.cached(&name) {
            return Ok(hit);
        }

        let candidates: Vec<DomainName> = std::iter::once(name.clone())
            .chain(name.wildcard_parent())
            .collect();

        let timeout = self.inner.settings.lookup_timeout;
        let lookup = async {
            let mut any_zone = false;
            for candidate in &candidates {
                let (exists, loaded) = self.load(candidate.as_str()).await?;
                any_zone |= exists;
                if let Some(entry) = loaded {
                    return Ok::<_, CertError>((true, Some(entry)));
                }
                if exists {
                    continue;
                }
                let Some(zone) = self.alias_target(candidate).await? else {
                    continue;
                };
                let (exists, loaded) = self.load(&zone).await?;
                any_zone |= exists;
                if let Some(entry) = loaded {
                    return Ok((true, Some(entry)));
                }
            }
            Ok((any_zone, None))
        };

        match tokio::time::timeout(timeout, lookup).await {
            Ok(Ok((_, Some(entry)))) => Ok(entry.key),
            Ok(Ok((zone_exists, None))) => {
                if !zone_exists {
                    self.note_unknown(&name);
                }
                debug!(server_name = %name, zone_exists = zone_exists, "No certificate for server name");
                Err(decline())
            }
            Ok(Err(e)) => {
                warn!(server_name = %name, error = %e, "Certificate lookup failed");
                Err(decline())
            }
            Err(_) => {
                warn!(server_name = %name, timeout_ms = timeout.as_millis() as u64, "Certificate lookup timed out");
                Err(decline())
            }
        }
    }

    /// Hot-cache lookup, including the covering wildcard and alt names
    pub(crate) fn cached(&self, name: &DomainName) -> Option<Arc<CertifiedKey>> {
        let now = Utc::now();
        let candidates = std::iter::once(name.clone()).chain(name.wildcard_parent());
        for candidate in candidates {
            let alias = self
                .inner
                .aliases
                .get(candidate.as_str())
                .map(|zone| zone.value().clone());
            let keys = std::iter::once(candidate.as_str().to_string()).chain(alias);
            for key in keys {
                let hit = self
                    .inner
                    .cache
                    .get(&key)
                    .map(|entry| (entry.is_valid_at(now), entry.key.clone()));
                match hit {
                    Some((true, certified)) => {
                        trace!(server_name = %name, zone = %key, "Certificate cache hit");
                        return Some(certified);
                    }
                    Some((false, _)) => {
                        debug!(zone = %key, "Evicting expired certificate");
                        self.inner.cache.remove(&key);
                    }
                    None => {}
                }
            }
        }
        None
    }

    /// Zone that lists `name` among its alt names
    ///
    /// A running manager trusts its index, which the watch keeps current.
    /// Otherwise the zones are scanned and the match is indexed.
    async fn alias_target(&self, name: &DomainName) -> CertResult<Option<String>> {
        if let Some(zone) = self.inner.aliases.get(name.as_str()) {
            return Ok(Some(zone.value().clone()));
        }
        if self.is_running() {
            return Ok(None);
        }

        let zones = self.inner.service.zones().await?;
        let found = zones
            .into_iter()
            .find(|zone| zone.alt_names.iter().any(|alt| alt.eq_ignore_ascii_case(name.as_str())));
        Ok(found.map(|zone| {
            self.index_aliases(&zone);
            zone.zone
        }))
    }

    /// Point every alt name of `zone` at it, replacing its previous set
    fn index_aliases(&self, zone: &Zone) {
        self.drop_aliases(&zone.zone);
        for alt in &zone.alt_names {
            let Ok(alt) = DomainName::parse(alt) else {
                continue;
            };
            if alt.as_str() == zone.zone {
                continue;
            }
            self.inner.unknown.remove(alt.as_str());
            self.inner.aliases.insert(alt.into_string(), zone.zone.clone());
        }
    }

    fn drop_aliases(&self, domain: &str) {
        self.inner.aliases.retain(|_, zone| zone.as_str() != domain);
    }

    fn generation(&self, domain: &str) -> u64 {
        self.inner.generations.get(domain).map(|g| *g).unwrap_or(0)
    }

    /// Load a zone's bundle into the hot cache
    ///
    /// Returns whether the zone exists and the usable certificate, if any.
    async fn load(&self, domain: &str) -> CertResult<(bool, Option<CachedCertificate>)> {
        let service = &self.inner.service;
        let generation = self.generation(domain);
        let Some(zone) = service.repository().find_zone(domain).await? else {
            return Ok((false, None));
        };
        self.index_aliases(&zone);
        if !zone.has_certificate() {
            return Ok((true, None));
        }

        let Some(bytes) = service.cache().get(&zone.certificate).await? else {
            warn!(domain = %domain, "Zone references a missing certificate bundle");
            return Ok((true, None));
        };
        let bundle = CertificateBundle::parse(bytes)?;
        let entry = CachedCertificate::from_bundle(domain, &bundle)?;
        if !entry.is_valid_at(Utc::now()) {
            debug!(domain = %domain, not_after = %entry.leaf.not_after, "Stored certificate is not valid now");
            return Ok((true, None));
        }

        self.inner.unknown.remove(domain);
        if self.generation(domain) != generation {
            debug!(domain = %domain, "Certificate invalidated during load, not caching");
            return Ok((true, Some(entry)));
        }
        self.inner.cache.insert(domain.to_string(), entry.clone());
        debug!(domain = %domain, serial = %entry.leaf.serial, "Loaded certificate into cache");
        Ok((true, Some(entry)))
    }

    fn note_unknown(&self, name: &DomainName) {
        let unknown = &self.inner.unknown;
        if unknown.contains_key(name.as_str()) {
            return;
        }
        if unknown.len() >= self.inner.settings.unknown_capacity {
            trace!(server_name = %name, "Unknown name table full");
            return;
        }
        unknown.insert(name.to_string(), Utc::now());
    }

    /// Drop `domain` from the hot cache so the next lookup reloads it
    pub fn invalidate_cache(&self, domain: &str) {
        let key = DomainName::parse(domain)
            .map(DomainName::into_string)
            .unwrap_or_else(|_| domain.to_string());
        *self.inner.generations.entry(key.clone()).or_insert(0) += 1;
        if self.inner.cache.remove(&key).is_some() {
            debug!(domain = %key, "Invalidated cached certificate");
        }
    }

    // =========================================================================
    // Status
    // =========================================================================

    /// Domains with a valid cached certificate, with the zone's last error
    pub async fn list_active(&self) -> CertResult<BTreeMap<String, Option<String>>> {
        let now = Utc::now();
        let domains: Vec<String> = self
            .inner
            .cache
            .iter()
            .filter(|entry| entry.is_valid_at(now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut active = BTreeMap::new();
        for domain in domains {
            let last_error = self
                .inner
                .service
                .repository()
                .find_zone(&domain)
                .await?
                .map(|z| z.last_error)
                .filter(|e| !e.is_empty());
            active.insert(domain, last_error);
        }
        Ok(active)
    }

    /// Issued zones and when they are next due for renewal
    ///
    /// A zone backing off after a failure reports its retry time.
    pub async fn list_renewal(&self) -> CertResult<BTreeMap<String, DateTime<Utc>>> {
        let mut due = BTreeMap::new();
        for zone in self.inner.service.zones().await? {
            if !zone.has_certificate() {
                continue;
            }
            let retry = self.inner.retries.get(&zone.zone).map(|r| r.next_attempt());
            if let Some(at) = retry.or_else(|| zone.renewal_due_at()) {
                due.insert(zone.zone.clone(), at);
            }
        }
        Ok(due)
    }

    /// Never-issued zones and unrecognised handshake names, with first-seen time
    pub async fn list_unknown(&self) -> CertResult<BTreeMap<String, DateTime<Utc>>> {
        let mut unknown: BTreeMap<String, DateTime<Utc>> = self
            .inner
            .unknown
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();

        for zone in self.inner.service.zones().await? {
            if zone.has_certificate() {
                continue;
            }
            let seen = zone.first_seen_at().unwrap_or_else(Utc::now);
            unknown.insert(zone.zone.clone(), seen);
        }
        Ok(unknown)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Warm the cache and start the watch and renewal tasks
    pub async fn start(&self) -> CertResult<()> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let zones = self.inner.service.zones().await?;
        for zone in &zones {
            self.index_aliases(zone);
        }
        let mut warmed = 0;
        for zone in zones.iter().filter(|z| z.has_certificate()) {
            match self.load(&zone.zone).await {
                Ok((_, Some(_))) => warmed += 1,
                Ok(_) => {}
                Err(e) => warn!(domain = %zone.zone, error = %e, "Failed to warm certificate"),
            }
        }

        let watch = self
            .inner
            .service
            .repository()
            .watch_zones(self.inner.cancel.clone())
            .await?;

        let watch_task = tokio::spawn(self.clone().watch_loop(watch));
        let renewal_task = tokio::spawn(renewal::run(self.clone(), self.inner.cancel.clone()));
        self.inner.tasks.lock().extend([watch_task, renewal_task]);

        info!(
            zones = zones.len(),
            warmed = warmed,
            tick_secs = self.inner.settings.tick.as_secs(),
            "Certificate manager started"
        );
        Ok(())
    }

    /// Stop background tasks and wait for them to finish
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Manager task ended abnormally");
            }
        }
        info!("Certificate manager stopped");
    }

    async fn watch_loop(self, mut watch: ZoneWatch) {
        while let Some(event) = watch.recv().await {
            self.apply_zone_event(event).await;
        }
        debug!("Zone watch loop exited");
    }

    async fn apply_zone_event(&self, event: ZoneEvent) {
        let ZoneEvent { domain, kind } = event;
        match kind {
            ZoneEventKind::Updated(zone) => {
                self.invalidate_cache(&domain);
                self.index_aliases(&zone);
                if zone.has_certificate() {
                    if let Err(e) = self.load(&domain).await {
                        warn!(domain = %domain, error = %e, "Failed to reload updated zone");
                    }
                }
            }
            ZoneEventKind::Deleted => {
                self.invalidate_cache(&domain);
                self.drop_aliases(&domain);
                self.inner.retries.remove(&domain);
                self.inner.unknown.remove(&domain);
                debug!(domain = %domain, "Zone deleted");
            }
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst) && !self.inner.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for CertificateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateManager")
            .field("cached", &self.inner.cache.len())
            .field("unknown", &self.inner.unknown.len())
            .field("in_flight", &self.inner.in_flight.len())
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::{AcmeCertificate, AcmeError, AcmeProvider, RegisteredAccount};
    use crate::records::{AcmeAccount, IssuanceMode};
    use crate::repository::CertificateRepository;
    use async_trait::async_trait;
    use certwarden_config::ChallengeKind;
    use certwarden_store::MemoryDataStore;

    struct NoAcme;

    #[async_trait]
    impl AcmeProvider for NoAcme {
        async fn register(&self, _email: &str) -> Result<RegisteredAccount, AcmeError> {
            Err(AcmeError::Protocol("offline".to_string()))
        }

        async fn order(
            &self,
            _account: &AcmeAccount,
            _domains: &[String],
            _challenge: ChallengeKind,
        ) -> Result<AcmeCertificate, AcmeError> {
            Err(AcmeError::Protocol("offline".to_string()))
        }
    }

    fn manager() -> CertificateManager {
        let repo = CertificateRepository::new(Arc::new(MemoryDataStore::new()));
        let service = CertificateService::new(repo, Arc::new(NoAcme), Arc::new(Config::default()));
        CertificateManager::new(Arc::new(service))
    }

    #[tokio::test]
    async fn test_unknown_name_declined_and_remembered() {
        let manager = manager();
        let err = manager.get_certificate("nobody.test").await.unwrap_err();
        assert!(matches!(err, CertError::NoCertificate(_)));

        let unknown = manager.list_unknown().await.unwrap();
        assert!(unknown.contains_key("nobody.test"));
    }

    #[tokio::test]
    async fn test_invalid_server_name_declined() {
        let manager = manager();
        let err = manager.get_certificate("bad..name").await.unwrap_err();
        assert!(matches!(err, CertError::NoCertificate(_)));
    }

    #[tokio::test]
    async fn test_issued_zone_served_and_listed() {
        let manager = manager();
        let service = manager.service().clone();
        service.add_zone("a.test", IssuanceMode::SelfSigned, None).await.unwrap();
        service.issue_certificate("a.test").await.unwrap();

        let key = manager.get_certificate("A.TEST").await.unwrap();
        assert_eq!(key.cert.len(), 3);

        let active = manager.list_active().await.unwrap();
        assert_eq!(active.get("a.test"), Some(&None));

        let renewal = manager.list_renewal().await.unwrap();
        assert!(renewal.contains_key("a.test"));
        assert!(manager.list_unknown().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_wildcard_zone_covers_subdomain() {
        let manager = manager();
        let service = manager.service().clone();
        service.add_zone("*.a.test", IssuanceMode::SelfSigned, None).await.unwrap();
        service.issue_certificate("*.a.test").await.unwrap();

        assert!(manager.get_certificate("www.a.test").await.is_ok());
        assert!(manager.get_certificate("a.test").await.is_err());
    }

    #[tokio::test]
    async fn test_alt_name_served_from_zone_certificate() {
        let manager = manager();
        let service = manager.service().clone();
        let mut zone = service.add_zone("a.test", IssuanceMode::SelfSigned, None).await.unwrap();
        zone.alt_names = vec!["www.a.test".to_string()];
        service.repository().save_zone(&zone).await.unwrap();
        service.issue_certificate("a.test").await.unwrap();

        let key = manager.get_certificate("WWW.a.test").await.unwrap();
        let leaf = CertificateInfo::from_der(key.cert[0].as_ref()).unwrap();
        assert!(leaf.dns_names.contains(&"www.a.test".to_string()));

        let name = DomainName::parse("www.a.test").unwrap();
        assert!(manager.cached(&name).is_some());
        assert!(manager.list_unknown().await.unwrap().is_empty());
        assert!(manager.list_active().await.unwrap().contains_key("a.test"));
    }

    #[tokio::test]
    async fn test_alt_name_forgets_earlier_unknown_entry() {
        let manager = manager();
        let service = manager.service().clone();
        assert!(manager.get_certificate("api.b.test").await.is_err());
        assert!(manager.list_unknown().await.unwrap().contains_key("api.b.test"));

        let mut zone = service.add_zone("b.test", IssuanceMode::SelfSigned, None).await.unwrap();
        zone.alt_names = vec!["api.b.test".to_string()];
        service.repository().save_zone(&zone).await.unwrap();
        service.issue_certificate("b.test").await.unwrap();

        assert!(manager.get_certificate("api.b.test").await.is_ok());
        assert!(!manager.list_unknown().await.unwrap().contains_key("api.b.test"));
    }

    #[tokio::test]
    async fn test_invalidate_bumps_generation() {
        let manager = manager();
        assert_eq!(manager.generation("a.test"), 0);
        manager.invalidate_cache("A.test");
        manager.invalidate_cache("a.test");
        assert_eq!(manager.generation("a.test"), 2);
    }

    #[tokio::test]
    async fn test_unknown_capacity_bounded() {
        let repo = CertificateRepository::new(Arc::new(MemoryDataStore::new()));
        let service = Arc::new(CertificateService::new(
            repo,
            Arc::new(NoAcme),
            Arc::new(Config::default()),
        ));
        let mut settings = ManagerSettings::from(service.config());
        settings.unknown_capacity = 2;
        let manager = CertificateManager::with_settings(service, settings);

        for name in ["a.test", "b.test", "c.test"] {
            let _ = manager.get_certificate(name).await;
        }
        assert_eq!(manager.list_unknown().await.unwrap().len(), 2);
    }
}
