//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use certwarden::acme::{AcmeCertificate, AcmeError, AcmeProvider, RegisteredAccount};
use certwarden::pki::{CertificateIssuer, IssuancePolicy};
use certwarden::{
    AcmeAccount, AcmeRegistration, CertificateManager, CertificateRepository, CertificateService,
    ManagerSettings,
};
use certwarden_common::BackoffPolicy;
use certwarden_config::{ChallengeKind, Config};
use certwarden_store::{DataStore, MemoryDataStore, StoreError, WatchStream};

/// ACME provider that signs orders with its own private CA
pub struct FakeAcme {
    pub registrations: AtomicUsize,
    pub orders: AtomicUsize,
    pub fail: AtomicBool,
    ca: CertificateIssuer,
}

impl FakeAcme {
    pub fn new() -> Self {
        Self {
            registrations: AtomicUsize::new(0),
            orders: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            ca: CertificateIssuer::create_root("fake-acme", "Fake ACME CA", Arc::new(IssuancePolicy::default()))
                .unwrap(),
        }
    }
}

#[async_trait]
impl AcmeProvider for FakeAcme {
    async fn register(&self, email: &str) -> Result<RegisteredAccount, AcmeError> {
        let n = self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(RegisteredAccount {
            registration: AcmeRegistration {
                status: "valid".to_string(),
                contact: vec![format!("mailto:{}", email)],
                terms_of_service_agreed: true,
                orders: String::new(),
                uri: format!("https://acme.test/acct/{}", n + 1),
            },
            credentials: b"{}".to_vec(),
        })
    }

    async fn order(
        &self,
        _account: &AcmeAccount,
        domains: &[String],
        _challenge: ChallengeKind,
    ) -> Result<AcmeCertificate, AcmeError> {
        self.orders.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(AcmeError::Challenge("validation failed".to_string()));
        }
        let leaf = self
            .ca
            .issue_server_cert(&domains[0], domains, &[])
            .map_err(|e| AcmeError::Certificate(e.to_string()))?;
        Ok(AcmeCertificate {
            key_pem: leaf.key_pem().to_string(),
            chain_pem: self.ca.chain_pem(&leaf),
        })
    }
}

/// Memory store whose reads can be made slow
pub struct SlowStore {
    inner: MemoryDataStore,
    slow: AtomicBool,
    delay: Duration,
}

impl SlowStore {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryDataStore::new(),
            slow: AtomicBool::new(false),
            delay,
        }
    }

    pub fn set_slow(&self, slow: bool) {
        self.slow.store(slow, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataStore for SlowStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        if self.slow.load(Ordering::SeqCst) {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Bytes)>, StoreError> {
        self.inner.scan(prefix).await
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        self.inner.watch(prefix).await
    }
}

pub fn acme_config() -> Config {
    let mut config = Config::default();
    config.acme.email = Some("ops@example.test".to_string());
    config
}

pub fn service_with(store: Arc<dyn DataStore>, acme: Arc<FakeAcme>, config: Config) -> Arc<CertificateService> {
    let repo = CertificateRepository::new(store);
    Arc::new(CertificateService::new(repo, acme, Arc::new(config)))
}

pub fn service(acme: Arc<FakeAcme>) -> Arc<CertificateService> {
    service_with(Arc::new(MemoryDataStore::new()), acme, acme_config())
}

/// Settings with a fast tick and short backoff
pub fn fast_settings(service: &CertificateService) -> ManagerSettings {
    let mut settings = ManagerSettings::from(service.config());
    settings.tick = Duration::from_millis(50);
    settings.backoff = BackoffPolicy::new(Duration::from_millis(100), Duration::from_millis(400));
    settings
}

pub fn manager(service: Arc<CertificateService>) -> CertificateManager {
    let settings = fast_settings(&service);
    CertificateManager::with_settings(service, settings)
}

/// Poll `check` until it holds or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
