//! Certificate service
//!
//! Creates signers and ACME accounts, issues certificates for zones from
//! either source, and records the outcome on the zone. Work on one domain is
//! serialized by a per-domain async mutex; different domains proceed in
//! parallel.
//!
//! Every issuance attempt ends with the zone record saved: a success stores
//! the bundle under `cache/<domain>` and updates the expiry and renewal-due
//! times, a failure records `last_error` and leaves the previous certificate
//! in force.

mod command;

pub use command::ServiceCommand;
pub(crate) use command::SERVICE_USAGE;

use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use certwarden_common::DomainName;
use certwarden_config::{Config, SelfSignedConfig, ZoneConfig};

use crate::acme::{
    AcmeProvider, CertificateBundle, CertificateCache, RepositoryCache,
};
use crate::error::{CertError, CertResult};
use crate::pki::{
    local_ip_addresses, CertificateIssuer, ClientCertificate, IssuancePolicy, IssuerArena,
    PkiError,
};
use crate::records::{AcmeAccount, IssuanceMode, SelfSigner, Zone};
use crate::repository::CertificateRepository;

/// Result of a renewal request
#[derive(Debug, Clone, PartialEq)]
pub enum RenewalOutcome {
    /// A new certificate was issued
    Renewed(Zone),
    /// Nothing done; renewal is due at the given time
    NotDue(Option<DateTime<Utc>>),
}

/// Issuance front end over the repository, the PKI and an ACME provider
pub struct CertificateService {
    repo: CertificateRepository,
    cache: Arc<dyn CertificateCache>,
    acme: Arc<dyn AcmeProvider>,
    config: Arc<Config>,
    policy: Arc<IssuancePolicy>,
    /// Registered ACME identities by email
    users: DashMap<String, AcmeAccount>,
    domain_locks: DashMap<String, Arc<Mutex<()>>>,
    account_locks: DashMap<String, Arc<Mutex<()>>>,
    signer_lock: Mutex<()>,
}

impl CertificateService {
    pub fn new(
        repo: CertificateRepository,
        acme: Arc<dyn AcmeProvider>,
        config: Arc<Config>,
    ) -> Self {
        let cache = Arc::new(RepositoryCache::new(repo.clone()));
        let policy = Arc::new(IssuancePolicy::from(&config.self_signed));
        Self {
            repo,
            cache,
            acme,
            config,
            policy,
            users: DashMap::new(),
            domain_locks: DashMap::new(),
            account_locks: DashMap::new(),
            signer_lock: Mutex::new(()),
        }
    }

    /// Store bundles in `cache` instead of the repository backend
    pub fn with_cache(mut self, cache: Arc<dyn CertificateCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn repository(&self) -> &CertificateRepository {
        &self.repo
    }

    pub fn cache(&self) -> &Arc<dyn CertificateCache> {
        &self.cache
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // =========================================================================
    // ACME accounts
    // =========================================================================

    /// Register an ACME account unless one already exists for `email`
    pub async fn create_acme_account(&self, email: &str) -> CertResult<AcmeAccount> {
        let email = normalize_email(email)?;
        let lock = self.account_lock(&email);
        let _guard = lock.lock().await;

        if let Some(existing) = self.repo.find_acme_account(&email).await? {
            debug!(email = %email, "ACME account already registered");
            return Ok(existing);
        }

        let registered = self.acme.register(&email).await?;
        let account = AcmeAccount {
            email: email.clone(),
            registration: Some(registered.registration),
            credentials: registered.credentials,
            created_at: Utc::now().timestamp(),
        };
        self.repo.save_acme_account(&account).await?;

        info!(email = %email, "Created ACME account");
        Ok(account)
    }

    /// The in-memory identity for `email`, registering it if needed
    pub async fn get_or_create_acme_user(&self, email: &str) -> CertResult<AcmeAccount> {
        let email = normalize_email(email)?;
        if let Some(user) = self.users.get(&email) {
            return Ok(user.clone());
        }

        let account = self.create_acme_account(&email).await?;
        self.users.insert(email, account.clone());
        Ok(account)
    }

    // =========================================================================
    // Signers
    // =========================================================================

    /// Create a root CA named `common_name`, plus `<common_name>-intermediate`
    pub async fn create_self_signer(
        &self,
        common_name: &str,
        with_intermediate: bool,
    ) -> CertResult<Vec<SelfSigner>> {
        validate_signer_name(common_name)?;
        let _guard = self.signer_lock.lock().await;
        self.create_self_signer_locked(common_name, with_intermediate)
            .await
    }

    async fn create_self_signer_locked(
        &self,
        common_name: &str,
        with_intermediate: bool,
    ) -> CertResult<Vec<SelfSigner>> {
        let inter_name = SelfSignedConfig::intermediate_name(common_name);
        for name in [common_name, inter_name.as_str()] {
            if self.repo.find_self_signer(name).await?.is_some() {
                return Err(CertError::Issuance(format!("signer '{}' already exists", name)));
            }
        }

        let root = CertificateIssuer::create_root(common_name, common_name, self.policy.clone())?;
        let mut created = vec![root.to_record()];
        if with_intermediate {
            let inter = root.issue_inter_cert(&inter_name)?;
            created.push(inter.to_record());
        }

        // Parents first, so a reader never sees an orphan
        for record in &created {
            self.repo.save_self_signer(record).await?;
        }

        info!(
            signer = %common_name,
            intermediate = with_intermediate,
            "Created self-signed certificate authority"
        );
        Ok(created)
    }

    /// Issue an intermediate CA called `name` beneath `parent`
    pub async fn create_intermediate_signer(
        &self,
        parent: &str,
        name: &str,
    ) -> CertResult<SelfSigner> {
        validate_signer_name(name)?;
        let _guard = self.signer_lock.lock().await;

        let mut arena = self.load_arena().await?;
        if arena.contains(name) {
            return Err(CertError::Issuance(format!("signer '{}' already exists", name)));
        }
        let parent = arena.issuer(parent)?;
        let inter = parent.issue_inter_cert(name)?;
        let record = inter.to_record();
        self.repo.save_self_signer(&record).await?;
        Ok(record)
    }

    /// Issue a client certificate and its PKCS#12 container from `signer`
    pub async fn issue_client_certificate(
        &self,
        signer: &str,
        common_name: &str,
        password: &str,
    ) -> CertResult<ClientCertificate> {
        let issuer = self.load_arena().await?.issuer(signer)?;
        let client = issuer.issue_client_cert(common_name, password)?;
        info!(
            signer = %signer,
            common_name = %common_name,
            serial = %client.certificate.info().serial,
            "Issued client certificate"
        );
        Ok(client)
    }

    async fn load_arena(&self) -> CertResult<IssuerArena> {
        let records = self.repo.all_self_signers().await?;
        Ok(IssuerArena::from_records(records, self.policy.clone()))
    }

    /// The issuer that signs leaves for `zone`
    ///
    /// An explicit signer is used as-is. Otherwise the configured default
    /// root is used, preferring its intermediate, and bootstrapped first when
    /// missing and allowed.
    async fn zone_issuer(&self, zone: &Zone) -> CertResult<CertificateIssuer> {
        let mut arena = self.load_arena().await?;
        if !zone.signer.is_empty() {
            return Ok(arena.issuer(&zone.signer)?);
        }

        let defaults = &self.config.self_signed;
        if !arena.contains(&defaults.signer) {
            if !defaults.auto_bootstrap {
                return Err(PkiError::UnknownSigner(defaults.signer.clone()).into());
            }
            let _guard = self.signer_lock.lock().await;
            if self.repo.find_self_signer(&defaults.signer).await?.is_none() {
                info!(signer = %defaults.signer, "Bootstrapping default signer");
                self.create_self_signer_locked(&defaults.signer, defaults.with_intermediate)
                    .await?;
            }
            arena = self.load_arena().await?;
        }

        let inter = SelfSignedConfig::intermediate_name(&defaults.signer);
        let name = if arena.contains(&inter) {
            inter
        } else {
            defaults.signer.clone()
        };
        Ok(arena.issuer(&name)?)
    }

    // =========================================================================
    // Zones
    // =========================================================================

    /// Register a new zone; `owner` is the ACME email or signer name
    pub async fn add_zone(
        &self,
        domain: &str,
        mode: IssuanceMode,
        owner: Option<&str>,
    ) -> CertResult<Zone> {
        let domain = parse_domain(domain)?;
        let lock = self.domain_lock(domain.as_str());
        let _guard = lock.lock().await;

        if self.repo.find_zone(domain.as_str()).await?.is_some() {
            return Err(CertError::Command(format!("zone '{}' already exists", domain)));
        }

        let mut zone = Zone::new(domain.as_str(), mode);
        if let Some(owner) = owner {
            match mode {
                IssuanceMode::Acme => zone.email = normalize_email(owner)?,
                IssuanceMode::SelfSigned => zone.signer = owner.to_string(),
            }
        }
        self.repo.save_zone(&zone).await?;

        info!(domain = %domain, mode = %mode.as_str(), "Added zone");
        Ok(zone)
    }

    /// Insert configured zones that are not stored yet
    pub async fn seed_zones(&self, zones: &[ZoneConfig]) -> CertResult<usize> {
        let mut added = 0;
        for config in zones {
            let domain = parse_domain(&config.domain)?;
            if self.repo.find_zone(domain.as_str()).await?.is_some() {
                continue;
            }
            let mut zone = Zone::from_config(config, domain.as_str());
            for alt in zone.alt_names.iter_mut() {
                *alt = parse_domain(alt)?.into_string();
            }
            self.repo.save_zone(&zone).await?;
            added += 1;
        }
        if added > 0 {
            info!(added = added, "Seeded zones from configuration");
        }
        Ok(added)
    }

    /// Remove a zone and its cached certificate
    pub async fn remove_zone(&self, domain: &str) -> CertResult<()> {
        let domain = parse_domain(domain)?;
        let lock = self.domain_lock(domain.as_str());
        {
            let _guard = lock.lock().await;
            self.repo.delete_zone(domain.as_str()).await?;
            self.cache.delete(domain.as_str()).await?;
        }
        self.domain_locks.remove(domain.as_str());

        info!(domain = %domain, "Removed zone");
        Ok(())
    }

    fn domain_lock(&self, domain: &str) -> Arc<Mutex<()>> {
        self.domain_locks
            .entry(domain.to_string())
            .or_default()
            .clone()
    }

    fn account_lock(&self, email: &str) -> Arc<Mutex<()>> {
        self.account_locks
            .entry(email.to_string())
            .or_default()
            .clone()
    }

    async fn load_zone(&self, domain: &str) -> CertResult<Zone> {
        self.repo
            .find_zone(domain)
            .await?
            .ok_or_else(|| CertError::not_found("zone", domain))
    }

    // =========================================================================
    // Issuance
    // =========================================================================

    /// Issue a certificate for `domain` by its zone's mode
    pub async fn issue_certificate(&self, domain: &str) -> CertResult<Zone> {
        let domain = parse_domain(domain)?;
        let lock = self.domain_lock(domain.as_str());
        let _guard = lock.lock().await;

        let zone = self.load_zone(domain.as_str()).await?;
        self.issue_locked(zone).await
    }

    /// Run the ACME order flow for `domain`
    pub async fn issue_acme_certificate(&self, domain: &str) -> CertResult<Zone> {
        let domain = parse_domain(domain)?;
        let lock = self.domain_lock(domain.as_str());
        let _guard = lock.lock().await;

        let zone = self.load_zone(domain.as_str()).await?;
        expect_mode(&zone, IssuanceMode::Acme)?;
        self.issue_locked(zone).await
    }

    /// Issue `domain` from the self-signed issuer tree
    pub async fn issue_self_signed_certificate(&self, domain: &str) -> CertResult<Zone> {
        let domain = parse_domain(domain)?;
        let lock = self.domain_lock(domain.as_str());
        let _guard = lock.lock().await;

        let zone = self.load_zone(domain.as_str()).await?;
        expect_mode(&zone, IssuanceMode::SelfSigned)?;
        self.issue_locked(zone).await
    }

    /// Renew `domain` if due, or unconditionally when `force` is set
    pub async fn renew_certificate(&self, domain: &str, force: bool) -> CertResult<RenewalOutcome> {
        let domain = parse_domain(domain)?;
        let lock = self.domain_lock(domain.as_str());
        let _guard = lock.lock().await;

        let zone = self.load_zone(domain.as_str()).await?;
        if !force && !zone.is_renewal_due(Utc::now()) {
            debug!(domain = %domain, due = ?zone.renewal_due_at(), "Renewal not due");
            return Ok(RenewalOutcome::NotDue(zone.renewal_due_at()));
        }

        self.issue_locked(zone).await.map(RenewalOutcome::Renewed)
    }

    /// Issue for a zone whose domain lock is held, then record the outcome
    async fn issue_locked(&self, zone: Zone) -> CertResult<Zone> {
        let mode = zone.mode();
        let outcome = async {
            let bundle = match mode {
                IssuanceMode::Acme => self.acme_bundle(&zone).await?,
                IssuanceMode::SelfSigned => self.self_signed_bundle(&zone).await?,
            };
            self.cache.put(&zone.zone, bundle.to_bytes()).await?;
            Ok::<_, CertError>(bundle)
        }
        .await;

        self.record_outcome(zone, mode, outcome).await
    }

    async fn record_outcome(
        &self,
        mut zone: Zone,
        mode: IssuanceMode,
        outcome: CertResult<CertificateBundle>,
    ) -> CertResult<Zone> {
        match outcome {
            Ok(bundle) => {
                let leaf = bundle.leaf();
                let name = zone.zone.clone();
                zone.record_issued(name, leaf.not_before, leaf.not_after, self.config.renewal.fraction);
                self.repo.save_zone(&zone).await?;

                info!(
                    domain = %zone.zone,
                    mode = %mode.as_str(),
                    serial = %leaf.serial,
                    expires = %leaf.not_after,
                    "Issued certificate"
                );
                Ok(zone)
            }
            Err(e) => {
                error!(domain = %zone.zone, mode = %mode.as_str(), error = %e, "Certificate issuance failed");
                zone.record_failure(&e);
                if let Err(save_err) = self.repo.save_zone(&zone).await {
                    warn!(domain = %zone.zone, error = %save_err, "Failed to record issuance error");
                }
                Err(e)
            }
        }
    }

    async fn acme_bundle(&self, zone: &Zone) -> CertResult<CertificateBundle> {
        let email = if zone.email.is_empty() {
            self.config.acme.email.clone().ok_or_else(|| {
                CertError::Acme(format!("zone '{}' has no ACME email and none is configured", zone.zone))
            })?
        } else {
            zone.email.clone()
        };
        let challenge = zone.challenge_kind().unwrap_or(self.config.acme.challenge);
        let timeout = self.config.acme.order_timeout();

        let flow = async {
            let account = self.get_or_create_acme_user(&email).await?;
            let cert = self.acme.order(&account, &zone.names(), challenge).await?;
            CertificateBundle::from_parts(&cert.key_pem, &cert.chain_pem)
        };

        match tokio::time::timeout(timeout, flow).await {
            Ok(result) => result,
            Err(_) => Err(CertError::Timeout(timeout)),
        }
    }

    async fn self_signed_bundle(&self, zone: &Zone) -> CertResult<CertificateBundle> {
        let issuer = self.zone_issuer(zone).await?;

        let mut domains = Vec::new();
        let mut ips = Vec::new();
        for name in zone.names() {
            match name.parse::<IpAddr>() {
                Ok(ip) => ips.push(ip),
                Err(_) => domains.push(name),
            }
        }
        for raw in &zone.ip_addresses {
            let ip: IpAddr = raw.parse().map_err(|_| {
                CertError::Issuance(format!("zone '{}' has invalid IP address '{}'", zone.zone, raw))
            })?;
            if !ips.contains(&ip) {
                ips.push(ip);
            }
        }
        if self.config.self_signed.include_local_ips {
            for ip in local_ip_addresses(true) {
                if !ips.contains(&ip) {
                    ips.push(ip);
                }
            }
        }

        let leaf = issuer.issue_server_cert(&zone.zone, &domains, &ips)?;
        CertificateBundle::from_parts(leaf.key_pem(), &issuer.chain_pem(&leaf))
    }

    // =========================================================================
    // Listing
    // =========================================================================

    pub async fn zones(&self) -> CertResult<Vec<Zone>> {
        self.repo.all_zones().await
    }

    pub async fn signers(&self) -> CertResult<Vec<SelfSigner>> {
        self.repo.all_self_signers().await
    }

    pub async fn accounts(&self) -> CertResult<Vec<AcmeAccount>> {
        let mut accounts = Vec::new();
        self.repo
            .list_acme_accounts("", |a| {
                accounts.push(a);
                true
            })
            .await?;
        Ok(accounts)
    }
}

impl std::fmt::Debug for CertificateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateService")
            .field("repo", &self.repo)
            .field("users", &self.users.len())
            .field("locked_domains", &self.domain_locks.len())
            .finish_non_exhaustive()
    }
}

fn parse_domain(raw: &str) -> CertResult<DomainName> {
    DomainName::parse(raw).map_err(|e| CertError::Command(e.to_string()))
}

fn normalize_email(raw: &str) -> CertResult<String> {
    let email = raw.trim().to_ascii_lowercase();
    match email.split_once('@') {
        Some((local, host)) if !local.is_empty() && host.contains('.') => Ok(email),
        _ => Err(CertError::Command(format!("invalid email address '{}'", raw))),
    }
}

fn validate_signer_name(name: &str) -> CertResult<()> {
    if name.is_empty() || name.contains('/') {
        return Err(CertError::Command(format!("invalid signer name '{}'", name)));
    }
    Ok(())
}

fn expect_mode(zone: &Zone, mode: IssuanceMode) -> CertResult<()> {
    if zone.mode() != mode {
        return Err(CertError::Issuance(format!(
            "zone '{}' uses {} issuance, not {}",
            zone.zone,
            zone.mode().as_str(),
            mode.as_str()
        )));
    }
    Ok(())
}
