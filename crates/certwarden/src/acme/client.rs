//! ACME v2 client
//!
//! [`AcmeProvider`] is the seam between the certificate service and an ACME
//! CA. [`InstantAcmeProvider`] implements it with `instant-acme`:
//!
//! 1. Register (or restore) the account from stored credentials
//! 2. Create an order for the zone's names
//! 3. Provision each pending authorization's challenge and mark it ready
//! 4. Poll until every authorization is valid
//! 5. Finalize with a fresh ECDSA P-256 CSR and download the chain
//!
//! The whole flow is bounded by the caller's order timeout.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, Authorization, AuthorizationStatus, ChallengeType, Identifier,
    NewAccount, NewOrder, Order, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair, PKCS_ECDSA_P256_SHA256};
use tracing::{debug, info, warn};

use certwarden_config::{AcmeConfig, ChallengeKind};

use super::challenge::{dns01_record_name, DnsProvider, Http01Challenges, DEFAULT_CHALLENGE_TTL};
use super::AcmeError;
use crate::records::{AcmeAccount, AcmeRegistration};

/// Result of registering an account with the CA
#[derive(Debug, Clone)]
pub struct RegisteredAccount {
    pub registration: AcmeRegistration,
    /// Opaque client credentials, including the account key
    pub credentials: Vec<u8>,
}

/// A certificate downloaded from the CA
#[derive(Debug, Clone)]
pub struct AcmeCertificate {
    /// PKCS#8 PEM key the CSR was made with
    pub key_pem: String,
    /// PEM chain, leaf first
    pub chain_pem: String,
}

/// An ACME certificate authority
#[async_trait]
pub trait AcmeProvider: Send + Sync {
    /// Register a new account for `email`
    async fn register(&self, email: &str) -> Result<RegisteredAccount, AcmeError>;

    /// Run a full order for `domains` using `challenge`
    async fn order(
        &self,
        account: &AcmeAccount,
        domains: &[String],
        challenge: ChallengeKind,
    ) -> Result<AcmeCertificate, AcmeError>;
}

/// [`AcmeProvider`] backed by `instant-acme`
pub struct InstantAcmeProvider {
    directory_url: String,
    accept_tos: bool,
    poll_interval: Duration,
    http01: Http01Challenges,
    dns: Option<Arc<dyn DnsProvider>>,
}

impl InstantAcmeProvider {
    pub fn new(config: &AcmeConfig, http01: Http01Challenges) -> Self {
        Self {
            directory_url: config.directory().to_string(),
            accept_tos: config.accept_tos,
            poll_interval: config.poll_interval(),
            http01,
            dns: None,
        }
    }

    /// Enable dns-01 through `provider`
    pub fn with_dns_provider(mut self, provider: Arc<dyn DnsProvider>) -> Self {
        self.dns = Some(provider);
        self
    }

    /// The HTTP-01 token table the listener should serve
    pub fn http01(&self) -> &Http01Challenges {
        &self.http01
    }

    async fn restore(&self, account: &AcmeAccount) -> Result<Account, AcmeError> {
        let credentials: AccountCredentials = serde_json::from_slice(&account.credentials)
            .map_err(|e| AcmeError::Credentials {
                email: account.email.clone(),
                reason: e.to_string(),
            })?;
        Ok(Account::from_credentials(credentials).await?)
    }

    /// Provision, validate and clean up every pending authorization
    async fn authorize(
        &self,
        order: &mut Order,
        authorizations: Vec<Authorization>,
        kind: ChallengeKind,
    ) -> Result<(), AcmeError> {
        for authz in authorizations {
            match authz.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                status => {
                    return Err(AcmeError::Challenge(format!(
                        "authorization for {:?} is {:?}",
                        authz.identifier, status
                    )))
                }
            }

            let Identifier::Dns(domain) = &authz.identifier;
            let wanted = match kind {
                ChallengeKind::Http01 => ChallengeType::Http01,
                ChallengeKind::Dns01 => ChallengeType::Dns01,
            };
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == wanted)
                .ok_or_else(|| {
                    AcmeError::Challenge(format!(
                        "CA offered no {} challenge for {}",
                        kind.as_str(),
                        domain
                    ))
                })?;

            let key_auth = order.key_authorization(challenge);
            match kind {
                ChallengeKind::Http01 => {
                    self.http01
                        .add(&challenge.token, key_auth.as_str(), DEFAULT_CHALLENGE_TTL);
                }
                ChallengeKind::Dns01 => {
                    let dns = self.dns.as_ref().ok_or_else(|| {
                        AcmeError::Challenge("dns-01 requested but no DNS provider is configured".to_string())
                    })?;
                    dns.set_txt(&dns01_record_name(domain), &key_auth.dns_value())
                        .await?;
                }
            }

            let validated = async {
                order.set_challenge_ready(&challenge.url).await?;
                self.wait_for_authorization(order, &authz.identifier).await
            }
            .await;

            match kind {
                ChallengeKind::Http01 => self.http01.remove(&challenge.token),
                ChallengeKind::Dns01 => {
                    if let Some(dns) = &self.dns {
                        if let Err(e) = dns.remove_txt(&dns01_record_name(domain)).await {
                            warn!(domain = %domain, error = %e, "Failed to remove DNS-01 record");
                        }
                    }
                }
            }

            validated?;
            info!(domain = %domain, challenge = %kind.as_str(), "Authorization validated");
        }
        Ok(())
    }

    async fn wait_for_authorization(
        &self,
        order: &mut Order,
        identifier: &Identifier,
    ) -> Result<(), AcmeError> {
        loop {
            tokio::time::sleep(self.poll_interval).await;

            let authorizations = order.authorizations().await?;
            let current = authorizations
                .iter()
                .find(|a| &a.identifier == identifier)
                .ok_or_else(|| AcmeError::Protocol("authorization disappeared from order".to_string()))?;

            match current.status {
                AuthorizationStatus::Valid => return Ok(()),
                AuthorizationStatus::Pending => {
                    debug!(identifier = ?identifier, "Authorization still pending");
                }
                status => {
                    return Err(AcmeError::Challenge(format!(
                        "authorization for {:?} became {:?}",
                        identifier, status
                    )))
                }
            }
        }
    }

    async fn finalize(&self, order: &mut Order, domains: &[String]) -> Result<AcmeCertificate, AcmeError> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| AcmeError::Certificate(e.to_string()))?;
        let mut params = CertificateParams::new(domains.to_vec())
            .map_err(|e| AcmeError::Certificate(e.to_string()))?;
        params.distinguished_name = DistinguishedName::new();
        let csr = params
            .serialize_request(&key)
            .map_err(|e| AcmeError::Certificate(e.to_string()))?;

        // Wait until the order accepts a CSR
        loop {
            match order.refresh().await?.status {
                OrderStatus::Ready => break,
                OrderStatus::Pending => tokio::time::sleep(self.poll_interval).await,
                OrderStatus::Invalid => {
                    return Err(AcmeError::Challenge("order became invalid".to_string()))
                }
                OrderStatus::Valid | OrderStatus::Processing => break,
            }
        }

        order.finalize(csr.der()).await?;

        loop {
            match order.refresh().await?.status {
                OrderStatus::Valid => break,
                OrderStatus::Invalid => {
                    return Err(AcmeError::Protocol("order became invalid after finalize".to_string()))
                }
                _ => tokio::time::sleep(self.poll_interval).await,
            }
        }

        let chain_pem = order
            .certificate()
            .await?
            .ok_or_else(|| AcmeError::Certificate("CA returned no certificate".to_string()))?;

        Ok(AcmeCertificate {
            key_pem: key.serialize_pem(),
            chain_pem,
        })
    }
}

impl std::fmt::Debug for InstantAcmeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstantAcmeProvider")
            .field("directory_url", &self.directory_url)
            .field("accept_tos", &self.accept_tos)
            .field("pending_http01", &self.http01.pending_count())
            .field("dns", &self.dns.is_some())
            .finish()
    }
}

#[async_trait]
impl AcmeProvider for InstantAcmeProvider {
    async fn register(&self, email: &str) -> Result<RegisteredAccount, AcmeError> {
        if !self.accept_tos {
            return Err(AcmeError::TermsNotAccepted(email.to_string()));
        }

        let contact = format!("mailto:{}", email);
        let new_account = NewAccount {
            contact: &[&contact],
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        let (account, credentials) =
            Account::create(&new_account, &self.directory_url, None).await?;
        let credentials = serde_json::to_vec(&credentials)
            .map_err(|e| AcmeError::Certificate(format!("failed to serialize credentials: {}", e)))?;

        info!(email = %email, directory = %self.directory_url, "Registered ACME account");

        Ok(RegisteredAccount {
            registration: AcmeRegistration {
                status: "valid".to_string(),
                contact: vec![contact],
                terms_of_service_agreed: true,
                orders: String::new(),
                uri: account.id().to_string(),
            },
            credentials,
        })
    }

    async fn order(
        &self,
        account: &AcmeAccount,
        domains: &[String],
        challenge: ChallengeKind,
    ) -> Result<AcmeCertificate, AcmeError> {
        let client = self.restore(account).await?;

        let identifiers: Vec<Identifier> = domains.iter().map(|d| Identifier::Dns(d.clone())).collect();
        let mut order = client
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;
        debug!(domains = ?domains, "Created ACME order");

        let authorizations = order.authorizations().await?;
        self.authorize(&mut order, authorizations, challenge).await?;

        let certificate = self.finalize(&mut order, domains).await?;
        info!(domains = ?domains, "Downloaded ACME certificate");
        Ok(certificate)
    }
}
