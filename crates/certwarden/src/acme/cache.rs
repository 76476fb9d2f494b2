//! Certificate cache bridge
//!
//! Issued certificates are stored as a single PEM blob per name: the private
//! key followed by the certificate chain, leaf first. [`CertificateCache`] is
//! the narrow get/put/delete surface the service and manager use;
//! [`RepositoryCache`] keeps the blobs in the repository backend under
//! `cache/`.

use std::fmt;
use std::io::BufReader;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls_pemfile::Item;

use crate::error::{CertError, CertResult};
use crate::pki::CertificateInfo;
use crate::repository::CertificateRepository;

/// Name-keyed storage for certificate bundles
#[async_trait]
pub trait CertificateCache: Send + Sync {
    async fn get(&self, name: &str) -> CertResult<Option<Bytes>>;

    async fn put(&self, name: &str, data: Bytes) -> CertResult<()>;

    /// Removing an absent name succeeds
    async fn delete(&self, name: &str) -> CertResult<()>;
}

/// [`CertificateCache`] backed by the certificate repository
#[derive(Debug, Clone)]
pub struct RepositoryCache {
    repo: CertificateRepository,
}

impl RepositoryCache {
    pub fn new(repo: CertificateRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl CertificateCache for RepositoryCache {
    async fn get(&self, name: &str) -> CertResult<Option<Bytes>> {
        self.repo.get_cached(name).await
    }

    async fn put(&self, name: &str, data: Bytes) -> CertResult<()> {
        self.repo.put_cached(name, data).await
    }

    async fn delete(&self, name: &str) -> CertResult<()> {
        self.repo.delete_cached(name).await
    }
}

/// A private key and its certificate chain
pub struct CertificateBundle {
    raw: Bytes,
    key: PrivateKeyDer<'static>,
    certs: Vec<CertificateDer<'static>>,
    leaf: CertificateInfo,
}

impl CertificateBundle {
    /// Combine a PEM key and a PEM chain (leaf first)
    pub fn from_parts(key_pem: &str, chain_pem: &str) -> CertResult<Self> {
        let mut raw = String::with_capacity(key_pem.len() + chain_pem.len() + 1);
        raw.push_str(key_pem);
        if !raw.ends_with('\n') {
            raw.push('\n');
        }
        raw.push_str(chain_pem);
        Self::parse(Bytes::from(raw))
    }

    /// Parse a stored bundle
    pub fn parse(raw: Bytes) -> CertResult<Self> {
        let mut key = None;
        let mut certs = Vec::new();

        let mut reader = BufReader::new(raw.as_ref());
        for item in rustls_pemfile::read_all(&mut reader) {
            let item = item.map_err(|e| CertError::Encoding(format!("invalid PEM bundle: {}", e)))?;
            match item {
                Item::X509Certificate(cert) => certs.push(cert),
                Item::Pkcs8Key(k) if key.is_none() => key = Some(PrivateKeyDer::from(k)),
                Item::Sec1Key(k) if key.is_none() => key = Some(PrivateKeyDer::from(k)),
                Item::Pkcs1Key(k) if key.is_none() => key = Some(PrivateKeyDer::from(k)),
                _ => {}
            }
        }

        let key = key.ok_or_else(|| CertError::Encoding("bundle has no private key".to_string()))?;
        let leaf = certs
            .first()
            .ok_or_else(|| CertError::Encoding("bundle has no certificate".to_string()))?;
        let leaf = CertificateInfo::from_der(leaf.as_ref())?;

        Ok(Self {
            raw,
            key,
            certs,
            leaf,
        })
    }

    /// Stored form: key PEM then chain PEM
    pub fn to_bytes(&self) -> Bytes {
        self.raw.clone()
    }

    pub fn leaf(&self) -> &CertificateInfo {
        &self.leaf
    }

    /// Chain in DER, leaf first
    pub fn certs(&self) -> &[CertificateDer<'static>] {
        &self.certs
    }

    pub fn chain_len(&self) -> usize {
        self.certs.len()
    }

    /// Signing material for a TLS server
    pub fn certified_key(&self) -> CertResult<Arc<CertifiedKey>> {
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&self.key)
            .map_err(|e| CertError::Encoding(format!("unsupported private key: {}", e)))?;
        Ok(Arc::new(CertifiedKey::new(self.certs.clone(), signing_key)))
    }
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("subject", &self.leaf.subject)
            .field("not_after", &self.leaf.not_after)
            .field("chain_len", &self.certs.len())
            .finish_non_exhaustive()
    }
}
