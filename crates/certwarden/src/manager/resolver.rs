//! rustls certificate resolver over the manager's hot cache

use std::sync::Arc;

use dashmap::DashMap;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use tokio::runtime::Handle;
use tracing::{debug, trace};

use certwarden_common::DomainName;

use super::CertificateManager;

/// SNI-based [`ResolvesServerCert`] backed by a [`CertificateManager`]
///
/// Resolution is synchronous and only consults the hot cache. A miss
/// declines the handshake and loads the name in the background, so a retried
/// handshake finds it.
pub struct SniResolver {
    manager: CertificateManager,
    runtime: Option<Handle>,
    warming: Arc<DashMap<String, ()>>,
}

impl SniResolver {
    /// Create a resolver; background loads run on the current Tokio runtime, if any
    pub fn new(manager: CertificateManager) -> Self {
        Self {
            manager,
            runtime: Handle::try_current().ok(),
            warming: Arc::new(DashMap::new()),
        }
    }

    /// Synchronous lookup of `server_name`
    pub fn lookup(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
        let name = DomainName::parse(server_name).ok()?;
        if let Some(key) = self.manager.cached(&name) {
            return Some(key);
        }
        self.warm(name);
        None
    }

    fn warm(&self, name: DomainName) {
        let Some(runtime) = &self.runtime else {
            trace!(server_name = %name, "No runtime for background certificate load");
            return;
        };
        if self.warming.insert(name.to_string(), ()).is_some() {
            return;
        }

        let manager = self.manager.clone();
        let warming = self.warming.clone();
        runtime.spawn(async move {
            if manager.get_certificate(name.as_str()).await.is_ok() {
                debug!(server_name = %name, "Loaded certificate after handshake miss");
            }
            warming.remove(name.as_str());
        });
    }
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("manager", &self.manager)
            .field("warming", &self.warming.len())
            .finish()
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name()?;
        self.lookup(server_name)
    }
}
