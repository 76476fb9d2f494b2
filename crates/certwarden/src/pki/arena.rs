//! Reconstruction of issuer trees from stored signer records

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::trace;

use super::{CertificateIssuer, IssuancePolicy, IssuedCertificate, PkiError};
use crate::records::SelfSigner;

/// Signer records indexed by name, resolved into issuers on demand
///
/// Resolution walks parent names up to a root, rejecting missing parents,
/// cycles and certificates that were not actually signed by their recorded
/// parent. Resolved issuers are memoized.
#[derive(Debug)]
pub struct IssuerArena {
    records: HashMap<String, SelfSigner>,
    resolved: HashMap<String, CertificateIssuer>,
    policy: Arc<IssuancePolicy>,
}

impl IssuerArena {
    pub fn new(policy: Arc<IssuancePolicy>) -> Self {
        Self {
            records: HashMap::new(),
            resolved: HashMap::new(),
            policy,
        }
    }

    pub fn from_records(
        records: impl IntoIterator<Item = SelfSigner>,
        policy: Arc<IssuancePolicy>,
    ) -> Self {
        let mut arena = Self::new(policy);
        for record in records {
            arena.add_record(record);
        }
        arena
    }

    pub fn add_record(&mut self, record: SelfSigner) {
        self.resolved.remove(&record.name);
        self.records.insert(record.name.clone(), record);
    }

    /// Register an issuer created in this process
    pub fn insert(&mut self, issuer: CertificateIssuer) {
        self.records.insert(issuer.name().to_string(), issuer.to_record());
        self.resolved.insert(issuer.name().to_string(), issuer);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Names of the signers whose parent is `name`
    pub fn children(&self, name: &str) -> Vec<&str> {
        let mut children: Vec<&str> = self
            .records
            .values()
            .filter(|r| r.issuer == name)
            .map(|r| r.name.as_str())
            .collect();
        children.sort_unstable();
        children
    }

    /// Resolve a signer and every ancestor into an issuer
    pub fn issuer(&mut self, name: &str) -> Result<CertificateIssuer, PkiError> {
        if let Some(issuer) = self.resolved.get(name) {
            return Ok(issuer.clone());
        }

        // Collect the path from `name` up to the first resolved ancestor or root
        let mut path = Vec::new();
        let mut seen = HashSet::new();
        let mut current = name.to_string();
        loop {
            if self.resolved.contains_key(&current) {
                break;
            }
            if !seen.insert(current.clone()) {
                return Err(PkiError::SignerCycle(name.to_string()));
            }
            let record = self
                .records
                .get(&current)
                .ok_or_else(|| PkiError::UnknownSigner(current.clone()))?;
            path.push(current.clone());
            if record.is_root() {
                break;
            }
            current = record.issuer.clone();
        }

        // Build from the top down so each child sees its resolved parent
        for signer in path.into_iter().rev() {
            let record = self
                .records
                .get(&signer)
                .ok_or_else(|| PkiError::UnknownSigner(signer.clone()))?;
            let certificate = IssuedCertificate::from_pem(&record.certificate, &record.private_key)?;

            let parent = if record.is_root() {
                None
            } else {
                let parent = self
                    .resolved
                    .get(&record.issuer)
                    .ok_or_else(|| PkiError::UnknownSigner(record.issuer.clone()))?;
                if !certificate.info().is_issued_by(parent.certificate().info()) {
                    return Err(PkiError::ChainMismatch {
                        name: signer.clone(),
                        parent: record.issuer.clone(),
                    });
                }
                Some(parent)
            };

            let issuer = CertificateIssuer::from_parts(
                signer.clone(),
                certificate,
                parent,
                self.policy.clone(),
            );
            trace!(signer = %signer, depth = issuer.ancestors().len(), "Resolved signer");
            self.resolved.insert(signer, issuer);
        }

        self.resolved
            .get(name)
            .cloned()
            .ok_or_else(|| PkiError::UnknownSigner(name.to_string()))
    }
}
