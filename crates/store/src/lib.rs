//! Key-value data store abstraction.
//!
//! The certificate repository persists its records through [`DataStore`], a
//! small capability trait covering get/put/delete, prefix enumeration and
//! prefix watches. The storage engine itself is a collaborator; this crate
//! ships [`MemoryDataStore`] for tests, demos and single-process deployments.
//!
//! # Watch semantics
//!
//! A [`WatchStream`] yields every committed mutation under its prefix. Events
//! for one key arrive in commit order; ordering across keys is unspecified.
//! When the stream reports [`WatchError::Closed`] the backend dropped the
//! subscription (for example after a reconnect) and the consumer is expected
//! to subscribe again.

mod error;
mod memory;

pub use error::StoreError;
pub use memory::MemoryDataStore;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;

/// Kind of a committed mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEventKind {
    /// Key was created or overwritten with this value
    Put(Bytes),
    /// Key was removed
    Delete,
}

/// A committed mutation observed by a watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub key: String,
    pub kind: StoreEventKind,
}

/// Why a watch stream stopped yielding events
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum WatchError {
    /// The backend ended the subscription; resubscribe to continue
    #[error("watch subscription closed by backend")]
    Closed,
    /// The consumer fell behind and this many events were dropped
    #[error("watch consumer lagged, {0} events dropped")]
    Lagged(u64),
}

/// Stream of mutations under a key prefix
#[derive(Debug)]
pub struct WatchStream {
    prefix: String,
    rx: broadcast::Receiver<StoreEvent>,
}

impl WatchStream {
    /// Wrap a backend event feed, keeping only keys under `prefix`
    pub fn new(prefix: impl Into<String>, rx: broadcast::Receiver<StoreEvent>) -> Self {
        Self {
            prefix: prefix.into(),
            rx,
        }
    }

    /// The watched prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Wait for the next event under the prefix
    pub async fn recv(&mut self) -> Result<StoreEvent, WatchError> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.key.starts_with(&self.prefix) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(WatchError::Closed),
                Err(broadcast::error::RecvError::Lagged(n)) => return Err(WatchError::Lagged(n)),
            }
        }
    }
}

/// Capability trait for the backing key-value engine.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Read a key
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;

    /// Create or overwrite a key; the value becomes visible atomically
    async fn put(&self, key: &str, value: Bytes) -> Result<(), StoreError>;

    /// Remove a key; removing an absent key succeeds
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// All entries whose key starts with `prefix`, in key order
    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Bytes)>, StoreError>;

    /// Subscribe to mutations under `prefix`
    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError>;

    /// Backend name for logs
    fn name(&self) -> &str {
        "unnamed"
    }
}
