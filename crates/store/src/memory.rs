//! In-memory data store with prefix watches.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::{DataStore, StoreError, StoreEvent, StoreEventKind, WatchStream};

/// Default capacity of the watch event channel.
const DEFAULT_WATCH_CAPACITY: usize = 1024;

/// Ordered in-memory key-value store.
///
/// Mutations are published to watchers while the write lock is held, so
/// watchers see the events for one key in the order they were committed.
pub struct MemoryDataStore {
    /// Entries in key order
    entries: RwLock<BTreeMap<String, Bytes>>,
    /// Event feed shared by all watch streams
    events: RwLock<broadcast::Sender<StoreEvent>>,
    /// Watch channel capacity (events beyond it are reported as lag)
    watch_capacity: usize,
    /// Simulated outage flag
    unavailable: AtomicBool,
}

impl MemoryDataStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::with_watch_capacity(DEFAULT_WATCH_CAPACITY)
    }

    /// Create an empty store with a custom watch channel capacity.
    pub fn with_watch_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            entries: RwLock::new(BTreeMap::new()),
            events: RwLock::new(tx),
            watch_capacity: capacity,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Close every open watch stream, as a backend reconnect would.
    ///
    /// Existing streams report [`crate::WatchError::Closed`]; new
    /// subscriptions work normally.
    pub fn disconnect_watchers(&self) {
        let (tx, _) = broadcast::channel(self.watch_capacity);
        let old = std::mem::replace(&mut *self.events.write(), tx);
        debug!(
            receivers = old.receiver_count(),
            "Disconnected data store watchers"
        );
    }

    /// Make every operation fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
        debug!(unavailable = unavailable, "Changed data store availability");
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store marked unavailable".to_string()))
        } else {
            Ok(())
        }
    }

    fn publish(&self, event: StoreEvent) {
        // No receivers is not an error
        let _ = self.events.read().send(event);
    }
}

impl Default for MemoryDataStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryDataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDataStore")
            .field("keys", &self.len())
            .field("watch_capacity", &self.watch_capacity)
            .field("unavailable", &self.unavailable.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        self.check_available()?;
        let value = self.entries.read().get(key).cloned();
        trace!(key = %key, found = value.is_some(), "Memory store get");
        Ok(value)
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
        self.check_available()?;
        if key.is_empty() {
            return Err(StoreError::InvalidKey(key.to_string()));
        }

        let mut entries = self.entries.write();
        entries.insert(key.to_string(), value.clone());
        self.publish(StoreEvent {
            key: key.to_string(),
            kind: StoreEventKind::Put(value),
        });
        trace!(key = %key, "Memory store put");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check_available()?;

        let mut entries = self.entries.write();
        if entries.remove(key).is_some() {
            self.publish(StoreEvent {
                key: key.to_string(),
                kind: StoreEventKind::Delete,
            });
            trace!(key = %key, "Memory store delete");
        }
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<(String, Bytes)>, StoreError> {
        self.check_available()?;

        let entries = self.entries.read();
        let matches: Vec<(String, Bytes)> = entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        trace!(prefix = %prefix, count = matches.len(), "Memory store scan");
        Ok(matches)
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        self.check_available()?;
        let rx = self.events.read().subscribe();
        debug!(prefix = %prefix, "Opened memory store watch");
        Ok(WatchStream::new(prefix, rx))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WatchError;

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = MemoryDataStore::new();

        store.put("zone/a.test", Bytes::from_static(b"one")).await.unwrap();
        assert_eq!(
            store.get("zone/a.test").await.unwrap(),
            Some(Bytes::from_static(b"one"))
        );

        store.delete("zone/a.test").await.unwrap();
        assert_eq!(store.get("zone/a.test").await.unwrap(), None);

        // Deleting again is fine
        store.delete("zone/a.test").await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_prefix_in_key_order() {
        let store = MemoryDataStore::new();
        store.put("zone/b", Bytes::from_static(b"b")).await.unwrap();
        store.put("zone/a", Bytes::from_static(b"a")).await.unwrap();
        store.put("signer/x", Bytes::from_static(b"x")).await.unwrap();
        store.put("zonf", Bytes::from_static(b"no")).await.unwrap();

        let keys: Vec<String> = store
            .scan("zone/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["zone/a".to_string(), "zone/b".to_string()]);
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let store = MemoryDataStore::new();
        let result = store.put("", Bytes::new()).await;
        assert!(matches!(result, Err(StoreError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_watch_filters_prefix_and_orders_events() {
        let store = MemoryDataStore::new();
        let mut watch = store.watch("zone/").await.unwrap();

        store.put("signer/root", Bytes::from_static(b"r")).await.unwrap();
        store.put("zone/a", Bytes::from_static(b"1")).await.unwrap();
        store.put("zone/a", Bytes::from_static(b"2")).await.unwrap();
        store.delete("zone/a").await.unwrap();

        let first = watch.recv().await.unwrap();
        assert_eq!(first.key, "zone/a");
        assert_eq!(first.kind, StoreEventKind::Put(Bytes::from_static(b"1")));

        let second = watch.recv().await.unwrap();
        assert_eq!(second.kind, StoreEventKind::Put(Bytes::from_static(b"2")));

        let third = watch.recv().await.unwrap();
        assert_eq!(third.kind, StoreEventKind::Delete);
    }

    #[tokio::test]
    async fn test_disconnect_closes_streams() {
        let store = MemoryDataStore::new();
        let mut watch = store.watch("zone/").await.unwrap();

        store.disconnect_watchers();
        assert_eq!(watch.recv().await, Err(WatchError::Closed));

        // A fresh subscription sees new events
        let mut watch = store.watch("zone/").await.unwrap();
        store.put("zone/c", Bytes::from_static(b"c")).await.unwrap();
        assert_eq!(watch.recv().await.unwrap().key, "zone/c");
    }

    #[tokio::test]
    async fn test_lag_is_reported() {
        let store = MemoryDataStore::with_watch_capacity(2);
        let mut watch = store.watch("zone/").await.unwrap();

        for i in 0..5u8 {
            store.put("zone/a", Bytes::from(vec![i])).await.unwrap();
        }

        assert!(matches!(watch.recv().await, Err(WatchError::Lagged(_))));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = MemoryDataStore::new();
        store.set_unavailable(true);

        assert!(matches!(
            store.get("zone/a").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.put("zone/a", Bytes::new()).await.is_err());

        store.set_unavailable(false);
        assert!(store.put("zone/a", Bytes::new()).await.is_ok());
    }
}
