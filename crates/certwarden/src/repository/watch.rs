//! Zone change notifications
//!
//! A forwarding task turns raw store events under `zone/` into typed
//! [`ZoneEvent`]s. When the backend drops the subscription the task
//! resubscribes with bounded backoff and replays every current zone as
//! `Updated`. Zones the task had seen that are gone from the store by then
//! are replayed as `Deleted`, so a consumer never misses the final state of
//! a zone.

use std::collections::HashSet;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use certwarden_common::{Backoff, BackoffPolicy};
use certwarden_store::{StoreEventKind, WatchError, WatchStream};

use super::{CertificateRepository, ZONE_PREFIX};
use crate::records::{self, Zone};

const CHANNEL_CAPACITY: usize = 256;

/// What happened to a zone
#[derive(Debug, Clone, PartialEq)]
pub enum ZoneEventKind {
    Updated(Zone),
    Deleted,
}

/// A change to one zone
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneEvent {
    pub domain: String,
    pub kind: ZoneEventKind,
}

/// Receiving end of a zone watch
///
/// Dropping it stops the forwarding task.
#[derive(Debug)]
pub struct ZoneWatch {
    rx: mpsc::Receiver<ZoneEvent>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ZoneWatch {
    /// Next event, or `None` once the watch has stopped
    pub async fn recv(&mut self) -> Option<ZoneEvent> {
        self.rx.recv().await
    }

    /// Token that stops this watch without affecting the parent token
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Stop forwarding and wait for the task to exit
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ZoneWatch {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub(super) fn spawn(
    repo: CertificateRepository,
    stream: WatchStream,
    known: HashSet<String>,
    parent: CancellationToken,
    policy: BackoffPolicy,
) -> ZoneWatch {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let cancel = parent.child_token();
    let task = tokio::spawn(forward(repo, stream, known, tx, cancel.clone(), policy));

    ZoneWatch {
        rx,
        cancel,
        task: Some(task),
    }
}

async fn forward(
    repo: CertificateRepository,
    mut stream: WatchStream,
    mut known: HashSet<String>,
    tx: mpsc::Sender<ZoneEvent>,
    cancel: CancellationToken,
    policy: BackoffPolicy,
) {
    let mut backoff = Backoff::new(policy);

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tx.closed() => break,
            received = stream.recv() => received,
        };

        match received {
            Ok(event) => {
                let Some(domain) = event.key.strip_prefix(ZONE_PREFIX) else {
                    continue;
                };
                let kind = match event.kind {
                    StoreEventKind::Put(bytes) => match records::decode::<Zone>(&bytes) {
                        Ok(zone) => {
                            known.insert(domain.to_string());
                            ZoneEventKind::Updated(zone)
                        }
                        Err(e) => {
                            warn!(domain = %domain, error = %e, "Skipping undecodable zone update");
                            continue;
                        }
                    },
                    StoreEventKind::Delete => {
                        known.remove(domain);
                        ZoneEventKind::Deleted
                    }
                };
                let event = ZoneEvent {
                    domain: domain.to_string(),
                    kind,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Err(WatchError::Lagged(dropped)) => {
                warn!(dropped = dropped, "Zone watch lagged, replaying current zones");
                if !replay(&repo, &tx, &mut known).await {
                    break;
                }
            }
            Err(WatchError::Closed) => {
                info!("Zone watch closed by backend, resubscribing");
                match resubscribe(&repo, &cancel, &mut backoff).await {
                    Some(next) => {
                        stream = next;
                        backoff.reset();
                        if !replay(&repo, &tx, &mut known).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    debug!("Zone watch stopped");
}

/// Subscribe again, retrying with backoff until it works or the watch is cancelled
async fn resubscribe(
    repo: &CertificateRepository,
    cancel: &CancellationToken,
    backoff: &mut Backoff,
) -> Option<WatchStream> {
    loop {
        let delay = backoff.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        match repo.backend().watch(ZONE_PREFIX).await {
            Ok(stream) => {
                info!(attempts = backoff.attempts(), "Zone watch resubscribed");
                return Some(stream);
            }
            Err(e) => {
                warn!(error = %e, attempt = backoff.attempts(), "Zone watch resubscribe failed");
            }
        }
    }
}

/// Send every current zone as `Updated` and every vanished one as `Deleted`
///
/// Returns false once the receiver is gone.
async fn replay(
    repo: &CertificateRepository,
    tx: &mpsc::Sender<ZoneEvent>,
    known: &mut HashSet<String>,
) -> bool {
    let zones = match repo.all_zones().await {
        Ok(zones) => zones,
        Err(e) => {
            warn!(error = %e, "Failed to replay zones");
            return true;
        }
    };

    let current: HashSet<String> = zones.iter().map(|z| z.zone.clone()).collect();
    let mut vanished: Vec<String> = known.difference(&current).cloned().collect();
    vanished.sort();
    *known = current;

    for domain in vanished {
        debug!(domain = %domain, "Zone removed while the watch was down");
        let event = ZoneEvent {
            domain,
            kind: ZoneEventKind::Deleted,
        };
        if tx.send(event).await.is_err() {
            return false;
        }
    }

    for zone in zones {
        let event = ZoneEvent {
            domain: zone.zone.clone(),
            kind: ZoneEventKind::Updated(zone),
        };
        if tx.send(event).await.is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::IssuanceMode;
    use certwarden_store::{DataStore, MemoryDataStore};
    use std::sync::Arc;
    use std::time::Duration;

    fn repo(store: Arc<MemoryDataStore>) -> CertificateRepository {
        CertificateRepository::with_resubscribe_policy(
            store,
            BackoffPolicy::new(Duration::from_millis(5), Duration::from_millis(20)),
        )
    }

    async fn next(watch: &mut ZoneWatch) -> ZoneEvent {
        tokio::time::timeout(Duration::from_secs(5), watch.recv())
            .await
            .expect("watch timed out")
            .expect("watch ended")
    }

    #[tokio::test]
    async fn test_watch_reports_updates_and_deletes() {
        let store = Arc::new(MemoryDataStore::new());
        let repo = repo(store.clone());
        let mut watch = repo.watch_zones(CancellationToken::new()).await.unwrap();

        let zone = Zone::new("a.test", IssuanceMode::Acme);
        repo.save_zone(&zone).await.unwrap();
        repo.put_cached("a.test", bytes::Bytes::from_static(b"x")).await.unwrap();
        repo.delete_zone("a.test").await.unwrap();

        let event = next(&mut watch).await;
        assert_eq!(event.domain, "a.test");
        assert_eq!(event.kind, ZoneEventKind::Updated(zone));

        let event = next(&mut watch).await;
        assert_eq!(event.kind, ZoneEventKind::Deleted);
    }

    #[tokio::test]
    async fn test_watch_resubscribes_and_replays() {
        let store = Arc::new(MemoryDataStore::new());
        let repo = repo(store.clone());
        let mut watch = repo.watch_zones(CancellationToken::new()).await.unwrap();

        repo.save_zone(&Zone::new("a.test", IssuanceMode::Acme)).await.unwrap();
        assert_eq!(next(&mut watch).await.domain, "a.test");

        store.disconnect_watchers();

        // Replay after resubscribing carries the existing zone again
        let event = next(&mut watch).await;
        assert_eq!(event.domain, "a.test");
        assert!(matches!(event.kind, ZoneEventKind::Updated(_)));

        repo.save_zone(&Zone::new("b.test", IssuanceMode::Acme)).await.unwrap();
        assert_eq!(next(&mut watch).await.domain, "b.test");
    }

    #[tokio::test]
    async fn test_delete_during_disconnect_is_reported() {
        let store = Arc::new(MemoryDataStore::new());
        let repo = repo(store.clone());
        repo.save_zone(&Zone::new("a.test", IssuanceMode::Acme)).await.unwrap();
        repo.save_zone(&Zone::new("b.test", IssuanceMode::Acme)).await.unwrap();
        let mut watch = repo.watch_zones(CancellationToken::new()).await.unwrap();

        store.disconnect_watchers();
        repo.delete_zone("a.test").await.unwrap();

        loop {
            let event = next(&mut watch).await;
            if event.domain == "a.test" && event.kind == ZoneEventKind::Deleted {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_cancel_ends_watch() {
        let store = Arc::new(MemoryDataStore::new());
        let repo = repo(store.clone());
        let parent = CancellationToken::new();
        let mut watch = repo.watch_zones(parent.clone()).await.unwrap();

        parent.cancel();
        let ended = tokio::time::timeout(Duration::from_secs(5), watch.recv()).await;
        assert_eq!(ended.unwrap(), None);
    }

    #[tokio::test]
    async fn test_undecodable_update_skipped() {
        let store = Arc::new(MemoryDataStore::new());
        let repo = repo(store.clone());
        let mut watch = repo.watch_zones(CancellationToken::new()).await.unwrap();

        store
            .put("zone/bad.test", bytes::Bytes::from_static(b"\x09"))
            .await
            .unwrap();
        repo.save_zone(&Zone::new("good.test", IssuanceMode::Acme)).await.unwrap();

        assert_eq!(next(&mut watch).await.domain, "good.test");
    }
}
