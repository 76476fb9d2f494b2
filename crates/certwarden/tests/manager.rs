//! Certificate manager integration tests

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use certwarden::pki::CertificateInfo;
use certwarden::{CertError, CertificateManager, IssuanceMode, SniResolver};
use certwarden_store::MemoryDataStore;

use common::{eventually, fast_settings, manager, service, service_with, FakeAcme, SlowStore};

#[tokio::test]
async fn test_self_signed_chain_served_through_manager() {
    let svc = service(Arc::new(FakeAcme::new()));
    svc.create_self_signer("root-ca", false).await.unwrap();
    svc.create_intermediate_signer("root-ca", "inter-ca").await.unwrap();
    svc.add_zone("example.test", IssuanceMode::SelfSigned, Some("inter-ca"))
        .await
        .unwrap();
    svc.issue_certificate("example.test").await.unwrap();

    let mgr = manager(svc);
    let key = mgr.get_certificate("example.test").await.unwrap();
    assert_eq!(key.cert.len(), 3);

    let (_, leaf) = x509_parser::parse_x509_certificate(key.cert[0].as_ref()).unwrap();
    let (_, inter) = x509_parser::parse_x509_certificate(key.cert[1].as_ref()).unwrap();
    let (_, root) = x509_parser::parse_x509_certificate(key.cert[2].as_ref()).unwrap();
    assert!(leaf.verify_signature(Some(inter.public_key())).is_ok());
    assert!(inter.verify_signature(Some(root.public_key())).is_ok());
    assert!(root.verify_signature(None).is_ok());
}

#[tokio::test]
async fn test_acme_zone_served_through_manager() {
    let acme = Arc::new(FakeAcme::new());
    let svc = service(acme.clone());
    svc.add_zone("shop.test", IssuanceMode::Acme, None).await.unwrap();
    svc.issue_certificate("shop.test").await.unwrap();

    let mgr = manager(svc);
    let key = mgr.get_certificate("shop.test").await.unwrap();
    assert_eq!(key.cert.len(), 2);
    assert_eq!(acme.orders.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_invalidate_cache_reloads_new_certificate() {
    let svc = service(Arc::new(FakeAcme::new()));
    svc.add_zone("reload.test", IssuanceMode::SelfSigned, None).await.unwrap();
    svc.issue_certificate("reload.test").await.unwrap();

    let mgr = manager(svc.clone());
    let before = mgr.get_certificate("reload.test").await.unwrap();

    // Not started, so nothing refreshes the cache on its own
    svc.renew_certificate("reload.test", true).await.unwrap();
    let stale = mgr.get_certificate("reload.test").await.unwrap();
    assert_eq!(stale.cert[0], before.cert[0]);

    mgr.invalidate_cache("reload.test");
    let fresh = mgr.get_certificate("reload.test").await.unwrap();
    assert_ne!(fresh.cert[0], before.cert[0]);
}

#[tokio::test]
async fn test_renewal_loop_renews_due_zone() {
    let svc = service(Arc::new(FakeAcme::new()));
    svc.add_zone("due.test", IssuanceMode::SelfSigned, None).await.unwrap();
    let issued = svc.issue_certificate("due.test").await.unwrap();

    // Make the stored certificate look old and overdue
    let mut zone = issued.clone();
    zone.expires_at -= 3600;
    zone.renewal_due = chrono::Utc::now().timestamp() - 10;
    svc.repository().save_zone(&zone).await.unwrap();

    let mgr = manager(svc.clone());
    mgr.start().await.unwrap();

    let renewed = eventually(Duration::from_secs(5), || {
        let svc = svc.clone();
        let old = zone.clone();
        async move {
            let current = svc.repository().find_zone("due.test").await.unwrap().unwrap();
            current.expires_at > old.expires_at && current.renewal_due > old.renewal_due
        }
    })
    .await;
    assert!(renewed, "zone was not renewed by the background loop");

    let due = mgr.list_renewal().await.unwrap();
    assert!(due["due.test"] > chrono::Utc::now());
    mgr.shutdown().await;
}

#[tokio::test]
async fn test_renewal_loop_issues_missing_zone() {
    let svc = service(Arc::new(FakeAcme::new()));
    let mgr = manager(svc.clone());
    mgr.start().await.unwrap();

    svc.add_zone("late.test", IssuanceMode::SelfSigned, None).await.unwrap();

    let served = eventually(Duration::from_secs(5), || {
        let mgr = mgr.clone();
        async move { mgr.get_certificate("late.test").await.is_ok() }
    })
    .await;
    assert!(served);
    mgr.shutdown().await;
}

#[tokio::test]
async fn test_failed_renewal_backs_off_and_records_error() {
    let acme = Arc::new(FakeAcme::new());
    acme.fail.store(true, Ordering::SeqCst);
    let svc = service(acme.clone());
    svc.add_zone("broken.test", IssuanceMode::Acme, None).await.unwrap();

    let mgr = manager(svc.clone());
    mgr.start().await.unwrap();

    let recorded = eventually(Duration::from_secs(5), || {
        let svc = svc.clone();
        async move {
            let zone = svc.repository().find_zone("broken.test").await.unwrap().unwrap();
            !zone.last_error.is_empty()
        }
    })
    .await;
    assert!(recorded);

    // Backoff starts at 100ms over a 50ms tick, so retries stay well below one per tick
    tokio::time::sleep(Duration::from_millis(500)).await;
    mgr.shutdown().await;
    let attempts = acme.orders.load(Ordering::SeqCst);
    assert!(attempts >= 1);
    assert!(attempts <= 6, "too many attempts: {}", attempts);

    assert!(mgr.list_active().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_unknown_lists_unissued_zones_and_names() {
    let svc = service(Arc::new(FakeAcme::new()));
    svc.add_zone("new.test", IssuanceMode::Acme, None).await.unwrap();

    let mgr = manager(svc);
    let err = mgr.get_certificate("new.test").await.unwrap_err();
    assert!(matches!(err, CertError::NoCertificate(_)));
    let _ = mgr.get_certificate("stranger.test").await;

    let unknown = mgr.list_unknown().await.unwrap();
    assert!(unknown["new.test"].timestamp() > 0);
    assert!(unknown.contains_key("stranger.test"));

    let active = mgr.list_active().await.unwrap();
    assert!(!active.contains_key("new.test"));
}

#[tokio::test]
async fn test_slow_store_lookup_declines_within_timeout() {
    let store = Arc::new(SlowStore::new(Duration::from_millis(800)));
    let svc = service_with(store.clone(), Arc::new(FakeAcme::new()), common::acme_config());
    svc.add_zone("slow.test", IssuanceMode::SelfSigned, None).await.unwrap();
    svc.issue_certificate("slow.test").await.unwrap();

    let mut settings = fast_settings(&svc);
    settings.lookup_timeout = Duration::from_millis(50);
    let mgr = CertificateManager::with_settings(svc, settings);

    store.set_slow(true);
    let started = tokio::time::Instant::now();
    let err = mgr.get_certificate("slow.test").await.unwrap_err();
    assert!(matches!(err, CertError::NoCertificate(_)));
    assert!(started.elapsed() < Duration::from_millis(600));

    store.set_slow(false);
    assert!(mgr.get_certificate("slow.test").await.is_ok());
}

#[tokio::test]
async fn test_watch_drops_removed_zone_from_cache() {
    let svc = service(Arc::new(FakeAcme::new()));
    svc.add_zone("gone.test", IssuanceMode::SelfSigned, None).await.unwrap();
    svc.issue_certificate("gone.test").await.unwrap();

    let mgr = manager(svc.clone());
    mgr.start().await.unwrap();
    assert!(mgr.list_active().await.unwrap().contains_key("gone.test"));

    svc.remove_zone("gone.test").await.unwrap();
    let dropped = eventually(Duration::from_secs(5), || {
        let mgr = mgr.clone();
        async move { mgr.get_certificate("gone.test").await.is_err() }
    })
    .await;
    assert!(dropped);
    mgr.shutdown().await;
}

#[tokio::test]
async fn test_zone_removed_while_watch_disconnected_is_dropped() {
    let store = Arc::new(MemoryDataStore::new());
    let svc = service_with(store.clone(), Arc::new(FakeAcme::new()), common::acme_config());
    svc.add_zone("gone.test", IssuanceMode::SelfSigned, None).await.unwrap();
    svc.issue_certificate("gone.test").await.unwrap();

    let mgr = manager(svc.clone());
    mgr.start().await.unwrap();
    assert!(mgr.list_active().await.unwrap().contains_key("gone.test"));

    store.disconnect_watchers();
    svc.remove_zone("gone.test").await.unwrap();

    let dropped = eventually(Duration::from_secs(5), || {
        let mgr = mgr.clone();
        async move { mgr.get_certificate("gone.test").await.is_err() }
    })
    .await;
    assert!(dropped, "removed zone still served after the watch reconnected");
    assert!(!mgr.list_active().await.unwrap().contains_key("gone.test"));
    mgr.shutdown().await;
}

#[tokio::test]
async fn test_invalidate_during_slow_load_is_kept() {
    let store = Arc::new(SlowStore::new(Duration::from_millis(300)));
    let svc = service_with(store.clone(), Arc::new(FakeAcme::new()), common::acme_config());
    svc.add_zone("race.test", IssuanceMode::SelfSigned, None).await.unwrap();
    svc.issue_certificate("race.test").await.unwrap();

    let mut settings = fast_settings(&svc);
    settings.lookup_timeout = Duration::from_secs(2);
    let mgr = CertificateManager::with_settings(svc, settings);

    store.set_slow(true);
    let lookup = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.get_certificate("race.test").await.is_ok() }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    mgr.invalidate_cache("race.test");

    // The lookup still answers, but must not repopulate the cache
    assert!(lookup.await.unwrap());
    store.set_slow(false);
    assert!(!mgr.list_active().await.unwrap().contains_key("race.test"));
}

#[tokio::test]
async fn test_alt_name_served_by_running_manager() {
    let svc = service(Arc::new(FakeAcme::new()));
    let mgr = manager(svc.clone());
    mgr.start().await.unwrap();

    let mut zone = svc.add_zone("multi.test", IssuanceMode::SelfSigned, None).await.unwrap();
    zone.alt_names = vec!["www.multi.test".to_string(), "api.multi.test".to_string()];
    svc.repository().save_zone(&zone).await.unwrap();
    svc.issue_certificate("multi.test").await.unwrap();

    let served = eventually(Duration::from_secs(5), || {
        let mgr = mgr.clone();
        async move { mgr.get_certificate("api.multi.test").await.is_ok() }
    })
    .await;
    assert!(served);

    let key = mgr.get_certificate("www.multi.test").await.unwrap();
    let leaf = CertificateInfo::from_der(key.cert[0].as_ref()).unwrap();
    assert!(leaf.dns_names.contains(&"api.multi.test".to_string()));
    assert!(!mgr.list_unknown().await.unwrap().contains_key("www.multi.test"));

    svc.remove_zone("multi.test").await.unwrap();
    let dropped = eventually(Duration::from_secs(5), || {
        let mgr = mgr.clone();
        async move { mgr.get_certificate("www.multi.test").await.is_err() }
    })
    .await;
    assert!(dropped);
    mgr.shutdown().await;
}

#[tokio::test]
async fn test_sni_resolver_warms_after_miss() {
    let svc = service(Arc::new(FakeAcme::new()));
    svc.add_zone("sni.test", IssuanceMode::SelfSigned, None).await.unwrap();
    svc.issue_certificate("sni.test").await.unwrap();

    let mgr = manager(svc);
    let resolver = SniResolver::new(mgr);
    assert!(resolver.lookup("sni.test").is_none());

    let warmed = eventually(Duration::from_secs(5), || {
        let hit = resolver.lookup("sni.test").is_some();
        async move { hit }
    })
    .await;
    assert!(warmed);
    assert!(resolver.lookup("nobody.test").is_none());
}

#[tokio::test]
async fn test_manager_commands() {
    let svc = service(Arc::new(FakeAcme::new()));
    let mgr = manager(svc);

    let out = mgr.execute_command("add-zone", &["cmd.test", "self"]).await.unwrap();
    assert_eq!(out, "added zone cmd.test (self-signed)");
    let out = mgr.execute_command("issue", &["cmd.test"]).await.unwrap();
    assert!(out.starts_with("issued cmd.test mode=self-signed"));

    mgr.get_certificate("cmd.test").await.unwrap();
    let active = mgr.execute_command("active", &[]).await.unwrap();
    assert_eq!(active.trim(), "cmd.test");

    let renewal = mgr.execute_command("renewal", &[]).await.unwrap();
    assert!(renewal.starts_with("cmd.test due="));

    let out = mgr.execute_command("invalidate", &["cmd.test"]).await.unwrap();
    assert_eq!(out, "invalidated cmd.test");
    assert!(mgr.execute_command("active", &[]).await.unwrap().is_empty());

    let err = mgr.execute_command("bogus", &[]).await.unwrap_err();
    assert!(matches!(err, CertError::Command(_)));
}
