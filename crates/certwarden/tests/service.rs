//! Certificate service integration tests

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use certwarden::{CertError, IssuanceMode, RenewalOutcome};

use common::{service, FakeAcme};

#[tokio::test]
async fn test_account_creation_is_idempotent_across_commands() {
    let acme = Arc::new(FakeAcme::new());
    let svc = service(acme.clone());

    let first = svc.execute_command("create-account", &["admin@corp.test"]).await.unwrap();
    let second = svc.execute_command("create-account", &["Admin@Corp.test"]).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(acme.registrations.load(Ordering::SeqCst), 1);

    let accounts = svc.execute_command("accounts", &[]).await.unwrap();
    assert_eq!(accounts.trim(), "admin@corp.test status=valid");
}

#[tokio::test]
async fn test_signer_commands_build_hierarchy() {
    let svc = service(Arc::new(FakeAcme::new()));

    let out = svc
        .execute_command("create-signer", &["corp", "--with-inter"])
        .await
        .unwrap();
    assert_eq!(out, "created signers: corp, corp-intermediate");

    let out = svc.execute_command("create-inter", &["corp", "team"]).await.unwrap();
    assert_eq!(out, "created signer team under corp");

    let signers = svc.execute_command("signers", &[]).await.unwrap();
    let lines: Vec<&str> = signers.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines.contains(&"corp parent=-"));
    assert!(lines.contains(&"team parent=corp"));
}

#[tokio::test]
async fn test_client_certificate_command() {
    let svc = service(Arc::new(FakeAcme::new()));
    svc.create_self_signer("corp", false).await.unwrap();

    let out = svc
        .execute_command("client-cert", &["corp", "alice", "s3cret"])
        .await
        .unwrap();
    assert!(out.starts_with("issued client certificate"));
    assert!(out.contains("-----BEGIN CERTIFICATE-----"));

    let err = svc
        .execute_command("client-cert", &["missing", "alice", "s3cret"])
        .await
        .unwrap_err();
    assert!(matches!(err, CertError::Issuance(_)));
}

#[tokio::test]
async fn test_renew_not_due_and_forced() {
    let svc = service(Arc::new(FakeAcme::new()));
    svc.add_zone("renew.test", IssuanceMode::SelfSigned, None).await.unwrap();
    let issued = svc.issue_certificate("renew.test").await.unwrap();

    match svc.renew_certificate("renew.test", false).await.unwrap() {
        RenewalOutcome::NotDue(due) => assert_eq!(due, issued.renewal_due_at()),
        other => panic!("unexpected outcome {:?}", other),
    }

    let out = svc.execute_command("renew", &["renew.test", "--force"]).await.unwrap();
    assert!(out.starts_with("renewed renew.test"));
}

#[tokio::test]
async fn test_failed_issuance_keeps_previous_certificate() {
    let acme = Arc::new(FakeAcme::new());
    let svc = service(acme.clone());
    svc.add_zone("keep.test", IssuanceMode::Acme, None).await.unwrap();
    let issued = svc.issue_certificate("keep.test").await.unwrap();

    acme.fail.store(true, Ordering::SeqCst);
    let err = svc.renew_certificate("keep.test", true).await.unwrap_err();
    assert!(matches!(err, CertError::Challenge(_)));

    let zone = svc.repository().find_zone("keep.test").await.unwrap().unwrap();
    assert_eq!(zone.expires_at, issued.expires_at);
    assert_eq!(zone.certificate, issued.certificate);
    assert!(zone.last_error.contains("validation failed"));
    assert!(svc.cache().get("keep.test").await.unwrap().is_some());
}

#[tokio::test]
async fn test_zone_lifecycle_commands() {
    let svc = service(Arc::new(FakeAcme::new()));

    svc.execute_command("add-zone", &["life.test", "acme", "owner@corp.test"])
        .await
        .unwrap();
    let err = svc
        .execute_command("add-zone", &["life.test", "acme"])
        .await
        .unwrap_err();
    assert!(matches!(err, CertError::Command(_)));

    let zones = svc.execute_command("zones", &[]).await.unwrap();
    assert!(zones.starts_with("life.test mode=acme expires=-"));

    svc.execute_command("remove-zone", &["life.test"]).await.unwrap();
    assert!(svc.execute_command("zones", &[]).await.unwrap().is_empty());
}
