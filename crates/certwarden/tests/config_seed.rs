//! Configuration-driven seeding and issuance

mod common;

use std::io::Write;
use std::net::IpAddr;
use std::sync::Arc;

use certwarden::pki::CertificateInfo;
use certwarden_config::Config;
use certwarden_store::MemoryDataStore;

use common::{manager, service_with, FakeAcme};

const CONFIG: &str = r#"
[acme]
email = "ops@corp.test"

[self_signed]
signer = "lab-ca"

[self_signed.desc]
organization = "Corp Lab"
country = "NL"

[[zones]]
domain = "Lab.Corp.Test"
mode = "self-signed"
alt_names = ["api.corp.test"]
ip_addresses = ["10.0.0.7"]

[[zones]]
domain = "shop.corp.test"
"#;

fn load() -> Config {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    let config = Config::from_file(file.path()).unwrap();
    config.validate().unwrap();
    config
}

#[tokio::test]
async fn test_seed_zones_is_idempotent() {
    let config = load();
    let zones = config.zones.clone();
    let svc = service_with(Arc::new(MemoryDataStore::new()), Arc::new(FakeAcme::new()), config);

    assert_eq!(svc.seed_zones(&zones).await.unwrap(), 2);
    assert_eq!(svc.seed_zones(&zones).await.unwrap(), 0);

    let names: Vec<String> = svc.zones().await.unwrap().into_iter().map(|z| z.zone).collect();
    assert_eq!(names, vec!["lab.corp.test".to_string(), "shop.corp.test".to_string()]);
}

#[tokio::test]
async fn test_seeded_self_signed_zone_uses_config() {
    let config = load();
    let zones = config.zones.clone();
    let svc = service_with(Arc::new(MemoryDataStore::new()), Arc::new(FakeAcme::new()), config);
    svc.seed_zones(&zones).await.unwrap();

    svc.issue_certificate("lab.corp.test").await.unwrap();
    let signers: Vec<String> = svc.signers().await.unwrap().into_iter().map(|s| s.name).collect();
    assert_eq!(signers, vec!["lab-ca".to_string(), "lab-ca-intermediate".to_string()]);

    let mgr = manager(svc);
    let key = mgr.get_certificate("lab.corp.test").await.unwrap();
    assert_eq!(key.cert.len(), 3);

    let leaf = CertificateInfo::from_der(key.cert[0].as_ref()).unwrap();
    assert!(leaf.dns_names.contains(&"lab.corp.test".to_string()));
    assert!(leaf.dns_names.contains(&"api.corp.test".to_string()));
    assert!(leaf.ip_addresses.contains(&"10.0.0.7".parse::<IpAddr>().unwrap()));

    let (_, parsed) = x509_parser::parse_x509_certificate(key.cert[0].as_ref()).unwrap();
    let org = parsed.subject().iter_organization().next().unwrap();
    assert_eq!(org.as_str().unwrap(), "Corp Lab");
}
