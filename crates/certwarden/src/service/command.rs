//! Operator commands
//!
//! A textual `command + args` surface over the service. Every command
//! returns a human-readable result or a [`CertError::Command`] carrying usage
//! text when the arguments are malformed.

use std::fmt::Write as _;

use super::{CertificateService, RenewalOutcome};
use crate::error::{CertError, CertResult};
use crate::records::{from_unix, IssuanceMode, Zone};

pub(crate) const SERVICE_USAGE: &str = "\
  create-account <email>
  create-signer <common-name> [--with-inter]
  create-inter <parent> <name>
  client-cert <signer> <common-name> <password>
  add-zone <domain> <acme|self> [email-or-signer]
  remove-zone <domain>
  issue <domain>
  renew <domain> [--force]
  zones
  signers
  accounts";

/// A parsed service command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCommand {
    CreateAccount { email: String },
    CreateSigner { common_name: String, with_intermediate: bool },
    CreateInter { parent: String, name: String },
    ClientCert { signer: String, common_name: String, password: String },
    AddZone { domain: String, mode: IssuanceMode, owner: Option<String> },
    RemoveZone { domain: String },
    Issue { domain: String },
    Renew { domain: String, force: bool },
    Zones,
    Signers,
    Accounts,
}

impl ServiceCommand {
    pub fn parse(command: &str, args: &[&str]) -> CertResult<Self> {
        let cmd = match (command, args) {
            ("create-account", [email]) => ServiceCommand::CreateAccount {
                email: email.to_string(),
            },
            ("create-signer", [cn]) => ServiceCommand::CreateSigner {
                common_name: cn.to_string(),
                with_intermediate: false,
            },
            ("create-signer", [cn, "--with-inter"]) => ServiceCommand::CreateSigner {
                common_name: cn.to_string(),
                with_intermediate: true,
            },
            ("create-inter", [parent, name]) => ServiceCommand::CreateInter {
                parent: parent.to_string(),
                name: name.to_string(),
            },
            ("client-cert", [signer, cn, password]) => ServiceCommand::ClientCert {
                signer: signer.to_string(),
                common_name: cn.to_string(),
                password: password.to_string(),
            },
            ("add-zone", [domain, mode, rest @ ..]) if rest.len() <= 1 => {
                let mode = IssuanceMode::from_str_loose(mode).ok_or_else(|| {
                    CertError::Command(format!("unknown mode '{}', expected acme or self", mode))
                })?;
                ServiceCommand::AddZone {
                    domain: domain.to_string(),
                    mode,
                    owner: rest.first().map(|s| s.to_string()),
                }
            }
            ("remove-zone", [domain]) => ServiceCommand::RemoveZone {
                domain: domain.to_string(),
            },
            ("issue", [domain]) => ServiceCommand::Issue {
                domain: domain.to_string(),
            },
            ("renew", [domain]) => ServiceCommand::Renew {
                domain: domain.to_string(),
                force: false,
            },
            ("renew", [domain, "--force"]) => ServiceCommand::Renew {
                domain: domain.to_string(),
                force: true,
            },
            ("zones", []) => ServiceCommand::Zones,
            ("signers", []) => ServiceCommand::Signers,
            ("accounts", []) => ServiceCommand::Accounts,
            _ => return Err(usage_error(command)),
        };
        Ok(cmd)
    }

    /// Whether `command` names a service command, regardless of arity
    pub fn is_known(command: &str) -> bool {
        SERVICE_USAGE
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .any(|name| name == command)
    }
}

fn usage_error(command: &str) -> CertError {
    if ServiceCommand::is_known(command) {
        CertError::Command(format!("wrong arguments for '{}'\nusage:\n{}", command, SERVICE_USAGE))
    } else {
        CertError::Command(format!("unknown command '{}'\nusage:\n{}", command, SERVICE_USAGE))
    }
}

impl CertificateService {
    /// Parse and run an operator command
    pub async fn execute_command(&self, command: &str, args: &[&str]) -> CertResult<String> {
        let cmd = ServiceCommand::parse(command, args)?;
        self.run_command(cmd).await
    }

    pub async fn run_command(&self, cmd: ServiceCommand) -> CertResult<String> {
        match cmd {
            ServiceCommand::CreateAccount { email } => {
                let account = self.create_acme_account(&email).await?;
                let uri = account
                    .registration
                    .as_ref()
                    .map(|r| r.uri.as_str())
                    .unwrap_or_default();
                Ok(format!("account {} registered at {}", account.email, uri))
            }
            ServiceCommand::CreateSigner {
                common_name,
                with_intermediate,
            } => {
                let created = self.create_self_signer(&common_name, with_intermediate).await?;
                let names: Vec<&str> = created.iter().map(|s| s.name.as_str()).collect();
                Ok(format!("created signers: {}", names.join(", ")))
            }
            ServiceCommand::CreateInter { parent, name } => {
                let signer = self.create_intermediate_signer(&parent, &name).await?;
                Ok(format!("created signer {} under {}", signer.name, signer.issuer))
            }
            ServiceCommand::ClientCert {
                signer,
                common_name,
                password,
            } => {
                let client = self
                    .issue_client_certificate(&signer, &common_name, &password)
                    .await?;
                let info = client.certificate.info();
                Ok(format!(
                    "issued client certificate {} (serial {}, expires {}, PKCS#12 {} bytes)\n{}",
                    info.subject,
                    info.serial,
                    info.not_after.to_rfc3339(),
                    client.pkcs12.len(),
                    client.certificate.cert_pem()
                ))
            }
            ServiceCommand::AddZone {
                domain,
                mode,
                owner,
            } => {
                let zone = self.add_zone(&domain, mode, owner.as_deref()).await?;
                Ok(format!("added zone {} ({})", zone.zone, mode.as_str()))
            }
            ServiceCommand::RemoveZone { domain } => {
                self.remove_zone(&domain).await?;
                Ok(format!("removed zone {}", domain))
            }
            ServiceCommand::Issue { domain } => {
                let zone = self.issue_certificate(&domain).await?;
                Ok(format!("issued {}", describe_zone(&zone)))
            }
            ServiceCommand::Renew { domain, force } => {
                match self.renew_certificate(&domain, force).await? {
                    RenewalOutcome::Renewed(zone) => Ok(format!("renewed {}", describe_zone(&zone))),
                    RenewalOutcome::NotDue(due) => Ok(format!(
                        "{} not due for renewal until {}",
                        domain,
                        due.map(|d| d.to_rfc3339()).unwrap_or_else(|| "-".to_string())
                    )),
                }
            }
            ServiceCommand::Zones => {
                let zones = self.zones().await?;
                let mut out = String::new();
                for zone in &zones {
                    let _ = writeln!(out, "{}", describe_zone(zone));
                }
                Ok(out)
            }
            ServiceCommand::Signers => {
                let mut out = String::new();
                for signer in self.signers().await? {
                    let parent = if signer.is_root() { "-" } else { signer.issuer.as_str() };
                    let _ = writeln!(out, "{} parent={}", signer.name, parent);
                }
                Ok(out)
            }
            ServiceCommand::Accounts => {
                let mut out = String::new();
                for account in self.accounts().await? {
                    let status = account
                        .registration
                        .as_ref()
                        .map(|r| r.status.as_str())
                        .unwrap_or("unknown");
                    let _ = writeln!(out, "{} status={}", account.email, status);
                }
                Ok(out)
            }
        }
    }
}

/// One-line summary of a zone
pub(crate) fn describe_zone(zone: &Zone) -> String {
    let stamp = |secs: i64| {
        from_unix(secs)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string())
    };
    let mut line = format!(
        "{} mode={} expires={} renewal_due={}",
        zone.zone,
        zone.mode().as_str(),
        stamp(zone.expires_at),
        stamp(zone.renewal_due)
    );
    if !zone.last_error.is_empty() {
        let _ = write!(line, " error=\"{}\"", zone.last_error);
    }
    line
}
