//! Manager commands
//!
//! Cache and status commands handled by the manager itself. Everything else
//! is forwarded to [`CertificateService::execute_command`].
//!
//! [`CertificateService::execute_command`]: crate::service::CertificateService::execute_command

use std::fmt::Write as _;

use super::CertificateManager;
use crate::error::{CertError, CertResult};
use crate::service::ServiceCommand;

const MANAGER_USAGE: &str = "\
  active
  renewal
  unknown
  invalidate <domain>";

/// A parsed manager command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerCommand {
    Active,
    Renewal,
    Unknown,
    Invalidate { domain: String },
    Service(ServiceCommand),
}

impl ManagerCommand {
    pub fn parse(command: &str, args: &[&str]) -> CertResult<Self> {
        match (command, args) {
            ("active", []) => Ok(ManagerCommand::Active),
            ("renewal", []) => Ok(ManagerCommand::Renewal),
            ("unknown", []) => Ok(ManagerCommand::Unknown),
            ("invalidate", [domain]) => Ok(ManagerCommand::Invalidate {
                domain: domain.to_string(),
            }),
            ("active" | "renewal" | "unknown" | "invalidate", _) => Err(CertError::Command(format!(
                "wrong arguments for '{}'\nusage:\n{}",
                command, MANAGER_USAGE
            ))),
            _ if ServiceCommand::is_known(command) => {
                ServiceCommand::parse(command, args).map(ManagerCommand::Service)
            }
            _ => Err(CertError::Command(format!(
                "unknown command '{}'\nusage:\n{}\n{}",
                command,
                MANAGER_USAGE,
                crate::service::SERVICE_USAGE
            ))),
        }
    }
}

impl CertificateManager {
    /// Parse and run an operator command
    pub async fn execute_command(&self, command: &str, args: &[&str]) -> CertResult<String> {
        let cmd = ManagerCommand::parse(command, args)?;
        self.run_command(cmd).await
    }

    pub async fn run_command(&self, cmd: ManagerCommand) -> CertResult<String> {
        let mut out = String::new();
        match cmd {
            ManagerCommand::Active => {
                for (domain, last_error) in self.list_active().await? {
                    let _ = match last_error {
                        Some(error) => writeln!(out, "{} error=\"{}\"", domain, error),
                        None => writeln!(out, "{}", domain),
                    };
                }
            }
            ManagerCommand::Renewal => {
                for (domain, due) in self.list_renewal().await? {
                    let _ = writeln!(out, "{} due={}", domain, due.to_rfc3339());
                }
            }
            ManagerCommand::Unknown => {
                for (domain, seen) in self.list_unknown().await? {
                    let _ = writeln!(out, "{} first_seen={}", domain, seen.to_rfc3339());
                }
            }
            ManagerCommand::Invalidate { domain } => {
                self.invalidate_cache(&domain);
                out = format!("invalidated {}", domain);
            }
            ManagerCommand::Service(cmd) => {
                let touched = match &cmd {
                    ServiceCommand::Issue { domain }
                    | ServiceCommand::Renew { domain, .. }
                    | ServiceCommand::RemoveZone { domain } => Some(domain.clone()),
                    _ => None,
                };
                out = self.inner.service.run_command(cmd).await?;
                if let Some(domain) = touched {
                    self.invalidate_cache(&domain);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_vocabulary() {
        assert_eq!(ManagerCommand::parse("active", &[]).unwrap(), ManagerCommand::Active);
        assert_eq!(
            ManagerCommand::parse("invalidate", &["a.test"]).unwrap(),
            ManagerCommand::Invalidate {
                domain: "a.test".to_string()
            }
        );
        assert_eq!(
            ManagerCommand::parse("zones", &[]).unwrap(),
            ManagerCommand::Service(ServiceCommand::Zones)
        );
    }

    #[test]
    fn test_manager_usage_errors() {
        let err = ManagerCommand::parse("invalidate", &[]).unwrap_err();
        assert!(err.to_string().contains("wrong arguments for 'invalidate'"));

        let err = ManagerCommand::parse("issue", &[]).unwrap_err();
        assert!(err.to_string().contains("wrong arguments for 'issue'"));

        let err = ManagerCommand::parse("reboot", &[]).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("unknown command 'reboot'"));
        assert!(msg.contains("invalidate <domain>"));
        assert!(msg.contains("add-zone"));
    }
}
