//! Background renewal loop
//!
//! Every tick, zones whose renewal time has passed are renewed. Zones that
//! were never issued are due immediately. At most one renewal runs per zone,
//! and a failed zone is retried on a bounded exponential backoff instead of
//! on every tick.

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use certwarden_common::{Backoff, BackoffPolicy};

use super::CertificateManager;
use crate::error::CertResult;
use crate::records::Zone;
use crate::service::RenewalOutcome;

/// Retry schedule of a zone whose last renewal failed
#[derive(Debug, Clone)]
pub(crate) struct RetryState {
    backoff: Backoff,
    next_attempt: DateTime<Utc>,
}

impl RetryState {
    fn new(policy: BackoffPolicy) -> Self {
        Self {
            backoff: Backoff::new(policy),
            next_attempt: Utc::now(),
        }
    }

    /// Push the next attempt out by the next backoff delay
    fn schedule(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = self.backoff.next_delay();
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));
        self.next_attempt = now + delay;
        self.next_attempt
    }

    pub(crate) fn next_attempt(&self) -> DateTime<Utc> {
        self.next_attempt
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.backoff.attempts()
    }
}

type RenewalResult = (String, CertResult<RenewalOutcome>);

/// Run until `cancel` fires
pub(super) async fn run(manager: CertificateManager, cancel: CancellationToken) {
    let tick = manager.inner.settings.tick;
    info!(tick_secs = tick.as_secs(), "Starting certificate renewal loop");

    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut renewals: JoinSet<RenewalResult> = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = manager.check_renewals(&mut renewals).await {
                    error!(error = %e, "Certificate renewal check failed");
                }
            }
            Some(joined) = renewals.join_next(), if !renewals.is_empty() => {
                match joined {
                    Ok((domain, result)) => manager.finish_renewal(&domain, result).await,
                    Err(e) => error!(error = %e, "Renewal task panicked"),
                }
            }
        }
    }

    if !renewals.is_empty() {
        debug!(pending = renewals.len(), "Aborting in-flight renewals");
    }
    renewals.shutdown().await;
    manager.inner.in_flight.clear();
    info!("Certificate renewal loop stopped");
}

impl CertificateManager {
    /// Spawn a renewal for every due zone that has none running
    async fn check_renewals(&self, renewals: &mut JoinSet<RenewalResult>) -> CertResult<()> {
        let zones = self.inner.service.zones().await?;
        let now = Utc::now();
        debug!(zone_count = zones.len(), "Checking zones for renewal");

        for zone in zones {
            if !self.is_due(&zone, now) {
                continue;
            }
            if self.inner.in_flight.insert(zone.zone.clone(), ()).is_some() {
                debug!(domain = %zone.zone, "Renewal already in flight");
                continue;
            }

            info!(
                domain = %zone.zone,
                issued = zone.has_certificate(),
                due = ?zone.renewal_due_at(),
                "Certificate needs renewal"
            );
            let service = self.inner.service.clone();
            renewals.spawn(async move {
                let result = service.renew_certificate(&zone.zone, false).await;
                (zone.zone, result)
            });
        }
        Ok(())
    }

    fn is_due(&self, zone: &Zone, now: DateTime<Utc>) -> bool {
        if !zone.has_certificate() && !self.inner.settings.issue_missing {
            return false;
        }
        if !zone.is_renewal_due(now) {
            return false;
        }
        match self.inner.retries.get(&zone.zone) {
            Some(retry) if retry.next_attempt() > now => {
                debug!(domain = %zone.zone, retry_at = %retry.next_attempt(), "Renewal backing off");
                false
            }
            _ => true,
        }
    }

    async fn finish_renewal(&self, domain: &str, result: CertResult<RenewalOutcome>) {
        self.inner.in_flight.remove(domain);

        match result {
            Ok(RenewalOutcome::Renewed(zone)) => {
                self.inner.retries.remove(domain);
                self.invalidate_cache(domain);
                if let Err(e) = self.load(domain).await {
                    warn!(domain = %domain, error = %e, "Failed to load renewed certificate");
                }
                info!(domain = %domain, due = ?zone.renewal_due_at(), "Certificate renewed successfully");
            }
            Ok(RenewalOutcome::NotDue(due)) => {
                self.inner.retries.remove(domain);
                debug!(domain = %domain, due = ?due, "Zone renewed elsewhere");
            }
            Err(e) => {
                let policy = self.inner.settings.backoff;
                let now = Utc::now();
                let mut retry = self
                    .inner
                    .retries
                    .entry(domain.to_string())
                    .or_insert_with(|| RetryState::new(policy));
                let retry_at = retry.schedule(now);
                error!(
                    domain = %domain,
                    error = %e,
                    attempt = retry.attempts(),
                    retry_at = %retry_at,
                    "Certificate renewal failed"
                );
            }
        }
    }
}
