//! Renewal scheduling and handshake-path configuration.

use std::time::Duration;

use certwarden_common::BackoffPolicy;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// When to renew and how to back off after failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct RenewalConfig {
    /// Fraction of the validity window after which renewal is due
    #[serde(default = "default_fraction")]
    #[validate(range(min = 0.1, max = 0.95))]
    pub fraction: f64,

    /// How often the scheduler looks for due zones
    #[serde(default = "default_tick_secs")]
    #[validate(range(min = 1, max = 86400))]
    pub tick_secs: u64,

    /// Delay before the first retry of a failed renewal
    #[serde(default = "default_initial_backoff_secs")]
    #[validate(range(min = 1))]
    pub initial_backoff_secs: u64,

    /// Cap for retry delays
    #[serde(default = "default_max_backoff_secs")]
    #[validate(range(min = 1))]
    pub max_backoff_secs: u64,

    /// Growth factor between retries
    #[serde(default = "default_backoff_multiplier")]
    #[validate(range(min = 1.0, max = 10.0))]
    pub backoff_multiplier: f64,

    /// Relative jitter applied to retry delays
    #[serde(default = "default_jitter")]
    #[validate(range(min = 0.0, max = 0.5))]
    pub jitter: f64,

    /// Issue certificates for zones that have never been issued
    #[serde(default = "default_issue_missing")]
    pub issue_missing: bool,
}

fn default_fraction() -> f64 { 2.0 / 3.0 }
fn default_tick_secs() -> u64 { 30 }
fn default_initial_backoff_secs() -> u64 { 60 }
fn default_max_backoff_secs() -> u64 { 3600 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_jitter() -> f64 { 0.1 }
fn default_issue_missing() -> bool { true }

impl Default for RenewalConfig {
    fn default() -> Self {
        Self {
            fraction: default_fraction(),
            tick_secs: default_tick_secs(),
            initial_backoff_secs: default_initial_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
            issue_missing: default_issue_missing(),
        }
    }
}

impl RenewalConfig {
    /// Scheduler tick
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    /// Retry policy for failed renewals
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_secs(self.initial_backoff_secs),
            max: Duration::from_secs(self.max_backoff_secs),
            multiplier: self.backoff_multiplier,
            jitter: self.jitter,
        }
    }
}

/// Handshake-path settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    /// Bound on store reads made while answering a handshake
    #[serde(default = "default_lookup_timeout_ms")]
    #[validate(range(min = 1, max = 10000))]
    pub lookup_timeout_ms: u64,

    /// Maximum number of unrecognised server names remembered
    #[serde(default = "default_unknown_capacity")]
    #[validate(range(max = 100000))]
    pub unknown_capacity: usize,
}

fn default_lookup_timeout_ms() -> u64 { 250 }
fn default_unknown_capacity() -> usize { 1024 }

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            lookup_timeout_ms: default_lookup_timeout_ms(),
            unknown_capacity: default_unknown_capacity(),
        }
    }
}

impl ManagerConfig {
    /// Lookup timeout
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}
