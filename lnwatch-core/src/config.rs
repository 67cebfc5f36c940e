use core::cmp;
use core::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chain::interface::ConfirmationTarget;
use crate::prelude::*;
use crate::Error;

/// Default number of confirmations before an output is considered irreversibly ours
pub const ANTI_REORG_DELAY: u32 = 6;

/// Default depth of per-block history kept for reorg handling
pub const MAX_REORG_DEPTH: u32 = 100;

/// Retry schedule for failed persistence
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub initial_backoff_ms: u64,
    /// Backoff cap
    pub max_backoff_ms: u64,
    /// Consecutive failures before an update is escalated to the host
    pub escalate_after: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { initial_backoff_ms: 500, max_backoff_ms: 60_000, escalate_after: 5 }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, after `attempts` failed attempts
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        let ms = self.initial_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(cmp::min(ms, self.max_backoff_ms))
    }
}

/// Monitor configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Confirmations before an output is reported spendable
    pub anti_reorg_delay: u32,
    /// Per-block history retained for reorgs
    pub max_reorg_depth: u32,
    /// Feerate target for justice transactions
    pub justice_confirmation_target: ConfirmationTarget,
    /// Persistence retry schedule
    pub retry: RetryPolicy,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            anti_reorg_delay: ANTI_REORG_DELAY,
            max_reorg_depth: MAX_REORG_DEPTH,
            justice_confirmation_target: ConfirmationTarget::HighPriority,
            retry: RetryPolicy::default(),
        }
    }
}

impl MonitorConfig {
    /// Check that the configuration is consistent
    pub fn validate(&self) -> Result<(), Error> {
        if self.anti_reorg_delay == 0 {
            return Err(Error::InvalidArgument("anti_reorg_delay must be at least 1".to_string()));
        }
        if self.max_reorg_depth < self.anti_reorg_delay {
            return Err(Error::InvalidArgument(format!(
                "max_reorg_depth {} is below anti_reorg_delay {}",
                self.max_reorg_depth, self.anti_reorg_delay
            )));
        }
        if self.retry.initial_backoff_ms == 0
            || self.retry.max_backoff_ms < self.retry.initial_backoff_ms
        {
            return Err(Error::InvalidArgument("bad retry backoff bounds".to_string()));
        }
        Ok(())
    }
}
