use std::{sync::Arc, time::Duration};

use crate::config::{Config, ReconnectMode};

/// Decides whether and when a recoverable close is followed by a new start.
pub trait ReconnectPolicy: Send + Sync {
    /// `attempt` counts consecutive reconnects since the last `open`, starting at 1.
    /// `None` gives up and the session becomes fatal.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;
}

/// Reconnect at once, forever.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImmediateRetry;

impl ReconnectPolicy for ImmediateRetry {
    fn next_delay(&self, _attempt: u32) -> Option<Duration> {
        Some(Duration::ZERO)
    }
}

/// `base * 2^(attempt-1)`, capped at `max`. `max_attempts == 0` means unlimited.
#[derive(Clone, Copy, Debug)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if self.max_attempts > 0 && attempt > self.max_attempts {
            return None;
        }
        let shift = attempt.saturating_sub(1).min(16);
        let base_ms = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let delay = Duration::from_millis(base_ms.saturating_mul(1_u64 << shift));
        Some(delay.min(self.max))
    }
}

pub fn from_config(cfg: &Config) -> Arc<dyn ReconnectPolicy> {
    match cfg.reconnect_mode {
        ReconnectMode::Immediate => Arc::new(ImmediateRetry),
        ReconnectMode::Backoff => Arc::new(ExponentialBackoff {
            base: cfg.reconnect_base,
            max: cfg.reconnect_max,
            max_attempts: cfg.reconnect_max_attempts,
        }),
    }
}
