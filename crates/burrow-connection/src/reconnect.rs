//! Exponential backoff for agents that redial a broker after losing it

use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Backoff policy
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// None = retry forever
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ReconnectError {
    #[error("Gave up after {0} reconnection attempts")]
    MaxAttemptsReached(usize),

    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Tracks the delay before the next attempt
#[derive(Debug)]
pub struct Backoff {
    policy: ReconnectPolicy,
    next_delay: Duration,
    attempt: usize,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            next_delay: policy.initial_delay,
            policy,
            attempt: 0,
        }
    }

    /// Consume one attempt and return how long to wait before it
    pub fn next_delay(&mut self) -> Result<Duration, ReconnectError> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempt >= max {
                return Err(ReconnectError::MaxAttemptsReached(max));
            }
        }

        self.attempt += 1;
        let delay = self.next_delay;
        let grown = delay.as_secs_f64() * self.policy.multiplier;
        self.next_delay = Duration::from_secs_f64(grown).min(self.policy.max_delay);
        Ok(delay)
    }

    /// Sleep for the next delay unless `cancel` fires first
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), ReconnectError> {
        let delay = self.next_delay()?;
        debug!(
            attempt = self.attempt,
            delay_ms = delay.as_millis() as u64,
            "Waiting before reconnecting"
        );

        tokio::select! {
            _ = cancel.cancelled() => Err(ReconnectError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Call after a connection has been established
    pub fn reset(&mut self) {
        self.next_delay = self.policy.initial_delay;
        self.attempt = 0;
    }

    pub fn attempt(&self) -> usize {
        self.attempt
    }
}
