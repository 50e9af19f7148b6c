//! Reconnect policy for relay subscriptions

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Default pause between subscription attempts
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Fixed-interval retry that stops once its scope is cancelled
///
/// There are only a handful of relays per node, so a constant short pause
/// recovers faster than exponential backoff.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    scope: CancellationToken,
    interval: Duration,
}

impl ReconnectPolicy {
    pub fn new(scope: CancellationToken, interval: Duration) -> Self {
        Self { scope, interval }
    }

    /// Pause before the next attempt, `None` once the scope is cancelled
    pub fn next_interval(&self) -> Option<Duration> {
        if self.scope.is_cancelled() {
            return None;
        }
        Some(self.interval)
    }

    /// No state to reset; the policy only watches its scope
    pub fn reset(&mut self) {}

    /// Wait out the next interval; returns false if the scope ended first
    pub async fn wait(&self) -> bool {
        let Some(interval) = self.next_interval() else {
            return false;
        };
        tokio::select! {
            _ = self.scope.cancelled() => false,
            _ = tokio::time::sleep(interval) => !self.scope.is_cancelled(),
        }
    }
}
