//! Reconnection policy: exponential backoff with proportional jitter.
//!
//! The policy is a pure decision function. It holds no attempt counter; the
//! [`LifecycleCoordinator`](crate::coordinator::LifecycleCoordinator) owns the
//! counter and asks the policy for a verdict and a delay.
//!
//! `delay(i) = min(cap, base * 2^i) + uniform(0, jitter(i))` where
//! `jitter(i) = max(min_jitter, min(cap, base * 2^i) * jitter_ratio)`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{RealtimeError, Result};

/// Backoff configuration for one consumer type.
///
/// # Example
///
/// ```rust
/// use realtime_sync::ReconnectPolicy;
///
/// let policy = ReconnectPolicy::change_feed();
/// assert!(policy.should_retry(0));
/// let delay = policy.next_delay(2); // ~4s plus up to 1s of jitter
/// assert!(delay.as_millis() >= 4000);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Delay for the first retry, before jitter.
    /// Default: 1000ms
    pub base_delay_ms: u64,

    /// Upper bound of the exponential term.
    /// Default: 60000ms
    pub max_delay_ms: u64,

    /// Number of automatic retries before the coordinator degrades.
    /// Default: 10 (change feeds), 3 (ephemeral channels)
    pub max_attempts: u32,

    /// Jitter bound as a fraction of the exponential term.
    /// Default: 0.25
    pub jitter_ratio: f64,

    /// Lower bound of the jitter window.
    /// Default: 1000ms
    pub min_jitter_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::change_feed()
    }
}

impl ReconnectPolicy {
    /// Policy for consumers backing persistent data (notifications, audit rows).
    pub fn change_feed() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            max_attempts: 10,
            jitter_ratio: 0.25,
            min_jitter_ms: 1000,
        }
    }

    /// Policy for live-feedback channels (typing, presence): few retries,
    /// then degrade to polling.
    pub fn ephemeral() -> Self {
        Self {
            max_attempts: 3,
            ..Self::change_feed()
        }
    }

    /// Policy for best-effort HTTP publishes (presence touches).
    pub fn publish() -> Self {
        Self {
            max_attempts: 3,
            ..Self::change_feed()
        }
    }

    /// Override the attempt bound.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Override base and cap.
    pub fn with_delays_ms(mut self, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self
    }

    /// True while `attempt_index < max_attempts`.
    pub fn should_retry(&self, attempt_index: u32) -> bool {
        attempt_index < self.max_attempts
    }

    /// The capped exponential term for an attempt, without jitter.
    pub fn exponential_ms(&self, attempt_index: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt_index))
            .min(self.max_delay_ms)
    }

    /// Upper bound of the jitter added to an attempt's delay.
    pub fn jitter_ceiling_ms(&self, attempt_index: u32) -> u64 {
        let proportional = (self.exponential_ms(attempt_index) as f64 * self.jitter_ratio) as u64;
        proportional.max(self.min_jitter_ms)
    }

    /// Largest jitter any attempt can receive.
    pub fn max_jitter_ms(&self) -> u64 {
        let proportional = (self.max_delay_ms as f64 * self.jitter_ratio) as u64;
        proportional.max(self.min_jitter_ms)
    }

    /// Largest delay any attempt can produce: cap plus the jitter bound.
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms.saturating_add(self.max_jitter_ms()))
    }

    /// Randomized delay before retry number `attempt_index` (0-based).
    pub fn next_delay(&self, attempt_index: u32) -> Duration {
        let ceiling = self.jitter_ceiling_ms(attempt_index);
        let jitter = rand::rng().random_range(0..=ceiling);
        Duration::from_millis(self.exponential_ms(attempt_index).saturating_add(jitter))
    }

    /// Deterministic delay for a given jitter position in `[0, 1]`.
    pub fn delay_at(&self, attempt_index: u32, jitter_unit: f64) -> Duration {
        let unit = jitter_unit.clamp(0.0, 1.0);
        let jitter = (self.jitter_ceiling_ms(attempt_index) as f64 * unit).round() as u64;
        Duration::from_millis(self.exponential_ms(attempt_index).saturating_add(jitter))
    }

    /// Reject nonsensical settings loaded from config.
    pub fn validate(&self, context: &str) -> Result<()> {
        if self.base_delay_ms == 0 {
            return Err(RealtimeError::ConfigurationError(format!(
                "{}: base_delay_ms must be greater than 0",
                context
            )));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(RealtimeError::ConfigurationError(format!(
                "{}: max_delay_ms ({}) must be >= base_delay_ms ({})",
                context, self.max_delay_ms, self.base_delay_ms
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(RealtimeError::ConfigurationError(format!(
                "{}: jitter_ratio must be within [0, 1], got {}",
                context, self.jitter_ratio
            )));
        }
        Ok(())
    }
}

/// Policies per consumer type, as loaded from the `[reconnect]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicies {
    /// Notifications, projects and other persistent data
    pub change_feed: ReconnectPolicy,
    /// Typing indicators and inbound presence heartbeats
    pub ephemeral: ReconnectPolicy,
    /// Presence touch publishes
    pub presence: ReconnectPolicy,
}

impl Default for ReconnectPolicies {
    fn default() -> Self {
        Self {
            change_feed: ReconnectPolicy::change_feed(),
            ephemeral: ReconnectPolicy::ephemeral(),
            presence: ReconnectPolicy::publish(),
        }
    }
}

impl ReconnectPolicies {
    pub fn validate(&self) -> Result<()> {
        self.change_feed.validate("reconnect.change_feed")?;
        self.ephemeral.validate("reconnect.ephemeral")?;
        self.presence.validate("reconnect.presence")
    }
}
