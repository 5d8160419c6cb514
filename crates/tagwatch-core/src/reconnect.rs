//! Bounded automatic reconnection.
//!
//! After an established link is lost the engine retries immediately. Only a
//! failed retry spends budget, and each further failure waits
//! `min(max_backoff, base_backoff * 2^(k-1))` where `k` counts consecutive
//! failed retries. A link that comes up again clears `k` but not the budget.
//! Once the budget is spent the tag stays disconnected until a manual connect
//! or a rediscovery resets it.

use std::collections::HashMap;
use std::time::Duration;

use tracing::{debug, info};

use crate::config::ReconnectConfig;
use crate::registry::DeviceRegistry;
use crate::types::Address;

/// Reconnect attempts granted after every deliberate connect.
pub const DEFAULT_RECONNECT_BUDGET: u8 = 5;

/// What to do after a link went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// The address is unknown.
    Ignore,
    /// Automatic reconnection is switched off.
    Disabled,
    /// Connect again after `delay`.
    Retry {
        /// Wait before connecting; zero means now.
        delay: Duration,
    },
    /// The budget is spent.
    Exhausted,
}

/// Retry-or-give-up decisions for lost links.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    enabled: bool,
    base_backoff: Duration,
    max_backoff: Duration,
    failures: HashMap<Address, u8>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

impl ReconnectPolicy {
    /// Build a policy from configuration.
    #[must_use]
    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self {
            enabled: config.enabled,
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            failures: HashMap::new(),
        }
    }

    /// Wait before the attempt following the `failures`-th consecutive failed retry.
    #[must_use]
    pub fn backoff(&self, failures: u8) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1_u32 << u32::from(failures - 1).min(16);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Refill the budget at the start of a deliberate connect.
    pub fn reset(&mut self, registry: &DeviceRegistry, address: &Address) {
        self.failures.remove(address);
        registry.update(address, |r| r.reconnect_budget = DEFAULT_RECONNECT_BUDGET);
    }

    /// Drop all state kept for a forgotten tag.
    pub fn forget(&mut self, address: &Address) {
        self.failures.remove(address);
    }

    /// Consecutive failed retries recorded for `address`.
    #[must_use]
    pub fn failures(&self, address: &Address) -> u8 {
        self.failures.get(address).copied().unwrap_or(0)
    }

    /// Decide what follows a lost link or failed attempt.
    ///
    /// `retry_failed` is true when the link that went down was itself an
    /// automatic retry that never reached Ready; only then is budget spent.
    /// Any other loss starts a fresh failure streak.
    pub fn on_disconnected(
        &mut self,
        registry: &DeviceRegistry,
        address: &Address,
        retry_failed: bool,
    ) -> ReconnectDecision {
        let Some(remaining) = registry.update(address, |r| {
            if retry_failed {
                r.reconnect_budget = r.reconnect_budget.saturating_sub(1);
            }
            r.reconnect_budget
        }) else {
            self.failures.remove(address);
            return ReconnectDecision::Ignore;
        };

        let failures = if retry_failed {
            let streak = self.failures.entry(address.clone()).or_insert(0);
            *streak = streak.saturating_add(1);
            *streak
        } else {
            self.failures.remove(address);
            0
        };

        if !self.enabled {
            return ReconnectDecision::Disabled;
        }
        if remaining == 0 {
            info!(address = %address, "Reconnect budget exhausted");
            return ReconnectDecision::Exhausted;
        }

        let delay = self.backoff(failures);
        debug!(address = %address, remaining, failures, delay_ms = delay.as_millis(), "Scheduling reconnect");
        ReconnectDecision::Retry { delay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDeviceStore;
    use crate::types::DeviceUpdate;
    use std::sync::Arc;

    fn setup() -> (DeviceRegistry, Address) {
        let registry = DeviceRegistry::new(Arc::new(MemoryDeviceStore::new()));
        let address = Address::parse("AA:BB:CC:DD:EE:01").unwrap();
        registry.upsert(&address, DeviceUpdate::default());
        (registry, address)
    }

    #[test]
    fn test_unknown_device_is_ignored() {
        let (registry, _) = setup();
        let other = Address::parse("AA:BB:CC:DD:EE:99").unwrap();
        assert_eq!(
            ReconnectPolicy::default().on_disconnected(&registry, &other, true),
            ReconnectDecision::Ignore
        );
    }

    #[test]
    fn test_first_retry_is_immediate_and_free() {
        let (registry, address) = setup();
        let decision = ReconnectPolicy::default().on_disconnected(&registry, &address, false);
        assert_eq!(decision, ReconnectDecision::Retry { delay: Duration::ZERO });
        assert_eq!(registry.get(&address).unwrap().reconnect_budget, 5);
    }

    #[test]
    fn test_budget_decrements_per_failed_retry() {
        let (registry, address) = setup();
        let mut policy = ReconnectPolicy::default();
        for n in 1..=4_u8 {
            let decision = policy.on_disconnected(&registry, &address, true);
            assert!(matches!(decision, ReconnectDecision::Retry { .. }));
            assert_eq!(registry.get(&address).unwrap().reconnect_budget, 5 - n);
        }
        assert_eq!(
            policy.on_disconnected(&registry, &address, true),
            ReconnectDecision::Exhausted
        );
        assert_eq!(registry.get(&address).unwrap().reconnect_budget, 0);

        // Never negative, no further retries.
        assert_eq!(
            policy.on_disconnected(&registry, &address, true),
            ReconnectDecision::Exhausted
        );
        assert_eq!(registry.get(&address).unwrap().reconnect_budget, 0);
    }

    #[test]
    fn test_reset_refills_budget() {
        let (registry, address) = setup();
        let mut policy = ReconnectPolicy::default();
        policy.on_disconnected(&registry, &address, true);
        policy.reset(&registry, &address);
        assert_eq!(registry.get(&address).unwrap().reconnect_budget, 5);
        assert_eq!(policy.failures(&address), 0);
    }

    #[test]
    fn test_backoff_follows_failure_streak_not_budget() {
        let (registry, address) = setup();
        let mut policy = ReconnectPolicy::from_config(&ReconnectConfig {
            enabled: true,
            base_backoff_ms: 2_000,
            max_backoff_ms: 60_000,
        });

        for wait in [2, 4, 8] {
            assert_eq!(
                policy.on_disconnected(&registry, &address, true),
                ReconnectDecision::Retry { delay: Duration::from_secs(wait) }
            );
        }
        assert_eq!(registry.get(&address).unwrap().reconnect_budget, 2);

        // The third retry got through, then the link dropped again.
        assert_eq!(
            policy.on_disconnected(&registry, &address, false),
            ReconnectDecision::Retry { delay: Duration::ZERO }
        );
        assert_eq!(policy.failures(&address), 0);

        // The budget stays spent but the wait starts over at the base.
        assert_eq!(
            policy.on_disconnected(&registry, &address, true),
            ReconnectDecision::Retry { delay: Duration::from_secs(2) }
        );
        assert_eq!(registry.get(&address).unwrap().reconnect_budget, 1);
    }

    #[test]
    fn test_forget_clears_streak() {
        let (registry, address) = setup();
        let mut policy = ReconnectPolicy::default();
        policy.on_disconnected(&registry, &address, true);
        assert_eq!(policy.failures(&address), 1);
        policy.forget(&address);
        assert_eq!(policy.failures(&address), 0);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = ReconnectPolicy::from_config(&ReconnectConfig {
            enabled: true,
            base_backoff_ms: 2_000,
            max_backoff_ms: 10_000,
        });
        assert_eq!(policy.backoff(0), Duration::ZERO);
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(3), Duration::from_secs(8));
        assert_eq!(policy.backoff(4), Duration::from_secs(10));
        assert_eq!(policy.backoff(200), Duration::from_secs(10));
    }

    #[test]
    fn test_disabled_policy() {
        let (registry, address) = setup();
        let mut policy = ReconnectPolicy::from_config(&ReconnectConfig {
            enabled: false,
            ..ReconnectConfig::default()
        });
        assert_eq!(
            policy.on_disconnected(&registry, &address, false),
            ReconnectDecision::Disabled
        );
    }
}
