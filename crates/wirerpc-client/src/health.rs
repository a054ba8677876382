use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use wirerpc_common::ClientConfig;

/// Health scoring of a single connection.
///
/// The connection driver reports every delivered response as a success and
/// every expired call as a failure; the balancer only offers connections
/// whose policy reports healthy.
pub trait HealthPolicy: Send + Sync + fmt::Debug {
    fn on_success(&self);
    fn on_failure(&self);
    fn is_healthy(&self) -> bool;
}

/// Creates a fresh policy for each new connection.
pub type HealthPolicyFactory = Arc<dyn Fn(&ClientConfig) -> Box<dyn HealthPolicy> + Send + Sync>;

/// Goes unhealthy after `threshold` consecutive failures; any success
/// resets the count.
#[derive(Debug)]
pub struct ErrorThresholdPolicy {
    threshold: u32,
    consecutive_failures: AtomicU32,
}

impl ErrorThresholdPolicy {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Uses [`ClientConfig::connect_error_threshold`].
    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.connect_error_threshold())
    }

    pub fn factory() -> HealthPolicyFactory {
        Arc::new(|config: &ClientConfig| Box::new(Self::from_config(config)) as Box<dyn HealthPolicy>)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

impl HealthPolicy for ErrorThresholdPolicy {
    fn on_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn on_failure(&self) {
        let _ = self
            .consecutive_failures
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(1));
    }

    fn is_healthy(&self) -> bool {
        self.consecutive_failures() < self.threshold
    }
}

/// Never marks a connection unhealthy.
#[derive(Debug, Default)]
pub struct AlwaysHealthy;

impl HealthPolicy for AlwaysHealthy {
    fn on_success(&self) {}
    fn on_failure(&self) {}
    fn is_healthy(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_trips_and_resets() {
        let policy = ErrorThresholdPolicy::new(3);
        policy.on_failure();
        policy.on_failure();
        assert!(policy.is_healthy());

        policy.on_failure();
        assert!(!policy.is_healthy());

        policy.on_success();
        assert!(policy.is_healthy());
        assert_eq!(policy.consecutive_failures(), 0);
    }

    #[test]
    fn test_threshold_from_config_is_split_across_connections() {
        let config = ClientConfig::default().with_connections_per_provider(4);
        assert_eq!(ErrorThresholdPolicy::from_config(&config).threshold(), 10 / 4);

        let config = ClientConfig::default().with_connections_per_provider(64);
        assert_eq!(ErrorThresholdPolicy::from_config(&config).threshold(), 1);
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let policy = ErrorThresholdPolicy::new(0);
        assert!(policy.is_healthy());
        policy.on_failure();
        assert!(!policy.is_healthy());
    }

    #[test]
    fn test_factory_builds_independent_policies() {
        let factory = ErrorThresholdPolicy::factory();
        let config = ClientConfig::default();
        let a = factory(&config);
        let b = factory(&config);
        for _ in 0..10 {
            a.on_failure();
        }
        assert!(!a.is_healthy());
        assert!(b.is_healthy());
    }

    #[test]
    fn test_always_healthy() {
        let policy = AlwaysHealthy;
        for _ in 0..100 {
            policy.on_failure();
        }
        assert!(policy.is_healthy());
    }
}
