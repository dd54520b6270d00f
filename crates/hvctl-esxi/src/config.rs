//! Service configuration: cache TTL, timeouts, retry policy, VM limits.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Behavioural settings for [`crate::service::InventoryService`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    /// Inventory snapshot lifetime in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// Default per-call timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Consecutive failed calls after which the session is torn down
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub vm_limits: VmLimits,
}

fn default_cache_ttl() -> u64 { 30 }
fn default_request_timeout() -> u64 { 30 }
fn default_max_failures() -> u32 { 5 }

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl(),
            request_timeout_secs: default_request_timeout(),
            max_consecutive_failures: default_max_failures(),
            retry: RetryPolicy::default(),
            vm_limits: VmLimits::default(),
        }
    }
}

impl ServiceConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Exponential backoff policy shared by login and remote operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay after the first failed attempt, in milliseconds (default: 500)
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    /// Upper bound for a single delay, in milliseconds (default: 20 000)
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    /// Add up to 50% random jitter on top of each delay
    #[serde(default)]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 20_000 }

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (0-based).
    ///
    /// Doubles per attempt up to `max_backoff_ms`. Jitter is added on top of
    /// the doubled base, so uncapped delays still strictly increase.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponential = self
            .initial_backoff_ms
            .saturating_mul(2u64.saturating_pow(attempt));
        let capped = exponential.min(self.max_backoff_ms);

        let delay = if self.jitter && capped > 1 {
            use rand::Rng;
            let spread = capped / 2;
            capped.saturating_add(rand::thread_rng().gen_range(0..=spread))
                .min(self.max_backoff_ms)
        } else {
            capped
        };
        Duration::from_millis(delay)
    }

    /// At least one attempt is always made.
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Local limits enforced on VM create specs before any remote call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VmLimits {
    #[serde(default = "default_max_cpu")]
    pub max_cpu_count: u32,
    #[serde(default = "default_max_memory")]
    pub max_memory_mib: u64,
}

fn default_max_cpu() -> u32 { 128 }
// 6 TiB
fn default_max_memory() -> u64 { 6 * 1024 * 1024 }

impl Default for VmLimits {
    fn default() -> Self {
        Self {
            max_cpu_count: default_max_cpu(),
            max_memory_mib: default_max_memory(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.cache_ttl(), Duration::from_secs(30));
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.max_consecutive_failures, 5);
    }

    #[test]
    fn deserialize_partial_json() {
        let cfg: ServiceConfig =
            serde_json::from_str(r#"{"cacheTtlSecs":5,"retry":{"maxAttempts":4}}"#).unwrap();
        assert_eq!(cfg.cache_ttl_secs, 5);
        assert_eq!(cfg.retry.max_attempts, 4);
        assert_eq!(cfg.retry.initial_backoff_ms, 500);
        assert_eq!(cfg.request_timeout_secs, 30);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 500,
            max_backoff_ms: 3_000,
            jitter: false,
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(500));
        assert_eq!(policy.backoff(1), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2_000));
        assert_eq!(policy.backoff(3), Duration::from_millis(3_000));
        assert_eq!(policy.backoff(40), Duration::from_millis(3_000));
    }

    #[test]
    fn jittered_backoff_still_increases() {
        let policy = RetryPolicy { jitter: true, ..RetryPolicy::default() };
        for _ in 0..50 {
            let d0 = policy.backoff(0);
            let d1 = policy.backoff(1);
            let d2 = policy.backoff(2);
            assert!(d0 >= Duration::from_millis(500) && d0 <= Duration::from_millis(750));
            assert!(d0 < d1 && d1 < d2);
        }
    }

    #[test]
    fn zero_attempts_means_one() {
        let policy = RetryPolicy { max_attempts: 0, ..RetryPolicy::default() };
        assert_eq!(policy.attempts(), 1);
    }
}
