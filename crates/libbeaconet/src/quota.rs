use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use leaky_bucket::RateLimiter;

/// Token bucket for inbound request servicing. One token per request;
/// the bucket refills completely over the replenish window.
pub struct RequestQuota {
    limiter: RateLimiter,
}

impl RequestQuota {
    pub fn new(capacity: usize, full_replenish_time: Duration) -> Self {
        let capacity = capacity.max(1);
        RequestQuota {
            limiter: RateLimiter::builder()
                .initial(capacity)
                .max(capacity)
                .refill(1)
                .interval(full_replenish_time / capacity as u32)
                .fair(true)
                .build(),
        }
    }

    /// Non-blocking; the caller that gets `false` awaits via [`consume`]
    /// and records the throttle.
    pub fn try_consume(&self) -> bool {
        self.limiter.try_acquire(1)
    }

    pub async fn consume(&self) {
        self.limiter.acquire(1).await
    }

    pub fn balance(&self) -> usize {
        self.limiter.balance()
    }
}

/// Requests delayed by quota, tagged by short protocol id.
#[derive(Default)]
pub struct ThrottleCounters {
    by_protocol: DashMap<&'static str, AtomicU64>,
}

impl ThrottleCounters {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn increment(&self, short_id: &'static str) {
        self.by_protocol
            .entry(short_id)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, short_id: &str) -> u64 {
        self.by_protocol
            .get(short_id)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        let mut out: Vec<_> = self
            .by_protocol
            .iter()
            .map(|e| (*e.key(), e.value().load(Ordering::Relaxed)))
            .collect();
        out.sort_unstable();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_capacity_then_throttled() {
        let q = RequestQuota::new(4, Duration::from_secs(5));
        for _ in 0..4 {
            assert!(q.try_consume());
        }
        assert!(!q.try_consume());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replenishes_over_window() {
        let q = RequestQuota::new(10, Duration::from_secs(5));
        while q.try_consume() {}
        tokio::time::sleep(Duration::from_secs(5)).await;
        let mut available = 0;
        while q.try_consume() {
            available += 1;
        }
        assert_eq!(available, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_consume_waits_for_token() {
        let q = RequestQuota::new(1, Duration::from_secs(1));
        assert!(q.try_consume());
        let start = tokio::time::Instant::now();
        q.consume().await;
        assert!(start.elapsed() >= Duration::from_millis(900));
    }

    #[test]
    fn test_throttle_counters() {
        let c = ThrottleCounters::new();
        c.increment("blocks_root");
        c.increment("blocks_root");
        c.increment("ping");
        assert_eq!(c.get("blocks_root"), 2);
        assert_eq!(c.get("ping"), 1);
        assert_eq!(c.get("status"), 0);
        assert_eq!(c.snapshot(), vec![("blocks_root", 2), ("ping", 1)]);
    }
}
