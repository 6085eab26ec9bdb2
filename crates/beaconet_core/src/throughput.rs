use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

const EMA_ALPHA: f64 = 0.25;

#[derive(Default)]
struct ThroughputState {
    ema_bps: f64,
    samples: u64,
}

/// Per-peer throughput estimate: exponential moving average over
/// (bytes, elapsed) samples from completed responses.
#[derive(Default)]
pub struct ThroughputEstimator {
    state: Mutex<ThroughputState>,
    // Published copies so readers never take the lock.
    bytes_per_second: AtomicU64,
    sample_count: AtomicU64,
}

impl ThroughputEstimator {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn record(&self, bytes: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0. {
            return;
        }
        let sample_bps = bytes as f64 / secs;
        let mut g = self.state.lock();
        g.ema_bps = if g.samples == 0 {
            sample_bps
        } else {
            g.ema_bps * (1. - EMA_ALPHA) + sample_bps * EMA_ALPHA
        };
        g.samples += 1;
        self.bytes_per_second
            .store(g.ema_bps as u64, Ordering::Relaxed);
        self.sample_count.store(g.samples, Ordering::Relaxed);
    }

    pub fn bps(&self) -> u64 {
        self.bytes_per_second.load(Ordering::Relaxed)
    }

    pub fn samples(&self) -> u64 {
        self.sample_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_sample_sets_estimate() {
        let t = ThroughputEstimator::new();
        assert_eq!(t.bps(), 0);
        t.record(1000, Duration::from_secs(1));
        assert_eq!(t.bps(), 1000);
        assert_eq!(t.samples(), 1);
    }

    #[test]
    fn test_ema_moves_toward_new_samples() {
        let t = ThroughputEstimator::new();
        t.record(1000, Duration::from_secs(1));
        t.record(2000, Duration::from_secs(1));
        let bps = t.bps();
        assert!(bps > 1000 && bps < 2000, "bps={bps}");
        assert_eq!(t.samples(), 2);
    }

    #[test]
    fn test_zero_elapsed_ignored() {
        let t = ThroughputEstimator::new();
        t.record(1000, Duration::ZERO);
        assert_eq!(t.samples(), 0);
    }
}
