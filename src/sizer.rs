//! Dynamic chunk-size controller.
//!
//! A pure function of observed per-chunk upload latency: no transport
//! state leaks in, which keeps the controller independently testable.

use std::time::Duration;

/// Latency-driven controller for the nominal chunk size.
///
/// The current size only applies to chunks that have not started; in-flight
/// chunks keep the size they were planned with.
#[derive(Debug, Clone)]
pub struct ChunkSizer {
    current: u64,
    min: u64,
    max: u64,
    target: Duration,
}

impl ChunkSizer {
    pub fn new(initial: u64, min: u64, max: u64, target_ms: u64) -> Self {
        let max = max.max(min);
        Self {
            current: initial.clamp(min, max),
            min,
            max,
            target: Duration::from_millis(target_ms),
        }
    }

    /// Current nominal chunk size in bytes
    pub fn current(&self) -> u64 {
        self.current
    }

    /// Force the nominal size, e.g. after the server renegotiates it
    pub fn set_current(&mut self, size: u64) {
        self.current = size.clamp(self.min, self.max);
    }

    /// Feed one observed chunk upload wall time.
    ///
    /// Under half the target doubles the size, over 1.5x the target halves
    /// it, anything in between leaves it unchanged. The result stays within
    /// the configured bounds.
    pub fn observe(&mut self, elapsed: Duration) {
        let target_ms = self.target.as_millis() as u64;
        let elapsed_ms = elapsed.as_millis() as u64;

        if elapsed_ms * 2 < target_ms {
            self.current = (self.current * 2).min(self.max);
        } else if elapsed_ms * 2 > target_ms * 3 {
            self.current = (self.current / 2).max(self.min);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};

    fn sizer() -> ChunkSizer {
        ChunkSizer::new(1024 * 1024, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE, 3000)
    }

    #[test]
    fn fast_chunks_double_the_size() {
        let mut s = sizer();
        s.observe(Duration::from_millis(1000));
        assert_eq!(s.current(), 2 * 1024 * 1024);
    }

    #[test]
    fn slow_chunks_halve_the_size() {
        let mut s = sizer();
        s.observe(Duration::from_millis(5000));
        assert_eq!(s.current(), 512 * 1024);
    }

    #[test]
    fn on_target_leaves_the_size_unchanged() {
        let mut s = sizer();
        for ms in [1500, 3000, 4500] {
            s.observe(Duration::from_millis(ms));
            assert_eq!(s.current(), 1024 * 1024);
        }
    }

    #[test]
    fn size_never_leaves_the_bounds() {
        let mut s = sizer();
        for _ in 0..20 {
            s.observe(Duration::from_millis(1));
        }
        assert_eq!(s.current(), MAX_CHUNK_SIZE);
        for _ in 0..20 {
            s.observe(Duration::from_secs(60));
        }
        assert_eq!(s.current(), MIN_CHUNK_SIZE);
    }

    #[test]
    fn bounds_hold_for_arbitrary_latency_sequences() {
        let mut s = sizer();
        let latencies = [1u64, 10_000, 3, 8_000, 2_999, 4_501, 1_499, 100_000, 0];
        for ms in latencies {
            s.observe(Duration::from_millis(ms));
            assert!(s.current() >= MIN_CHUNK_SIZE);
            assert!(s.current() <= MAX_CHUNK_SIZE);
        }
    }

    #[test]
    fn initial_size_is_clamped() {
        let s = ChunkSizer::new(1, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE, 3000);
        assert_eq!(s.current(), MIN_CHUNK_SIZE);
        let s = ChunkSizer::new(u64::MAX, MIN_CHUNK_SIZE, MAX_CHUNK_SIZE, 3000);
        assert_eq!(s.current(), MAX_CHUNK_SIZE);
    }

    #[test]
    fn renegotiated_size_is_clamped() {
        let mut s = sizer();
        s.set_current(64 * 1024);
        assert_eq!(s.current(), MIN_CHUNK_SIZE);
    }
}
