use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared pipeline counters. Every stage holds a clone of the `Arc` and
/// increments the counter for its own concern; counters only reset when a
/// new controller is initialized.
#[derive(Debug, Default)]
pub struct PipelineStats {
    frames_received: AtomicU64,
    frames_detected: AtomicU64,
    frames_analyzed: AtomicU64,
    frames_dropped: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time copy of the counters, for external consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub frames_received: u64,
    pub frames_detected: u64,
    pub frames_analyzed: u64,
    pub frames_dropped: u64,
    pub errors: u64,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frames_detected(&self, count: u64) {
        self.frames_detected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_frame_analyzed(&self) {
        self.frames_analyzed.fetch_add(1, Ordering::Relaxed);
    }

    /// Channel-full drops are tracked separately from errors: dropping is
    /// the intended backpressure behavior, not a fault.
    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_detected: self.frames_detected.load(Ordering::Relaxed),
            frames_analyzed: self.frames_analyzed.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let stats = PipelineStats::new();
        stats.record_frame_received();
        stats.record_frame_received();
        stats.record_frames_detected(2);
        stats.record_frame_dropped();
        stats.record_error();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.frames_received, 2);
        assert_eq!(snapshot.frames_detected, 2);
        assert_eq!(snapshot.frames_analyzed, 0);
        assert_eq!(snapshot.frames_dropped, 1);
        assert_eq!(snapshot.errors, 1);
    }
}
