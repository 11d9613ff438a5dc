//! Health monitoring and metrics for branches

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one branch
///
/// All fields use atomic operations; every stage of the branch holds an
/// `Arc` to the same instance.
#[derive(Debug, Default)]
pub struct BranchHealth {
    /// RTP packets that entered the branch queue
    pub packets_received: AtomicU64,

    /// Payload bytes that entered the branch queue
    pub bytes_received: AtomicU64,

    /// Access units or data units assembled by the depayload/parse stages
    pub units_assembled: AtomicU64,

    /// Units discarded (lost fragments, waiting for a keyframe, ...)
    pub units_dropped: AtomicU64,

    /// Frames or data units consumed by the sink
    pub frames_rendered: AtomicU64,

    /// Number of decode failures
    pub decode_failures: AtomicU64,
}

impl BranchHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_packet(&self, size: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_unit(&self) {
        self.units_assembled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.units_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rendered(&self) {
        self.frames_rendered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> HealthSummary {
        HealthSummary {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            units_assembled: self.units_assembled.load(Ordering::Relaxed),
            units_dropped: self.units_dropped.load(Ordering::Relaxed),
            frames_rendered: self.frames_rendered.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of branch metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthSummary {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub units_assembled: u64,
    pub units_dropped: u64,
    pub frames_rendered: u64,
    pub decode_failures: u64,
}

impl std::fmt::Display for HealthSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} packets ({} bytes), {} units ({} dropped), {} rendered, {} decode failures",
            self.packets_received,
            self.bytes_received,
            self.units_assembled,
            self.units_dropped,
            self.frames_rendered,
            self.decode_failures
        )
    }
}
