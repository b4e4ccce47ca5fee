use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Source of hybrid timestamps (microseconds). The real clock lives in the
/// tablet server; consensus only needs "now" for lease bookkeeping and for
/// stamping replicated operations, so the seam is a single method.
pub trait HybridClock: Send + Sync + 'static {
    /// Current hybrid time in microseconds since the epoch.
    fn now_ht(&self) -> u64;
}

/// Wall-clock-backed implementation, adequate outside the storage engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHybridClock;

impl HybridClock for SystemHybridClock {
    fn now_ht(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards")
            .as_micros() as u64
    }
}

/// A clock that only moves when told to; test-only determinism.
#[derive(Debug, Default)]
pub struct ManualHybridClock {
    now: std::sync::atomic::AtomicU64,
}

impl ManualHybridClock {
    pub fn advance_to(
        &self,
        ht: u64,
    ) {
        self.now.store(ht, std::sync::atomic::Ordering::SeqCst);
    }
}

impl HybridClock for ManualHybridClock {
    fn now_ht(&self) -> u64 {
        self.now.load(std::sync::atomic::Ordering::SeqCst)
    }
}
