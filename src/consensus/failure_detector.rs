//! Leader-failure detector: a resettable timer per tablet that fires when no
//! evidence of a live leader arrives for a full election timeout.
//!
//! Election losses snooze it with randomized exponential backoff so two
//! candidates that split a vote do not collide again on the next timeout.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tokio::time::Instant;
use tracing::debug;
use tracing::trace;

const MAX_BACKOFF_EXPONENT: u32 = 4;

struct DetectorInner {
    deadline: Instant,
    period: Duration,
    enabled: bool,
    backoff_exponent: u32,
}

pub(crate) struct FailureDetector {
    inner: Mutex<DetectorInner>,
    changed: Notify,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FailureDetector {
    pub fn new(period: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(DetectorInner {
                deadline: Instant::now() + with_jitter(period, 0),
                period,
                enabled: false,
                backoff_exponent: 0,
            }),
            changed: Notify::new(),
            task: Mutex::new(None),
        })
    }

    /// Spawns the timer task. `on_expire` runs on the raft pool every time a
    /// full (jittered) period elapses without a snooze.
    pub fn start(
        self: &Arc<Self>,
        on_expire: Box<dyn Fn() + Send + Sync>,
    ) {
        let detector = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (deadline, enabled) = {
                    let inner = detector.inner.lock();
                    (inner.deadline, inner.enabled)
                };
                tokio::select! {
                    _ = detector.changed.notified() => continue,
                    _ = sleep_until(deadline) => {
                        if !enabled {
                            // Disabled: wait for the next state change.
                            detector.changed.notified().await;
                            continue;
                        }
                        trace!("failure detector fired");
                        on_expire();
                        detector.snooze();
                    }
                }
            }
        });
        *self.task.lock() = Some(handle);
    }

    pub fn enable(&self) {
        let mut inner = self.inner.lock();
        inner.enabled = true;
        inner.backoff_exponent = 0;
        inner.deadline = Instant::now() + with_jitter(inner.period, 0);
        drop(inner);
        self.changed.notify_one();
    }

    pub fn disable(&self) {
        self.inner.lock().enabled = false;
        self.changed.notify_one();
    }

    /// Pushes the deadline out a full period; call on every sign of a live
    /// leader.
    pub fn snooze(&self) {
        let mut inner = self.inner.lock();
        inner.deadline = Instant::now() + with_jitter(inner.period, 0);
        drop(inner);
        self.changed.notify_one();
    }

    pub fn snooze_for(
        &self,
        duration: Duration,
    ) {
        let mut inner = self.inner.lock();
        let candidate = Instant::now() + duration;
        if candidate > inner.deadline {
            inner.deadline = candidate;
        }
        drop(inner);
        self.changed.notify_one();
    }

    /// Snooze after a lost election: each consecutive loss doubles the
    /// randomized window, capped so a partitioned node recovers quickly.
    pub fn backoff_snooze(&self) {
        let mut inner = self.inner.lock();
        inner.backoff_exponent = (inner.backoff_exponent + 1).min(MAX_BACKOFF_EXPONENT);
        let exponent = inner.backoff_exponent;
        inner.deadline = Instant::now() + with_jitter(inner.period, exponent);
        debug!(
            "failure detector backoff: exponent={}, next deadline in {:?}",
            exponent,
            inner.deadline - Instant::now()
        );
        drop(inner);
        self.changed.notify_one();
    }

    pub fn stop(&self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

impl Drop for FailureDetector {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

/// period * 2^exponent, then a uniform random stretch up to +50% so
/// detectors across replicas drift apart.
fn with_jitter(
    period: Duration,
    exponent: u32,
) -> Duration {
    let base = period * 2u32.saturating_pow(exponent);
    let jitter = rand::thread_rng().gen_range(0..=base.as_millis().max(1) / 2) as u64;
    base + Duration::from_millis(jitter)
}
