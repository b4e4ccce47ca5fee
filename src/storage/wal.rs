//! The write-ahead-log seam.
//!
//! The real log (segment files, fsync batching, GC, anchor registry) is an
//! external collaborator; consensus drives it through this narrow trait and
//! only ever observes "enqueued" and "durable". Entries are shared as
//! `Arc<ReplicateMsg>` because the same message may simultaneously sit in
//! the queue's cache and in several peers' outbound requests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use tracing::warn;

use crate::proto::OpId;
use crate::proto::ReplicateMsg;
use crate::Result;

/// Invoked exactly once, after the appended batch is durable (or failed).
pub type AppendCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

#[cfg_attr(test, automock)]
pub trait WalLog: Send + Sync + 'static {
    /// Asynchronously enqueues `msgs` for append. `on_durable` fires once the
    /// batch is on disk; a failure here is fatal to the process.
    fn append(
        &self,
        msgs: Vec<Arc<ReplicateMsg>>,
        on_durable: AppendCallback,
    ) -> Result<()>;

    fn last_op_id(&self) -> OpId;

    /// Reads one entry back by index. `None` if the index was never written
    /// or has been garbage-collected.
    fn read_op(
        &self,
        index: u64,
    ) -> Result<Option<Arc<ReplicateMsg>>>;

    /// Oldest index still readable. A follower whose next index falls below
    /// this cannot catch up incrementally and needs remote bootstrap.
    fn min_retained_index(&self) -> u64;

    /// Discards every entry with index strictly greater than `index`.
    /// Used when a new leader overwrites a divergent suffix.
    fn truncate_after(
        &self,
        index: u64,
    ) -> Result<()>;

    /// Entries above `committed_index`, for pending-op replay at startup.
    fn orphaned_replicates(
        &self,
        committed_index: u64,
    ) -> Result<Vec<Arc<ReplicateMsg>>>;

    fn flush(&self) -> Result<()>;
}

/// In-memory log used by the test harness and by embedders that bring their
/// own durability underneath.
pub struct InMemWal {
    inner: Mutex<InMemWalInner>,
    /// Artificial durability latency, so tests can exercise the
    /// wait-for-durability path.
    durability_delay: Mutex<Option<Duration>>,
}

struct InMemWalInner {
    entries: BTreeMap<u64, Arc<ReplicateMsg>>,
    last: OpId,
    min_retained: u64,
}

impl Default for InMemWal {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemWal {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(InMemWalInner {
                entries: BTreeMap::new(),
                last: OpId::default(),
                min_retained: 1,
            }),
            durability_delay: Mutex::new(None),
        }
    }

    pub fn set_durability_delay(
        &self,
        delay: Option<Duration>,
    ) {
        *self.durability_delay.lock() = delay;
    }

    /// Drops every entry at or below `index`, simulating log GC.
    pub fn gc_up_to(
        &self,
        index: u64,
    ) {
        let mut inner = self.inner.lock();
        inner.entries.retain(|&i, _| i > index);
        if index + 1 > inner.min_retained {
            inner.min_retained = index + 1;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

impl WalLog for InMemWal {
    fn append(
        &self,
        msgs: Vec<Arc<ReplicateMsg>>,
        on_durable: AppendCallback,
    ) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            for msg in &msgs {
                inner.entries.insert(msg.id.index, msg.clone());
                if msg.id > inner.last {
                    inner.last = msg.id;
                }
            }
        }

        let delay = *self.durability_delay.lock();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(delay) = delay {
                        tokio::time::sleep(delay).await;
                    }
                    on_durable(Ok(()));
                });
            }
            // No runtime in scope (plain unit test): durable immediately.
            Err(_) => on_durable(Ok(())),
        }
        Ok(())
    }

    fn last_op_id(&self) -> OpId {
        self.inner.lock().last
    }

    fn read_op(
        &self,
        index: u64,
    ) -> Result<Option<Arc<ReplicateMsg>>> {
        Ok(self.inner.lock().entries.get(&index).cloned())
    }

    fn min_retained_index(&self) -> u64 {
        self.inner.lock().min_retained
    }

    fn truncate_after(
        &self,
        index: u64,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let removed = inner.entries.split_off(&(index + 1));
        if !removed.is_empty() {
            warn!(
                "truncating {} log entries after index {}",
                removed.len(),
                index
            );
        }
        inner.last = inner
            .entries
            .values()
            .next_back()
            .map(|m| m.id)
            .unwrap_or_default();
        Ok(())
    }

    fn orphaned_replicates(
        &self,
        committed_index: u64,
    ) -> Result<Vec<Arc<ReplicateMsg>>> {
        let inner = self.inner.lock();
        Ok(inner
            .entries
            .range(committed_index + 1..)
            .map(|(_, m)| m.clone())
            .collect())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}
