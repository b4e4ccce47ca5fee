//! Per-tablet serial batcher.
//!
//! A bounded queue of drivers plus a running flag flipped by
//! compare-and-swap: whoever flips 0→1 owns the (single) run task, so a
//! tablet's operations are prepared sequentially no matter how wide the
//! runtime is. Leader-side operations accumulate into replication batches;
//! schema changes and replica-side operations flush the batch first.

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::trace;
use log::warn;
use parking_lot::Mutex;

use super::OperationDriver;
use crate::config::PipelineOptions;
use crate::consensus::ConsensusCore;
use crate::consensus::ConsensusRound;
use crate::errors::ConsensusError;
use crate::errors::ReplicationError;
use crate::proto::OperationType;
use crate::Result;
use crate::TypeConfig;

pub struct Preparer<T: TypeConfig> {
    inner: Arc<PreparerInner<T>>,
}

struct PreparerInner<T: TypeConfig> {
    core: Arc<ConsensusCore<T>>,
    options: PipelineOptions,
    queue: Mutex<VecDeque<Arc<OperationDriver<T>>>>,
    running: AtomicUsize,
    stopped: AtomicBool,
}

impl<T: TypeConfig> Preparer<T> {
    pub fn new(
        core: Arc<ConsensusCore<T>>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            inner: Arc::new(PreparerInner {
                core,
                options,
                queue: Mutex::new(VecDeque::new()),
                running: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueues a driver; rejected when the bounded queue is full so the
    /// caller can push back. Flipping the running flag 0→1 schedules the
    /// serial run task.
    pub fn submit(
        &self,
        driver: Arc<OperationDriver<T>>,
    ) -> Result<()> {
        if self.inner.stopped.load(Ordering::Acquire) {
            return Err(ConsensusError::Shutdown.into());
        }
        {
            let mut queue = self.inner.queue.lock();
            if queue.len() >= self.inner.options.prepare_queue_max_size {
                return Err(ConsensusError::Replication(ReplicationError::QueueFull {
                    capacity: self.inner.options.prepare_queue_max_size,
                })
                .into());
            }
            queue.push_back(driver);
        }
        if self
            .inner
            .running
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                inner.run().await;
            });
        }
        Ok(())
    }

    /// Stops accepting work. Already-replicated operations cannot be
    /// cancelled here; shutdown of pending rounds happens in consensus.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

impl<T: TypeConfig> PreparerInner<T> {
    async fn run(self: Arc<Self>) {
        loop {
            self.drain().await;

            // Exit protocol: clear running, then re-check under the lock. A
            // submit that raced the drain restarts us via the CAS; if it
            // already gave up because running was still 1, we must loop
            // ourselves.
            self.running.store(0, Ordering::Release);
            let has_work = !self.queue.lock().is_empty();
            if !has_work {
                return;
            }
            if self
                .running
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // Someone else took over.
                return;
            }
        }
    }

    async fn drain(&self) {
        let mut batch: Vec<Arc<OperationDriver<T>>> = Vec::new();
        let mut batch_term = 0u64;

        loop {
            let Some(driver) = self.queue.lock().pop_front() else {
                break;
            };

            // Replica-side operations do not replicate from here; they only
            // need their prepare run, in order, after the current batch.
            if !driver.is_leader_side() {
                self.flush_batch(&mut batch).await;
                if let Err(e) = driver.prepare_and_start().await {
                    driver.handle_failure(e);
                }
                continue;
            }

            if let Err(e) = self.core.check_leadership_and_bind_term(driver.round()) {
                driver.handle_failure(e);
                continue;
            }
            let term = driver.round().bound_term();

            // Schema changes and placeholder ops take exclusive locks; they
            // are always batched alone. A term change also splits the batch
            // so one stale op cannot fail unrelated neighbors.
            let exclusive = matches!(
                driver.op_type(),
                OperationType::AlterSchema | OperationType::Empty
            );
            if !batch.is_empty()
                && (term != batch_term
                    || exclusive
                    || batch.len() >= self.options.max_group_replicate_batch_size)
            {
                self.flush_batch(&mut batch).await;
            }

            batch_term = term;
            batch.push(driver);
            if exclusive {
                self.flush_batch(&mut batch).await;
            }
        }

        self.flush_batch(&mut batch).await;
    }

    /// Prepares every driver in the batch, then replicates each maximal
    /// prefix of successful prepares. A failed prepare fails only its own
    /// driver; the scan resumes with a fresh sub-batch.
    async fn flush_batch(
        &self,
        batch: &mut Vec<Arc<OperationDriver<T>>>,
    ) {
        if batch.is_empty() {
            return;
        }
        trace!("flushing prepare batch of {}", batch.len());

        let mut prefix: Vec<Arc<OperationDriver<T>>> = Vec::new();
        for driver in batch.drain(..) {
            match driver.prepare_and_start().await {
                Ok(()) => prefix.push(driver),
                Err(e) => {
                    self.replicate_prefix(&mut prefix);
                    driver.handle_failure(e);
                }
            }
        }
        self.replicate_prefix(&mut prefix);
    }

    /// Replication failures fail every operation in the sub-batch
    /// identically.
    fn replicate_prefix(
        &self,
        prefix: &mut Vec<Arc<OperationDriver<T>>>,
    ) {
        if prefix.is_empty() {
            return;
        }
        let rounds: Vec<Arc<ConsensusRound>> =
            prefix.iter().map(|d| d.round().clone()).collect();
        if let Err(e) = self.core.replicate_batch(&rounds) {
            warn!("replicate_batch of {} ops failed: {e}", rounds.len());
            for driver in prefix.iter() {
                driver.handle_failure(crate::errors::aborted(
                    driver.round().id(),
                    format!("batch replication failed: {e}"),
                ));
            }
        }
        prefix.clear();
    }
}
