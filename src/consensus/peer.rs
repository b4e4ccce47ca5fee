//! One outstanding-request pump per remote replica.
//!
//! A single permit guards the in-flight request; heartbeats and data sends
//! share it, so leader memory per peer is bounded by one request. The pump
//! is a task that alternates between asking the queue for the next request
//! and awaiting the RPC; the permit is held for the whole loop, which is
//! what enforces the single-outstanding-request invariant.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::sync::Semaphore;
use tokio::sync::TryAcquireError;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::MessageQueue;
use super::NextRequest;
use super::TriggerMode;
use crate::config::ConsensusOptions;
use crate::errors::ConsensusError;
use crate::metrics::PEER_RPC_FAILURES;
use crate::proto::ConsensusErrorCode;
use crate::proto::RaftPeer;
use crate::PeerProxy;
use crate::Result;
use crate::TypeConfig;

const STATE_CREATED: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_CLOSED: u8 = 3;

pub struct Peer<T: TypeConfig> {
    remote: RaftPeer,
    tablet_id: String,
    local_uuid: String,
    proxy: Arc<dyn PeerProxy>,
    queue: Arc<MessageQueue<T>>,
    options: ConsensusOptions,
    state: AtomicU8,
    failed_attempts: AtomicU64,
    permit: Arc<Semaphore>,
    heartbeater: Mutex<Option<Heartbeater>>,
}

impl<T: TypeConfig> Peer<T> {
    pub fn new(
        remote: RaftPeer,
        tablet_id: String,
        local_uuid: String,
        proxy: Arc<dyn PeerProxy>,
        queue: Arc<MessageQueue<T>>,
        options: ConsensusOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            remote,
            tablet_id,
            local_uuid,
            proxy,
            queue,
            options,
            state: AtomicU8::new(STATE_CREATED),
            failed_attempts: AtomicU64::new(0),
            permit: Arc::new(Semaphore::new(1)),
            heartbeater: Mutex::new(None),
        })
    }

    pub fn uuid(&self) -> &str {
        &self.remote.uuid
    }

    pub fn remote(&self) -> &RaftPeer {
        &self.remote
    }

    /// Created → Started: spawns the heartbeater and kicks off the first
    /// (negotiating) exchange.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self
            .state
            .compare_exchange(
                STATE_CREATED,
                STATE_STARTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(ConsensusError::Shutdown.into());
        }
        *self.heartbeater.lock() = Some(Heartbeater::spawn(
            Arc::downgrade(self),
            self.options.heartbeat_interval(),
        ));
        self.signal_request(TriggerMode::AlwaysSend)
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_CLOSED
    }

    /// Notifies the pump that the queue may contain messages for this peer.
    /// Returns Ok immediately when a request is already in flight; the
    /// in-flight handler will loop.
    pub fn signal_request(
        self: &Arc<Self>,
        trigger: TriggerMode,
    ) -> Result<()> {
        let state = self.state.load(Ordering::Acquire);
        if state == STATE_CLOSED {
            return Err(ConsensusError::Shutdown.into());
        }
        // Until the first exchange has negotiated watermarks, every send is
        // forced to AlwaysSend.
        let trigger = if state == STATE_STARTED {
            TriggerMode::AlwaysSend
        } else {
            trigger
        };

        // After a failure only the heartbeater (AlwaysSend) retries; skipping
        // the data path avoids hammering an unreachable peer.
        if self.failed_attempts.load(Ordering::Acquire) > 0 && trigger == TriggerMode::NonEmptyOnly
        {
            return Ok(());
        }

        match self.permit.clone().try_acquire_owned() {
            Ok(permit) => {
                let peer = self.clone();
                tokio::spawn(async move {
                    peer.send_next_request(trigger).await;
                    drop(permit);
                });
                Ok(())
            }
            Err(TryAcquireError::NoPermits) => Ok(()),
            Err(TryAcquireError::Closed) => Err(ConsensusError::Shutdown.into()),
        }
    }

    async fn send_next_request(
        self: &Arc<Self>,
        mut trigger: TriggerMode,
    ) {
        loop {
            if self.is_closed() {
                return;
            }

            let next = match self.queue.request_for_peer(&self.remote.uuid, trigger) {
                Ok(next) => next,
                Err(e) => {
                    warn!(
                        "T {} P {} -> {}: building request failed: {e}",
                        self.tablet_id, self.local_uuid, self.remote.uuid
                    );
                    return;
                }
            };

            match next {
                NextRequest::Idle => return,
                NextRequest::RemoteBootstrap(request) => {
                    debug!(
                        "T {} P {} -> {}: triggering remote bootstrap",
                        self.tablet_id, self.local_uuid, self.remote.uuid
                    );
                    let proxy = self.proxy.clone();
                    // Fire and forget; progress shows up as normal appends.
                    tokio::spawn(async move {
                        if let Err(e) = proxy.start_remote_bootstrap(request).await {
                            warn!("start_remote_bootstrap failed: {e}");
                        }
                    });
                    return;
                }
                NextRequest::PromoteToFull { uuid } => {
                    self.queue.notify_promotion_ready(&uuid);
                    return;
                }
                NextRequest::Send(prepared) => {
                    // First dispatch ends the negotiation phase regardless of
                    // how the exchange turns out.
                    self.mark_running();
                    if prepared.num_ops > 0 {
                        self.reset_heartbeat();
                    }
                    let rpc = self.proxy.update_consensus(prepared.request);
                    let response = match timeout(self.options.rpc_timeout(), rpc).await {
                        Ok(Ok(response)) => response,
                        Ok(Err(e)) => {
                            self.record_transport_failure(&format!("{e}"));
                            return;
                        }
                        Err(_) => {
                            self.record_transport_failure("rpc timed out");
                            return;
                        }
                    };

                    self.failed_attempts.store(0, Ordering::Release);

                    let wrong_server = response
                        .status
                        .as_ref()
                        .and_then(|s| s.error.as_ref())
                        .map(|e| e.code() == ConsensusErrorCode::WrongServerUuid)
                        .unwrap_or(false);
                    if wrong_server {
                        self.queue
                            .report_failed_follower(&self.remote.uuid, "wrong server uuid");
                        return;
                    }

                    self.queue.notify_peer_is_responsive(&self.remote.uuid);
                    let more_pending = self.queue.response_from_peer(
                        &self.remote.uuid,
                        prepared.lease_grants,
                        &response,
                    );
                    if more_pending && !self.is_closed() {
                        trace!(
                            "T {} P {} -> {}: more pending, looping",
                            self.tablet_id,
                            self.local_uuid,
                            self.remote.uuid
                        );
                        trigger = TriggerMode::AlwaysSend;
                        continue;
                    }
                    return;
                }
            }
        }
    }

    fn mark_running(&self) {
        let _ = self.state.compare_exchange(
            STATE_STARTED,
            STATE_RUNNING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn record_transport_failure(
        &self,
        reason: &str,
    ) {
        let attempts = self.failed_attempts.fetch_add(1, Ordering::AcqRel) + 1;
        PEER_RPC_FAILURES.with_label_values(&[&self.remote.uuid]).inc();
        self.queue.record_failed_exchange(&self.remote.uuid);
        debug!(
            "T {} P {} -> {}: exchange failed ({reason}), attempt {attempts}",
            self.tablet_id, self.local_uuid, self.remote.uuid
        );
    }

    fn reset_heartbeat(&self) {
        if let Some(hb) = self.heartbeater.lock().as_ref() {
            hb.reset();
        }
    }

    /// Flips to Closed and drains the in-flight request before untracking
    /// the peer. Callbacks arriving after this point are ignored.
    pub async fn close(&self) {
        let prev = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if prev == STATE_CLOSED {
            return;
        }
        if let Some(hb) = self.heartbeater.lock().take() {
            hb.stop();
        }
        // Wait out any in-flight exchange.
        let _permit = self.permit.acquire().await;
        self.queue.untrack_peer(&self.remote.uuid);
        debug!(
            "T {} P {} -> {}: peer closed",
            self.tablet_id, self.local_uuid, self.remote.uuid
        );
    }
}

/// Fixed-interval keepalive. Firing goes through the same permit as data
/// sends; a reset after real traffic keeps idle-period heartbeats spaced.
struct Heartbeater {
    reset_tx: watch::Sender<()>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Heartbeater {
    fn spawn<T: TypeConfig>(
        peer: std::sync::Weak<Peer<T>>,
        interval: std::time::Duration,
    ) -> Self {
        let (reset_tx, mut reset_rx) = watch::channel(());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => return,
                    _ = reset_rx.changed() => continue,
                    _ = tokio::time::sleep(interval) => {
                        let Some(peer) = peer.upgrade() else { return };
                        if peer.is_closed() {
                            return;
                        }
                        let _ = peer.signal_request(TriggerMode::AlwaysSend);
                    }
                }
            }
        });
        Self {
            reset_tx,
            shutdown_tx,
            task,
        }
    }

    fn reset(&self) {
        let _ = self.reset_tx.send(());
    }

    fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        self.task.abort();
    }
}
