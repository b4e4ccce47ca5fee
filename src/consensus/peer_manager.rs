//! Keeps the live `Peer` set in sync with the active configuration.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;
use tracing::warn;

use super::MessageQueue;
use super::Peer;
use super::TriggerMode;
use crate::alias::PFOF;
use crate::config::ConsensusOptions;
use crate::proto::QuorumConfig;
use crate::PeerProxyFactory;
use crate::Result;
use crate::TypeConfig;

pub struct PeerManager<T: TypeConfig> {
    tablet_id: String,
    local_uuid: String,
    options: ConsensusOptions,
    factory: Arc<PFOF<T>>,
    queue: Arc<MessageQueue<T>>,
    peers: DashMap<String, Arc<Peer<T>>>,
}

impl<T: TypeConfig> PeerManager<T> {
    pub fn new(
        tablet_id: String,
        local_uuid: String,
        options: ConsensusOptions,
        factory: Arc<PFOF<T>>,
        queue: Arc<MessageQueue<T>>,
    ) -> Self {
        Self {
            tablet_id,
            local_uuid,
            options,
            factory,
            queue,
            peers: DashMap::new(),
        }
    }

    /// Creates peers that appeared in the config and closes peers that left.
    /// The queue is told about both directions so watermarks stay aligned
    /// with the membership.
    pub async fn update_quorum_config(
        &self,
        config: &QuorumConfig,
    ) -> Result<()> {
        self.queue.update_tracked_peers(config);

        for member in &config.peers {
            if member.uuid == self.local_uuid || self.peers.contains_key(&member.uuid) {
                continue;
            }
            let proxy = match self.factory.proxy_for(member) {
                Ok(proxy) => proxy,
                Err(e) => {
                    warn!(
                        "T {} P {}: no proxy for peer {}: {e}",
                        self.tablet_id, self.local_uuid, member.uuid
                    );
                    continue;
                }
            };
            let peer = Peer::new(
                member.clone(),
                self.tablet_id.clone(),
                self.local_uuid.clone(),
                proxy,
                self.queue.clone(),
                self.options.clone(),
            );
            peer.start()?;
            info!(
                "T {} P {}: tracking new peer {} ({})",
                self.tablet_id, self.local_uuid, member.uuid, member.address
            );
            self.peers.insert(member.uuid.clone(), peer);
        }

        let gone: Vec<Arc<Peer<T>>> = {
            let mut gone = Vec::new();
            self.peers.retain(|uuid, peer| {
                if config.has_peer(uuid) {
                    true
                } else {
                    gone.push(peer.clone());
                    false
                }
            });
            gone
        };
        for peer in gone {
            info!(
                "T {} P {}: peer {} left the config, closing",
                self.tablet_id,
                self.local_uuid,
                peer.uuid()
            );
            peer.close().await;
        }
        Ok(())
    }

    /// Broadcasts a send trigger to every tracked peer.
    pub fn signal_request(
        &self,
        trigger: TriggerMode,
    ) {
        for entry in self.peers.iter() {
            if let Err(e) = entry.value().signal_request(trigger) {
                warn!(
                    "T {} P {}: signal to {} failed: {e}",
                    self.tablet_id,
                    self.local_uuid,
                    entry.key()
                );
            }
        }
    }

    pub async fn close_all(&self) {
        let peers: Vec<Arc<Peer<T>>> = self.peers.iter().map(|e| e.value().clone()).collect();
        self.peers.clear();
        for peer in peers {
            peer.close().await;
        }
    }

    pub fn num_peers(&self) -> usize {
        self.peers.len()
    }
}
