//! The outbound RPC seam.
//!
//! Transport, connection pooling, and service dispatch belong to the
//! embedding server; consensus talks to a remote replica through
//! [`PeerProxy`] and resolves uuid→proxy through [`PeerProxyFactory`].
//! Errors surfaced here are classified by the caller: transport failures
//! count as unreachability, anything carried inside a response is a
//! protocol-level error from a reachable peer.

use std::sync::Arc;

#[cfg(test)]
use mockall::automock;
use tonic::async_trait;

use crate::proto::ConsensusRequest;
use crate::proto::ConsensusResponse;
use crate::proto::LeaderElectionLostRequest;
use crate::proto::RaftPeer;
use crate::proto::RunLeaderElectionRequest;
use crate::proto::StartRemoteBootstrapRequest;
use crate::proto::VoteRequest;
use crate::proto::VoteResponse;
use crate::Result;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerProxy: Send + Sync + 'static {
    async fn update_consensus(
        &self,
        request: ConsensusRequest,
    ) -> Result<ConsensusResponse>;

    async fn request_vote(
        &self,
        request: VoteRequest,
    ) -> Result<VoteResponse>;

    async fn run_leader_election(
        &self,
        request: RunLeaderElectionRequest,
    ) -> Result<()>;

    async fn leader_election_lost(
        &self,
        request: LeaderElectionLostRequest,
    ) -> Result<()>;

    /// Fire-and-forget: the destination pulls the tablet wholesale from the
    /// named source. Progress is observed through normal append traffic.
    async fn start_remote_bootstrap(
        &self,
        request: StartRemoteBootstrapRequest,
    ) -> Result<()>;
}

/// Resolves a config member to a live proxy. Implementations typically wrap
/// a channel pool keyed by `peer.address`.
#[cfg_attr(test, automock)]
pub trait PeerProxyFactory: Send + Sync + 'static {
    fn proxy_for(
        &self,
        peer: &RaftPeer,
    ) -> Result<Arc<dyn PeerProxy>>;
}
