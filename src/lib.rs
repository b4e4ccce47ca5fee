//! # raftlet
//!
//! Per-tablet Raft consensus core: the leader/follower state machine with
//! terms, leases, config changes and elections; the per-peer
//! request/response pump with batching and pipelining; and the per-tablet
//! prepare/apply pipeline that keeps OpId order while batches execute
//! concurrently with replication and log I/O.
//!
//! The persistent log, the tablet storage engine, the RPC transport, and
//! process bootstrap are collaborators: the crate consumes them through the
//! [`WalLog`], [`Operation`]/[`ReplicaOperationBuilder`], and [`PeerProxy`]
//! seams, bound together by a [`TypeConfig`].
//!
//! ## Data flow (leader write)
//!
//! client call → [`Operation`] → [`Pipeline::submit`] → serial prepare batch
//! → [`ConsensusCore::replicate_batch`] → queue enqueue + local log append +
//! per-peer pump → majority ack → committed-index advance → apply → finish.

pub mod config;
pub mod consensus;
pub mod proto;
pub mod storage;
pub mod tablet;

mod constants;
mod errors;
mod metrics;
mod network;
mod type_config;
mod utils;

// `self::` disambiguates from the `config` crate in the extern prelude.
pub use self::config::*;
pub use consensus::BootstrapInfo;
pub use consensus::ConsensusCore;
pub use consensus::ConsensusCoreArgs;
pub use consensus::PeerRole;
pub use consensus::TriggerMode;
pub use constants::*;
pub use errors::*;
pub use metrics::register_custom_metrics;
pub use metrics::CUSTOM_REGISTRY;
#[doc(hidden)]
pub use network::*;
pub use proto::MINIMUM_OP_ID;
#[doc(hidden)]
pub use storage::*;
pub use tablet::CompletionStatus;
pub use tablet::Operation;
pub use tablet::Pipeline;
pub use tablet::ReplicaOperationBuilder;
#[doc(hidden)]
pub use type_config::*;
#[doc(hidden)]
pub use utils::quorum::majority_count;
pub use utils::time::HybridClock;
pub use utils::time::ManualHybridClock;
pub use utils::time::SystemHybridClock;

//-----------------------------------------------------------
// Test utils
#[cfg(test)]
#[doc(hidden)]
pub mod test_utils;
