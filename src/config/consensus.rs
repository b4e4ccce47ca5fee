use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

/// Core consensus tunables, passed explicitly at `ConsensusCore`
/// construction. Never read from process-wide state on hot paths.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConsensusOptions {
    /// Period between keepalive requests; also the failure-detector base unit.
    pub heartbeat_interval_ms: u64,

    /// Election timeout, expressed in heartbeat units.
    pub leader_failure_max_missed_heartbeat_periods: f64,

    /// Lease renewed on each append exchange. 0 disables leader leases.
    pub leader_lease_duration_ms: u64,

    /// Hybrid-time lease; 0 disables.
    pub ht_lease_duration_ms: u64,

    /// Per-RPC deadline; expiry is accounted as unreachability.
    pub consensus_rpc_timeout_ms: u64,

    /// Cap on ops carried by a single append request to one peer.
    pub max_ops_per_request: usize,

    /// Cooldown between repeated step-downs naming the same protege.
    pub min_leader_stepdown_retry_interval_ms: u64,

    /// How many election timeouts a stepped-down leader withholds its own
    /// candidacy, so the cluster does not immediately re-elect it.
    pub withhold_election_timeout_periods: u32,

    /// Consecutive failed exchanges before a follower is reported for
    /// eviction. Only consulted when `evict_failed_followers` is set.
    pub follower_unreachable_max_missed_periods: u64,

    /// Enables automatic removal of unresponsive followers.
    pub evict_failed_followers: bool,
}

impl Default for ConsensusOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 500,
            leader_failure_max_missed_heartbeat_periods: 6.0,
            leader_lease_duration_ms: 2000,
            ht_lease_duration_ms: 2000,
            consensus_rpc_timeout_ms: 3000,
            max_ops_per_request: 64,
            min_leader_stepdown_retry_interval_ms: 10_000,
            withhold_election_timeout_periods: 2,
            follower_unreachable_max_missed_periods: 10,
            evict_failed_followers: false,
        }
    }
}

impl ConsensusOptions {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// leader_failure_max_missed_heartbeat_periods x heartbeat_interval.
    pub fn election_timeout(&self) -> Duration {
        Duration::from_micros(
            (self.heartbeat_interval_ms as f64 * self.leader_failure_max_missed_heartbeat_periods
                * 1000.0) as u64,
        )
    }

    pub fn leader_lease(&self) -> Option<Duration> {
        (self.leader_lease_duration_ms > 0)
            .then(|| Duration::from_millis(self.leader_lease_duration_ms))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.consensus_rpc_timeout_ms)
    }

    pub fn stepdown_retry_interval(&self) -> Duration {
        Duration::from_millis(self.min_leader_stepdown_retry_interval_ms)
    }

    pub fn withhold_election_interval(&self) -> Duration {
        self.election_timeout() * self.withhold_election_timeout_periods
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::InvalidConfig(
                "heartbeat_interval_ms cannot be 0".into(),
            ));
        }

        if self.leader_failure_max_missed_heartbeat_periods < 1.0 {
            return Err(Error::InvalidConfig(
                "leader_failure_max_missed_heartbeat_periods must be at least 1".into(),
            ));
        }

        if self.consensus_rpc_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "consensus_rpc_timeout_ms cannot be 0".into(),
            ));
        }

        if self.max_ops_per_request == 0 {
            return Err(Error::InvalidConfig(
                "max_ops_per_request must be > 0".into(),
            ));
        }

        if self.ht_lease_duration_ms > 0 && self.leader_lease_duration_ms == 0 {
            return Err(Error::InvalidConfig(
                "ht_lease_duration_ms requires leader leases to be enabled".into(),
            ));
        }

        Ok(())
    }
}

/// Prepare/apply pipeline tunables, one set per tablet.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineOptions {
    /// Cap on the number of leader-side operations replicated as one batch.
    pub max_group_replicate_batch_size: usize,

    /// Bound on the preparer's submit queue.
    pub prepare_queue_max_size: usize,

    /// Soft limit on memory held by pending (not yet committed) operations.
    /// Follower appends past this limit are rejected as retryable.
    pub pending_ops_soft_limit_bytes: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            max_group_replicate_batch_size: 16,
            prepare_queue_max_size: 1024,
            pending_ops_soft_limit_bytes: 128 * 1024 * 1024,
        }
    }
}

impl PipelineOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_group_replicate_batch_size == 0 {
            return Err(Error::InvalidConfig(
                "max_group_replicate_batch_size must be > 0".into(),
            ));
        }

        if self.prepare_queue_max_size == 0 {
            return Err(Error::InvalidConfig(
                "prepare_queue_max_size must be > 0".into(),
            ));
        }

        if self.pending_ops_soft_limit_bytes == 0 {
            return Err(Error::InvalidConfig(
                "pending_ops_soft_limit_bytes must be > 0".into(),
            ));
        }

        Ok(())
    }
}
