//! Process-wide consensus counters. The only legitimate global mutable
//! state in the crate; everything else is passed explicitly.

use lazy_static::lazy_static;
use prometheus::exponential_buckets;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::IntCounter;
use prometheus::IntCounterVec;
use prometheus::Opts;
use prometheus::Registry;

lazy_static! {
    pub static ref OPS_REPLICATED: IntCounter = IntCounter::new(
        "consensus_ops_replicated",
        "Operations submitted to replication by the leader"
    )
    .expect("metric can not be created");
    pub static ref MAJORITY_DONE_OPS: IntCounter = IntCounter::new(
        "consensus_majority_done_ops",
        "Majority-watermark advances observed by the queue"
    )
    .expect("metric can not be created");
    pub static ref ELECTIONS_STARTED: IntCounter = IntCounter::new(
        "consensus_elections_started",
        "Leader elections this node has started"
    )
    .expect("metric can not be created");
    pub static ref ELECTIONS_WON: IntCounter = IntCounter::new(
        "consensus_elections_won",
        "Leader elections this node has won"
    )
    .expect("metric can not be created");
    pub static ref FOLLOWER_EVICTIONS: IntCounter = IntCounter::new(
        "consensus_follower_evictions",
        "Unresponsive followers removed from the config"
    )
    .expect("metric can not be created");
    pub static ref PEER_RPC_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "consensus_peer_rpc_failures",
            "Failed exchanges per remote peer"
        ),
        &["peer_id"]
    )
    .expect("metric can not be created");
    pub static ref APPLY_LATENCY_METRIC: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "operation_apply_latency",
            "Histogram of submit-to-apply latency in ms"
        )
        .buckets(exponential_buckets(1.0, 2.0, 12).unwrap()),
        &["op_type"]
    )
    .expect("metric can not be created");
    pub static ref CUSTOM_REGISTRY: Registry =
        Registry::new_custom(Some("raftlet".to_string()), None).unwrap();
}

pub fn register_custom_metrics(registry: &Registry) {
    registry
        .register(Box::new(OPS_REPLICATED.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(MAJORITY_DONE_OPS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(ELECTIONS_STARTED.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(ELECTIONS_WON.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(FOLLOWER_EVICTIONS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(PEER_RPC_FAILURES.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(APPLY_LATENCY_METRIC.clone()))
        .expect("collector can be registered");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let registry = Registry::new_custom(Some("raftlet_test".to_string()), None).unwrap();
        register_custom_metrics(&registry);
        OPS_REPLICATED.inc();
        assert!(OPS_REPLICATED.get() >= 1);
    }
}
