use std::io::Write;
use std::time::Duration;

use super::ConsensusOptions;
use super::PipelineOptions;
use super::TabletConfig;

#[test]
fn test_defaults_are_valid() {
    let config = TabletConfig::default();
    assert!(config.validate().is_ok());
}

#[test]
fn test_election_timeout_derivation() {
    let options = ConsensusOptions {
        heartbeat_interval_ms: 100,
        leader_failure_max_missed_heartbeat_periods: 6.0,
        ..Default::default()
    };
    assert_eq!(options.election_timeout(), Duration::from_millis(600));
    assert_eq!(options.heartbeat_interval(), Duration::from_millis(100));
}

#[test]
fn test_zero_lease_disables_leases() {
    let options = ConsensusOptions {
        leader_lease_duration_ms: 0,
        ht_lease_duration_ms: 0,
        ..Default::default()
    };
    assert!(options.leader_lease().is_none());
    assert!(options.validate().is_ok());
}

#[test]
fn test_ht_lease_requires_leader_lease() {
    let options = ConsensusOptions {
        leader_lease_duration_ms: 0,
        ht_lease_duration_ms: 1000,
        ..Default::default()
    };
    assert!(options.validate().is_err());
}

#[test]
fn test_invalid_heartbeat_rejected() {
    let options = ConsensusOptions {
        heartbeat_interval_ms: 0,
        ..Default::default()
    };
    assert!(options.validate().is_err());
}

#[test]
fn test_pipeline_bounds_rejected_at_zero() {
    let options = PipelineOptions {
        prepare_queue_max_size: 0,
        ..Default::default()
    };
    assert!(options.validate().is_err());

    let options = PipelineOptions {
        max_group_replicate_batch_size: 0,
        ..Default::default()
    };
    assert!(options.validate().is_err());
}

#[test]
fn test_file_override() {
    let mut file = tempfile::NamedTempFile::with_suffix(".toml").expect("temp file");
    writeln!(
        file,
        "[consensus]\nheartbeat_interval_ms = 250\n\n[pipeline]\nmax_group_replicate_batch_size = 4\n"
    )
    .expect("write");

    let base = TabletConfig::default();
    let merged = base
        .with_override_config(file.path().to_str().unwrap())
        .expect("merge");
    assert_eq!(merged.consensus.heartbeat_interval_ms, 250);
    assert_eq!(merged.pipeline.max_group_replicate_batch_size, 4);
    // Untouched fields keep their defaults.
    assert_eq!(
        merged.pipeline.prepare_queue_max_size,
        PipelineOptions::default().prepare_queue_max_size
    );
}
