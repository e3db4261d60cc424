//! Status file consistency across transitions and restarts.

mod common;

use common::*;
use poolkeeper::cluster::{BackendStatus, ClusterState};
use poolkeeper::failover::run_failover;
use poolkeeper::request::{self, NodeStateRequest, REQ_SWITCHOVER};
use poolkeeper::statusfile;
use tempfile::TempDir;

#[test]
fn failover_persists_a_consistent_snapshot() {
    let logdir = TempDir::new().unwrap();
    let mut cfg = test_config(2);
    cfg.logdir = logdir.path().to_path_buf();
    let cluster = ClusterState::create(&cfg).unwrap();
    set_all_up_with_primary(&cluster, 0);

    request::push(&cluster, &NodeStateRequest::node_down(vec![1], REQ_SWITCHOVER)).unwrap();
    let link = FakeLink::disabled();
    let runner = RecordingRunner::default();
    let mut fleet = RecordingFleet::new(Some(&cluster));
    let mut probes = probe_factory(FakeProbe::primary_at(0, &[]));
    run_failover(&cluster, &cfg, &mut fleet, &link, &runner, &mut probes);

    let contents =
        std::fs::read_to_string(statusfile::status_file_path(logdir.path())).unwrap();
    assert_eq!(contents, "up\ndown\n");
}

#[test]
fn restart_restores_the_persisted_vector() {
    let logdir = TempDir::new().unwrap();
    let mut cfg = test_config(3);
    cfg.logdir = logdir.path().to_path_buf();
    let cluster = ClusterState::create(&cfg).unwrap();
    cluster.backend(1).set_status(BackendStatus::Down);
    statusfile::write(&cluster, logdir.path()).unwrap();

    // A fresh supervisor generation loads the same vector.
    let restarted = ClusterState::create(&cfg).unwrap();
    statusfile::load(&restarted, logdir.path(), false).unwrap();
    assert_eq!(restarted.backend(0).status(), BackendStatus::Up);
    assert_eq!(restarted.backend(1).status(), BackendStatus::Down);
    assert_eq!(restarted.backend(2).status(), BackendStatus::Up);
}

#[test]
fn all_down_transition_leaves_last_up_set_on_disk() {
    let logdir = TempDir::new().unwrap();
    let mut cfg = test_config(2);
    cfg.logdir = logdir.path().to_path_buf();
    let cluster = ClusterState::create(&cfg).unwrap();
    set_all_up_with_primary(&cluster, 0);

    request::push(&cluster, &NodeStateRequest::node_down(vec![0, 1], 0)).unwrap();
    let link = FakeLink::disabled();
    let runner = RecordingRunner::default();
    let mut fleet = RecordingFleet::new(Some(&cluster));
    let mut probes = probe_factory(FakeProbe::default());
    run_failover(&cluster, &cfg, &mut fleet, &link, &runner, &mut probes);

    // In memory everything is down, but the file keeps the last set of
    // nodes any data was written to.
    assert!(cluster.all_backends_down());
    let contents =
        std::fs::read_to_string(statusfile::status_file_path(logdir.path())).unwrap();
    assert_eq!(contents, "down\nup\n");

    // An ambiguous restart therefore resolves to the previously-up node.
    let restarted = ClusterState::create(&cfg).unwrap();
    statusfile::load(&restarted, logdir.path(), false).unwrap();
    assert_eq!(restarted.backend(0).status(), BackendStatus::Down);
    assert_eq!(restarted.backend(1).status(), BackendStatus::Up);
}
