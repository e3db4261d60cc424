//! End-to-end failover engine scenarios driven through the request queue
//! with scripted probes and a recording fleet.

mod common;

use common::*;
use poolkeeper::cluster::{BackendRole, BackendStatus, ClusterState};
use poolkeeper::failover::run_failover;
use poolkeeper::primary::{find_primary_node, request_detach_of_invalid_nodes};
use poolkeeper::request::{
    self, NodeStateRequest, RequestKind, REQ_CONFIRMED, REQ_SWITCHOVER, REQ_UPDATE,
};
use poolkeeper::cluster::InterruptReason;
use std::sync::atomic::Ordering;
use tempfile::TempDir;

#[test]
fn standby_failure_in_streaming_replication() {
    let logdir = TempDir::new().unwrap();
    let mut cfg = test_config(2);
    cfg.logdir = logdir.path().to_path_buf();
    cfg.failover_command = "failover %d %P %H".to_string();
    let cluster = ClusterState::create(&cfg).unwrap();
    set_all_up_with_primary(&cluster, 0);

    // Worker 1 holds a pooled connection load-balanced to node 1.
    cluster.coninfo(1, 0, 1).set(true, 1, 900);

    request::push(&cluster, &NodeStateRequest::node_down(vec![1], REQ_SWITCHOVER)).unwrap();

    let link = FakeLink::disabled();
    let runner = RecordingRunner::default();
    let mut fleet = RecordingFleet::new(Some(&cluster));
    let mut probes = probe_factory(FakeProbe::primary_at(0, &[]));
    run_failover(&cluster, &cfg, &mut fleet, &link, &runner, &mut probes);

    assert_eq!(cluster.backend(1).status(), BackendStatus::Down);
    assert_eq!(cluster.request_info().primary_node_id(), 0);
    assert_eq!(cluster.request_info().main_node_id(), 0);

    // Only the worker with a session on node 1 was killed; the other one
    // exits lazily.
    assert!(fleet.killed.iter().all(|&w| w == 1));
    assert_eq!(fleet.respawned, vec![1]);
    assert!(cluster.worker(0).need_restart());

    // Command saw the failed node, the old primary and the new main host.
    assert_eq!(*runner.commands.borrow(), vec!["failover 1 0 db0.example"]);

    // The peer window opened and closed around the committed transition.
    assert_eq!(*link.failover_windows.borrow(), vec!["start", "end"]);

    assert_eq!(fleet.pcp_woken, 1);
    assert_eq!(fleet.pcp_restarted, 1);
    assert!(!cluster.request_info().switching());
    assert!(cluster.request_info().queue_is_empty());

    // Every fleet mutation happened while switching was held.
    assert!(!fleet.switching_observed.is_empty());
    assert!(fleet.switching_observed.iter().all(|&s| s));
}

#[test]
fn primary_failure_with_promotion() {
    let logdir = TempDir::new().unwrap();
    let mut cfg = test_config(2);
    cfg.logdir = logdir.path().to_path_buf();
    cfg.failover_command = "failover %d %P %m".to_string();
    let cluster = ClusterState::create(&cfg).unwrap();
    set_all_up_with_primary(&cluster, 0);

    request::push(&cluster, &NodeStateRequest::node_down(vec![0], 0)).unwrap();

    let link = FakeLink::disabled();
    let runner = RecordingRunner::default();
    let mut fleet = RecordingFleet::new(Some(&cluster));
    let mut probes = probe_factory(FakeProbe::primary_at(1, &[]));
    run_failover(&cluster, &cfg, &mut fleet, &link, &runner, &mut probes);

    assert_eq!(cluster.backend(0).status(), BackendStatus::Down);
    assert_eq!(cluster.request_info().primary_node_id(), 1);
    assert_eq!(cluster.backend(1).role(), BackendRole::Primary);
    assert_eq!(cluster.request_info().main_node_id(), 1);

    // Primary went away: every query worker restarts.
    assert_eq!(fleet.respawned, vec![0, 1]);
    assert!(fleet.killed.contains(&0) && fleet.killed.contains(&1));

    assert_eq!(*runner.commands.borrow(), vec!["failover 0 0 1"]);
}

#[test]
fn failback_of_quarantined_former_primary() {
    let logdir = TempDir::new().unwrap();
    let mut cfg = test_config(2);
    cfg.logdir = logdir.path().to_path_buf();
    cfg.failback_command = "failback %d".to_string();
    let cluster = ClusterState::create(&cfg).unwrap();
    set_all_up_with_primary(&cluster, 0);

    // Node 0 was quarantined while primary.
    cluster.backend(0).set_status(BackendStatus::Down);
    cluster.backend(0).set_quarantined(true);
    cluster.backend(0).set_role(BackendRole::Primary);
    cluster
        .request_info()
        .primary_node_id
        .store(-1, Ordering::SeqCst);

    request::push(&cluster, &NodeStateRequest::node_up(0, REQ_UPDATE)).unwrap();

    let link = FakeLink::disabled();
    let runner = RecordingRunner::default();
    let mut fleet = RecordingFleet::new(Some(&cluster));
    let mut probes = probe_factory(FakeProbe::default());
    run_failover(&cluster, &cfg, &mut fleet, &link, &runner, &mut probes);

    assert!(!cluster.backend(0).quarantined());
    assert_eq!(cluster.backend(0).status(), BackendStatus::ConnectWait);
    // The pre-quarantine primary is restored.
    assert_eq!(cluster.request_info().primary_node_id(), 0);
    // No failback command for a quarantine-clearing update.
    assert!(runner.commands.borrow().is_empty());
    // Primary changed from -1: all workers restart.
    assert_eq!(fleet.respawned, vec![0, 1]);
    assert!(fleet.health_checks_ensured >= 1);
}

#[test]
fn split_brain_detection_and_detach() {
    let logdir = TempDir::new().unwrap();
    let mut cfg = test_config(2);
    cfg.logdir = logdir.path().to_path_buf();
    cfg.detach_false_primary = true;
    let cluster = ClusterState::create(&cfg).unwrap();
    set_all_up_with_primary(&cluster, 0);

    // Both nodes claim to be primary, no standbys anywhere.
    let mut probe = FakeProbe::default();
    probe.in_recovery.insert(0, false);
    probe.in_recovery.insert(1, false);

    let outcome = find_primary_node(&cluster, &cfg, &mut probe);
    assert_eq!(outcome.primary, 0);
    assert_eq!(outcome.invalid, vec![1]);

    request_detach_of_invalid_nodes(&cluster, &outcome.invalid);
    assert!(cluster
        .signal_slot()
        .is_raised(InterruptReason::FailoverInterrupt));

    // The queued request asks for a trusted switchover of node 1.
    let queued = request::pop(&cluster).unwrap();
    assert_eq!(queued.kind, RequestKind::NodeDown);
    assert_eq!(queued.node_ids, vec![1]);
    assert!(queued.has_flag(REQ_SWITCHOVER));
    assert!(queued.has_flag(REQ_CONFIRMED));

    // Driving the request through the engine detaches the false primary
    // and keeps the trusted one.
    request::push(&cluster, &queued).unwrap();
    let link = FakeLink::disabled();
    let runner = RecordingRunner::default();
    let mut fleet = RecordingFleet::new(Some(&cluster));
    let mut probes = probe_factory(FakeProbe::primary_at(0, &[]));
    run_failover(&cluster, &cfg, &mut fleet, &link, &runner, &mut probes);

    assert_eq!(cluster.backend(1).status(), BackendStatus::Down);
    assert_eq!(cluster.request_info().primary_node_id(), 0);
}

#[test]
fn node_down_then_up_is_not_auto_promoted() {
    let logdir = TempDir::new().unwrap();
    let mut cfg = test_config(2);
    cfg.logdir = logdir.path().to_path_buf();
    let cluster = ClusterState::create(&cfg).unwrap();
    set_all_up_with_primary(&cluster, 0);

    let link = FakeLink::disabled();
    let runner = RecordingRunner::default();

    request::push(&cluster, &NodeStateRequest::node_down(vec![1], REQ_SWITCHOVER)).unwrap();
    let mut fleet = RecordingFleet::new(Some(&cluster));
    let mut probes = probe_factory(FakeProbe::primary_at(0, &[]));
    run_failover(&cluster, &cfg, &mut fleet, &link, &runner, &mut probes);
    assert_eq!(cluster.backend(1).status(), BackendStatus::Down);

    request::push(&cluster, &NodeStateRequest::node_up(1, 0)).unwrap();
    let mut fleet = RecordingFleet::new(Some(&cluster));
    let mut probes = probe_factory(FakeProbe::primary_at(0, &[1]));
    run_failover(&cluster, &cfg, &mut fleet, &link, &runner, &mut probes);

    // Back to connect-wait, primary unchanged.
    assert_eq!(cluster.backend(1).status(), BackendStatus::ConnectWait);
    assert_eq!(cluster.request_info().primary_node_id(), 0);
}

#[test]
fn quarantine_then_update_failback_round_trip() {
    let logdir = TempDir::new().unwrap();
    let mut cfg = test_config(2);
    cfg.logdir = logdir.path().to_path_buf();
    let cluster = ClusterState::create(&cfg).unwrap();
    set_all_up_with_primary(&cluster, 0);

    let link = FakeLink::disabled();
    let runner = RecordingRunner::default();

    // Quarantine the primary: a soft DOWN with deferred failover.
    request::push(&cluster, &NodeStateRequest::quarantine(vec![0])).unwrap();
    let mut fleet = RecordingFleet::new(Some(&cluster));
    let mut probes = probe_factory(FakeProbe::default());
    run_failover(&cluster, &cfg, &mut fleet, &link, &runner, &mut probes);

    assert_eq!(cluster.backend(0).status(), BackendStatus::Down);
    assert!(cluster.backend(0).quarantined());
    assert_eq!(cluster.request_info().primary_node_id(), -1);
    assert_eq!(cluster.backend(0).role(), BackendRole::Primary);
    // No failover command for quarantine.
    assert!(runner.commands.borrow().is_empty());

    // Quorum returns: the update failback restores node and primary.
    request::push(&cluster, &NodeStateRequest::node_up(0, REQ_UPDATE)).unwrap();
    let mut fleet = RecordingFleet::new(Some(&cluster));
    let mut probes = probe_factory(FakeProbe::default());
    run_failover(&cluster, &cfg, &mut fleet, &link, &runner, &mut probes);

    assert_eq!(cluster.backend(0).status(), BackendStatus::ConnectWait);
    assert!(!cluster.backend(0).quarantined());
    assert_eq!(cluster.request_info().primary_node_id(), 0);
}

#[test]
fn all_backends_down_terminates_cleanly() {
    let logdir = TempDir::new().unwrap();
    let mut cfg = test_config(2);
    cfg.logdir = logdir.path().to_path_buf();
    let cluster = ClusterState::create(&cfg).unwrap();
    set_all_up_with_primary(&cluster, 0);

    request::push(&cluster, &NodeStateRequest::node_down(vec![0, 1], 0)).unwrap();

    let link = FakeLink::disabled();
    let runner = RecordingRunner::default();
    let mut fleet = RecordingFleet::new(Some(&cluster));
    // Probe that would hang discovery forever if the all-down early exit
    // were broken (timeout is 1s in the test config as a backstop).
    let mut probes = probe_factory(FakeProbe::default());
    run_failover(&cluster, &cfg, &mut fleet, &link, &runner, &mut probes);

    assert_eq!(cluster.backend(0).status(), BackendStatus::Down);
    assert_eq!(cluster.backend(1).status(), BackendStatus::Down);
    assert_eq!(cluster.request_info().primary_node_id(), -1);
    assert_eq!(cluster.get_next_main_node(), -1);
    assert!(!cluster.request_info().switching());
}

#[test]
fn close_idle_signals_workers_without_transition() {
    let logdir = TempDir::new().unwrap();
    let mut cfg = test_config(2);
    cfg.logdir = logdir.path().to_path_buf();
    let cluster = ClusterState::create(&cfg).unwrap();
    set_all_up_with_primary(&cluster, 0);

    request::push(&cluster, &NodeStateRequest::close_idle()).unwrap();

    let link = FakeLink::disabled();
    let runner = RecordingRunner::default();
    let mut fleet = RecordingFleet::new(Some(&cluster));
    let mut probes = probe_factory(FakeProbe::default());
    run_failover(&cluster, &cfg, &mut fleet, &link, &runner, &mut probes);

    assert_eq!(fleet.signalled_all.len(), 1);
    // No state change, no peer notification, no PCP restart.
    assert_eq!(cluster.backend(0).status(), BackendStatus::Up);
    assert!(link.failover_windows.borrow().is_empty());
    assert_eq!(fleet.pcp_restarted, 0);
    assert_eq!(fleet.pcp_woken, 1);
}

#[test]
fn invalid_requests_are_rejected_without_effect() {
    let logdir = TempDir::new().unwrap();
    let mut cfg = test_config(2);
    cfg.logdir = logdir.path().to_path_buf();
    let cluster = ClusterState::create(&cfg).unwrap();
    set_all_up_with_primary(&cluster, 0);

    let link = FakeLink::disabled();
    let runner = RecordingRunner::default();

    // Failback of an already-up node.
    request::push(&cluster, &NodeStateRequest::node_up(1, 0)).unwrap();
    // Node id out of range.
    request::push(&cluster, &NodeStateRequest::node_up(9, 0)).unwrap();
    // Down request for an unused node id.
    request::push(&cluster, &NodeStateRequest::node_down(vec![-1], 0)).unwrap();

    let mut fleet = RecordingFleet::new(Some(&cluster));
    let mut probes = probe_factory(FakeProbe::default());
    run_failover(&cluster, &cfg, &mut fleet, &link, &runner, &mut probes);

    assert_eq!(cluster.backend(0).status(), BackendStatus::Up);
    assert_eq!(cluster.backend(1).status(), BackendStatus::Up);
    assert_eq!(cluster.request_info().primary_node_id(), 0);
    assert!(fleet.killed.is_empty());
    assert!(runner.commands.borrow().is_empty());
    // Nothing was processed, so the PCP worker keeps running.
    assert_eq!(fleet.pcp_restarted, 0);
}

#[test]
fn follow_primary_degenerates_remaining_backends() {
    let logdir = TempDir::new().unwrap();
    let mut cfg = test_config(3);
    cfg.logdir = logdir.path().to_path_buf();
    cfg.follow_primary_command = "follow %d %m".to_string();
    let cluster = ClusterState::create(&cfg).unwrap();
    set_all_up_with_primary(&cluster, 0);

    request::push(&cluster, &NodeStateRequest::node_down(vec![0], 0)).unwrap();

    let link = FakeLink::disabled();
    let runner = RecordingRunner::default();
    let mut fleet = RecordingFleet::new(Some(&cluster));
    let mut probes = probe_factory(FakeProbe::primary_at(1, &[2]));
    run_failover(&cluster, &cfg, &mut fleet, &link, &runner, &mut probes);

    assert_eq!(cluster.request_info().primary_node_id(), 1);
    // Node 2 was degenerated so the follow command can re-point it.
    assert_eq!(cluster.backend(2).status(), BackendStatus::Down);
    assert_eq!(cluster.backend(1).status(), BackendStatus::Up);
    assert_eq!(cluster.request_info().main_node_id(), 1);
    // Follow child forked with (old main, new primary, old primary).
    assert_eq!(fleet.follow_spawns, vec![(0, 1, 0)]);
}
