//! Peer-cluster synchronization and follow-primary lock scenarios.

mod common;

use common::*;
use poolkeeper::cluster::{BackendStatus, ClusterState};
use poolkeeper::failover::run_failover;
use poolkeeper::follow::{acquire_follow_primary_lock, release_follow_primary_lock};
use poolkeeper::request;
use poolkeeper::watchdog::{
    degenerate_all_quarantine_nodes, sync_backend_from_leader,
    update_backend_quarantine_status, LeaderStatus, WdNodeState,
};
use std::sync::atomic::Ordering;
use tempfile::TempDir;

fn leader_status(statuses: Vec<BackendStatus>, primary: i32) -> LeaderStatus {
    LeaderStatus {
        leader_name: "wd-leader".to_string(),
        statuses,
        primary_node_id: primary,
    }
}

#[test]
fn sync_adopts_leader_view_with_full_restart() {
    let cfg = test_config(2);
    let cluster = ClusterState::create(&cfg).unwrap();
    set_all_up_with_primary(&cluster, 0);

    let link = FakeLink::standby_with_leader(leader_status(
        vec![BackendStatus::Down, BackendStatus::Up],
        1,
    ));
    let mut fleet = RecordingFleet::new(Some(&cluster));
    sync_backend_from_leader(&cluster, &cfg, &link, &mut fleet, false);

    assert_eq!(cluster.backend(0).status(), BackendStatus::Down);
    assert_eq!(cluster.backend(1).status(), BackendStatus::ConnectWait);
    assert_eq!(cluster.request_info().primary_node_id(), 1);
    assert_eq!(cluster.request_info().main_node_id(), 1);
    // Primary moved: the whole fleet restarts.
    assert_eq!(fleet.respawned, vec![0, 1]);
}

#[test]
fn sync_keeps_live_local_primary_when_leader_says_minus_one() {
    let cfg = test_config(2);
    let cluster = ClusterState::create(&cfg).unwrap();
    set_all_up_with_primary(&cluster, 0);

    let link = FakeLink::standby_with_leader(leader_status(
        vec![BackendStatus::Up, BackendStatus::Up],
        -1,
    ));
    let mut fleet = RecordingFleet::new(Some(&cluster));
    sync_backend_from_leader(&cluster, &cfg, &link, &mut fleet, false);

    // The leader's primary is merely quarantined over there.
    assert_eq!(cluster.request_info().primary_node_id(), 0);
}

#[test]
fn quorum_regained_failback_runs_end_to_end() {
    let logdir = TempDir::new().unwrap();
    let mut cfg = test_config(2);
    cfg.logdir = logdir.path().to_path_buf();
    let cluster = ClusterState::create(&cfg).unwrap();
    set_all_up_with_primary(&cluster, 0);

    // Node 0 was quarantined while primary.
    cluster.backend(0).set_status(BackendStatus::Down);
    cluster.backend(0).set_quarantined(true);
    cluster
        .request_info()
        .primary_node_id
        .store(-1, Ordering::SeqCst);

    // Only the cluster leader reissues failback requests.
    let mut link = FakeLink::disabled();
    link.state = WdNodeState::Leader;
    assert_eq!(update_backend_quarantine_status(&cluster, &link), 1);

    let runner = RecordingRunner::default();
    let mut fleet = RecordingFleet::new(Some(&cluster));
    let mut probes = probe_factory(FakeProbe::default());
    run_failover(&cluster, &cfg, &mut fleet, &link, &runner, &mut probes);

    assert_eq!(cluster.backend(0).status(), BackendStatus::ConnectWait);
    assert!(!cluster.backend(0).quarantined());
    assert_eq!(cluster.request_info().primary_node_id(), 0);
    // Update failback: the failback command stays untouched.
    assert!(runner.commands.borrow().is_empty());
}

#[test]
fn inform_quarantine_nodes_degenerates_them_for_real() {
    let logdir = TempDir::new().unwrap();
    let mut cfg = test_config(3);
    cfg.logdir = logdir.path().to_path_buf();
    cfg.failover_command = "failover %d".to_string();
    let cluster = ClusterState::create(&cfg).unwrap();
    set_all_up_with_primary(&cluster, 0);

    cluster.backend(1).set_status(BackendStatus::Down);
    cluster.backend(1).set_quarantined(true);
    cluster.backend(2).set_status(BackendStatus::Down);
    cluster.backend(2).set_quarantined(true);

    assert_eq!(degenerate_all_quarantine_nodes(&cluster), 2);

    let link = FakeLink::disabled();
    let runner = RecordingRunner::default();
    let mut fleet = RecordingFleet::new(Some(&cluster));
    let mut probes = probe_factory(FakeProbe::primary_at(0, &[]));
    run_failover(&cluster, &cfg, &mut fleet, &link, &runner, &mut probes);

    // Quarantine converted to a real failover: flags cleared, command run.
    assert!(!cluster.backend(1).quarantined());
    assert!(!cluster.backend(2).quarantined());
    assert_eq!(cluster.backend(1).status(), BackendStatus::Down);
    assert_eq!(
        *runner.commands.borrow(),
        vec!["failover 1".to_string(), "failover 2".to_string()]
    );
}

#[test]
fn follow_lock_contention_transfers_to_remote() {
    let cfg = test_config(2);
    let cluster = ClusterState::create(&cfg).unwrap();
    let info = cluster.request_info();

    // Local holder takes the lock.
    assert!(acquire_follow_primary_lock(&cluster, true, false));
    assert_eq!(info.follow_primary_count.load(Ordering::SeqCst), 1);

    // Remote request arrives; it never blocks, only marks itself pending.
    assert!(!acquire_follow_primary_lock(&cluster, true, true));
    assert!(info.follow_primary_lock_pending.load(Ordering::SeqCst));

    // Local release hands the lock over instead of freeing it.
    release_follow_primary_lock(&cluster, false);
    assert_eq!(info.follow_primary_count.load(Ordering::SeqCst), 1);
    assert!(info.follow_primary_lock_held_remotely.load(Ordering::SeqCst));
    assert!(!info.follow_primary_lock_pending.load(Ordering::SeqCst));

    // While held remotely, local blocking is avoided with block = false.
    assert!(!acquire_follow_primary_lock(&cluster, false, false));

    // Remote release frees it for good.
    release_follow_primary_lock(&cluster, true);
    assert_eq!(info.follow_primary_count.load(Ordering::SeqCst), 0);
    assert!(!info.follow_primary_lock_held_remotely.load(Ordering::SeqCst));
}

#[test]
fn remote_release_requires_remote_hold() {
    let cfg = test_config(2);
    let cluster = ClusterState::create(&cfg).unwrap();
    let info = cluster.request_info();

    assert!(acquire_follow_primary_lock(&cluster, true, false));
    // A remote release cannot free a locally held lock.
    release_follow_primary_lock(&cluster, true);
    assert_eq!(info.follow_primary_count.load(Ordering::SeqCst), 1);

    release_follow_primary_lock(&cluster, false);
    assert_eq!(info.follow_primary_count.load(Ordering::SeqCst), 0);
}

#[test]
fn watchdog_flagged_requests_survive_queue_round_trip() {
    let cfg = test_config(2);
    let cluster = ClusterState::create(&cfg).unwrap();
    cluster.backend(1).set_status(BackendStatus::Down);
    cluster.backend(1).set_quarantined(true);

    let mut link = FakeLink::disabled();
    link.state = WdNodeState::Leader;
    assert_eq!(update_backend_quarantine_status(&cluster, &link), 1);

    let queued = request::pop(&cluster).unwrap();
    assert!(queued.has_flag(poolkeeper::request::REQ_UPDATE));
    assert!(queued.has_flag(poolkeeper::request::REQ_WATCHDOG));
}
