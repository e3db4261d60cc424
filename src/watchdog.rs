//! Watchdog Synchronization
//!
//! The peer cluster-membership service is an external collaborator; this
//! module owns the seam ([`WatchdogLink`]) and the local half of the
//! protocol: adopting the leader's backend status vector, reissuing
//! failback requests for quarantined nodes once quorum returns, and
//! degenerating quarantined nodes on demand.

use crate::cluster::{BackendStatus, ClusterState, LockId};
use crate::config::Config;
use crate::registry::WorkerFleet;
use crate::request::{self, NodeStateRequest, REQ_CONFIRMED, REQ_UPDATE, REQ_WATCHDOG};
use log::{info, warn};
use std::sync::atomic::Ordering;

/// Local node's standing in the peer cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WdNodeState {
    Disabled,
    Leader,
    Standby,
    Other,
}

/// Authoritative backend view fetched from the cluster leader.
#[derive(Debug, Clone)]
pub struct LeaderStatus {
    pub leader_name: String,
    pub statuses: Vec<BackendStatus>,
    pub primary_node_id: i32,
}

/// Interface consumed from the watchdog service. All calls are
/// best-effort; the transport and consensus live outside this crate.
pub trait WatchdogLink {
    fn enabled(&self) -> bool;
    fn local_state(&self) -> WdNodeState;
    fn quorum_held(&self) -> bool;
    /// `None` when the leader cannot be reached or we are the leader
    /// ourselves (the local view is then authoritative).
    fn leader_backend_status(&self) -> Option<LeaderStatus>;
    /// Tell remote supervisors to quiesce conflicting operations.
    fn failover_start(&self);
    fn failover_end(&self);
    /// Follow-primary lock fan-out to the standby supervisors.
    fn lock_standbys(&self);
    fn unlock_standbys(&self);
}

/// Link used when `use_watchdog` is off; the cluster is just this node.
pub struct NoWatchdog;

impl WatchdogLink for NoWatchdog {
    fn enabled(&self) -> bool {
        false
    }
    fn local_state(&self) -> WdNodeState {
        WdNodeState::Disabled
    }
    fn quorum_held(&self) -> bool {
        true
    }
    fn leader_backend_status(&self) -> Option<LeaderStatus> {
        None
    }
    fn failover_start(&self) {}
    fn failover_end(&self) {}
    fn lock_standbys(&self) {}
    fn unlock_standbys(&self) {}
}

/// Fetch the leader's backend status vector and reconcile the local view,
/// restarting workers the same way the failover engine would.
///
/// `initializing` suppresses the restart pass during startup, before any
/// worker exists.
pub fn sync_backend_from_leader(
    cluster: &ClusterState,
    cfg: &Config,
    link: &dyn WatchdogLink,
    fleet: &mut dyn WorkerFleet,
    initializing: bool,
) {
    let leader = match link.leader_backend_status() {
        Some(status) if !status.statuses.is_empty() => status,
        Some(_) => {
            info!("I am the leader watchdog node, using the local backend status");
            return;
        }
        None => {
            warn!("failed to get the backend status from the leader watchdog node, using the local status");
            return;
        }
    };

    info!(
        "leader watchdog node \"{}\" returned status for {} backend nodes",
        leader.leader_name,
        leader.statuses.len()
    );

    let mut primary_changed = false;
    let mut changed_to_down = false;
    let mut changed_to_up = false;
    let mut reload_main_node_id = false;
    let mut down_node_ids: Vec<i32> = Vec::new();

    let n = leader.statuses.len().min(cluster.num_backends());
    for i in 0..n {
        let backend = cluster.backend(i);
        // The leader's verdict supersedes any local quarantine.
        backend.set_quarantined(false);
        match leader.statuses[i] {
            BackendStatus::Down => {
                if backend.status() != BackendStatus::Down {
                    backend.set_status(BackendStatus::Down);
                    reload_main_node_id = true;
                    changed_to_down = true;
                    down_node_ids.push(i as i32);
                    info!(
                        "backend {} is set to down status, backend is DOWN on cluster leader \"{}\"",
                        i, leader.leader_name
                    );
                }
            }
            BackendStatus::ConnectWait | BackendStatus::Up => {
                if backend.status() != BackendStatus::ConnectWait {
                    if backend.status() == BackendStatus::Down {
                        changed_to_up = true;
                    }
                    backend.set_status(BackendStatus::ConnectWait);
                    reload_main_node_id = true;
                    info!(
                        "backend {} is set to UP status, backend is UP on cluster leader \"{}\"",
                        i, leader.leader_name
                    );
                }
            }
            BackendStatus::Unused => {}
        }
    }

    let info_block = cluster.request_info();
    let local_primary = info_block.primary_node_id();
    if cfg.mode.supports_primary() && local_primary != leader.primary_node_id {
        if !initializing {
            info!(
                "primary node {} on leader watchdog node \"{}\" is different from local primary node {}",
                leader.primary_node_id, leader.leader_name, local_primary
            );
        }
        // A leader reporting -1 while our primary is alive locally means
        // the primary is merely quarantined over there; keep ours.
        if local_primary >= 0
            && leader.primary_node_id == -1
            && cluster.backend(local_primary as usize).status() != BackendStatus::Down
        {
            info!(
                "primary node {} seems quarantined on the leader, keeping the current primary",
                local_primary
            );
        } else {
            let _guard = cluster.lock(LockId::RequestInfo);
            info_block
                .primary_node_id
                .store(leader.primary_node_id, Ordering::SeqCst);
            primary_changed = true;
        }
    }

    if reload_main_node_id {
        let _guard = cluster.lock(LockId::RequestInfo);
        info_block
            .main_node_id
            .store(cluster.get_next_main_node(), Ordering::SeqCst);
    }

    if initializing {
        return;
    }

    if !changed_to_up && !changed_to_down && !primary_changed {
        info!(
            "backend nodes status remains same after the sync from \"{}\"",
            leader.leader_name
        );
        return;
    }

    // Restart scope mirrors the failover engine: full restart unless we
    // are streaming and the primary stayed put.
    let (need_restart, partial_restart) = if !cfg.mode.is_streaming() {
        info!("node status changed after sync, restarting all children (not in streaming replication mode)");
        (true, false)
    } else if primary_changed {
        info!("primary node changed after sync, restarting all children");
        (true, false)
    } else if !changed_to_down {
        info!("no backend node was detached by the sync, no need to restart children");
        (false, false)
    } else {
        info!(
            "{} backend node(s) were detached by the sync, restarting affected children",
            down_node_ids.len()
        );
        (true, !cluster.all_backends_down())
    };

    if need_restart {
        for w in 0..cluster.num_workers() {
            let restart = if partial_restart {
                worker_uses_any_node(cluster, w, &down_node_ids)
            } else {
                true
            };
            if restart {
                if cluster.worker(w).pid() != 0 {
                    fleet.kill_query_worker(w);
                    fleet.respawn_query_worker(w);
                }
            } else {
                cluster.worker(w).set_need_restart(true);
            }
        }
    } else {
        for w in 0..cluster.num_workers() {
            cluster.worker(w).set_need_restart(true);
        }
    }

    fleet.signal_generic_worker();
    fleet.ensure_health_check_workers();
}

/// True when any pool slot of worker `w` holds a live connection that is
/// load-balanced to one of `nodes`.
pub fn worker_uses_any_node(cluster: &ClusterState, w: usize, nodes: &[i32]) -> bool {
    for pool in 0..cluster.max_pool() {
        for b in 0..cluster.num_backends() {
            let con = cluster.coninfo(w, pool, b);
            if con.connected() && nodes.contains(&con.load_balancing_node()) {
                info!(
                    "worker {} needs restart because pool {} uses backend {}",
                    w,
                    pool,
                    con.load_balancing_node()
                );
                return true;
            }
        }
    }
    false
}

/// Quorum came back: reissue a failback request for every quarantined
/// backend so its real state gets re-established. Only the cluster
/// leader drives this; standbys receive the outcome through sync.
/// Returns the number of requests enqueued.
pub fn update_backend_quarantine_status(
    cluster: &ClusterState,
    link: &dyn WatchdogLink,
) -> usize {
    let mut enqueued = 0;
    for i in 0..cluster.num_backends() {
        let backend = cluster.backend(i);
        if backend.quarantined() && backend.status() == BackendStatus::Down {
            if link.local_state() == WdNodeState::Leader {
                let request =
                    NodeStateRequest::node_up(i as i32, REQ_UPDATE | REQ_WATCHDOG);
                match request::push(cluster, &request) {
                    Ok(_) => enqueued += 1,
                    Err(e) => warn!("cannot reissue failback for quarantined node {}: {}", i, e),
                }
            }
        }
    }
    enqueued
}

/// Turn every quarantined backend into a real DOWN node. Returns the
/// number of nodes queued for degeneration.
pub fn degenerate_all_quarantine_nodes(cluster: &ClusterState) -> usize {
    let quarantined: Vec<i32> = (0..cluster.num_backends())
        .filter(|&i| cluster.backend(i).quarantined())
        .map(|i| i as i32)
        .collect();
    if quarantined.is_empty() {
        return 0;
    }
    info!("degenerating quarantine nodes: {:?}", quarantined);
    let request = NodeStateRequest::node_down(quarantined.clone(), REQ_CONFIRMED);
    match request::push(cluster, &request) {
        Ok(_) => quarantined.len(),
        Err(e) => {
            warn!("cannot degenerate quarantine nodes: {}", e);
            0
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::cluster::tests::test_config;
    use crate::cluster::ClusterState;
    use nix::sys::signal::Signal;

    /// Scriptable watchdog link.
    pub struct FakeLink {
        pub state: WdNodeState,
        pub quorum: bool,
        pub leader: Option<LeaderStatus>,
    }

    impl WatchdogLink for FakeLink {
        fn enabled(&self) -> bool {
            true
        }
        fn local_state(&self) -> WdNodeState {
            self.state
        }
        fn quorum_held(&self) -> bool {
            self.quorum
        }
        fn leader_backend_status(&self) -> Option<LeaderStatus> {
            self.leader.clone()
        }
        fn failover_start(&self) {}
        fn failover_end(&self) {}
        fn lock_standbys(&self) {}
        fn unlock_standbys(&self) {}
    }

    /// Records what the sync decided to do with the fleet.
    #[derive(Default)]
    pub struct RecordingFleet {
        pub killed: Vec<usize>,
        pub respawned: Vec<usize>,
        pub generic_signalled: usize,
        pub health_checks_ensured: usize,
    }

    impl WorkerFleet for RecordingFleet {
        fn kill_query_worker(&mut self, idx: usize) {
            self.killed.push(idx);
        }
        fn respawn_query_worker(&mut self, idx: usize) {
            self.respawned.push(idx);
        }
        fn signal_query_workers(&mut self, _sig: Signal) {}
        fn signal_generic_worker(&mut self) {
            self.generic_signalled += 1;
        }
        fn wakeup_pcp_worker(&mut self) {}
        fn restart_pcp_worker(&mut self) {}
        fn spawn_follow_child(&mut self, _old_main: i32, _new_primary: i32, _old_primary: i32) {}
        fn ensure_health_check_workers(&mut self) {
            self.health_checks_ensured += 1;
        }
    }

    fn leader(statuses: Vec<BackendStatus>, primary: i32) -> Option<LeaderStatus> {
        Some(LeaderStatus {
            leader_name: "wd-leader".to_string(),
            statuses,
            primary_node_id: primary,
        })
    }

    #[test]
    fn test_sync_adopts_leader_view_full_restart() {
        let cfg = test_config(2);
        let cluster = ClusterState::create(&cfg).unwrap();
        cluster.worker(0).set_pid(100);
        cluster.worker(1).set_pid(101);
        cluster
            .request_info()
            .primary_node_id
            .store(0, Ordering::SeqCst);

        let link = FakeLink {
            state: WdNodeState::Standby,
            quorum: true,
            leader: leader(vec![BackendStatus::Down, BackendStatus::Up], 1),
        };
        let mut fleet = RecordingFleet::default();
        sync_backend_from_leader(&cluster, &cfg, &link, &mut fleet, false);

        assert_eq!(cluster.backend(0).status(), BackendStatus::Down);
        assert_eq!(cluster.backend(1).status(), BackendStatus::ConnectWait);
        assert_eq!(cluster.request_info().primary_node_id(), 1);
        assert_eq!(cluster.request_info().main_node_id(), 1);
        // Primary changed: every worker restarts.
        assert_eq!(fleet.killed, vec![0, 1]);
        assert_eq!(fleet.respawned, vec![0, 1]);
        assert_eq!(fleet.generic_signalled, 1);
        assert_eq!(fleet.health_checks_ensured, 1);
    }

    #[test]
    fn test_sync_keeps_local_primary_when_leader_reports_quarantine() {
        let cfg = test_config(2);
        let cluster = ClusterState::create(&cfg).unwrap();
        cluster
            .request_info()
            .primary_node_id
            .store(0, Ordering::SeqCst);

        let link = FakeLink {
            state: WdNodeState::Standby,
            quorum: true,
            leader: leader(
                vec![BackendStatus::ConnectWait, BackendStatus::ConnectWait],
                -1,
            ),
        };
        let mut fleet = RecordingFleet::default();
        sync_backend_from_leader(&cluster, &cfg, &link, &mut fleet, false);

        // Local primary is alive: the leader's -1 is ignored.
        assert_eq!(cluster.request_info().primary_node_id(), 0);
    }

    #[test]
    fn test_sync_clears_quarantine_unconditionally() {
        let cfg = test_config(2);
        let cluster = ClusterState::create(&cfg).unwrap();
        cluster.backend(1).set_quarantined(true);
        cluster.backend(1).set_status(BackendStatus::Down);
        cluster
            .request_info()
            .primary_node_id
            .store(0, Ordering::SeqCst);

        let link = FakeLink {
            state: WdNodeState::Standby,
            quorum: true,
            leader: leader(vec![BackendStatus::Up, BackendStatus::Up], 0),
        };
        let mut fleet = RecordingFleet::default();
        sync_backend_from_leader(&cluster, &cfg, &link, &mut fleet, false);

        assert!(!cluster.backend(1).quarantined());
        assert_eq!(cluster.backend(1).status(), BackendStatus::ConnectWait);
    }

    #[test]
    fn test_sync_selective_restart_on_standby_down() {
        let cfg = test_config(2);
        let cluster = ClusterState::create(&cfg).unwrap();
        cluster.worker(0).set_pid(100);
        cluster.worker(1).set_pid(101);
        cluster
            .request_info()
            .primary_node_id
            .store(0, Ordering::SeqCst);
        // Worker 1 holds a pooled connection load-balanced to node 1.
        cluster.coninfo(1, 0, 1).set(true, 1, 777);

        let link = FakeLink {
            state: WdNodeState::Standby,
            quorum: true,
            leader: leader(vec![BackendStatus::Up, BackendStatus::Down], 0),
        };
        let mut fleet = RecordingFleet::default();
        sync_backend_from_leader(&cluster, &cfg, &link, &mut fleet, false);

        assert_eq!(fleet.killed, vec![1]);
        assert!(cluster.worker(0).need_restart());
        assert!(!cluster.worker(1).need_restart());
    }

    #[test]
    fn test_sync_no_change_is_quiet() {
        let cfg = test_config(2);
        let cluster = ClusterState::create(&cfg).unwrap();
        cluster
            .request_info()
            .primary_node_id
            .store(0, Ordering::SeqCst);

        let link = FakeLink {
            state: WdNodeState::Standby,
            quorum: true,
            leader: leader(
                vec![BackendStatus::ConnectWait, BackendStatus::ConnectWait],
                0,
            ),
        };
        let mut fleet = RecordingFleet::default();
        sync_backend_from_leader(&cluster, &cfg, &link, &mut fleet, false);
        assert!(fleet.killed.is_empty());
        assert_eq!(fleet.generic_signalled, 0);
    }

    #[test]
    fn test_quorum_regained_reissues_failback_on_leader_only() {
        let cfg = test_config(2);
        let cluster = ClusterState::create(&cfg).unwrap();
        cluster.backend(1).set_status(BackendStatus::Down);
        cluster.backend(1).set_quarantined(true);

        let standby_link = FakeLink {
            state: WdNodeState::Standby,
            quorum: true,
            leader: None,
        };
        assert_eq!(update_backend_quarantine_status(&cluster, &standby_link), 0);

        let leader_link = FakeLink {
            state: WdNodeState::Leader,
            quorum: true,
            leader: None,
        };
        assert_eq!(update_backend_quarantine_status(&cluster, &leader_link), 1);

        let queued = request::pop(&cluster).unwrap();
        assert_eq!(queued.kind, crate::request::RequestKind::NodeUp);
        assert_eq!(queued.node_ids, vec![1]);
        assert!(queued.has_flag(REQ_UPDATE));
        assert!(queued.has_flag(REQ_WATCHDOG));
    }

    #[test]
    fn test_degenerate_quarantine_nodes() {
        let cfg = test_config(3);
        let cluster = ClusterState::create(&cfg).unwrap();
        assert_eq!(degenerate_all_quarantine_nodes(&cluster), 0);

        cluster.backend(0).set_status(BackendStatus::Down);
        cluster.backend(0).set_quarantined(true);
        cluster.backend(2).set_status(BackendStatus::Down);
        cluster.backend(2).set_quarantined(true);
        assert_eq!(degenerate_all_quarantine_nodes(&cluster), 2);

        let queued = request::pop(&cluster).unwrap();
        assert_eq!(queued.kind, crate::request::RequestKind::NodeDown);
        assert_eq!(queued.node_ids, vec![0, 2]);
        assert!(queued.has_flag(REQ_CONFIRMED));
    }
}
