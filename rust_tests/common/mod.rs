//! Shared fakes for the integration tests: a scriptable probe, a
//! recording worker fleet, a recording command runner and a scriptable
//! watchdog link.

use poolkeeper::cluster::{BackendRole, BackendStatus, ClusterState};
use poolkeeper::command::CommandRunner;
use poolkeeper::config::Config;
use poolkeeper::primary::{BackendProbe, WalReceiverInfo};
use poolkeeper::registry::WorkerFleet;
use poolkeeper::watchdog::{LeaderStatus, WatchdogLink, WdNodeState};
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::Ordering;

/// An n-backend cluster with two query workers and two pools per worker.
pub fn test_config(n: usize) -> Config {
    let mut backends = String::new();
    for i in 0..n {
        backends.push_str(&format!(
            "[[backend]]\nhost = \"db{}.example\"\nport = 5432\ndata_directory = \"/data/{}\"\n",
            i, i
        ));
    }
    let toml_content = format!(
        "num_init_children = 2\nmax_pool = 2\nsearch_primary_node_timeout = 1\n{}",
        backends
    );
    toml::from_str(&toml_content).unwrap()
}

/// Bring a cluster into "primary plus standbys, everything up" shape.
pub fn set_all_up_with_primary(cluster: &ClusterState, primary: usize) {
    for i in 0..cluster.num_backends() {
        cluster.backend(i).set_status(BackendStatus::Up);
        cluster.backend(i).set_role(if i == primary {
            BackendRole::Primary
        } else {
            BackendRole::Standby
        });
    }
    cluster
        .request_info()
        .primary_node_id
        .store(primary as i32, Ordering::SeqCst);
    cluster
        .request_info()
        .main_node_id
        .store(cluster.get_next_main_node(), Ordering::SeqCst);
    for w in 0..cluster.num_workers() {
        cluster.worker(w).set_pid(100 + w as i32);
    }
}

// =============================================================================
// Probe
// =============================================================================

#[derive(Default, Clone)]
pub struct FakeProbe {
    pub in_recovery: HashMap<usize, bool>,
    pub receivers: HashMap<usize, WalReceiverInfo>,
}

impl FakeProbe {
    pub fn primary_at(node: usize, standbys: &[usize]) -> FakeProbe {
        let mut probe = FakeProbe::default();
        probe.in_recovery.insert(node, false);
        for &s in standbys {
            probe.in_recovery.insert(s, true);
        }
        probe
    }
}

impl BackendProbe for FakeProbe {
    fn is_in_recovery(&mut self, node: usize) -> Option<bool> {
        self.in_recovery.get(&node).copied()
    }
    fn server_version(&mut self, _node: usize) -> Option<i32> {
        Some(150000)
    }
    fn wal_receiver(&mut self, node: usize) -> Option<WalReceiverInfo> {
        self.receivers.get(&node).cloned()
    }
}

/// Probe factory returning a fresh clone of `probe` per discovery round.
pub fn probe_factory(probe: FakeProbe) -> impl FnMut() -> Box<dyn BackendProbe> {
    move || Box::new(probe.clone()) as Box<dyn BackendProbe>
}

// =============================================================================
// Fleet
// =============================================================================

/// Records every fleet operation; optionally watches the switching flag
/// to prove transitions happen under it.
pub struct RecordingFleet<'a> {
    pub cluster: Option<&'a ClusterState>,
    pub killed: Vec<usize>,
    pub respawned: Vec<usize>,
    pub follow_spawns: Vec<(i32, i32, i32)>,
    pub signalled_all: Vec<i32>,
    pub generic_signalled: usize,
    pub pcp_woken: usize,
    pub pcp_restarted: usize,
    pub health_checks_ensured: usize,
    pub switching_observed: Vec<bool>,
}

impl<'a> RecordingFleet<'a> {
    pub fn new(cluster: Option<&'a ClusterState>) -> RecordingFleet<'a> {
        RecordingFleet {
            cluster,
            killed: Vec::new(),
            respawned: Vec::new(),
            follow_spawns: Vec::new(),
            signalled_all: Vec::new(),
            generic_signalled: 0,
            pcp_woken: 0,
            pcp_restarted: 0,
            health_checks_ensured: 0,
            switching_observed: Vec::new(),
        }
    }

    fn observe(&mut self) {
        if let Some(cluster) = self.cluster {
            self.switching_observed
                .push(cluster.request_info().switching());
        }
    }
}

impl WorkerFleet for RecordingFleet<'_> {
    fn kill_query_worker(&mut self, idx: usize) {
        self.observe();
        self.killed.push(idx);
    }
    fn respawn_query_worker(&mut self, idx: usize) {
        self.observe();
        self.respawned.push(idx);
    }
    fn signal_query_workers(&mut self, sig: nix::sys::signal::Signal) {
        self.signalled_all.push(sig as i32);
    }
    fn signal_generic_worker(&mut self) {
        self.generic_signalled += 1;
    }
    fn wakeup_pcp_worker(&mut self) {
        self.pcp_woken += 1;
    }
    fn restart_pcp_worker(&mut self) {
        self.pcp_restarted += 1;
    }
    fn spawn_follow_child(&mut self, old_main: i32, new_primary: i32, old_primary: i32) {
        self.follow_spawns.push((old_main, new_primary, old_primary));
    }
    fn ensure_health_check_workers(&mut self) {
        self.health_checks_ensured += 1;
    }
}

// =============================================================================
// Command runner
// =============================================================================

#[derive(Default)]
pub struct RecordingRunner {
    pub commands: RefCell<Vec<String>>,
}

impl CommandRunner for RecordingRunner {
    fn run(&self, command: &str) -> i32 {
        self.commands.borrow_mut().push(command.to_string());
        0
    }
}

// =============================================================================
// Watchdog link
// =============================================================================

pub struct FakeLink {
    pub state: WdNodeState,
    pub quorum: bool,
    pub leader: Option<LeaderStatus>,
    pub failover_windows: RefCell<Vec<&'static str>>,
}

impl FakeLink {
    pub fn disabled() -> FakeLink {
        FakeLink {
            state: WdNodeState::Disabled,
            quorum: true,
            leader: None,
            failover_windows: RefCell::new(Vec::new()),
        }
    }

    pub fn standby_with_leader(leader: LeaderStatus) -> FakeLink {
        FakeLink {
            state: WdNodeState::Standby,
            quorum: true,
            leader: Some(leader),
            failover_windows: RefCell::new(Vec::new()),
        }
    }
}

impl WatchdogLink for FakeLink {
    fn enabled(&self) -> bool {
        self.state != WdNodeState::Disabled
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
    fn failover_start(&self) {
        self.failover_windows.borrow_mut().push("start");
    }
    fn failover_end(&self) {
        self.failover_windows.borrow_mut().push("end");
    }
    fn lock_standbys(&self) {}
    fn unlock_standbys(&self) {}
}
