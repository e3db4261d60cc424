//! Primary Node Discovery
//!
//! Probes every valid backend with `SELECT pg_is_in_recovery()` and
//! classifies the respondents. With standbys present and
//! `detach_false_primary` enabled, `pg_stat_wal_receiver` is consulted on
//! each standby to establish which primary actually owns it; a primary
//! owning fewer standbys than exist is a split-brain survivor and gets
//! marked invalid.

use crate::cluster::{ClusterState, InterruptReason};
use crate::config::Config;
use crate::follow;
use log::{debug, info, warn};
use std::thread;
use std::time::{Duration, Instant};

/// Classification of one backend after a probe round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAssessment {
    Unused,
    Primary,
    Standby,
    /// Split brain: looks like a primary but does not own the standbys.
    Invalid,
}

/// WAL receiver state reported by a standby.
#[derive(Debug, Clone)]
pub struct WalReceiverInfo {
    pub status: String,
    pub host: String,
    pub port: String,
}

/// Probe connection seam. The production implementation speaks libpq to
/// the backends; tests script the answers.
pub trait BackendProbe {
    /// `None` means the node did not respond; it is treated as not
    /// respondent and retried on the next round.
    fn is_in_recovery(&mut self, node: usize) -> Option<bool>;
    fn server_version(&mut self, node: usize) -> Option<i32>;
    fn wal_receiver(&mut self, node: usize) -> Option<WalReceiverInfo>;
}

/// Outcome of one discovery round: the trusted primary (or -1) and every
/// node found invalid. The caller turns invalid nodes into detach
/// requests when `detach_false_primary` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindOutcome {
    pub primary: i32,
    pub invalid: Vec<usize>,
}

impl FindOutcome {
    fn none() -> FindOutcome {
        FindOutcome {
            primary: -1,
            invalid: Vec::new(),
        }
    }
}

const WAL_RECEIVER_MIN_VERSION: i32 = 90600;

/// Classify every backend. Must not panic on backend errors; a failed
/// probe simply leaves the node unclassified for this round.
pub fn verify_backend_node_status(
    cluster: &ClusterState,
    cfg: &Config,
    probe: &mut dyn BackendProbe,
) -> Vec<NodeAssessment> {
    let n = cluster.num_backends();
    let mut status = vec![NodeAssessment::Unused; n];
    let mut num_primaries = 0usize;
    let mut num_standbys = 0usize;

    for i in 0..n {
        if !cluster.backend_valid(i) {
            continue;
        }
        match probe.is_in_recovery(i) {
            Some(true) => {
                status[i] = NodeAssessment::Standby;
                num_standbys += 1;
            }
            Some(false) => {
                status[i] = NodeAssessment::Primary;
                num_primaries += 1;
            }
            None => {
                info!("verify backend status: node {} did not respond to probe", i);
                cluster
                    .backend_stats(i)
                    .probe_failure_count
                    .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
        }
    }

    if num_primaries == 0 {
        debug!("verify backend status: there's no primary node");
        return status;
    }

    if num_standbys == 0 {
        if num_primaries == 1 {
            return status;
        }
        // Multiple primaries and nothing streaming from any of them.
        // Trust the lowest-indexed one and flag the rest.
        if let Some(first) = status.iter().position(|s| *s == NodeAssessment::Primary) {
            debug!("verify backend status: node {} is the trusted primary", first);
            for (i, s) in status.iter_mut().enumerate().skip(first + 1) {
                if *s == NodeAssessment::Primary {
                    *s = if cfg.detach_false_primary {
                        debug!("verify backend status: node {} is a false primary", i);
                        NodeAssessment::Invalid
                    } else {
                        NodeAssessment::Unused
                    };
                }
            }
        }
        return status;
    }

    if !cfg.detach_false_primary {
        debug!("verify backend status: detach_false_primary is off, skipping connectivity checks");
        return status;
    }

    // pg_stat_wal_receiver only exists from 9.6.0 on.
    let checkable = (0..n)
        .filter(|&i| cluster.backend_valid(i))
        .any(|i| probe.server_version(i).unwrap_or(0) >= WAL_RECEIVER_MIN_VERSION);
    if !checkable {
        debug!("verify backend status: server version too old, skipping connectivity checks");
        return status;
    }

    let mut owned = vec![0usize; n];
    let mut true_primary: i32 = -1;

    for i in 0..n {
        if status[i] != NodeAssessment::Primary {
            continue;
        }
        for j in 0..n {
            if status[j] != NodeAssessment::Standby {
                continue;
            }
            let receiver = match probe.wal_receiver(j) {
                Some(r) => r,
                None => {
                    debug!("verify backend status: no wal receiver info from standby {}", j);
                    continue;
                }
            };
            if receiver.status != "streaming" {
                debug!(
                    "verify backend status: standby {} wal receiver is \"{}\", not streaming",
                    j, receiver.status
                );
                continue;
            }
            let backend = cluster.backend(i);
            if standby_points_at(backend.host(), backend.port(), &receiver) {
                owned[i] += 1;
                if owned[i] == num_standbys {
                    true_primary = i as i32;
                }
            } else {
                info!(
                    "verify backend status: primary {} does not connect to standby {}",
                    i, j
                );
            }
        }
    }

    for i in 0..n {
        if status[i] == NodeAssessment::Primary && owned[i] < num_standbys {
            warn!(
                "verify backend status: primary {} owns only {} standbys out of {}",
                i, owned[i], num_standbys
            );
            if true_primary >= 0 {
                status[i] = NodeAssessment::Invalid;
            }
        }
    }

    status
}

/// A standby "points at" a primary when its wal receiver connection host
/// and port match the primary's address. A primary configured with a Unix
/// socket directory matches an empty host or TCP localhost.
fn standby_points_at(primary_host: &str, primary_port: u16, receiver: &WalReceiverInfo) -> bool {
    let host_matches = (primary_host.starts_with('/')
        && (receiver.host.is_empty() || receiver.host == "localhost"))
        || primary_host == receiver.host;
    host_matches
        && receiver
            .port
            .parse::<u16>()
            .map(|p| p == primary_port)
            .unwrap_or(false)
}

/// One discovery round. Takes the follow-primary lock around the probe so
/// false-primary detection and a running follow command never interleave.
pub fn find_primary_node(
    cluster: &ClusterState,
    cfg: &Config,
    probe: &mut dyn BackendProbe,
) -> FindOutcome {
    if !cfg.mode.supports_primary() {
        debug!("find primary node: not in a single-primary replication mode");
        return FindOutcome::none();
    }

    for i in 0..cluster.num_backends() {
        if cluster.backend(i).always_primary() {
            debug!("find primary node: node {} carries the always-primary flag", i);
            return FindOutcome {
                primary: i as i32,
                invalid: Vec::new(),
            };
        }
    }

    follow::acquire_follow_primary_lock(cluster, true, false);
    let status = verify_backend_node_status(cluster, cfg, probe);
    follow::release_follow_primary_lock(cluster, false);

    let mut primary: i32 = -1;
    let mut invalid = Vec::new();
    for (i, s) in status.iter().enumerate() {
        match s {
            NodeAssessment::Primary => {
                info!("find primary node: primary node is {}", i);
                if primary < 0 {
                    primary = i as i32;
                }
            }
            NodeAssessment::Standby => info!("find primary node: standby node is {}", i),
            NodeAssessment::Invalid => {
                info!("find primary node: invalid node {}", i);
                invalid.push(i);
            }
            NodeAssessment::Unused => {}
        }
    }
    FindOutcome { primary, invalid }
}

/// Retry wrapper: probe at 1-second intervals until a primary shows up or
/// `search_primary_node_timeout` expires (0 = never). Returns early when
/// all backends are down, or with the current primary when a follow
/// command is in flight (probing now would deadlock against it).
pub fn find_primary_node_repeatedly(
    cluster: &ClusterState,
    cfg: &Config,
    make_probe: &mut (dyn FnMut() -> Box<dyn BackendProbe> + '_),
) -> FindOutcome {
    if !cfg.mode.supports_primary() {
        return FindOutcome::none();
    }

    if cluster.request_info().follow_primary_ongoing() {
        let current = cluster.request_info().primary_node_id();
        info!(
            "find primary node: follow primary is ongoing, keeping current primary {}",
            current
        );
        return FindOutcome {
            primary: current,
            invalid: Vec::new(),
        };
    }

    if cluster.no_valid_backend() {
        info!("find primary node: all of the backends are down, giving up");
        return FindOutcome::none();
    }

    info!("find primary node: waiting for finding a primary node");
    let timeout = cfg.search_primary_node_timeout;
    let expiration = Instant::now() + Duration::from_secs(timeout);

    loop {
        if timeout != 0 && Instant::now() >= expiration {
            info!(
                "failed to find primary node: expired after {} seconds",
                timeout
            );
            return FindOutcome::none();
        }
        let mut probe = make_probe();
        let outcome = find_primary_node(cluster, cfg, probe.as_mut());
        if outcome.primary != -1 {
            return outcome;
        }
        thread::sleep(Duration::from_secs(1));
    }
}

/// Turn invalid nodes from a discovery round into detach requests.
/// They join the queue and are handled inside the same drain.
pub fn request_detach_of_invalid_nodes(cluster: &ClusterState, invalid: &[usize]) {
    use crate::request::{self, NodeStateRequest, REQ_CONFIRMED, REQ_SWITCHOVER};

    for &i in invalid {
        warn!("detaching false primary node {}", i);
        let request =
            NodeStateRequest::node_down(vec![i as i32], REQ_SWITCHOVER | REQ_CONFIRMED);
        if request::push(cluster, &request).is_err() {
            warn!("request queue full, cannot detach false primary node {}", i);
        } else {
            cluster
                .signal_slot()
                .raise(InterruptReason::FailoverInterrupt);
        }
    }
}

// =============================================================================
// SQL probe (production implementation)
// =============================================================================

/// Probe connections established with the streaming-replication check
/// credentials. One connection per valid backend, opened eagerly like the
/// discovery round expects; a backend that refuses the connection is
/// simply not respondent this round.
pub struct SqlProbe {
    clients: Vec<Option<postgres::Client>>,
    versions: Vec<i32>,
}

impl SqlProbe {
    pub fn connect(cluster: &ClusterState, cfg: &Config) -> SqlProbe {
        let n = cluster.num_backends();
        let mut clients = Vec::with_capacity(n);
        for i in 0..n {
            if !cluster.backend_valid(i) {
                clients.push(None);
                continue;
            }
            let backend = cluster.backend(i);
            let mut pg = postgres::Config::new();
            pg.host(backend.host())
                .port(backend.port())
                .user(&cfg.sr_check_user)
                .dbname(&cfg.sr_check_database)
                .connect_timeout(Duration::from_secs(10));
            if !cfg.sr_check_password.is_empty() {
                pg.password(&cfg.sr_check_password);
            }
            match pg.connect(postgres::NoTls) {
                Ok(client) => clients.push(Some(client)),
                Err(e) => {
                    info!("probe connection to node {} failed: {}", i, e);
                    clients.push(None);
                }
            }
        }
        SqlProbe {
            clients,
            versions: vec![0; n],
        }
    }
}

impl BackendProbe for SqlProbe {
    fn is_in_recovery(&mut self, node: usize) -> Option<bool> {
        let client = self.clients.get_mut(node)?.as_mut()?;
        match client.query_one("SELECT pg_is_in_recovery()", &[]) {
            Ok(row) => row.try_get(0).ok(),
            Err(e) => {
                info!("pg_is_in_recovery() failed on node {}: {}", node, e);
                None
            }
        }
    }

    fn server_version(&mut self, node: usize) -> Option<i32> {
        if let Some(&v) = self.versions.get(node) {
            if v != 0 {
                return Some(v);
            }
        }
        let client = self.clients.get_mut(node)?.as_mut()?;
        match client.query_one("SELECT current_setting('server_version_num')", &[]) {
            Ok(row) => {
                let raw: String = row.try_get(0).ok()?;
                let version = raw.trim().parse().ok()?;
                self.versions[node] = version;
                Some(version)
            }
            Err(e) => {
                info!("server version query failed on node {}: {}", node, e);
                None
            }
        }
    }

    fn wal_receiver(&mut self, node: usize) -> Option<WalReceiverInfo> {
        let client = self.clients.get_mut(node)?.as_mut()?;
        let rows = match client.query("SELECT status, conninfo FROM pg_stat_wal_receiver", &[]) {
            Ok(rows) => rows,
            Err(e) => {
                info!("pg_stat_wal_receiver query failed on node {}: {}", node, e);
                return None;
            }
        };
        let row = rows.first()?;
        let status: String = row.try_get::<_, Option<String>>(0).ok()??;
        let conninfo: String = row.try_get::<_, Option<String>>(1).ok()??;
        let (host, port) = parse_conninfo(&conninfo);
        Some(WalReceiverInfo { status, host, port })
    }
}

/// Pull `host` and `port` out of a libpq conninfo string.
fn parse_conninfo(conninfo: &str) -> (String, String) {
    let mut host = String::new();
    let mut port = String::new();
    for token in conninfo.split_whitespace() {
        if let Some(v) = token.strip_prefix("host=") {
            host = v.to_string();
        } else if let Some(v) = token.strip_prefix("port=") {
            port = v.to_string();
        }
    }
    (host, port)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::test_config;
    use crate::cluster::{BackendStatus, ClusterState};
    use std::collections::HashMap;

    /// Scriptable probe used across the unit tests.
    #[derive(Default)]
    pub struct FakeProbe {
        pub in_recovery: HashMap<usize, bool>,
        pub versions: HashMap<usize, i32>,
        pub receivers: HashMap<usize, WalReceiverInfo>,
    }

    impl BackendProbe for FakeProbe {
        fn is_in_recovery(&mut self, node: usize) -> Option<bool> {
            self.in_recovery.get(&node).copied()
        }
        fn server_version(&mut self, node: usize) -> Option<i32> {
            Some(*self.versions.get(&node).unwrap_or(&150000))
        }
        fn wal_receiver(&mut self, node: usize) -> Option<WalReceiverInfo> {
            self.receivers.get(&node).cloned()
        }
    }

    fn receiver_for(host: &str, port: &str) -> WalReceiverInfo {
        WalReceiverInfo {
            status: "streaming".to_string(),
            host: host.to_string(),
            port: port.to_string(),
        }
    }

    #[test]
    fn test_no_primary_round() {
        let cluster = ClusterState::create(&test_config(2)).unwrap();
        let cfg = test_config(2);
        let mut probe = FakeProbe::default();
        probe.in_recovery.insert(0, true);
        probe.in_recovery.insert(1, true);

        let status = verify_backend_node_status(&cluster, &cfg, &mut probe);
        assert_eq!(status, vec![NodeAssessment::Standby, NodeAssessment::Standby]);

        let outcome = find_primary_node(&cluster, &cfg, &mut probe);
        assert_eq!(outcome.primary, -1);
    }

    #[test]
    fn test_single_primary_accepted() {
        let cluster = ClusterState::create(&test_config(2)).unwrap();
        let cfg = test_config(2);
        let mut probe = FakeProbe::default();
        probe.in_recovery.insert(0, false);

        let outcome = find_primary_node(&cluster, &cfg, &mut probe);
        assert_eq!(outcome.primary, 0);
        assert!(outcome.invalid.is_empty());
    }

    #[test]
    fn test_split_brain_no_standbys_detach() {
        let cluster = ClusterState::create(&test_config(2)).unwrap();
        let mut cfg = test_config(2);
        cfg.detach_false_primary = true;
        let mut probe = FakeProbe::default();
        probe.in_recovery.insert(0, false);
        probe.in_recovery.insert(1, false);

        let status = verify_backend_node_status(&cluster, &cfg, &mut probe);
        assert_eq!(status[0], NodeAssessment::Primary);
        assert_eq!(status[1], NodeAssessment::Invalid);

        let outcome = find_primary_node(&cluster, &cfg, &mut probe);
        assert_eq!(outcome.primary, 0);
        assert_eq!(outcome.invalid, vec![1]);
    }

    #[test]
    fn test_split_brain_no_standbys_without_detach() {
        let cluster = ClusterState::create(&test_config(2)).unwrap();
        let cfg = test_config(2);
        let mut probe = FakeProbe::default();
        probe.in_recovery.insert(0, false);
        probe.in_recovery.insert(1, false);

        let status = verify_backend_node_status(&cluster, &cfg, &mut probe);
        assert_eq!(status[1], NodeAssessment::Unused);
    }

    #[test]
    fn test_owned_standby_confirms_primary() {
        let cluster = ClusterState::create(&test_config(2)).unwrap();
        let mut cfg = test_config(2);
        cfg.detach_false_primary = true;
        let mut probe = FakeProbe::default();
        probe.in_recovery.insert(0, false);
        probe.in_recovery.insert(1, true);
        probe
            .receivers
            .insert(1, receiver_for("db0.example", "5432"));

        let status = verify_backend_node_status(&cluster, &cfg, &mut probe);
        assert_eq!(status[0], NodeAssessment::Primary);
        assert_eq!(status[1], NodeAssessment::Standby);
    }

    #[test]
    fn test_false_primary_with_standbys() {
        let cluster = ClusterState::create(&test_config(3)).unwrap();
        let mut cfg = test_config(3);
        cfg.detach_false_primary = true;
        let mut probe = FakeProbe::default();
        // Nodes 0 and 1 both claim primary, node 2 streams from node 0.
        probe.in_recovery.insert(0, false);
        probe.in_recovery.insert(1, false);
        probe.in_recovery.insert(2, true);
        probe
            .receivers
            .insert(2, receiver_for("db0.example", "5432"));

        let status = verify_backend_node_status(&cluster, &cfg, &mut probe);
        assert_eq!(status[0], NodeAssessment::Primary);
        assert_eq!(status[1], NodeAssessment::Invalid);
        assert_eq!(status[2], NodeAssessment::Standby);
    }

    #[test]
    fn test_old_servers_skip_connectivity_checks() {
        let cluster = ClusterState::create(&test_config(3)).unwrap();
        let mut cfg = test_config(3);
        cfg.detach_false_primary = true;
        let mut probe = FakeProbe::default();
        probe.in_recovery.insert(0, false);
        probe.in_recovery.insert(1, false);
        probe.in_recovery.insert(2, true);
        for i in 0..3 {
            probe.versions.insert(i, 90500);
        }

        let status = verify_backend_node_status(&cluster, &cfg, &mut probe);
        // Both primaries survive; there is no way to tell them apart.
        assert_eq!(status[0], NodeAssessment::Primary);
        assert_eq!(status[1], NodeAssessment::Primary);
    }

    #[test]
    fn test_down_nodes_not_probed() {
        let cluster = ClusterState::create(&test_config(2)).unwrap();
        cluster.backend(0).set_status(BackendStatus::Down);
        let cfg = test_config(2);
        let mut probe = FakeProbe::default();
        probe.in_recovery.insert(0, false);
        probe.in_recovery.insert(1, true);

        let status = verify_backend_node_status(&cluster, &cfg, &mut probe);
        assert_eq!(status[0], NodeAssessment::Unused);
        assert_eq!(status[1], NodeAssessment::Standby);
    }

    #[test]
    fn test_always_primary_short_circuit() {
        let mut cfg = test_config(2);
        cfg.backends[1].always_primary = true;
        let cluster = ClusterState::create(&cfg).unwrap();
        // Probe claims node 0 is primary; the flag wins without probing.
        let mut probe = FakeProbe::default();
        probe.in_recovery.insert(0, false);

        let outcome = find_primary_node(&cluster, &cfg, &mut probe);
        assert_eq!(outcome.primary, 1);
    }

    #[test]
    fn test_raw_mode_finds_nothing() {
        let mut cfg = test_config(2);
        cfg.mode = crate::config::ClusterMode::Raw;
        let cluster = ClusterState::create(&cfg).unwrap();
        let mut probe = FakeProbe::default();
        probe.in_recovery.insert(0, false);
        assert_eq!(find_primary_node(&cluster, &cfg, &mut probe).primary, -1);
    }

    #[test]
    fn test_repeatedly_all_down_returns_immediately() {
        let cfg = test_config(2);
        let cluster = ClusterState::create(&cfg).unwrap();
        cluster.backend(0).set_status(BackendStatus::Down);
        cluster.backend(1).set_status(BackendStatus::Down);

        let mut factory =
            || Box::new(FakeProbe::default()) as Box<dyn BackendProbe>;
        let outcome = find_primary_node_repeatedly(&cluster, &cfg, &mut factory);
        assert_eq!(outcome.primary, -1);
    }

    #[test]
    fn test_repeatedly_follow_ongoing_keeps_current() {
        let cfg = test_config(2);
        let cluster = ClusterState::create(&cfg).unwrap();
        cluster
            .request_info()
            .primary_node_id
            .store(1, std::sync::atomic::Ordering::SeqCst);
        cluster
            .request_info()
            .follow_primary_ongoing
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let mut factory =
            || Box::new(FakeProbe::default()) as Box<dyn BackendProbe>;
        let outcome = find_primary_node_repeatedly(&cluster, &cfg, &mut factory);
        assert_eq!(outcome.primary, 1);
    }

    #[test]
    fn test_repeatedly_expires() {
        let mut cfg = test_config(2);
        cfg.search_primary_node_timeout = 1;
        let cluster = ClusterState::create(&cfg).unwrap();

        // Probe that never finds a primary.
        let mut factory = || {
            let mut probe = FakeProbe::default();
            probe.in_recovery.insert(0, true);
            probe.in_recovery.insert(1, true);
            Box::new(probe) as Box<dyn BackendProbe>
        };
        let outcome = find_primary_node_repeatedly(&cluster, &cfg, &mut factory);
        assert_eq!(outcome.primary, -1);
    }

    #[test]
    fn test_parse_conninfo() {
        let (host, port) =
            parse_conninfo("user=rep host=db0.example port=5432 sslmode=prefer");
        assert_eq!(host, "db0.example");
        assert_eq!(port, "5432");

        let (host, port) = parse_conninfo("dbname=x");
        assert_eq!(host, "");
        assert_eq!(port, "");
    }

    #[test]
    fn test_standby_points_at_unix_socket_primary() {
        let recv_local = receiver_for("localhost", "5432");
        assert!(standby_points_at("/var/run/postgresql", 5432, &recv_local));
        let recv_empty = receiver_for("", "5432");
        assert!(standby_points_at("/var/run/postgresql", 5432, &recv_empty));
        let recv_other = receiver_for("db9.example", "5432");
        assert!(!standby_points_at("/var/run/postgresql", 5432, &recv_other));
        assert!(!standby_points_at("db0.example", 5433, &receiver_for("db0.example", "5432")));
    }
}
