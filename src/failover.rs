//! Failover Engine
//!
//! Runs only in the supervisor. Holds `switching` for the entire drain of
//! the request queue so shell commands and restart decisions always see a
//! committed state transition; requests enqueued during the drain are
//! processed in the same drain. Processing is strictly sequential by
//! design.

use crate::cluster::{BackendRole, BackendStatus, ClusterState, LockId};
use crate::command::{self, CommandRunner};
use crate::config::Config;
use crate::primary::{self, BackendProbe};
use crate::registry::WorkerFleet;
use crate::request::{
    NodeStateRequest, RequestKind, REQ_SWITCHOVER, REQ_UPDATE,
};
use crate::statusfile;
use crate::watchdog::{worker_uses_any_node, WatchdogLink};
use log::{debug, info, warn};
use nix::sys::signal::Signal;
use std::sync::atomic::Ordering;

/// Factory for probe connections; the retry loop opens a fresh set of
/// connections per discovery round.
pub type ProbeFactory<'a> = dyn FnMut() -> Box<dyn BackendProbe> + 'a;

/// Drain the request queue, applying every node-state transition.
pub fn run_failover(
    cluster: &ClusterState,
    cfg: &Config,
    fleet: &mut dyn WorkerFleet,
    link: &dyn WatchdogLink,
    runner: &dyn CommandRunner,
    make_probe: &mut ProbeFactory<'_>,
) {
    debug!("failover handler called");
    {
        let _guard = cluster.lock(LockId::RequestInfo);
        let info = cluster.request_info();
        if info.switching() {
            debug!("failover handler called while switching");
            return;
        }
        info.switching.store(true, Ordering::SeqCst);
    }

    let mut need_restart_pcp = false;
    loop {
        let request = {
            let _guard = cluster.lock(LockId::RequestInfo);
            let info = cluster.request_info();
            match info.queue_pop() {
                Some(entry) => NodeStateRequest::from_entry(&entry),
                None => {
                    // Queue drained: release switching under the same lock.
                    info.switching.store(false, Ordering::SeqCst);
                    break;
                }
            }
        };
        let request = match request {
            Some(r) => r,
            None => {
                warn!("dropping request with unknown kind from the queue");
                continue;
            }
        };

        debug!(
            "failover handler: kind {:?} flags {:#x} nodes {:?}",
            request.kind, request.flags, request.node_ids
        );
        if process_request(cluster, cfg, fleet, link, runner, make_probe, &request) {
            need_restart_pcp = true;
        }
    }

    // Kick the PCP worker so blocked admin commands notice the new state.
    fleet.wakeup_pcp_worker();
    if need_restart_pcp {
        fleet.restart_pcp_worker();
    }
}

/// Apply one request. Returns true when the request was actually
/// processed (and the PCP worker therefore needs a restart).
fn process_request(
    cluster: &ClusterState,
    cfg: &Config,
    fleet: &mut dyn WorkerFleet,
    link: &dyn WatchdogLink,
    runner: &dyn CommandRunner,
    make_probe: &mut ProbeFactory<'_>,
    request: &NodeStateRequest,
) -> bool {
    let info = cluster.request_info();
    let n = cluster.num_backends();
    let stream = cfg.mode.is_streaming();
    let sl_mode = cfg.mode.supports_primary();
    let node_id = request.node_ids.first().copied().unwrap_or(-1);

    if request.kind == RequestKind::CloseIdle {
        fleet.signal_query_workers(Signal::SIGUSR1);
        return false;
    }

    // Remote supervisors quiesce conflicting operations while we commit.
    link.failover_start();

    let mut search_primary = true;
    let mut need_to_restart_children = true;
    let mut partial_restart = false;
    let mut all_backend_down = true;
    let mut sync_required = false;
    let mut affected = vec![false; n];

    match request.kind {
        RequestKind::NodeUp => {
            if !cluster.node_id_in_range(node_id) {
                warn!(
                    "invalid failback request, node id {} must be between 0 and {}",
                    node_id,
                    n - 1
                );
                return false;
            }
            // An already-valid node has nothing to fail back. (In raw mode
            // quarantine is not tracked, so the status check is the whole
            // story.)
            if cluster.backend_valid_raw(node_id as usize) {
                warn!(
                    "invalid failback request, status {:?} of node {} is invalid for failback",
                    cluster.backend(node_id as usize).status(),
                    node_id
                );
                return false;
            }
            let backend = cluster.backend(node_id as usize);
            info!(
                "starting fail back. reconnect host {}({})",
                backend.host(),
                backend.port()
            );

            // Sampled before the status flips; decides restart scope below.
            all_backend_down = cluster.all_backends_down();

            backend.set_status(BackendStatus::ConnectWait);

            if request.has_flag(REQ_UPDATE) {
                // Quarantine bookkeeping: no failback command, no primary
                // search, and the pre-quarantine main node comes back.
                backend.set_quarantined(false);
                search_primary = false;
                {
                    let _guard = cluster.lock(LockId::RequestInfo);
                    info.main_node_id
                        .store(cluster.get_next_main_node(), Ordering::SeqCst);
                }
                if info.primary_node_id() == -1 && backend.role() == BackendRole::Primary {
                    info!(
                        "failing back the quarantine node that was primary before quarantine, all children need a restart"
                    );
                    let _guard = cluster.lock(LockId::RequestInfo);
                    info.primary_node_id.store(node_id, Ordering::SeqCst);
                    need_to_restart_children = true;
                    partial_restart = false;
                } else if !all_backend_down {
                    info!(
                        "no children restart for failing back node {} host {}({}), streaming replication and not all backends were down",
                        node_id,
                        backend.host(),
                        backend.port()
                    );
                    need_to_restart_children = false;
                    partial_restart = false;
                } else {
                    need_to_restart_children = true;
                    partial_restart = false;
                }
            } else {
                if let Err(e) = statusfile::write(cluster, &cfg.logdir) {
                    warn!("failed to write status file: {}", e);
                }
                command::trigger(
                    runner,
                    cluster,
                    node_id,
                    &cfg.failback_command,
                    info.main_node_id(),
                    cluster.get_next_main_node(),
                    info.primary_node_id(),
                );
            }
            sync_required = true;
            cluster
                .global_stats()
                .failback_count
                .fetch_add(1, Ordering::SeqCst);
        }

        RequestKind::Promote => {
            if cluster.node_id_in_range(node_id) && cluster.backend_valid(node_id as usize) {
                let backend = cluster.backend(node_id as usize);
                info!(
                    "starting promotion. promote host {}({})",
                    backend.host(),
                    backend.port()
                );
            } else {
                info!("failover: no backends are promoted");
                return false;
            }
        }

        RequestKind::NodeDown | RequestKind::Quarantine => {
            let quarantine = request.kind == RequestKind::Quarantine;
            let mut cnt = 0;
            for &id in &request.node_ids {
                if id == -1 {
                    continue;
                }
                if !cluster.node_id_in_range(id) {
                    warn!("invalid degeneration request, node id {} out of range", id);
                    continue;
                }
                let backend = cluster.backend(id as usize);
                let eligible = backend.quarantined()
                    || if cfg.mode.is_raw() {
                        cluster.backend_valid_raw(id as usize)
                    } else {
                        cluster.backend_valid(id as usize)
                    };
                if !eligible {
                    continue;
                }
                info!(
                    "starting {}. shutdown host {}({})",
                    if quarantine { "quarantine" } else { "degeneration" },
                    backend.host(),
                    backend.port()
                );
                backend.set_status(BackendStatus::Down);
                if quarantine {
                    backend.set_quarantined(true);
                } else {
                    if info.primary_node_id() == -1
                        && backend.quarantined()
                        && backend.role() == BackendRole::Primary
                    {
                        // The node was primary when it got quarantined;
                        // restore that so the failover command sees the
                        // proper old primary.
                        debug!("degenerating the node that was primary before it was quarantined");
                        let _guard = cluster.lock(LockId::RequestInfo);
                        info.primary_node_id.store(id, Ordering::SeqCst);
                        search_primary = false;
                    }
                    backend.set_quarantined(false);
                    if let Err(e) = statusfile::write(cluster, &cfg.logdir) {
                        warn!("failed to write status file: {}", e);
                    }
                }
                affected[id as usize] = true;
                cnt += 1;
            }
            if cnt == 0 {
                info!("failover: no backends are degenerated");
                return false;
            }
            if !quarantine {
                cluster
                    .global_stats()
                    .failover_count
                    .fetch_add(1, Ordering::SeqCst);
            }
        }

        RequestKind::CloseIdle => unreachable!("handled above"),
    }

    let mut new_main_node = cluster.get_next_main_node();
    if new_main_node < 0 {
        info!("failover: no valid backend node found");
    }

    // Old ids as the command templates must see them.
    let old_main = info.main_node_id();

    // ---- decide restart scope, killing eagerly where sessions must die ----
    if stream
        && request.kind == RequestKind::NodeUp
        && !all_backend_down
        && info.primary_node_id() >= 0
        && info.primary_node_id() != node_id
    {
        // The update-status path already made its restart decision.
        if !request.has_flag(REQ_UPDATE) {
            info!(
                "do not restart children: failing back node {} in streaming replication mode and not all backends were down",
                node_id
            );
            need_to_restart_children = false;
            partial_restart = false;
        }
    } else if stream
        && matches!(request.kind, RequestKind::NodeDown | RequestKind::Quarantine)
        && request.has_flag(REQ_SWITCHOVER)
        && node_id != info.primary_node_id()
    {
        info!(
            "switchover of non-primary node {} in streaming replication mode, restarting only affected children",
            node_id
        );
        need_to_restart_children = true;
        partial_restart = true;
        for w in 0..cluster.num_workers() {
            if worker_uses_any_node(cluster, w, &[node_id]) && cluster.worker(w).pid() != 0 {
                fleet.kill_query_worker(w);
            }
        }
    } else {
        info!("restart all children");
        for w in 0..cluster.num_workers() {
            if cluster.worker(w).pid() != 0 {
                fleet.kill_query_worker(w);
            }
        }
        need_to_restart_children = true;
        partial_restart = false;
    }

    // ---- failover commands (never for quarantine) ----
    if request.kind == RequestKind::NodeDown {
        for (i, hit) in affected.iter().enumerate() {
            if *hit {
                command::trigger(
                    runner,
                    cluster,
                    i as i32,
                    &cfg.failover_command,
                    old_main,
                    new_main_node,
                    info.primary_node_id(),
                );
                sync_required = true;
            }
        }
    }

    // ---- determine the new primary ----
    let mut new_primary: i32 = -1;
    if request.kind == RequestKind::Promote
        && cluster.node_id_in_range(node_id)
        && cluster.backend_valid(node_id as usize)
    {
        new_primary = node_id;
    } else if request.kind == RequestKind::Quarantine {
        if info.primary_node_id() == node_id {
            // Remember the role so the primary comes back with the node.
            cluster
                .backend(node_id as usize)
                .set_role(BackendRole::Primary);
            new_primary = -1;
        } else if sl_mode {
            new_primary = info.primary_node_id();
        }
    } else if sl_mode && request.kind == RequestKind::NodeDown {
        if info.primary_node_id() >= 0 && info.primary_node_id() != node_id {
            // A standby went down; the primary cannot have moved.
            new_primary = info.primary_node_id();
        } else {
            if info.primary_node_id() >= 0 {
                cluster
                    .backend(info.primary_node_id() as usize)
                    .set_role(BackendRole::Standby);
            }
            new_primary = discover_primary(cluster, cfg, make_probe);
        }
    } else if !search_primary {
        debug!("failover on a quarantine-related request, keeping current primary");
        new_primary = info.primary_node_id();
    } else {
        new_primary = discover_primary(cluster, cfg, make_probe);
    }

    // ---- follow-primary degeneration ----
    let mut follow_cnt = 0;
    if stream && (!cfg.follow_primary_command.is_empty() || request.kind == RequestKind::Promote) {
        // The follow command runs after a failover of the current primary,
        // after a failover that created a primary from nothing, and after
        // an explicit promotion.
        let primary_failed = request.kind == RequestKind::NodeDown
            && info.primary_node_id() >= 0
            && affected
                .get(info.primary_node_id() as usize)
                .copied()
                .unwrap_or(false);
        let primary_appeared = request.kind == RequestKind::NodeDown
            && info.primary_node_id() < 0
            && new_primary >= 0;
        let promoted = request.kind == RequestKind::Promote
            && cluster.node_id_in_range(node_id)
            && cluster.backend_valid(node_id as usize);

        if primary_failed || primary_appeared || promoted {
            for i in 0..n {
                if new_primary >= 0 && i as i32 != new_primary {
                    let backend = cluster.backend(i);
                    info!(
                        "starting follow degeneration. shutdown host {}({})",
                        backend.host(),
                        backend.port()
                    );
                    backend.set_status(BackendStatus::Down);
                    if let Err(e) = statusfile::write(cluster, &cfg.logdir) {
                        warn!("failed to write status file: {}", e);
                    }
                    follow_cnt += 1;
                }
            }
            if follow_cnt == 0 {
                info!("failover: no follow backends are degenerated");
            } else {
                new_main_node = cluster.get_next_main_node();
                info!("failover: {} follow backends have been degenerated", follow_cnt);
            }
        }
    }
    if follow_cnt > 0 && !cfg.follow_primary_command.is_empty() {
        fleet.spawn_follow_child(info.primary_node_id(), new_primary, info.primary_node_id());
    }

    // ---- commit the new primary and main node ----
    if info.primary_node_id() != new_primary {
        if info.primary_node_id() >= 0 {
            cluster
                .backend(info.primary_node_id() as usize)
                .touch_status_time();
        }
        if new_primary >= 0 {
            let backend = cluster.backend(new_primary as usize);
            backend.set_role(BackendRole::Primary);
            backend.touch_status_time();
        }
    }
    {
        let _guard = cluster.lock(LockId::RequestInfo);
        info.primary_node_id.store(new_primary, Ordering::SeqCst);
    }
    info!("failover: set new primary node: {}", new_primary);
    if new_main_node >= 0 {
        let _guard = cluster.lock(LockId::RequestInfo);
        info.main_node_id.store(new_main_node, Ordering::SeqCst);
        sync_required = true;
        info!("failover: set new main node: {}", new_main_node);
    }

    // ---- restart (or lazily mark) the query workers ----
    if need_to_restart_children {
        for w in 0..cluster.num_workers() {
            let restart = if partial_restart {
                worker_uses_any_node(cluster, w, &[node_id])
            } else {
                true
            };
            if restart {
                if cluster.worker(w).pid() != 0 {
                    fleet.kill_query_worker(w);
                    fleet.respawn_query_worker(w);
                }
            } else {
                // Worker exits on its own at the next convenient point.
                cluster.worker(w).set_need_restart(true);
            }
        }
    } else {
        for w in 0..cluster.num_workers() {
            cluster.worker(w).set_need_restart(true);
        }
    }

    fleet.signal_generic_worker();

    if sync_required {
        link.failover_end();
    }

    match request.kind {
        RequestKind::NodeUp => {
            let backend = cluster.backend(node_id as usize);
            info!(
                "failback done. reconnect host {}({})",
                backend.host(),
                backend.port()
            );
            fleet.ensure_health_check_workers();
        }
        RequestKind::Promote => {
            let backend = cluster.backend(node_id as usize);
            info!(
                "promotion done. promoted host {}({})",
                backend.host(),
                backend.port()
            );
        }
        _ => {
            if cluster.node_id_in_range(node_id) {
                let backend = cluster.backend(node_id as usize);
                info!(
                    "{} done. shutdown host {}({})",
                    if request.kind == RequestKind::NodeDown {
                        "failover"
                    } else {
                        "quarantine"
                    },
                    backend.host(),
                    backend.port()
                );
            }
        }
    }
    true
}

/// Run the discovery retry loop and enqueue detach requests for any
/// false primaries it exposed; those requests join the current drain.
fn discover_primary(cluster: &ClusterState, cfg: &Config, make_probe: &mut ProbeFactory<'_>) -> i32 {
    let outcome = primary::find_primary_node_repeatedly(cluster, cfg, make_probe);
    if cfg.detach_false_primary && !outcome.invalid.is_empty() {
        primary::request_detach_of_invalid_nodes(cluster, &outcome.invalid);
    }
    outcome.primary
}
