//! Worker Entry Points
//!
//! The real per-client query routing, PCP admin handling, health-check
//! probing and log collection are external collaborators; the supervisor
//! only owns their lifecycle. The mains here are the integration points:
//! minimal loops that honor the shared-memory contract (need_restart,
//! signal dispositions, exit codes) so the supervised process tree is
//! complete and observable.
//!
//! Disposition contract inherited from the fork policy:
//! - SIGTERM/SIGINT/SIGQUIT terminate the child (default disposition)
//! - the PCP and generic workers die on SIGUSR1 so the supervisor can
//!   restart them after a drain
//! - query workers treat SIGUSR1 as "close idle connections" and ignore
//!   it here

use crate::cluster::{ClusterState, InterruptReason};
use crate::config::Config;
use crate::signals;
use log::{debug, info};
use nix::sys::signal::{SigHandler, Signal};
use nix::unistd::getppid;
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

fn ignore(signals: &[Signal]) {
    for sig in signals {
        let _ = unsafe { nix::sys::signal::signal(*sig, SigHandler::SigIgn) };
    }
}

/// Long-lived query worker. Parks until the supervisor asks it to exit.
pub fn query_worker_main(cluster: &ClusterState, _cfg: &Config, idx: usize) -> i32 {
    ignore(&[Signal::SIGUSR1, Signal::SIGUSR2, Signal::SIGHUP]);
    debug!("query worker {} started", idx);
    loop {
        if cluster.worker(idx).need_restart() {
            // Exit at the next convenient point; the reaper refills the slot.
            return 1;
        }
        thread::sleep(Duration::from_secs(1));
    }
}

/// PCP admin worker. Exits on SIGUSR1 (default disposition) so the
/// supervisor can hand a fresh one the post-drain state.
pub fn pcp_worker_main(_cluster: &ClusterState, _cfg: &Config) -> i32 {
    ignore(&[Signal::SIGUSR2, Signal::SIGHUP]);
    debug!("PCP worker started");
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}

/// Generic periodic worker. SIGUSR1 (node state changed) keeps its
/// default disposition: the worker dies and comes back with fresh state.
pub fn generic_worker_main(_cluster: &ClusterState, _cfg: &Config) -> i32 {
    ignore(&[Signal::SIGUSR2, Signal::SIGHUP]);
    debug!("generic worker started");
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}

/// Health-check worker for one backend: a plain TCP reachability probe on
/// a fixed period, feeding the shared statistics area. Failover decisions
/// stay with the supervisor.
pub fn health_check_main(cluster: &ClusterState, cfg: &Config, node: usize) -> i32 {
    ignore(&[Signal::SIGUSR1, Signal::SIGUSR2, Signal::SIGHUP]);
    let backend = cluster.backend(node);
    info!("health check process started for host {}({})", backend.host(), backend.port());
    loop {
        let addr = (backend.host(), backend.port());
        match TcpStream::connect(addr) {
            Ok(_) => {}
            Err(e) => {
                debug!("health check: node {} unreachable: {}", node, e);
                cluster
                    .backend_stats(node)
                    .probe_failure_count
                    .fetch_add(1, Ordering::SeqCst);
            }
        }
        thread::sleep(Duration::from_secs(cfg.health_check_period.max(1)));
    }
}

/// Log collector. The collection transport is external; the slot exists
/// so the supervisor tree matches production shape.
pub fn log_collector_main(_cfg: &Config) -> i32 {
    ignore(&[Signal::SIGUSR1, Signal::SIGUSR2, Signal::SIGHUP]);
    debug!("log collector started");
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}

/// Watchdog child. The consensus transport is external; this stand-in
/// reports a stable state once so supervisor startup can proceed, exactly
/// where the real child would send its first notification.
pub fn watchdog_child_main(cluster: &ClusterState, needs_cleanup: bool) -> i32 {
    ignore(&[Signal::SIGUSR1, Signal::SIGUSR2, Signal::SIGHUP]);
    if needs_cleanup {
        info!("watchdog child recovering state after abnormal predecessor exit");
    }
    signals::notify_supervisor(cluster, getppid(), InterruptReason::WatchdogStateChanged);
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}

/// Watchdog lifecheck child.
pub fn lifecheck_child_main() -> i32 {
    ignore(&[Signal::SIGUSR1, Signal::SIGUSR2, Signal::SIGHUP]);
    debug!("watchdog lifecheck started");
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}
