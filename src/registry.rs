//! Worker Registry and Process Lifecycle
//!
//! The supervisor forks and tracks: M query workers (pids live in the
//! shared worker slots), one PCP worker, one generic periodic worker, one
//! log collector, the optional watchdog pair, up to N health-check
//! workers, and at most one follow-primary child.
//!
//! Exit codes children report back:
//! - [`CHILD_EXIT_FATAL`]: the supervisor terminates with the same code
//! - [`CHILD_EXIT_NO_RESTART`]: the slot is cleared without respawn
//! - anything else: respawn

use crate::cluster::ClusterState;
use crate::config::MAX_BACKENDS;
use crate::signals::{self, SignalRouter};
use anyhow::{bail, Result};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};

pub const CHILD_EXIT_NO_RESTART: i32 = 2;
pub const CHILD_EXIT_FATAL: i32 = 3;

// =============================================================================
// Fork policy
// =============================================================================

/// Fork one child. Signals are blocked across the fork; the child resets
/// dispositions, closes the supervisor's self-pipe ends, unblocks and
/// enters its main function. Fork failure is fatal to the supervisor.
pub fn fork_child<F>(router: &SignalRouter, child_main: F) -> Result<Pid>
where
    F: FnOnce() -> i32,
{
    let old_mask = signals::block_all_signals();
    let forked = unsafe { fork() };
    match forked {
        Ok(ForkResult::Parent { child }) => {
            signals::restore_signal_mask(&old_mask);
            Ok(child)
        }
        Ok(ForkResult::Child) => {
            signals::reset_child_dispositions();
            router.close_in_child();
            signals::unblock_all_signals();
            std::process::exit(child_main());
        }
        Err(e) => {
            signals::restore_signal_mask(&old_mask);
            bail!("fork() failed: {}", e)
        }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// What kind of child a reaped pid turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildKind {
    QueryWorker(usize),
    Pcp,
    Generic,
    LogCollector,
    Watchdog,
    Lifecheck,
    HealthCheck(usize),
    FollowPrimary,
    Unknown,
}

impl ChildKind {
    pub fn name(self) -> &'static str {
        match self {
            ChildKind::QueryWorker(_) => "query worker",
            ChildKind::Pcp => "PCP worker",
            ChildKind::Generic => "generic worker",
            ChildKind::LogCollector => "log collector",
            ChildKind::Watchdog => "watchdog child",
            ChildKind::Lifecheck => "watchdog lifecheck",
            ChildKind::HealthCheck(_) => "health check worker",
            ChildKind::FollowPrimary => "follow primary child",
            ChildKind::Unknown => "child",
        }
    }
}

/// Verdict of classifying one wait status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// Respawn whatever exited.
    Restart,
    /// Slot is cleared, no respawn.
    NoRestart,
    /// Supervisor goes down with this code.
    Fatal(i32),
}

/// Pids of the singleton children. Query worker pids live in the shared
/// worker slots instead, where workers and the failover engine can see
/// them.
pub struct ProcessRegistry {
    pub pcp: i32,
    pub generic: i32,
    pub log_collector: i32,
    pub watchdog: i32,
    pub lifecheck: i32,
    pub follow: i32,
    pub health_check: [i32; MAX_BACKENDS],
    /// Set when the watchdog child died abnormally so its successor knows
    /// to recover shared watchdog state.
    pub watchdog_needs_cleanup: bool,
}

impl Default for ProcessRegistry {
    fn default() -> ProcessRegistry {
        ProcessRegistry::new()
    }
}

impl ProcessRegistry {
    pub fn new() -> ProcessRegistry {
        ProcessRegistry {
            pcp: 0,
            generic: 0,
            log_collector: 0,
            watchdog: 0,
            lifecheck: 0,
            follow: 0,
            health_check: [0; MAX_BACKENDS],
            watchdog_needs_cleanup: false,
        }
    }

    /// Identify a reaped pid. Singleton children are checked first, then
    /// the query-worker slots, then the health-check slots.
    pub fn identify(&self, cluster: &ClusterState, pid: i32) -> ChildKind {
        if pid == self.pcp && pid != 0 {
            return ChildKind::Pcp;
        }
        if pid == self.generic && pid != 0 {
            return ChildKind::Generic;
        }
        if pid == self.log_collector && pid != 0 {
            return ChildKind::LogCollector;
        }
        if pid == self.watchdog && pid != 0 {
            return ChildKind::Watchdog;
        }
        if pid == self.lifecheck && pid != 0 {
            return ChildKind::Lifecheck;
        }
        if pid == self.follow && pid != 0 {
            return ChildKind::FollowPrimary;
        }
        for i in 0..cluster.num_workers() {
            let worker_pid = cluster.worker(i).pid();
            if worker_pid != 0 && worker_pid == pid {
                return ChildKind::QueryWorker(i);
            }
        }
        for (i, &hc) in self.health_check.iter().enumerate().take(cluster.num_backends()) {
            if hc == pid && pid != 0 {
                return ChildKind::HealthCheck(i);
            }
        }
        ChildKind::Unknown
    }

    /// Classify an exit per the worker exit-code contract. Signal deaths
    /// are logged here; SIGSEGV and SIGKILL are escalated to warnings.
    pub fn classify_exit(kind: ChildKind, status: &WaitStatus) -> ExitClass {
        match status {
            WaitStatus::Exited(pid, code) => match *code {
                CHILD_EXIT_FATAL => {
                    debug!(
                        "{} with pid {} exited with fatal error, supervisor will shut down",
                        kind.name(),
                        pid
                    );
                    ExitClass::Fatal(*code)
                }
                CHILD_EXIT_NO_RESTART => {
                    info!(
                        "{} with pid {} exited with success and will not be restarted",
                        kind.name(),
                        pid
                    );
                    ExitClass::NoRestart
                }
                code => {
                    info!("{} with pid {} exits with status {}", kind.name(), pid, code);
                    ExitClass::Restart
                }
            },
            WaitStatus::Signaled(pid, sig, _) => {
                match sig {
                    Signal::SIGSEGV => warn!(
                        "{} with pid {} was terminated by segmentation fault",
                        kind.name(),
                        pid
                    ),
                    Signal::SIGKILL => warn!(
                        "{} with pid {} was terminated by sigkill",
                        kind.name(),
                        pid
                    ),
                    _ => info!(
                        "{} with pid {} exits by signal {}",
                        kind.name(),
                        pid,
                        sig
                    ),
                }
                ExitClass::Restart
            }
            _ => ExitClass::Restart,
        }
    }

    /// Collect exited children without blocking. Returns the reaped
    /// (pid, status) pairs in reap order.
    pub fn harvest() -> Vec<(i32, WaitStatus)> {
        let mut reaped = Vec::new();
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => match status.pid() {
                    Some(pid) => reaped.push((pid.as_raw(), status)),
                    None => break,
                },
                Err(Errno::ECHILD) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    warn!("waitpid failed in reaper: {}", e);
                    break;
                }
            }
        }
        reaped
    }

    /// Send `sig` to every tracked child except the log collector, clear
    /// the slots, and wait until as many children were reaped as were
    /// killed (or ECHILD). The follow-primary child and its process group
    /// are signalled last by the caller's exit path.
    pub fn terminate_all_children(&mut self, cluster: &ClusterState, sig: Signal) {
        if !matches!(sig, Signal::SIGTERM | Signal::SIGINT | Signal::SIGQUIT) {
            info!("invalid terminate signal {}, ignoring", sig);
            return;
        }

        let mut killed = 0usize;
        for i in 0..cluster.num_workers() {
            let pid = cluster.worker(i).pid();
            if pid != 0 {
                let _ = kill(Pid::from_raw(pid), sig);
                cluster.worker(i).clear();
                killed += 1;
            }
        }
        for pid_slot in [
            &mut self.pcp,
            &mut self.generic,
            &mut self.watchdog,
            &mut self.lifecheck,
        ] {
            if *pid_slot != 0 {
                let _ = kill(Pid::from_raw(*pid_slot), sig);
                *pid_slot = 0;
                killed += 1;
            }
        }
        for hc in self.health_check.iter_mut() {
            if *hc != 0 {
                let _ = kill(Pid::from_raw(*hc), sig);
                *hc = 0;
                killed += 1;
            }
        }

        let mut terminated = 0usize;
        while terminated < killed {
            match waitpid(Pid::from_raw(-1), None) {
                Ok(status) => {
                    if status.pid().is_some() {
                        terminated += 1;
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    info!("wait() failed during shutdown: {}", e);
                    break;
                }
            }
        }
    }

    /// Signal the follow-primary child and its whole process group.
    pub fn signal_follow_child(&mut self, sig: Signal) {
        if self.follow > 0 {
            info!("terminating the follow primary child and its process group");
            let _ = kill(Pid::from_raw(self.follow), sig);
            if let Err(e) = killpg(Pid::from_raw(self.follow), sig) {
                debug!("killpg({}, {}) failed: {}", self.follow, sig, e);
            }
            self.follow = 0;
        }
    }
}

// =============================================================================
// Worker fleet seam
// =============================================================================

/// The operations the failover engine and watchdog sync perform on the
/// worker fleet. The supervisor implements this with real forks and
/// kills; tests substitute a recording implementation.
pub trait WorkerFleet {
    /// SIGQUIT one query worker so its sessions die now.
    fn kill_query_worker(&mut self, idx: usize);
    /// Fork a fresh query worker into slot `idx`.
    fn respawn_query_worker(&mut self, idx: usize);
    /// Send `sig` to every live query worker.
    fn signal_query_workers(&mut self, sig: Signal);
    /// Nudge the generic worker to pick up new node state.
    fn signal_generic_worker(&mut self);
    /// Wake the PCP worker after a drain finished.
    fn wakeup_pcp_worker(&mut self);
    /// Stop the PCP worker, wait for it, fork a fresh one.
    fn restart_pcp_worker(&mut self);
    /// Fork the follow-primary child.
    fn spawn_follow_child(&mut self, old_main: i32, new_primary: i32, old_primary: i32);
    /// Fork health-check workers for valid backends that lost theirs.
    fn ensure_health_check_workers(&mut self);
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::test_config;
    use crate::cluster::ClusterState;

    #[test]
    fn test_classify_exit_codes() {
        let pid = Pid::from_raw(100);
        assert_eq!(
            ProcessRegistry::classify_exit(
                ChildKind::Pcp,
                &WaitStatus::Exited(pid, CHILD_EXIT_FATAL)
            ),
            ExitClass::Fatal(CHILD_EXIT_FATAL)
        );
        assert_eq!(
            ProcessRegistry::classify_exit(
                ChildKind::Generic,
                &WaitStatus::Exited(pid, CHILD_EXIT_NO_RESTART)
            ),
            ExitClass::NoRestart
        );
        assert_eq!(
            ProcessRegistry::classify_exit(ChildKind::Unknown, &WaitStatus::Exited(pid, 0)),
            ExitClass::Restart
        );
        assert_eq!(
            ProcessRegistry::classify_exit(ChildKind::Unknown, &WaitStatus::Exited(pid, 1)),
            ExitClass::Restart
        );
    }

    #[test]
    fn test_classify_signal_deaths_restart() {
        let pid = Pid::from_raw(100);
        for sig in [Signal::SIGSEGV, Signal::SIGKILL, Signal::SIGQUIT] {
            assert_eq!(
                ProcessRegistry::classify_exit(
                    ChildKind::QueryWorker(0),
                    &WaitStatus::Signaled(pid, sig, false)
                ),
                ExitClass::Restart
            );
        }
    }

    #[test]
    fn test_identify_children() {
        let cluster = ClusterState::create(&test_config(2)).unwrap();
        let mut registry = ProcessRegistry::new();
        registry.pcp = 501;
        registry.generic = 502;
        registry.follow = 503;
        registry.health_check[1] = 504;
        cluster.worker(0).set_pid(601);
        cluster.worker(1).set_pid(602);

        assert_eq!(registry.identify(&cluster, 501), ChildKind::Pcp);
        assert_eq!(registry.identify(&cluster, 502), ChildKind::Generic);
        assert_eq!(registry.identify(&cluster, 503), ChildKind::FollowPrimary);
        assert_eq!(registry.identify(&cluster, 504), ChildKind::HealthCheck(1));
        assert_eq!(registry.identify(&cluster, 602), ChildKind::QueryWorker(1));
        assert_eq!(registry.identify(&cluster, 999), ChildKind::Unknown);
    }

    #[test]
    fn test_identify_ignores_empty_slots() {
        let cluster = ClusterState::create(&test_config(2)).unwrap();
        let registry = ProcessRegistry::new();
        // pid 0 never matches the zeroed singleton slots
        assert_eq!(registry.identify(&cluster, 0), ChildKind::Unknown);
    }
}
