//! Supervisor Main Loop
//!
//! Startup sequencing, the self-pipe driven event loop, the reaper and
//! coordinated shutdown. The supervisor never serves a client query: it
//! owns the cluster-wide view of backend health and the worker fleet
//! acting on it.

use crate::cluster::{BackendRole, ClusterState, InterruptReason, LockId};
use crate::command::ShellRunner;
use crate::config::Config;
use crate::failover;
use crate::follow;
use crate::listener::Listeners;
use crate::primary::{self, BackendProbe, SqlProbe};
use crate::registry::{self, ChildKind, ExitClass, ProcessRegistry, WorkerFleet};
use crate::signals::SignalRouter;
use crate::statusfile;
use crate::watchdog::{self, NoWatchdog, WatchdogLink, WdNodeState};
use crate::workers;
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

/// Startup switches taken on the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct SupervisorOptions {
    pub discard_status: bool,
    pub clear_oidmaps: bool,
}

pub struct Supervisor {
    cfg: Config,
    config_path: PathBuf,
    cluster: ClusterState,
    router: SignalRouter,
    registry: ProcessRegistry,
    listeners: Option<Listeners>,
    link: Box<dyn WatchdogLink>,
    runner: ShellRunner,
    initializing: bool,
    exiting: bool,
}

impl Supervisor {
    /// Build the shared world and run until shut down. Does not return on
    /// the success path: the exit handler terminates the process.
    pub fn run(cfg: Config, config_path: PathBuf, opts: SupervisorOptions) -> Result<()> {
        let cluster = ClusterState::create(&cfg)?;

        // Restore previous backend status if possible.
        if let Err(e) = statusfile::load(&cluster, &cfg.logdir, opts.discard_status) {
            warn!("failed to read status file: {}", e);
        }
        {
            let _guard = cluster.lock(LockId::RequestInfo);
            cluster
                .request_info()
                .main_node_id
                .store(cluster.get_next_main_node(), Ordering::SeqCst);
        }

        if opts.clear_oidmaps {
            discard_oid_maps(&cfg);
        }

        let router = SignalRouter::install().context("failed to install signal handlers")?;

        // The consensus transport is an external collaborator; without it
        // the cluster is this node alone.
        let link: Box<dyn WatchdogLink> = Box::new(NoWatchdog);

        let mut supervisor = Supervisor {
            cfg,
            config_path,
            cluster,
            router,
            registry: ProcessRegistry::new(),
            listeners: None,
            link,
            runner: ShellRunner,
            initializing: true,
            exiting: false,
        };
        supervisor.startup()?;
        supervisor.main_loop()
    }

    // =========================================================================
    // Startup
    // =========================================================================

    fn startup(&mut self) -> Result<()> {
        // Log collector comes up first so nothing is lost.
        self.registry.log_collector =
            fork_log_collector(&self.router, &self.cfg);

        if self.cfg.use_watchdog {
            self.registry.watchdog =
                fork_watchdog(&self.router, &self.cluster, false);
            info!("waiting for watchdog to initialize");
            while !self.router.sigusr1_pending() && !self.router.sigchld_pending() {
                self.router.wait(Duration::from_millis(100));
            }
            if self.router.take_sigchld() {
                self.reaper();
            }
            info!("watchdog process is initialized");
            self.registry.lifecheck = fork_lifecheck(&self.router);
            while self.router.take_sigusr1() {
                self.process_interrupts();
            }
        }

        self.listeners = Some(Listeners::create(&self.cfg)?);

        // Fork the query worker fleet.
        for i in 0..self.cluster.num_workers() {
            fork_query_worker(&self.router, &self.cluster, &self.cfg, i);
        }

        // If the primary node id was not adopted from a peer, search for it.
        if self.cluster.request_info().primary_node_id() < 0 {
            let outcome = {
                let cluster = &self.cluster;
                let cfg = &self.cfg;
                let mut factory =
                    || Box::new(SqlProbe::connect(cluster, cfg)) as Box<dyn BackendProbe>;
                primary::find_primary_node_repeatedly(cluster, cfg, &mut factory)
            };
            {
                let _guard = self.cluster.lock(LockId::RequestInfo);
                self.cluster
                    .request_info()
                    .primary_node_id
                    .store(outcome.primary, Ordering::SeqCst);
            }
            if outcome.primary >= 0 {
                self.cluster
                    .backend(outcome.primary as usize)
                    .set_role(BackendRole::Primary);
            }
            // Very early stage node checking: detach anything the first
            // classification found invalid.
            if self.cfg.mode.is_streaming() && self.cfg.detach_false_primary {
                primary::request_detach_of_invalid_nodes(&self.cluster, &outcome.invalid);
            }
        }

        self.registry.pcp = fork_pcp_worker(&self.router, &self.cluster, &self.cfg);
        self.registry.generic = fork_generic_worker(&self.router, &self.cluster, &self.cfg);
        for i in 0..self.cluster.num_backends() {
            if self.cluster.backend_valid(i) {
                self.registry.health_check[i] =
                    fork_health_check(&self.router, &self.cluster, &self.cfg, i);
            }
        }

        if let Err(e) = statusfile::write(&self.cluster, &self.cfg.logdir) {
            warn!("failed to write status file: {}", e);
        }

        info!(
            "poolkeeper {} successfully started, supervising {} backends with {} query workers",
            env!("CARGO_PKG_VERSION"),
            self.cluster.num_backends(),
            self.cluster.num_workers()
        );
        self.initializing = false;

        // The startup false-primary check may have queued detach requests.
        if !self.cluster.request_info().queue_is_empty() {
            self.drain_failover();
        }
        Ok(())
    }

    // =========================================================================
    // Main loop
    // =========================================================================

    fn main_loop(&mut self) -> Result<()> {
        loop {
            if let Some(sig) = self.router.shutdown_signal() {
                self.shutdown(sig, 0);
            }
            if self.router.take_wakeup() {
                self.wakeup_children();
            }
            // Re-arm during processing is honoured by looping until the
            // flag stays clear for a full pass.
            while self.router.take_sigusr1() {
                self.process_interrupts();
            }
            // The reaper defers while a drain is rewriting the fleet; the
            // pending flag survives until the next pass.
            if self.router.sigchld_pending() && !self.cluster.request_info().switching() {
                self.router.take_sigchld();
                self.reaper();
            }
            if self.router.take_reload() {
                self.reload_config();
            }

            self.router.wait(Duration::from_secs(3));
        }
    }

    /// Drain the shared signal slot in fixed priority order.
    fn process_interrupts(&mut self) {
        info!("supervisor received SIGUSR1");

        if self
            .cluster
            .signal_slot()
            .take(InterruptReason::WatchdogQuorumChanged)
        {
            info!("received watchdog quorum change notification");
            if self.link.quorum_held() {
                info!("watchdog cluster now holds the quorum, updating quarantined backend nodes");
                let queued =
                    watchdog::update_backend_quarantine_status(&self.cluster, self.link.as_ref());
                if queued > 0 {
                    self.drain_failover();
                }
            }
        }

        if self
            .cluster
            .signal_slot()
            .take(InterruptReason::InformQuarantineNodes)
        {
            info!("received request to degenerate quarantine nodes");
            if watchdog::degenerate_all_quarantine_nodes(&self.cluster) > 0 {
                self.drain_failover();
            }
        }

        if self
            .cluster
            .signal_slot()
            .take(InterruptReason::BackendSyncRequired)
        {
            info!("received backend sync request from the peer cluster");
            if self.link.local_state() == WdNodeState::Standby {
                info!("cluster leader has performed failover, syncing the backend states");
                self.sync_from_leader();
            }
        }

        if self
            .cluster
            .signal_slot()
            .take(InterruptReason::WatchdogStateChanged)
        {
            info!("received watchdog state change notification");
            if self.link.local_state() == WdNodeState::Standby {
                info!("joined the peer cluster as a standby, syncing the backend states");
                self.sync_from_leader();
                // A leadership change must not leave the follow lock stuck
                // on a node that no longer coordinates.
                follow::release_follow_primary_lock(&self.cluster, true);
            }
        }

        if self
            .cluster
            .signal_slot()
            .take(InterruptReason::FailoverInterrupt)
        {
            info!("supervisor has received failover request");
            if self.initializing {
                info!("ignoring the failover request, still starting up");
            } else {
                self.drain_failover();
            }
        }
    }

    fn drain_failover(&mut self) {
        let mut fleet = SupervisorFleet {
            registry: &mut self.registry,
            router: &self.router,
            cluster: &self.cluster,
            cfg: &self.cfg,
            link: self.link.as_ref(),
            runner: &self.runner,
        };
        let mut factory =
            || Box::new(SqlProbe::connect(&self.cluster, &self.cfg)) as Box<dyn BackendProbe>;
        failover::run_failover(
            &self.cluster,
            &self.cfg,
            &mut fleet,
            self.link.as_ref(),
            &self.runner,
            &mut factory,
        );
    }

    fn sync_from_leader(&mut self) {
        let mut fleet = SupervisorFleet {
            registry: &mut self.registry,
            router: &self.router,
            cluster: &self.cluster,
            cfg: &self.cfg,
            link: self.link.as_ref(),
            runner: &self.runner,
        };
        watchdog::sync_backend_from_leader(
            &self.cluster,
            &self.cfg,
            self.link.as_ref(),
            &mut fleet,
            self.initializing,
        );
    }

    // =========================================================================
    // Reaper
    // =========================================================================

    /// Collect exited children and restart what policy says must come
    /// back. Respawn is skipped while exiting; the caller already defers
    /// during a drain.
    fn reaper(&mut self) {
        if self.exiting {
            debug!("reaper handler: skipped, already exiting");
            return;
        }
        debug!("reaper handler");

        for (pid, status) in ProcessRegistry::harvest() {
            let kind = self.registry.identify(&self.cluster, pid);

            if matches!(status, nix::sys::wait::WaitStatus::Signaled(..))
                && kind == ChildKind::Watchdog
            {
                // The successor must know to recover shared watchdog state.
                self.registry.watchdog_needs_cleanup = true;
            }

            match ProcessRegistry::classify_exit(kind, &status) {
                ExitClass::Fatal(code) => {
                    error!(
                        "{} process exited with fatal error, shutting down the supervisor",
                        kind.name()
                    );
                    self.shutdown(Signal::SIGTERM, code);
                }
                ExitClass::NoRestart => self.clear_child_slot(kind),
                ExitClass::Restart => self.respawn_child(kind),
            }
        }
        debug!("reaper handler: done");
    }

    fn clear_child_slot(&mut self, kind: ChildKind) {
        match kind {
            ChildKind::Pcp => self.registry.pcp = 0,
            ChildKind::Generic => self.registry.generic = 0,
            ChildKind::LogCollector => self.registry.log_collector = 0,
            ChildKind::Watchdog => self.registry.watchdog = 0,
            ChildKind::Lifecheck => self.registry.lifecheck = 0,
            ChildKind::FollowPrimary => self.registry.follow = 0,
            ChildKind::QueryWorker(i) => self.cluster.worker(i).clear(),
            ChildKind::HealthCheck(i) => self.registry.health_check[i] = 0,
            ChildKind::Unknown => {}
        }
    }

    fn respawn_child(&mut self, kind: ChildKind) {
        let switching = self.cluster.request_info().switching();
        match kind {
            ChildKind::Pcp => {
                self.registry.pcp = fork_pcp_worker(&self.router, &self.cluster, &self.cfg);
                info!("forked a new PCP worker with pid {}", self.registry.pcp);
            }
            ChildKind::Generic => {
                self.registry.generic =
                    fork_generic_worker(&self.router, &self.cluster, &self.cfg);
                info!("forked a new generic worker with pid {}", self.registry.generic);
            }
            ChildKind::LogCollector => {
                self.registry.log_collector = fork_log_collector(&self.router, &self.cfg);
                info!(
                    "forked a new log collector with pid {}",
                    self.registry.log_collector
                );
            }
            ChildKind::Watchdog => {
                let cleanup = self.registry.watchdog_needs_cleanup;
                self.registry.watchdog = fork_watchdog(&self.router, &self.cluster, cleanup);
                self.registry.watchdog_needs_cleanup = false;
                info!("forked a new watchdog child with pid {}", self.registry.watchdog);
            }
            ChildKind::Lifecheck => {
                self.registry.lifecheck = fork_lifecheck(&self.router);
                info!(
                    "forked a new watchdog lifecheck with pid {}",
                    self.registry.lifecheck
                );
            }
            ChildKind::FollowPrimary => {
                // Short-lived by design, never respawned.
                self.registry.follow = 0;
            }
            ChildKind::QueryWorker(i) => {
                if !switching && !self.exiting {
                    let pid = fork_query_worker(&self.router, &self.cluster, &self.cfg, i);
                    info!("forked a new query worker {} with pid {}", i, pid);
                } else {
                    self.cluster.worker(i).clear();
                    self.cluster.worker(i).set_need_restart(true);
                }
            }
            ChildKind::HealthCheck(i) => {
                if !switching && !self.exiting && self.cluster.backend_valid(i) {
                    self.registry.health_check[i] =
                        fork_health_check(&self.router, &self.cluster, &self.cfg, i);
                } else {
                    self.registry.health_check[i] = 0;
                }
            }
            ChildKind::Unknown => {}
        }
    }

    // =========================================================================
    // Wakeup / reload / shutdown
    // =========================================================================

    fn wakeup_children(&self) {
        for i in 0..self.cluster.num_workers() {
            let pid = self.cluster.worker(i).pid();
            if pid != 0 {
                let _ = kill(Pid::from_raw(pid), Signal::SIGUSR2);
            }
        }
    }

    fn reload_config(&mut self) {
        info!("reload config files");
        match Config::load(&self.config_path) {
            Ok(fresh) => self.cfg.apply_reload(fresh),
            Err(e) => {
                warn!("config reload failed, keeping current settings: {:#}", e);
                return;
            }
        }
        // Reloading could have changed what the status file should say.
        if let Err(e) = statusfile::write(&self.cluster, &self.cfg.logdir) {
            warn!("failed to write status file: {}", e);
        }

        for i in 0..self.cluster.num_workers() {
            let pid = self.cluster.worker(i).pid();
            if pid != 0 {
                let _ = kill(Pid::from_raw(pid), Signal::SIGHUP);
            }
        }
        for pid in [
            self.registry.pcp,
            self.registry.generic,
            self.registry.watchdog,
        ]
        .into_iter()
        .chain(self.registry.health_check.iter().copied())
        {
            if pid > 0 {
                let _ = kill(Pid::from_raw(pid), Signal::SIGHUP);
            }
        }
    }

    /// Coordinated shutdown. Serialized through the exit-handler
    /// semaphore so a burst of shutdown signals runs it exactly once.
    fn shutdown(&mut self, sig: Signal, exit_code: i32) -> ! {
        {
            let _guard = self.cluster.lock(LockId::MainExitHandler);
            if self.exiting {
                info!("shutdown requested (signal {}) but already in progress", sig);
                std::process::exit(exit_code);
            }
            self.exiting = true;
        }
        info!("shutting down by signal {}", sig);

        info!("terminating all child processes");
        self.registry.terminate_all_children(&self.cluster, sig);
        self.registry.signal_follow_child(sig);

        if let Err(e) = statusfile::write(&self.cluster, &self.cfg.logdir) {
            warn!("failed to write status file during shutdown: {}", e);
        }
        if let Some(listeners) = self.listeners.take() {
            listeners.unlink_sockets();
            drop(listeners);
        }

        info!("poolkeeper supervisor is shut down");
        std::process::exit(exit_code);
    }
}

// =============================================================================
// Fleet implementation (real forks and kills)
// =============================================================================

struct SupervisorFleet<'a> {
    registry: &'a mut ProcessRegistry,
    router: &'a SignalRouter,
    cluster: &'a ClusterState,
    cfg: &'a Config,
    link: &'a dyn WatchdogLink,
    runner: &'a ShellRunner,
}

impl WorkerFleet for SupervisorFleet<'_> {
    fn kill_query_worker(&mut self, idx: usize) {
        let pid = self.cluster.worker(idx).pid();
        if pid != 0 {
            debug!("killing query worker {} with pid {}", idx, pid);
            let _ = kill(Pid::from_raw(pid), Signal::SIGQUIT);
        }
    }

    fn respawn_query_worker(&mut self, idx: usize) {
        fork_query_worker(self.router, self.cluster, self.cfg, idx);
    }

    fn signal_query_workers(&mut self, sig: Signal) {
        for i in 0..self.cluster.num_workers() {
            let pid = self.cluster.worker(i).pid();
            if pid != 0 {
                let _ = kill(Pid::from_raw(pid), sig);
            }
        }
    }

    fn signal_generic_worker(&mut self) {
        if self.registry.generic > 0 {
            let _ = kill(Pid::from_raw(self.registry.generic), Signal::SIGUSR1);
        }
    }

    fn wakeup_pcp_worker(&mut self) {
        if self.registry.pcp > 0 {
            let _ = kill(Pid::from_raw(self.registry.pcp), Signal::SIGUSR2);
        }
    }

    fn restart_pcp_worker(&mut self) {
        let old = self.registry.pcp;
        if old > 0 {
            // Give in-flight admin responses a moment to flush.
            thread::sleep(Duration::from_secs(1));
            let _ = kill(Pid::from_raw(old), Signal::SIGUSR1);
            loop {
                match waitpid(Pid::from_raw(old), None) {
                    Ok(status) => {
                        info!("PCP worker {} exited in failover: {:?}", old, status);
                        break;
                    }
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => {
                        warn!("failover: waitpid on PCP worker failed: {}", e);
                        break;
                    }
                }
            }
        }
        self.registry.pcp = fork_pcp_worker(self.router, self.cluster, self.cfg);
        info!("forked a new PCP worker with pid {} in failover", self.registry.pcp);
    }

    fn spawn_follow_child(&mut self, old_main: i32, new_primary: i32, old_primary: i32) {
        match follow::fork_follow_child(
            self.router,
            self.cluster,
            self.cfg,
            self.link,
            self.runner,
            old_main,
            new_primary,
            old_primary,
        ) {
            Ok(pid) => self.registry.follow = pid.as_raw(),
            Err(e) => warn!("follow fork() failed: {}", e),
        }
    }

    fn ensure_health_check_workers(&mut self) {
        for i in 0..self.cluster.num_backends() {
            if self.registry.health_check[i] == 0 && self.cluster.backend_valid(i) {
                let backend = self.cluster.backend(i);
                info!(
                    "start health check process for host {}({})",
                    backend.host(),
                    backend.port()
                );
                self.registry.health_check[i] =
                    fork_health_check(self.router, self.cluster, self.cfg, i);
            }
        }
    }
}

// =============================================================================
// Fork helpers
// =============================================================================

fn fatal_fork_error(what: &str, e: anyhow::Error) -> ! {
    error!("failed to fork {}: {:#}", what, e);
    std::process::exit(1)
}

fn fork_query_worker(
    router: &SignalRouter,
    cluster: &ClusterState,
    cfg: &Config,
    idx: usize,
) -> i32 {
    cluster.worker(idx).set_need_restart(false);
    match registry::fork_child(router, || workers::query_worker_main(cluster, cfg, idx)) {
        Ok(pid) => {
            cluster.worker(idx).set_pid(pid.as_raw());
            pid.as_raw()
        }
        Err(e) => fatal_fork_error("query worker", e),
    }
}

fn fork_pcp_worker(router: &SignalRouter, cluster: &ClusterState, cfg: &Config) -> i32 {
    match registry::fork_child(router, || workers::pcp_worker_main(cluster, cfg)) {
        Ok(pid) => pid.as_raw(),
        Err(e) => fatal_fork_error("PCP worker", e),
    }
}

fn fork_generic_worker(router: &SignalRouter, cluster: &ClusterState, cfg: &Config) -> i32 {
    match registry::fork_child(router, || workers::generic_worker_main(cluster, cfg)) {
        Ok(pid) => pid.as_raw(),
        Err(e) => fatal_fork_error("generic worker", e),
    }
}

fn fork_log_collector(router: &SignalRouter, cfg: &Config) -> i32 {
    match registry::fork_child(router, || workers::log_collector_main(cfg)) {
        Ok(pid) => pid.as_raw(),
        Err(e) => fatal_fork_error("log collector", e),
    }
}

fn fork_health_check(
    router: &SignalRouter,
    cluster: &ClusterState,
    cfg: &Config,
    node: usize,
) -> i32 {
    match registry::fork_child(router, || workers::health_check_main(cluster, cfg, node)) {
        Ok(pid) => pid.as_raw(),
        Err(e) => fatal_fork_error("health check worker", e),
    }
}

fn fork_watchdog(router: &SignalRouter, cluster: &ClusterState, needs_cleanup: bool) -> i32 {
    match registry::fork_child(router, || {
        workers::watchdog_child_main(cluster, needs_cleanup)
    }) {
        Ok(pid) => pid.as_raw(),
        Err(e) => fatal_fork_error("watchdog child", e),
    }
}

fn fork_lifecheck(router: &SignalRouter) -> i32 {
    match registry::fork_child(router, workers::lifecheck_child_main) {
        Ok(pid) => pid.as_raw(),
        Err(e) => fatal_fork_error("watchdog lifecheck", e),
    }
}

/// Wipe the query-cache OID map directory.
fn discard_oid_maps(cfg: &Config) {
    if !cfg.cache_region_enabled() {
        return;
    }
    let dir = cfg.logdir.join("oiddir");
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => info!("discarded query cache oid maps at {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to discard oid maps at {}: {}", dir.display(), e),
    }
}
