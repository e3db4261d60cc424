//! Follow-Primary Lock and Child
//!
//! Re-pointing the remaining backends at a freshly promoted primary and
//! false-primary detach logic conflict with each other, so both must hold
//! this process-wide lock. A peer supervisor (through the watchdog link)
//! may also request the lock; remote requests never block, and exactly
//! one remote hold is supported.

use crate::cluster::{BackendStatus, ClusterState, LockId};
use crate::command::{self, CommandRunner};
use crate::config::Config;
use crate::registry;
use crate::signals::SignalRouter;
use crate::watchdog::WatchdogLink;
use anyhow::Result;
use log::{debug, info, warn};
use nix::unistd::{setsid, Pid};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

/// Acquire the follow-primary lock.
///
/// Local callers may block until the lock frees up (polling at 1-second
/// intervals). A remote request that finds the lock held sets the pending
/// flag and returns false; the lock transfers on the local release.
pub fn acquire_follow_primary_lock(cluster: &ClusterState, block: bool, remote_request: bool) -> bool {
    let info = cluster.request_info();
    loop {
        {
            let _guard = cluster.lock(LockId::FollowPrimary);
            let count = info.follow_primary_count.load(Ordering::SeqCst);

            if count <= 0 {
                debug!("follow primary lock was not held by anyone");
                info.follow_primary_lock_held_remotely
                    .store(remote_request, Ordering::SeqCst);
                info.follow_primary_count.store(1, Ordering::SeqCst);
                return true;
            }

            if remote_request {
                if info.follow_primary_lock_held_remotely.load(Ordering::SeqCst) {
                    // Only one remote hold is supported.
                    warn!(
                        "received remote follow primary lock request while the lock is already held by the remote node"
                    );
                } else {
                    info.follow_primary_lock_pending.store(true, Ordering::SeqCst);
                }
                debug!("follow primary lock was held by someone ({})", count);
                return false;
            }

            if !block {
                debug!("follow primary lock was held by someone ({})", count);
                return false;
            }
        }
        debug!("follow primary lock is held, sleeping");
        thread::sleep(Duration::from_secs(1));
    }
}

/// Release the follow-primary lock.
///
/// A remote release only clears a remotely held lock and always clears
/// the pending flag. A local release transfers the lock when a remote
/// request is pending.
pub fn release_follow_primary_lock(cluster: &ClusterState, remote_request: bool) {
    let info = cluster.request_info();
    let _guard = cluster.lock(LockId::FollowPrimary);

    if remote_request {
        if info.follow_primary_lock_held_remotely.load(Ordering::SeqCst) {
            info.follow_primary_count.store(0, Ordering::SeqCst);
            info.follow_primary_lock_held_remotely
                .store(false, Ordering::SeqCst);
            debug!("released the remotely held follow primary lock");
        } else if info.follow_primary_count.load(Ordering::SeqCst) != 0 {
            debug!("ignoring remote release: follow primary lock is not held by the remote node");
        }
        // A remote release always clears any pending remote request.
        info.follow_primary_lock_pending.store(false, Ordering::SeqCst);
    } else {
        if info.follow_primary_lock_pending.load(Ordering::SeqCst) {
            // Hand the lock over instead of dropping it.
            info.follow_primary_lock_held_remotely
                .store(true, Ordering::SeqCst);
            info.follow_primary_count.store(1, Ordering::SeqCst);
            info.follow_primary_lock_pending.store(false, Ordering::SeqCst);
            debug!("follow primary lock shifted to the remote node");
        } else {
            if info.follow_primary_lock_held_remotely.load(Ordering::SeqCst) {
                info!("releasing the remotely held follow primary lock by local request");
            }
            info.follow_primary_count.store(0, Ordering::SeqCst);
            info.follow_primary_lock_held_remotely
                .store(false, Ordering::SeqCst);
        }
    }
}

/// Body of the follow-primary child. Locks the standbys across the
/// cluster, takes the local lock, runs the follow command once per DOWN
/// backend, then releases everything.
pub fn run_follow_child(
    cluster: &ClusterState,
    cfg: &Config,
    link: &dyn WatchdogLink,
    runner: &dyn CommandRunner,
    old_main: i32,
    new_primary: i32,
    old_primary: i32,
) -> i32 {
    link.lock_standbys();
    acquire_follow_primary_lock(cluster, true, false);
    cluster
        .request_info()
        .follow_primary_ongoing
        .store(true, Ordering::SeqCst);

    info!("start triggering follow primary command");
    for i in 0..cluster.num_backends() {
        if cluster.backend(i).status() == BackendStatus::Down {
            command::trigger(
                runner,
                cluster,
                i as i32,
                &cfg.follow_primary_command,
                old_main,
                new_primary,
                old_primary,
            );
        }
    }

    cluster
        .request_info()
        .follow_primary_ongoing
        .store(false, Ordering::SeqCst);
    release_follow_primary_lock(cluster, false);
    link.unlock_standbys();
    0
}

/// Fork the short-lived follow-primary child. The child gets its own
/// session so the whole group can be signalled during shutdown.
pub fn fork_follow_child(
    router: &SignalRouter,
    cluster: &ClusterState,
    cfg: &Config,
    link: &dyn WatchdogLink,
    runner: &dyn CommandRunner,
    old_main: i32,
    new_primary: i32,
    old_primary: i32,
) -> Result<Pid> {
    registry::fork_child(router, || {
        if let Err(e) = setsid() {
            warn!("could not set session id in the follow primary child: {}", e);
        }
        run_follow_child(cluster, cfg, link, runner, old_main, new_primary, old_primary)
    })
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::test_config;
    use crate::cluster::ClusterState;
    use crate::watchdog::NoWatchdog;
    use std::cell::RefCell;

    fn lock_state(cluster: &ClusterState) -> (i32, bool, bool) {
        let info = cluster.request_info();
        (
            info.follow_primary_count.load(Ordering::SeqCst),
            info.follow_primary_lock_held_remotely.load(Ordering::SeqCst),
            info.follow_primary_lock_pending.load(Ordering::SeqCst),
        )
    }

    #[test]
    fn test_local_acquire_release() {
        let cluster = ClusterState::create(&test_config(2)).unwrap();
        assert!(acquire_follow_primary_lock(&cluster, false, false));
        assert_eq!(lock_state(&cluster), (1, false, false));

        // A second local non-blocking attempt fails.
        assert!(!acquire_follow_primary_lock(&cluster, false, false));

        release_follow_primary_lock(&cluster, false);
        assert_eq!(lock_state(&cluster), (0, false, false));
    }

    #[test]
    fn test_remote_acquire_when_free() {
        let cluster = ClusterState::create(&test_config(2)).unwrap();
        assert!(acquire_follow_primary_lock(&cluster, false, true));
        assert_eq!(lock_state(&cluster), (1, true, false));
    }

    #[test]
    fn test_remote_request_while_held_sets_pending_and_transfers() {
        let cluster = ClusterState::create(&test_config(2)).unwrap();
        assert!(acquire_follow_primary_lock(&cluster, true, false));

        // Remote never blocks; it leaves a pending marker instead.
        assert!(!acquire_follow_primary_lock(&cluster, true, true));
        assert_eq!(lock_state(&cluster), (1, false, true));

        // Local release hands the lock to the remote node.
        release_follow_primary_lock(&cluster, false);
        assert_eq!(lock_state(&cluster), (1, true, false));

        // Remote release finally frees it.
        release_follow_primary_lock(&cluster, true);
        assert_eq!(lock_state(&cluster), (0, false, false));
    }

    #[test]
    fn test_second_remote_acquire_is_ignored() {
        let cluster = ClusterState::create(&test_config(2)).unwrap();
        assert!(acquire_follow_primary_lock(&cluster, false, true));
        assert!(!acquire_follow_primary_lock(&cluster, false, true));
        // No pending flag: a remotely held lock swallows the request.
        assert_eq!(lock_state(&cluster), (1, true, false));
    }

    #[test]
    fn test_idle_remote_release_is_noop_but_clears_pending() {
        let cluster = ClusterState::create(&test_config(2)).unwrap();
        release_follow_primary_lock(&cluster, true);
        assert_eq!(lock_state(&cluster), (0, false, false));

        // Locally held lock survives a remote release.
        assert!(acquire_follow_primary_lock(&cluster, false, false));
        cluster
            .request_info()
            .follow_primary_lock_pending
            .store(true, Ordering::SeqCst);
        release_follow_primary_lock(&cluster, true);
        assert_eq!(lock_state(&cluster), (1, false, false));
    }

    struct Recorder(RefCell<Vec<String>>);

    impl CommandRunner for Recorder {
        fn run(&self, command: &str) -> i32 {
            self.0.borrow_mut().push(command.to_string());
            0
        }
    }

    #[test]
    fn test_follow_child_runs_command_per_down_backend() {
        let mut cfg = test_config(3);
        cfg.follow_primary_command = "follow %d -> %m".to_string();
        let cluster = ClusterState::create(&cfg).unwrap();
        cluster.backend(0).set_status(BackendStatus::Down);
        cluster.backend(2).set_status(BackendStatus::Down);

        let runner = Recorder(RefCell::new(Vec::new()));
        let rc = run_follow_child(&cluster, &cfg, &NoWatchdog, &runner, 0, 1, 0);
        assert_eq!(rc, 0);
        assert_eq!(
            *runner.0.borrow(),
            vec!["follow 0 -> 1".to_string(), "follow 2 -> 1".to_string()]
        );
        // Lock released, flag cleared.
        assert_eq!(lock_state(&cluster), (0, false, false));
        assert!(!cluster.request_info().follow_primary_ongoing());
    }
}
