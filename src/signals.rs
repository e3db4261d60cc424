//! Signal Routing
//!
//! Handlers do three things only: set a flag, write one byte to the
//! self-pipe, restore errno (signal-hook guarantees the last part). All
//! real work is deferred to the main loop, which polls the self-pipe with
//! a timeout and checks the flags in a fixed order:
//! shutdown -> wakeup -> sigusr1 -> sigchld -> reload.
//!
//! SIGUSR1 fans out further through the shared [`SignalSlot`], drained in
//! the fixed priority given by [`INTERRUPT_PRIORITY`].

use crate::cluster::{ClusterState, InterruptReason};
use nix::sys::signal::{kill, sigprocmask, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::Pid;
use signal_hook::consts::{SIGCHLD, SIGHUP, SIGINT, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::{flag, low_level::pipe};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Fixed drain order for the shared signal slot. A burst of simultaneous
/// notifications is therefore processed deterministically.
pub const INTERRUPT_PRIORITY: [InterruptReason; 5] = [
    InterruptReason::WatchdogQuorumChanged,
    InterruptReason::InformQuarantineNodes,
    InterruptReason::BackendSyncRequired,
    InterruptReason::WatchdogStateChanged,
    InterruptReason::FailoverInterrupt,
];

pub struct SignalRouter {
    pipe_r: RawFd,
    pipe_w: RawFd,
    /// Holds the raw signal number of the first shutdown signal seen.
    shutdown: Arc<AtomicUsize>,
    sigusr1: Arc<AtomicBool>,
    sigchld: Arc<AtomicBool>,
    wakeup: Arc<AtomicBool>,
    reload: Arc<AtomicBool>,
}

impl SignalRouter {
    /// Install handlers and create the self-pipe. Must run in the
    /// supervisor before the first fork so children inherit nothing but
    /// the (closable) pipe ends.
    pub fn install() -> io::Result<SignalRouter> {
        // The supervisor writes to workers that may be gone.
        unsafe { nix::sys::signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) }
            .map_err(io::Error::from)?;

        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let (pipe_r, pipe_w) = (fds[0], fds[1]);

        let shutdown = Arc::new(AtomicUsize::new(0));
        let sigusr1 = Arc::new(AtomicBool::new(false));
        let sigchld = Arc::new(AtomicBool::new(false));
        let wakeup = Arc::new(AtomicBool::new(false));
        let reload = Arc::new(AtomicBool::new(false));

        for sig in [SIGTERM, SIGINT, SIGQUIT] {
            flag::register_usize(sig, Arc::clone(&shutdown), sig as usize)?;
            pipe::register_raw(sig, pipe_w)?;
        }
        flag::register(SIGUSR1, Arc::clone(&sigusr1))?;
        pipe::register_raw(SIGUSR1, pipe_w)?;
        flag::register(SIGCHLD, Arc::clone(&sigchld))?;
        pipe::register_raw(SIGCHLD, pipe_w)?;
        flag::register(SIGUSR2, Arc::clone(&wakeup))?;
        pipe::register_raw(SIGUSR2, pipe_w)?;
        flag::register(SIGHUP, Arc::clone(&reload))?;
        pipe::register_raw(SIGHUP, pipe_w)?;

        Ok(SignalRouter {
            pipe_r,
            pipe_w,
            shutdown,
            sigusr1,
            sigchld,
            wakeup,
            reload,
        })
    }

    /// Sleep until a signal pokes the self-pipe or the timeout elapses.
    /// Returns true when something arrived. The pipe is drained so a burst
    /// costs a single wakeup.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut pfd = libc::pollfd {
            fd: self.pipe_r,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
        if rc <= 0 {
            return false;
        }
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.pipe_r, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }
        true
    }

    /// First shutdown signal received, if any. Never cleared: shutdown
    /// takes precedence over everything that follows it.
    pub fn shutdown_signal(&self) -> Option<Signal> {
        match self.shutdown.load(Ordering::SeqCst) {
            0 => None,
            n => Signal::try_from(n as libc::c_int).ok(),
        }
    }

    pub fn take_sigusr1(&self) -> bool {
        self.sigusr1.swap(false, Ordering::SeqCst)
    }

    pub fn sigusr1_pending(&self) -> bool {
        self.sigusr1.load(Ordering::SeqCst)
    }

    pub fn take_sigchld(&self) -> bool {
        self.sigchld.swap(false, Ordering::SeqCst)
    }

    pub fn sigchld_pending(&self) -> bool {
        self.sigchld.load(Ordering::SeqCst)
    }

    pub fn take_wakeup(&self) -> bool {
        self.wakeup.swap(false, Ordering::SeqCst)
    }

    pub fn take_reload(&self) -> bool {
        self.reload.swap(false, Ordering::SeqCst)
    }

    /// Forked children must not hold the supervisor's pipe open: a child
    /// catching a stray signal would otherwise wake the supervisor.
    pub fn close_in_child(&self) {
        unsafe {
            libc::close(self.pipe_r);
            libc::close(self.pipe_w);
        }
    }
}

/// Restore default dispositions in a freshly forked child. The child
/// inherits the supervisor's handlers, which point at supervisor state.
pub fn reset_child_dispositions() {
    for sig in [
        Signal::SIGTERM,
        Signal::SIGINT,
        Signal::SIGQUIT,
        Signal::SIGUSR1,
        Signal::SIGUSR2,
        Signal::SIGCHLD,
        Signal::SIGHUP,
        Signal::SIGPIPE,
    ] {
        let _ = unsafe { nix::sys::signal::signal(sig, SigHandler::SigDfl) };
    }
}

/// Block every signal, returning the previous mask. Held across fork and
/// while the failover engine commits a transition.
pub fn block_all_signals() -> SigSet {
    let mut old = SigSet::empty();
    let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::all()), Some(&mut old));
    old
}

pub fn restore_signal_mask(mask: &SigSet) {
    let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(mask), None);
}

pub fn unblock_all_signals() {
    let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
}

/// Raise an interrupt reason in the shared slot and poke the supervisor.
/// Used by any process that is not the supervisor itself.
pub fn notify_supervisor(cluster: &ClusterState, supervisor: Pid, reason: InterruptReason) {
    log::debug!("raising supervisor interrupt {:?}", reason);
    cluster.signal_slot().raise(reason);
    if let Err(e) = kill(supervisor, Signal::SIGUSR1) {
        log::warn!("failed to signal supervisor {}: {}", supervisor, e);
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_priority_order() {
        assert_eq!(
            INTERRUPT_PRIORITY[0],
            InterruptReason::WatchdogQuorumChanged
        );
        assert_eq!(
            INTERRUPT_PRIORITY[4],
            InterruptReason::FailoverInterrupt
        );
        // Every reason appears exactly once.
        for reason in INTERRUPT_PRIORITY {
            assert_eq!(
                INTERRUPT_PRIORITY.iter().filter(|r| **r == reason).count(),
                1
            );
        }
    }

    #[test]
    fn test_router_flags_and_pipe() {
        let router = SignalRouter::install().unwrap();

        // Nothing pending: the 50ms wait times out.
        assert!(!router.wait(Duration::from_millis(50)));
        assert!(router.shutdown_signal().is_none());

        signal_hook::low_level::raise(SIGUSR2).unwrap();
        assert!(router.wait(Duration::from_millis(1000)));
        assert!(router.take_wakeup());
        assert!(!router.take_wakeup());

        signal_hook::low_level::raise(SIGUSR1).unwrap();
        // Flag observable without waiting on the pipe.
        assert!(router.sigusr1_pending());
        assert!(router.take_sigusr1());
        assert!(!router.sigusr1_pending());
    }
}
