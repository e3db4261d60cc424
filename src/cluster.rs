//! Cluster-Wide Shared State
//!
//! Backend descriptor table, worker slots, the per-pool connection cube,
//! the signal slot and the global request info all live in one shared
//! segment mapped into the supervisor and every worker (§ arena + index:
//! structures reference each other by integer id only).
//!
//! Write discipline:
//! - backend `status`/`role`/`quarantined` are written only by the
//!   supervisor (failover engine, watchdog sync, status file load)
//! - the request queue, `switching`, `primary_node_id` and `main_node_id`
//!   are written under the REQUEST_INFO semaphore
//! - workers read everything lock-free and tolerate stale values

use crate::config::{ClusterMode, Config, MAX_BACKENDS};
use crate::shmem::{SemGuard, SharedRegion, SharedSemaphore, CHUNK_ALIGN};
use anyhow::Result;
use std::cell::UnsafeCell;
use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub const REQUEST_QUEUE_SIZE: u64 = 10;
pub const HOSTNAME_LEN: usize = 128;
pub const DATADIR_LEN: usize = 512;

// =============================================================================
// Backend descriptors
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackendStatus {
    Unused = 0,
    ConnectWait = 1,
    Up = 2,
    Down = 3,
}

impl BackendStatus {
    pub fn from_u8(v: u8) -> BackendStatus {
        match v {
            1 => BackendStatus::ConnectWait,
            2 => BackendStatus::Up,
            3 => BackendStatus::Down,
            _ => BackendStatus::Unused,
        }
    }

    /// Status word used by the persisted status file.
    pub fn status_word(self) -> &'static str {
        match self {
            BackendStatus::Up | BackendStatus::ConnectWait => "up",
            BackendStatus::Down => "down",
            BackendStatus::Unused => "unused",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackendRole {
    Unknown = 0,
    Primary = 1,
    Standby = 2,
}

impl BackendRole {
    pub fn from_u8(v: u8) -> BackendRole {
        match v {
            1 => BackendRole::Primary,
            2 => BackendRole::Standby,
            _ => BackendRole::Unknown,
        }
    }
}

pub const FLAG_ALWAYS_PRIMARY: u8 = 0x01;
pub const FLAG_DISALLOW_TO_FAILOVER: u8 = 0x02;

/// One backend descriptor in the shared table. Host, port, data directory
/// and flags are written once before the first fork and read-only after.
#[repr(C)]
pub struct BackendSlot {
    status: AtomicU8,
    role: AtomicU8,
    quarantined: AtomicBool,
    flags: u8,
    port: u16,
    host: [u8; HOSTNAME_LEN],
    data_directory: [u8; DATADIR_LEN],
    status_changed_at: AtomicI64,
}

impl BackendSlot {
    fn new(cfg: Option<&crate::config::BackendConfig>) -> BackendSlot {
        let mut host = [0u8; HOSTNAME_LEN];
        let mut data_directory = [0u8; DATADIR_LEN];
        let mut flags = 0u8;
        let mut port = 0u16;
        let status = match cfg {
            Some(b) => {
                copy_str(&mut host, &b.host);
                copy_str(&mut data_directory, &b.data_directory);
                if b.always_primary {
                    flags |= FLAG_ALWAYS_PRIMARY;
                }
                if b.disallow_to_failover {
                    flags |= FLAG_DISALLOW_TO_FAILOVER;
                }
                port = b.port;
                BackendStatus::ConnectWait
            }
            None => BackendStatus::Unused,
        };
        BackendSlot {
            status: AtomicU8::new(status as u8),
            role: AtomicU8::new(BackendRole::Unknown as u8),
            quarantined: AtomicBool::new(false),
            flags,
            port,
            host,
            data_directory,
            status_changed_at: AtomicI64::new(now_secs()),
        }
    }

    pub fn status(&self) -> BackendStatus {
        BackendStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    /// Every status write stamps the change time.
    pub fn set_status(&self, status: BackendStatus) {
        self.status.store(status as u8, Ordering::SeqCst);
        self.touch_status_time();
    }

    pub fn role(&self) -> BackendRole {
        BackendRole::from_u8(self.role.load(Ordering::SeqCst))
    }

    pub fn set_role(&self, role: BackendRole) {
        self.role.store(role as u8, Ordering::SeqCst);
    }

    pub fn quarantined(&self) -> bool {
        self.quarantined.load(Ordering::SeqCst)
    }

    pub fn set_quarantined(&self, v: bool) {
        self.quarantined.store(v, Ordering::SeqCst);
    }

    pub fn always_primary(&self) -> bool {
        self.flags & FLAG_ALWAYS_PRIMARY != 0
    }

    pub fn disallow_failover(&self) -> bool {
        self.flags & FLAG_DISALLOW_TO_FAILOVER != 0
    }

    pub fn host(&self) -> &str {
        fixed_to_str(&self.host)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn data_directory(&self) -> &str {
        fixed_to_str(&self.data_directory)
    }

    pub fn status_changed_at(&self) -> i64 {
        self.status_changed_at.load(Ordering::SeqCst)
    }

    pub fn touch_status_time(&self) {
        self.status_changed_at.store(now_secs(), Ordering::SeqCst);
    }
}

#[repr(C)]
pub struct BackendTable {
    num_backends: u32,
    slots: [BackendSlot; MAX_BACKENDS],
}

// =============================================================================
// Worker slots and the connection cube
// =============================================================================

/// Per query-worker bookkeeping. `pid == 0` means the slot is empty.
#[repr(C)]
pub struct WorkerSlot {
    pid: AtomicI32,
    started_at: AtomicI64,
    need_restart: AtomicBool,
}

impl WorkerSlot {
    pub fn pid(&self) -> i32 {
        self.pid.load(Ordering::SeqCst)
    }

    pub fn set_pid(&self, pid: i32) {
        self.pid.store(pid, Ordering::SeqCst);
        self.started_at.store(now_secs(), Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.pid.store(0, Ordering::SeqCst);
    }

    pub fn started_at(&self) -> i64 {
        self.started_at.load(Ordering::SeqCst)
    }

    pub fn need_restart(&self) -> bool {
        self.need_restart.load(Ordering::SeqCst)
    }

    pub fn set_need_restart(&self, v: bool) {
        self.need_restart.store(v, Ordering::SeqCst);
    }
}

/// One persistent connection slot inside a worker's pool. Written by the
/// owning worker, scanned by the supervisor when deciding restart scope.
#[repr(C)]
pub struct ConnectionInfo {
    connected: AtomicBool,
    load_balancing_node: AtomicI32,
    backend_pid: AtomicI32,
}

impl ConnectionInfo {
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn load_balancing_node(&self) -> i32 {
        self.load_balancing_node.load(Ordering::SeqCst)
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid.load(Ordering::SeqCst)
    }

    pub fn set(&self, connected: bool, load_balancing_node: i32, backend_pid: i32) {
        self.connected.store(connected, Ordering::SeqCst);
        self.load_balancing_node
            .store(load_balancing_node, Ordering::SeqCst);
        self.backend_pid.store(backend_pid, Ordering::SeqCst);
    }
}

// =============================================================================
// Signal slot
// =============================================================================

/// Reasons for signalling the supervisor with SIGUSR1. Any process may
/// raise a flag; only the supervisor drains them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum InterruptReason {
    FailoverInterrupt = 0,
    WatchdogStateChanged = 1,
    BackendSyncRequired = 2,
    WatchdogQuorumChanged = 3,
    InformQuarantineNodes = 4,
}

pub const NUM_INTERRUPT_REASONS: usize = 5;

#[repr(C)]
pub struct SignalSlot {
    flags: [AtomicBool; NUM_INTERRUPT_REASONS],
}

impl SignalSlot {
    pub fn raise(&self, reason: InterruptReason) {
        self.flags[reason as usize].store(true, Ordering::SeqCst);
    }

    /// Clear-and-return; the flag is always cleared before acting on it so
    /// a re-arm during processing is observed by the next pass.
    pub fn take(&self, reason: InterruptReason) -> bool {
        self.flags[reason as usize].swap(false, Ordering::SeqCst)
    }

    pub fn is_raised(&self, reason: InterruptReason) -> bool {
        self.flags[reason as usize].load(Ordering::SeqCst)
    }
}

// =============================================================================
// Request queue and global request info
// =============================================================================

/// One queued node-state-change request, fixed-size for the shared ring.
/// Entries are only touched under the REQUEST_INFO semaphore.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct QueuedRequest {
    pub kind: u8,
    pub flags: u8,
    pub count: u32,
    pub node_ids: [i32; MAX_BACKENDS],
}

impl QueuedRequest {
    pub const fn empty() -> QueuedRequest {
        QueuedRequest {
            kind: 0,
            flags: 0,
            count: 0,
            node_ids: [0; MAX_BACKENDS],
        }
    }
}

/// Global request info: node ids, the switching flag, the follow-primary
/// lock words and the bounded request ring.
#[repr(C)]
pub struct RequestInfo {
    pub main_node_id: AtomicI32,
    pub primary_node_id: AtomicI32,
    pub conn_counter: AtomicU32,
    pub switching: AtomicBool,
    pub follow_primary_ongoing: AtomicBool,
    pub follow_primary_count: AtomicI32,
    pub follow_primary_lock_held_remotely: AtomicBool,
    pub follow_primary_lock_pending: AtomicBool,
    pub queue_head: AtomicU64,
    pub queue_tail: AtomicU64,
    queue: [UnsafeCell<QueuedRequest>; REQUEST_QUEUE_SIZE as usize],
}

// Queue entries are written and read only under the REQUEST_INFO semaphore.
unsafe impl Sync for RequestInfo {}

impl RequestInfo {
    pub fn primary_node_id(&self) -> i32 {
        self.primary_node_id.load(Ordering::SeqCst)
    }

    pub fn main_node_id(&self) -> i32 {
        self.main_node_id.load(Ordering::SeqCst)
    }

    pub fn switching(&self) -> bool {
        self.switching.load(Ordering::SeqCst)
    }

    pub fn follow_primary_ongoing(&self) -> bool {
        self.follow_primary_ongoing.load(Ordering::SeqCst)
    }

    pub fn queue_len(&self) -> u64 {
        self.queue_tail.load(Ordering::SeqCst) - self.queue_head.load(Ordering::SeqCst)
    }

    pub fn queue_is_empty(&self) -> bool {
        self.queue_len() == 0
    }

    pub fn queue_is_full(&self) -> bool {
        self.queue_len() >= REQUEST_QUEUE_SIZE
    }

    /// Append an entry. Caller holds the REQUEST_INFO semaphore and has
    /// checked for a full ring.
    pub(crate) fn queue_push(&self, entry: QueuedRequest) {
        let tail = self.queue_tail.load(Ordering::SeqCst);
        let idx = (tail % REQUEST_QUEUE_SIZE) as usize;
        unsafe {
            *self.queue[idx].get() = entry;
        }
        self.queue_tail.store(tail + 1, Ordering::SeqCst);
    }

    /// Pop the oldest entry. Caller holds the REQUEST_INFO semaphore.
    pub(crate) fn queue_pop(&self) -> Option<QueuedRequest> {
        let head = self.queue_head.load(Ordering::SeqCst);
        if head == self.queue_tail.load(Ordering::SeqCst) {
            return None;
        }
        let idx = (head % REQUEST_QUEUE_SIZE) as usize;
        let entry = unsafe { *self.queue[idx].get() };
        self.queue_head.store(head + 1, Ordering::SeqCst);
        Some(entry)
    }
}

// =============================================================================
// Statistics and snapshot-isolation areas
// =============================================================================

#[repr(C)]
pub struct BackendStats {
    pub client_connection_count: AtomicU64,
    pub probe_failure_count: AtomicU64,
}

#[repr(C)]
pub struct GlobalStats {
    pub failover_count: AtomicU64,
    pub failback_count: AtomicU64,
}

/// Coordination words for snapshot-isolation mode. The pid arrays are
/// carved next to this header, one entry per query worker.
#[repr(C)]
pub struct SnapshotCoordination {
    pub recovery_state: AtomicI32,
    pub snapshot_counter: AtomicU64,
    pub commit_counter: AtomicU64,
}

// =============================================================================
// Cluster state handle
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockId {
    RequestInfo = 0,
    MainExitHandler = 1,
    FollowPrimary = 2,
}

/// Typed view over the shared segment. Cheap to clone into child contexts;
/// after `fork()` the mapping is shared and every pointer stays valid.
pub struct ClusterState {
    #[allow(dead_code)]
    region: SharedRegion,
    backends: *const BackendTable,
    workers: *const WorkerSlot,
    coninfo: *const ConnectionInfo,
    signal_slot: *const SignalSlot,
    req: *const RequestInfo,
    backend_stats: *const BackendStats,
    global_stats: *const GlobalStats,
    snapshot: *const SnapshotCoordination,
    snapshot_pids: *const AtomicI32,
    commit_pids: *const AtomicI32,
    cache_region: *mut u8,
    cache_region_len: usize,
    sems: [SharedSemaphore; 3],
    num_backends: usize,
    num_workers: usize,
    max_pool: usize,
    mode: ClusterMode,
}

unsafe impl Send for ClusterState {}
unsafe impl Sync for ClusterState {}

impl ClusterState {
    /// Allocate and initialize the whole shared segment from configuration.
    /// Called exactly once, before any fork. Allocation failure is fatal.
    pub fn create(cfg: &Config) -> Result<ClusterState> {
        let m = cfg.num_init_children;
        let p = cfg.max_pool;
        let n = cfg.backends.len();
        let cube = m * p * n;
        let cache_len = if cfg.cache_region_enabled() {
            cfg.cache_region_bytes
        } else {
            0
        };

        // Each carve realigns, so budget one alignment gap per chunk.
        let mut size = 256;
        size += size_of::<BackendTable>() + CHUNK_ALIGN;
        size += m * size_of::<WorkerSlot>() + CHUNK_ALIGN;
        size += cube * size_of::<ConnectionInfo>() + CHUNK_ALIGN;
        size += size_of::<SignalSlot>() + CHUNK_ALIGN;
        size += size_of::<RequestInfo>() + CHUNK_ALIGN;
        size += n * size_of::<BackendStats>() + CHUNK_ALIGN;
        size += size_of::<GlobalStats>() + CHUNK_ALIGN;
        size += size_of::<SnapshotCoordination>() + CHUNK_ALIGN;
        size += 2 * (m * size_of::<AtomicI32>() + CHUNK_ALIGN);
        size += 3 * size_of::<libc::sem_t>() + CHUNK_ALIGN;
        size += cache_len + CHUNK_ALIGN;

        log::info!("allocating {} bytes of shared memory segment", size);
        let region = SharedRegion::allocate(size)?;

        let mut carver = region.carver();
        let backends: *mut BackendTable = carver.chunk(1);
        let workers: *mut WorkerSlot = carver.chunk(m);
        let coninfo: *mut ConnectionInfo = carver.chunk(cube);
        let signal_slot: *mut SignalSlot = carver.chunk(1);
        let req: *mut RequestInfo = carver.chunk(1);
        let backend_stats: *mut BackendStats = carver.chunk(n);
        let global_stats: *mut GlobalStats = carver.chunk(1);
        let snapshot: *mut SnapshotCoordination = carver.chunk(1);
        let snapshot_pids: *mut AtomicI32 = carver.chunk(m);
        let commit_pids: *mut AtomicI32 = carver.chunk(m);
        let sem_ptrs: *mut libc::sem_t = carver.chunk(3);
        let cache_region = if cache_len > 0 {
            carver.bytes(cache_len)
        } else {
            ptr::null_mut()
        };

        unsafe {
            ptr::write(ptr::addr_of_mut!((*backends).num_backends), n as u32);
            for i in 0..MAX_BACKENDS {
                let slot = ptr::addr_of_mut!((*backends).slots[i]);
                ptr::write(slot, BackendSlot::new(cfg.backends.get(i)));
            }
            for i in 0..m {
                ptr::write(
                    workers.add(i),
                    WorkerSlot {
                        pid: AtomicI32::new(0),
                        started_at: AtomicI64::new(0),
                        need_restart: AtomicBool::new(false),
                    },
                );
            }
            for i in 0..cube {
                ptr::write(
                    coninfo.add(i),
                    ConnectionInfo {
                        connected: AtomicBool::new(false),
                        load_balancing_node: AtomicI32::new(-1),
                        backend_pid: AtomicI32::new(0),
                    },
                );
            }
            ptr::write(
                signal_slot,
                SignalSlot {
                    flags: Default::default(),
                },
            );
            ptr::write(
                req,
                RequestInfo {
                    main_node_id: AtomicI32::new(-1),
                    // -2 marks "never looked"; discovery runs at startup
                    primary_node_id: AtomicI32::new(-2),
                    conn_counter: AtomicU32::new(0),
                    switching: AtomicBool::new(false),
                    follow_primary_ongoing: AtomicBool::new(false),
                    follow_primary_count: AtomicI32::new(0),
                    follow_primary_lock_held_remotely: AtomicBool::new(false),
                    follow_primary_lock_pending: AtomicBool::new(false),
                    queue_head: AtomicU64::new(0),
                    queue_tail: AtomicU64::new(0),
                    queue: [const { UnsafeCell::new(QueuedRequest::empty()) };
                        REQUEST_QUEUE_SIZE as usize],
                },
            );
            for i in 0..n {
                ptr::write(
                    backend_stats.add(i),
                    BackendStats {
                        client_connection_count: AtomicU64::new(0),
                        probe_failure_count: AtomicU64::new(0),
                    },
                );
            }
            ptr::write(
                global_stats,
                GlobalStats {
                    failover_count: AtomicU64::new(0),
                    failback_count: AtomicU64::new(0),
                },
            );
            ptr::write(
                snapshot,
                SnapshotCoordination {
                    recovery_state: AtomicI32::new(0),
                    snapshot_counter: AtomicU64::new(0),
                    commit_counter: AtomicU64::new(0),
                },
            );
            for i in 0..m {
                ptr::write(snapshot_pids.add(i), AtomicI32::new(0));
                ptr::write(commit_pids.add(i), AtomicI32::new(0));
            }
        }

        let sems = unsafe {
            [
                SharedSemaphore::init_at(sem_ptrs)?,
                SharedSemaphore::init_at(sem_ptrs.add(1))?,
                SharedSemaphore::init_at(sem_ptrs.add(2))?,
            ]
        };

        let state = ClusterState {
            region,
            backends,
            workers,
            coninfo,
            signal_slot,
            req,
            backend_stats,
            global_stats,
            snapshot,
            snapshot_pids,
            commit_pids,
            cache_region,
            cache_region_len: cache_len,
            sems,
            num_backends: n,
            num_workers: m,
            max_pool: p,
            mode: cfg.mode,
        };

        // Now that statuses exist the main node can be computed.
        state
            .request_info()
            .main_node_id
            .store(state.get_next_main_node(), Ordering::SeqCst);
        Ok(state)
    }

    pub fn num_backends(&self) -> usize {
        self.num_backends
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn max_pool(&self) -> usize {
        self.max_pool
    }

    pub fn mode(&self) -> ClusterMode {
        self.mode
    }

    pub fn backend(&self, id: usize) -> &BackendSlot {
        assert!(id < self.num_backends, "backend id {} out of range", id);
        unsafe { &(*self.backends).slots[id] }
    }

    pub fn worker(&self, idx: usize) -> &WorkerSlot {
        assert!(idx < self.num_workers, "worker slot {} out of range", idx);
        unsafe { &*self.workers.add(idx) }
    }

    pub fn coninfo(&self, worker: usize, pool: usize, backend: usize) -> &ConnectionInfo {
        assert!(worker < self.num_workers && pool < self.max_pool && backend < self.num_backends);
        let idx = (worker * self.max_pool + pool) * self.num_backends + backend;
        unsafe { &*self.coninfo.add(idx) }
    }

    pub fn signal_slot(&self) -> &SignalSlot {
        unsafe { &*self.signal_slot }
    }

    pub fn request_info(&self) -> &RequestInfo {
        unsafe { &*self.req }
    }

    pub fn backend_stats(&self, id: usize) -> &BackendStats {
        assert!(id < self.num_backends);
        unsafe { &*self.backend_stats.add(id) }
    }

    pub fn global_stats(&self) -> &GlobalStats {
        unsafe { &*self.global_stats }
    }

    pub fn snapshot_coordination(&self) -> &SnapshotCoordination {
        unsafe { &*self.snapshot }
    }

    /// Pids of workers waiting for a snapshot, one slot per query worker.
    pub fn snapshot_waiting_pids(&self) -> &[AtomicI32] {
        unsafe { std::slice::from_raw_parts(self.snapshot_pids, self.num_workers) }
    }

    /// Pids of workers waiting to commit, one slot per query worker.
    pub fn commit_waiting_pids(&self) -> &[AtomicI32] {
        unsafe { std::slice::from_raw_parts(self.commit_pids, self.num_workers) }
    }

    pub fn cache_region(&self) -> Option<(*mut u8, usize)> {
        if self.cache_region.is_null() {
            None
        } else {
            Some((self.cache_region, self.cache_region_len))
        }
    }

    pub fn lock(&self, id: LockId) -> SemGuard<'_> {
        self.sems[id as usize].lock()
    }

    pub fn node_id_in_range(&self, id: i32) -> bool {
        id >= 0 && (id as usize) < self.num_backends
    }

    /// A backend is addressable when its status is CONNECT_WAIT or UP and
    /// it is not quarantined.
    pub fn backend_valid(&self, id: usize) -> bool {
        let b = self.backend(id);
        matches!(
            b.status(),
            BackendStatus::ConnectWait | BackendStatus::Up
        ) && !b.quarantined()
    }

    /// Raw-mode validity ignores the quarantine flag.
    pub fn backend_valid_raw(&self, id: usize) -> bool {
        matches!(
            self.backend(id).status(),
            BackendStatus::ConnectWait | BackendStatus::Up
        )
    }

    /// Lowest-indexed valid backend, -1 if none.
    pub fn get_next_main_node(&self) -> i32 {
        for i in 0..self.num_backends {
            let valid = if self.mode.is_raw() {
                self.backend_valid_raw(i)
            } else {
                self.backend_valid(i)
            };
            if valid {
                return i as i32;
            }
        }
        -1
    }

    /// True when every backend is DOWN or UNUSED.
    pub fn all_backends_down(&self) -> bool {
        for i in 0..self.num_backends {
            let status = self.backend(i).status();
            if status != BackendStatus::Down && status != BackendStatus::Unused {
                log::info!("node {} is not down (status: {:?})", i, status);
                return false;
            }
        }
        true
    }

    /// True when no backend is valid at all (quarantined nodes count as
    /// invalid here, unlike `all_backends_down`).
    pub fn no_valid_backend(&self) -> bool {
        (0..self.num_backends).all(|i| !self.backend_valid(i))
    }
}

// =============================================================================
// Helpers
// =============================================================================

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn copy_str(dst: &mut [u8], src: &str) {
    let bytes = src.as_bytes();
    let len = bytes.len().min(dst.len() - 1);
    dst[..len].copy_from_slice(&bytes[..len]);
}

fn fixed_to_str(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).unwrap_or("")
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::config::Config;

    /// Two-backend, two-worker test cluster used across the test suite.
    pub fn test_config(n: usize) -> Config {
        let mut backends = String::new();
        for i in 0..n {
            backends.push_str(&format!(
                "[[backend]]\nhost = \"db{}.example\"\nport = 5432\ndata_directory = \"/data/{}\"\n",
                i, i
            ));
        }
        let toml_content = format!("num_init_children = 2\nmax_pool = 2\n{}", backends);
        toml::from_str(&toml_content).unwrap()
    }

    #[test]
    fn test_create_initial_state() {
        let cfg = test_config(2);
        let cluster = ClusterState::create(&cfg).unwrap();

        assert_eq!(cluster.num_backends(), 2);
        assert_eq!(cluster.backend(0).status(), BackendStatus::ConnectWait);
        assert_eq!(cluster.backend(0).host(), "db0.example");
        assert_eq!(cluster.backend(1).data_directory(), "/data/1");
        assert_eq!(cluster.request_info().primary_node_id(), -2);
        assert_eq!(cluster.request_info().main_node_id(), 0);
        assert!(!cluster.request_info().switching());
    }

    #[test]
    fn test_status_write_stamps_time() {
        let cfg = test_config(1);
        let cluster = ClusterState::create(&cfg).unwrap();
        let before = cluster.backend(0).status_changed_at();
        cluster.backend(0).set_status(BackendStatus::Down);
        assert_eq!(cluster.backend(0).status(), BackendStatus::Down);
        assert!(cluster.backend(0).status_changed_at() >= before);
    }

    #[test]
    fn test_validity_and_main_node() {
        let cfg = test_config(3);
        let cluster = ClusterState::create(&cfg).unwrap();
        assert_eq!(cluster.get_next_main_node(), 0);

        cluster.backend(0).set_status(BackendStatus::Down);
        assert_eq!(cluster.get_next_main_node(), 1);

        // Quarantine makes a node invalid even while CONNECT_WAIT.
        cluster.backend(1).set_quarantined(true);
        assert!(!cluster.backend_valid(1));
        assert!(cluster.backend_valid_raw(1));
        assert_eq!(cluster.get_next_main_node(), 2);

        cluster.backend(2).set_status(BackendStatus::Down);
        cluster.backend(1).set_status(BackendStatus::Down);
        assert_eq!(cluster.get_next_main_node(), -1);
        assert!(cluster.all_backends_down());
    }

    #[test]
    fn test_queue_ring() {
        let cfg = test_config(2);
        let cluster = ClusterState::create(&cfg).unwrap();
        let req = cluster.request_info();

        assert!(req.queue_is_empty());
        for i in 0..REQUEST_QUEUE_SIZE {
            assert!(!req.queue_is_full());
            let mut entry = QueuedRequest::empty();
            entry.kind = i as u8;
            req.queue_push(entry);
        }
        assert!(req.queue_is_full());
        assert_eq!(req.queue_len(), REQUEST_QUEUE_SIZE);

        for i in 0..REQUEST_QUEUE_SIZE {
            let entry = req.queue_pop().unwrap();
            assert_eq!(entry.kind, i as u8);
        }
        assert!(req.queue_pop().is_none());
        assert!(req.queue_is_empty());
    }

    #[test]
    fn test_coninfo_cube_indexing() {
        let cfg = test_config(2);
        let cluster = ClusterState::create(&cfg).unwrap();
        cluster.coninfo(1, 1, 1).set(true, 1, 4242);
        assert!(cluster.coninfo(1, 1, 1).connected());
        assert_eq!(cluster.coninfo(1, 1, 1).load_balancing_node(), 1);
        assert!(!cluster.coninfo(0, 0, 0).connected());
        assert!(!cluster.coninfo(1, 1, 0).connected());
    }

    #[test]
    fn test_signal_slot_take_clears() {
        let cfg = test_config(1);
        let cluster = ClusterState::create(&cfg).unwrap();
        let slot = cluster.signal_slot();
        assert!(!slot.take(InterruptReason::FailoverInterrupt));
        slot.raise(InterruptReason::FailoverInterrupt);
        assert!(slot.is_raised(InterruptReason::FailoverInterrupt));
        assert!(slot.take(InterruptReason::FailoverInterrupt));
        assert!(!slot.take(InterruptReason::FailoverInterrupt));
    }
}
