//! Crash-Recoverable Backend Status File
//!
//! One line per configured backend: `up` | `down` | `unused`. The file is
//! fsynced on every write so an observer (or the next startup) only ever
//! sees a consistent snapshot. A legacy fixed-size binary record is still
//! auto-detected and accepted on load.

use crate::cluster::{BackendStatus, ClusterState};
use crate::config::MAX_BACKENDS;
use log::{info, warn};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

pub const STATUS_FILE_NAME: &str = "pool_status";

pub fn status_file_path(logdir: &Path) -> PathBuf {
    logdir.join(STATUS_FILE_NAME)
}

/// Persist the current status vector.
///
/// When every backend is DOWN the write is skipped, so the file always
/// reflects the last set of nodes any data was written to. An ambiguous
/// restart then resolves in favor of the previously-up set.
pub fn write(cluster: &ClusterState, logdir: &Path) -> io::Result<()> {
    let n = cluster.num_backends();
    let all_down = n > 0
        && (0..n).all(|i| cluster.backend(i).status() == BackendStatus::Down);
    if all_down {
        warn!("all backend nodes are down, skip writing status file");
        return Ok(());
    }

    let path = status_file_path(logdir);
    let mut file = File::create(&path)?;
    for i in 0..n {
        writeln!(file, "{}", cluster.backend(i).status().status_word())?;
    }
    file.flush()?;
    file.sync_all()?;
    Ok(())
}

/// Restore the persisted status vector into the shared table.
///
/// With `discard` the file is deleted instead and every backend keeps its
/// initial CONNECT_WAIT state. A file that wakes up no backend at all is
/// treated as bogus: every configured backend is coerced to CONNECT_WAIT
/// and the file is rewritten.
pub fn load(cluster: &ClusterState, logdir: &Path, discard: bool) -> io::Result<()> {
    // Stamp change times even when there is no file to read.
    for i in 0..cluster.num_backends() {
        cluster.backend(i).touch_status_time();
    }

    let path = status_file_path(logdir);
    if !path.exists() {
        info!("backend status file {} does not exist", path.display());
        return Ok(());
    }

    if discard {
        match fs::remove_file(&path) {
            Ok(()) => info!("backend status file {} discarded", path.display()),
            Err(e) => warn!(
                "failed to discard backend status file {}: {}",
                path.display(),
                e
            ),
        }
        return Ok(());
    }

    let mut raw = Vec::new();
    File::open(&path)?.read_to_end(&mut raw)?;

    let someone_wakeup = match parse_legacy_record(&raw, cluster.num_backends()) {
        Some(statuses) => apply_legacy(cluster, &statuses),
        None => apply_text(cluster, &raw),
    };

    if !someone_wakeup {
        // Bogus file: nothing would ever come up.
        for i in 0..cluster.num_backends() {
            cluster.backend(i).set_status(BackendStatus::ConnectWait);
        }
        if let Err(e) = write(cluster, logdir) {
            warn!("failed to rewrite status file: {}", e);
        }
    }
    Ok(())
}

/// The legacy format is one little-endian i32 status code per backend
/// slot, always `MAX_BACKENDS` entries long.
fn parse_legacy_record(raw: &[u8], num_backends: usize) -> Option<Vec<BackendStatus>> {
    if raw.len() != MAX_BACKENDS * 4 {
        return None;
    }
    let mut statuses = Vec::with_capacity(num_backends);
    for i in 0..MAX_BACKENDS {
        let bytes: [u8; 4] = raw[i * 4..i * 4 + 4].try_into().ok()?;
        let code = i32::from_le_bytes(bytes);
        if i < num_backends {
            // Anything but a live status code means this is not the old
            // binary format after all.
            match code {
                1 | 2 | 3 => statuses.push(BackendStatus::from_u8(code as u8)),
                _ => return None,
            }
        } else if code != 0 {
            return None;
        }
    }
    Some(statuses)
}

fn apply_legacy(cluster: &ClusterState, statuses: &[BackendStatus]) -> bool {
    let mut someone_wakeup = false;
    for (i, status) in statuses.iter().enumerate() {
        match status {
            BackendStatus::Down => {
                cluster.backend(i).set_status(BackendStatus::Down);
                info!("reading status file: backend {} is set to down status", i);
            }
            BackendStatus::ConnectWait | BackendStatus::Up => {
                cluster.backend(i).set_status(BackendStatus::ConnectWait);
                someone_wakeup = true;
            }
            BackendStatus::Unused => {}
        }
    }
    someone_wakeup
}

fn apply_text(cluster: &ClusterState, raw: &[u8]) -> bool {
    let text = String::from_utf8_lossy(raw);
    let mut someone_wakeup = false;

    for i in 0..cluster.num_backends() {
        cluster.backend(i).set_status(BackendStatus::Unused);
    }

    for (i, line) in text.lines().enumerate() {
        if i >= cluster.num_backends() {
            break;
        }
        let word = line.trim();
        let bytes = word.as_bytes();
        if bytes.len() >= 2 && bytes[..2].eq_ignore_ascii_case(b"up") {
            cluster.backend(i).set_status(BackendStatus::Up);
            someone_wakeup = true;
        } else if bytes.len() >= 4 && bytes[..4].eq_ignore_ascii_case(b"down") {
            cluster.backend(i).set_status(BackendStatus::Down);
            info!("reading status file: backend {} is set to down status", i);
        } else if bytes.len() >= 6 && bytes[..6].eq_ignore_ascii_case(b"unused") {
            cluster.backend(i).set_status(BackendStatus::Unused);
        } else {
            warn!(
                "invalid data in status file, ignoring: backend {} status \"{}\"",
                i, word
            );
        }
    }
    someone_wakeup
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::test_config;
    use crate::cluster::ClusterState;
    use tempfile::TempDir;

    #[test]
    fn test_write_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let cluster = ClusterState::create(&test_config(3)).unwrap();
        cluster.backend(1).set_status(BackendStatus::Down);
        cluster.backend(2).set_status(BackendStatus::Unused);

        write(&cluster, dir.path()).unwrap();
        let contents = std::fs::read_to_string(status_file_path(dir.path())).unwrap();
        assert_eq!(contents, "up\ndown\nunused\n");

        let restored = ClusterState::create(&test_config(3)).unwrap();
        load(&restored, dir.path(), false).unwrap();
        assert_eq!(restored.backend(0).status(), BackendStatus::Up);
        assert_eq!(restored.backend(1).status(), BackendStatus::Down);
        assert_eq!(restored.backend(2).status(), BackendStatus::Unused);
    }

    #[test]
    fn test_all_down_write_skipped() {
        let dir = TempDir::new().unwrap();
        let cluster = ClusterState::create(&test_config(2)).unwrap();
        write(&cluster, dir.path()).unwrap();

        cluster.backend(0).set_status(BackendStatus::Down);
        cluster.backend(1).set_status(BackendStatus::Down);
        write(&cluster, dir.path()).unwrap();

        // The file keeps the previously written up-set.
        let contents = std::fs::read_to_string(status_file_path(dir.path())).unwrap();
        assert_eq!(contents, "up\nup\n");
    }

    #[test]
    fn test_bogus_file_coerces_connect_wait() {
        let dir = TempDir::new().unwrap();
        std::fs::write(status_file_path(dir.path()), "down\nunused\n").unwrap();

        let cluster = ClusterState::create(&test_config(2)).unwrap();
        load(&cluster, dir.path(), false).unwrap();
        assert_eq!(cluster.backend(0).status(), BackendStatus::ConnectWait);
        assert_eq!(cluster.backend(1).status(), BackendStatus::ConnectWait);

        // And the file was rewritten to match.
        let contents = std::fs::read_to_string(status_file_path(dir.path())).unwrap();
        assert_eq!(contents, "up\nup\n");
    }

    #[test]
    fn test_discard_unlinks_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(status_file_path(dir.path()), "down\nup\n").unwrap();

        let cluster = ClusterState::create(&test_config(2)).unwrap();
        load(&cluster, dir.path(), true).unwrap();
        assert!(!status_file_path(dir.path()).exists());
        // Initial state preserved.
        assert_eq!(cluster.backend(0).status(), BackendStatus::ConnectWait);
        assert_eq!(cluster.backend(1).status(), BackendStatus::ConnectWait);
    }

    #[test]
    fn test_case_insensitive_and_garbage_lines() {
        let dir = TempDir::new().unwrap();
        std::fs::write(status_file_path(dir.path()), "UP\nwhatever\n").unwrap();

        let cluster = ClusterState::create(&test_config(2)).unwrap();
        load(&cluster, dir.path(), false).unwrap();
        assert_eq!(cluster.backend(0).status(), BackendStatus::Up);
        // Garbage line leaves the slot unused.
        assert_eq!(cluster.backend(1).status(), BackendStatus::Unused);
    }

    #[test]
    fn test_legacy_binary_record() {
        let dir = TempDir::new().unwrap();
        let mut raw = vec![0u8; MAX_BACKENDS * 4];
        // backend 0: UP (2), backend 1: DOWN (3)
        raw[0..4].copy_from_slice(&2i32.to_le_bytes());
        raw[4..8].copy_from_slice(&3i32.to_le_bytes());
        std::fs::write(status_file_path(dir.path()), &raw).unwrap();

        let cluster = ClusterState::create(&test_config(2)).unwrap();
        load(&cluster, dir.path(), false).unwrap();
        // Legacy UP is restored as CONNECT_WAIT.
        assert_eq!(cluster.backend(0).status(), BackendStatus::ConnectWait);
        assert_eq!(cluster.backend(1).status(), BackendStatus::Down);
    }

    #[test]
    fn test_missing_file_keeps_initial_state() {
        let dir = TempDir::new().unwrap();
        let cluster = ClusterState::create(&test_config(2)).unwrap();
        load(&cluster, dir.path(), false).unwrap();
        assert_eq!(cluster.backend(0).status(), BackendStatus::ConnectWait);
    }
}
