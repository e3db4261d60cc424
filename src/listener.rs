//! Listening Sockets
//!
//! One Unix-domain socket per service (client and PCP) plus zero or more
//! INET listeners per configured address and family. The sockets are
//! created by the supervisor and inherited by the workers that actually
//! accept on them; the supervisor itself never accepts a connection.

use anyhow::{bail, Context, Result};
use log::{info, warn};
use socket2::{Domain, Socket, Type};
use std::fs;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};

/// Every listening socket the supervisor owns, with the Unix socket paths
/// that must be unlinked on exit.
pub struct Listeners {
    pub client_unix: UnixListener,
    pub client_inet: Vec<TcpListener>,
    pub pcp_unix: UnixListener,
    pub pcp_inet: Vec<TcpListener>,
    unlink_paths: Vec<PathBuf>,
}

impl Listeners {
    pub fn create(cfg: &crate::config::Config) -> Result<Listeners> {
        let backlog = cfg.listen_backlog();

        let (client_unix, client_path) =
            create_unix_socket(&cfg.socket_dir, cfg.port, backlog)?;
        let client_inet = create_inet_sockets(&cfg.listen_addresses, cfg.port, backlog)?;

        let (pcp_unix, pcp_path) =
            create_unix_socket(&cfg.pcp_socket_dir, cfg.pcp_port, backlog)?;
        let pcp_inet = create_inet_sockets(&cfg.pcp_listen_addresses, cfg.pcp_port, backlog)?;

        Ok(Listeners {
            client_unix,
            client_inet,
            pcp_unix,
            pcp_inet,
            unlink_paths: vec![client_path, pcp_path],
        })
    }

    /// Remove the Unix socket files. Called on the supervisor exit path.
    pub fn unlink_sockets(&self) {
        for path in &self.unlink_paths {
            if let Err(e) = fs::remove_file(path) {
                info!("unlink failed for socket file {}: {}", path.display(), e);
            }
        }
    }
}

/// Unix-domain socket named the way PostgreSQL clients expect, mode 0777
/// so any local user can connect.
pub fn create_unix_socket(dir: &Path, port: u16, backlog: i32) -> Result<(UnixListener, PathBuf)> {
    let path = dir.join(format!(".s.PGSQL.{}", port));

    // A stale socket file from an unclean shutdown would fail the bind.
    let _ = fs::remove_file(&path);

    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)
        .context("failed to create Unix-domain socket")?;
    socket
        .bind(&socket2::SockAddr::unix(&path)?)
        .with_context(|| format!("bind on Unix-domain socket {} failed", path.display()))?;
    socket
        .listen(backlog)
        .with_context(|| format!("listen on Unix-domain socket {} failed", path.display()))?;

    fs::set_permissions(&path, fs::Permissions::from_mode(0o777))
        .with_context(|| format!("chmod on Unix-domain socket {} failed", path.display()))?;

    info!("listening on Unix-domain socket {}", path.display());
    Ok((socket.into(), path))
}

/// One listener per resolved address per hostname pattern. `*` expands to
/// the IPv4 and IPv6 wildcards. Socket creation failures on machines
/// without a proper dual stack are tolerated; bind or listen failures are
/// fatal, as is ending up with no socket at all for a non-empty pattern
/// list.
pub fn create_inet_sockets(
    hostnames: &[String],
    port: u16,
    backlog: i32,
) -> Result<Vec<TcpListener>> {
    if hostnames.is_empty() {
        return Ok(Vec::new());
    }

    let mut addrs: Vec<SocketAddr> = Vec::new();
    for host in hostnames {
        if host == "*" {
            addrs.push(SocketAddr::from(([0, 0, 0, 0], port)));
            addrs.push(SocketAddr::new("::".parse().unwrap(), port));
            continue;
        }
        let resolved = (host.as_str(), port)
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve listen address \"{}\"", host))?;
        addrs.extend(resolved);
    }

    let mut listeners = Vec::new();
    for addr in addrs {
        info!("setting up socket for {}", addr);

        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };
        let socket = match Socket::new(domain, Type::STREAM, None) {
            Ok(s) => s,
            Err(e) => {
                // Not necessarily a problem on single-stack machines.
                warn!("perhaps failed to create INET socket for {}: {}", addr, e);
                continue;
            }
        };

        socket
            .set_reuse_address(true)
            .context("setsockopt(SO_REUSEADDR) failed")?;
        if addr.is_ipv6() {
            // One socket per family; never let the v6 socket grab v4 too.
            if let Err(e) = socket.set_only_v6(true) {
                warn!("setsockopt(IPV6_V6ONLY) failed for {}: {}", addr, e);
            }
        }

        socket
            .bind(&addr.into())
            .with_context(|| format!("bind on socket {} failed", addr))?;
        socket
            .listen(backlog)
            .with_context(|| format!("listen on socket {} failed", addr))?;
        listeners.push(socket.into());
    }

    if listeners.is_empty() {
        bail!("could not create any INET domain socket");
    }
    Ok(listeners)
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_unix_socket_created_with_open_mode() {
        let dir = TempDir::new().unwrap();
        let (listener, path) = create_unix_socket(dir.path(), 11999, 16).unwrap();
        assert!(path.ends_with(".s.PGSQL.11999"));
        assert!(path.exists());

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
        drop(listener);
    }

    #[test]
    fn test_unix_socket_replaces_stale_file() {
        let dir = TempDir::new().unwrap();
        let stale = dir.path().join(".s.PGSQL.12000");
        fs::write(&stale, b"stale").unwrap();
        let (_listener, path) = create_unix_socket(dir.path(), 12000, 16).unwrap();
        assert_eq!(path, stale);
    }

    #[test]
    fn test_inet_sockets_on_ephemeral_port() {
        let listeners = create_inet_sockets(&["localhost".to_string()], 0, 16).unwrap();
        assert!(!listeners.is_empty());
        for listener in &listeners {
            assert!(listener.local_addr().is_ok());
        }
    }

    #[test]
    fn test_no_inet_patterns_is_ok() {
        let listeners = create_inet_sockets(&[], 0, 16).unwrap();
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_unresolvable_host_is_fatal() {
        let result = create_inet_sockets(
            &["no-such-host.invalid.".to_string()],
            0,
            16,
        );
        assert!(result.is_err());
    }
}
