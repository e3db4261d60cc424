//! Failover Command Execution
//!
//! `failover_command`, `failback_command` and `follow_primary_command` are
//! printf-style shell templates. They run synchronously through the host
//! shell; the exit code is logged and never aborts a state transition.

use crate::cluster::ClusterState;
use log::{info, warn};
use std::process::Command;

/// Runs an expanded command line. Seam for tests; the production
/// implementation shells out.
pub trait CommandRunner {
    /// Returns the command exit code, -1 when it could not be spawned or
    /// was killed by a signal.
    fn run(&self, command: &str) -> i32;
}

pub struct ShellRunner;

impl CommandRunner for ShellRunner {
    fn run(&self, command: &str) -> i32 {
        match Command::new("sh").arg("-c").arg(command).status() {
            Ok(status) => status.code().unwrap_or(-1),
            Err(e) => {
                warn!("failed to spawn command \"{}\": {}", command, e);
                -1
            }
        }
    }
}

/// Expand a command template against the transition being committed.
///
/// Substitutions: `%d`/`%h`/`%p`/`%D` failed node id/host/port/data
/// directory, `%m`/`%H`/`%r`/`%R` new main id/host/port/data directory,
/// `%M` old main id, `%P`/`%N`/`%S` old primary id/host/port, `%%` a
/// literal percent. A node id that does not resolve yields an empty
/// shell word.
pub fn expand_template(
    template: &str,
    cluster: &ClusterState,
    failed_node: i32,
    old_main: i32,
    new_main: i32,
    old_primary: i32,
) -> String {
    let mut out = String::with_capacity(template.len() + 32);
    let mut chars = template.chars();

    let host_of = |id: i32| -> Option<String> {
        cluster
            .node_id_in_range(id)
            .then(|| cluster.backend(id as usize).host().to_string())
    };
    let port_of = |id: i32| -> Option<String> {
        cluster
            .node_id_in_range(id)
            .then(|| cluster.backend(id as usize).port().to_string())
    };
    let datadir_of = |id: i32| -> Option<String> {
        cluster
            .node_id_in_range(id)
            .then(|| cluster.backend(id as usize).data_directory().to_string())
    };
    let push_or_empty = |out: &mut String, v: Option<String>| match v {
        Some(s) => out.push_str(&s),
        None => out.push_str("\"\""),
    };

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('d') => out.push_str(&failed_node.to_string()),
            Some('h') => push_or_empty(&mut out, host_of(failed_node)),
            Some('p') => push_or_empty(&mut out, port_of(failed_node)),
            Some('D') => push_or_empty(&mut out, datadir_of(failed_node)),
            Some('m') => out.push_str(&new_main.to_string()),
            Some('H') => push_or_empty(&mut out, host_of(new_main)),
            Some('r') => push_or_empty(&mut out, port_of(new_main)),
            Some('R') => push_or_empty(&mut out, datadir_of(new_main)),
            Some('M') => out.push_str(&old_main.to_string()),
            Some('P') => out.push_str(&old_primary.to_string()),
            Some('N') => push_or_empty(&mut out, host_of(old_primary)),
            Some('S') => push_or_empty(&mut out, port_of(old_primary)),
            Some('%') => out.push('%'),
            // Unknown specifier: swallow it, like the trailing '%'.
            Some(_) => {}
            None => {}
        }
    }
    out
}

/// Expand and execute one failover-style command for `failed_node`.
/// Empty templates are a no-op; an out-of-range failed node is refused.
pub fn trigger(
    runner: &dyn CommandRunner,
    cluster: &ClusterState,
    failed_node: i32,
    template: &str,
    old_main: i32,
    new_main: i32,
    old_primary: i32,
) -> i32 {
    if template.is_empty() {
        return 0;
    }
    if !cluster.node_id_in_range(failed_node) {
        warn!("refusing to run command for invalid node id {}", failed_node);
        return -1;
    }

    let command = expand_template(template, cluster, failed_node, old_main, new_main, old_primary);
    if command.is_empty() {
        return 0;
    }

    info!("execute command: {}", command);
    let code = runner.run(&command);
    info!("command \"{}\" exited with status {}", command, code);
    code
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::tests::test_config;
    use crate::cluster::ClusterState;

    fn cluster() -> ClusterState {
        ClusterState::create(&test_config(2)).unwrap()
    }

    #[test]
    fn test_failed_node_substitutions() {
        let cluster = cluster();
        let out = expand_template("fail %d %h %p %D", &cluster, 1, 0, 0, 0);
        assert_eq!(out, "fail 1 db1.example 5432 /data/1");
    }

    #[test]
    fn test_main_and_primary_substitutions() {
        let cluster = cluster();
        let out = expand_template("%m %H %r %R %M %P %N %S", &cluster, 0, 0, 1, 0);
        assert_eq!(out, "1 db1.example 5432 /data/1 0 0 db0.example 5432");
    }

    #[test]
    fn test_missing_node_yields_empty_word() {
        let cluster = cluster();
        let out = expand_template("%H|%N|%m|%P", &cluster, 0, -1, -1, -1);
        assert_eq!(out, "\"\"|\"\"|-1|-1");
    }

    #[test]
    fn test_percent_escape_and_unknown() {
        let cluster = cluster();
        assert_eq!(expand_template("100%% %z done", &cluster, 0, 0, 0, 0), "100%  done");
        assert_eq!(expand_template("dangling %", &cluster, 0, 0, 0, 0), "dangling ");
    }

    struct Recorder(std::cell::RefCell<Vec<String>>);

    impl CommandRunner for Recorder {
        fn run(&self, command: &str) -> i32 {
            self.0.borrow_mut().push(command.to_string());
            0
        }
    }

    #[test]
    fn test_trigger_empty_template_is_noop() {
        let cluster = cluster();
        let recorder = Recorder(Default::default());
        assert_eq!(trigger(&recorder, &cluster, 0, "", 0, 0, 0), 0);
        assert!(recorder.0.borrow().is_empty());
    }

    #[test]
    fn test_trigger_invalid_node_refused() {
        let cluster = cluster();
        let recorder = Recorder(Default::default());
        assert_eq!(trigger(&recorder, &cluster, 7, "echo %d", 0, 0, 0), -1);
        assert!(recorder.0.borrow().is_empty());
    }

    #[test]
    fn test_trigger_runs_expanded_command() {
        let cluster = cluster();
        let recorder = Recorder(Default::default());
        trigger(&recorder, &cluster, 1, "detach %d from %H", 0, 0, 0);
        assert_eq!(recorder.0.borrow()[0], "detach 1 from db0.example");
    }

    #[test]
    fn test_shell_runner_exit_code() {
        let runner = ShellRunner;
        assert_eq!(runner.run("exit 3"), 3);
        assert_eq!(runner.run("true"), 0);
    }
}
