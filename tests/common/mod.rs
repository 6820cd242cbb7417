//! Common test utilities shared across integration tests

#![allow(dead_code)]

use coderun::config::Config;
use coderun::language::resolve_program;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Setup logging for tests
pub fn setup_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("coderun=debug")
        .with_test_writer()
        .try_init();
}

/// Tests that execute Python are skipped on hosts without `python3`.
pub fn python_available() -> bool {
    let available = resolve_program("python3").is_some();
    if !available {
        eprintln!("python3 not found on PATH, skipping");
    }
    available
}

/// Tests that execute JavaScript are skipped on hosts without `node`.
pub fn node_available() -> bool {
    let available = resolve_program("node").is_some();
    if !available {
        eprintln!("node not found on PATH, skipping");
    }
    available
}

/// Namespace isolation mounts and chroots, so its tests need root and an
/// interpreter that is visible inside the read-only system mounts.
pub fn namespace_available() -> bool {
    if !nix::unistd::geteuid().is_root() {
        eprintln!("not running as root, skipping namespace test");
        return false;
    }
    let inside = resolve_program("python3").is_some_and(|path| {
        ["/usr/", "/bin/"].iter().any(|prefix| path.starts_with(prefix))
    });
    if !inside {
        eprintln!("python3 is not under /usr or /bin, skipping namespace test");
    }
    inside
}

/// A config whose workspaces live in a fresh temporary directory.
pub fn test_config() -> (Config, TempDir) {
    let root = tempfile::tempdir().expect("Failed to create temp dir");
    let mut config = Config {
        workspace_root: root.path().to_path_buf(),
        max_concurrent: 4,
        max_queue: 16,
        ..Config::default()
    };
    config.limits.time_ms = 2000;
    (config, root)
}

/// True once `pid` no longer exists or is only a zombie waiting for its
/// new parent to reap it.
pub fn process_gone(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Err(_) => true,
        Ok(stat) => {
            let state = stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.trim_start().chars().next());
            matches!(state, Some('Z') | Some('X') | None)
        }
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn dir_is_empty(path: &std::path::Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}
