use crate::config::Config;
use crate::language::resolve_program;
use tempfile::TempDir;

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

/// A config whose workspaces live in a fresh temporary directory.
pub fn test_config() -> (Config, TempDir) {
    let root = tempfile::tempdir().expect("tempdir");
    let config = Config {
        workspace_root: root.path().to_path_buf(),
        max_concurrent: 4,
        max_queue: 8,
        ..Config::default()
    };
    (config, root)
}
