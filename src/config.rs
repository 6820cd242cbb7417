//! Runtime configuration: resource ceilings, isolation mode and interpreters.

use crate::error::{Error, Result};
use clap::{Args, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;

/// Legacy wall-clock limit for a single execution.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// How strongly a program is separated from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// Own process group, rlimits and a private workspace directory.
    Process,
    /// Adds PID/mount/network/IPC/UTS namespaces and a chroot. Requires root.
    Namespace,
}

/// Per-execution resource ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceLimits {
    pub time_ms: u64,
    pub memory_kb: u64,
    pub file_size_kb: u64,
    pub open_files: u64,
    pub processes: u64,
    pub output_bytes: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            time_ms: DEFAULT_TIMEOUT_MS,
            memory_kb: 524_288,
            file_size_kb: 10_240,
            open_files: 64,
            processes: 64,
            output_bytes: 64 * 1024,
        }
    }
}

impl ResourceLimits {
    /// CPU seconds handed to RLIMIT_CPU. One second above the wall clock so
    /// the wall-clock deadline normally fires first.
    pub fn cpu_seconds(&self) -> u64 {
        self.time_ms.div_ceil(1000) + 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpreters {
    pub python: String,
    pub node: String,
}

impl Default for Interpreters {
    fn default() -> Self {
        Self {
            python: "python3".to_string(),
            node: "node".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub isolation: Isolation,
    pub workspace_root: PathBuf,
    pub limits: ResourceLimits,
    pub max_code_bytes: usize,
    pub max_input_bytes: usize,
    pub max_concurrent: usize,
    pub max_queue: usize,
    pub kill_grace_ms: u64,
    pub interpreters: Interpreters,
    /// Answer request errors with 200 and the message in `output`.
    pub legacy_errors: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            isolation: Isolation::Process,
            workspace_root: default_workspace_root(),
            limits: ResourceLimits::default(),
            max_code_bytes: 64 * 1024,
            max_input_bytes: 1024 * 1024,
            max_concurrent: default_concurrency(),
            max_queue: 64,
            kill_grace_ms: 100,
            interpreters: Interpreters::default(),
            legacy_errors: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        let zero = [
            ("timeout-ms", limits.time_ms == 0),
            ("memory-kb", limits.memory_kb == 0),
            ("open-files", limits.open_files == 0),
            ("processes", limits.processes == 0),
            ("max-output-bytes", limits.output_bytes == 0),
            ("max-code-bytes", self.max_code_bytes == 0),
            ("max-concurrent", self.max_concurrent == 0),
        ];
        if let Some((name, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(Error::InvalidInput(format!("--{} must be greater than zero", name)));
        }
        if self.interpreters.python.is_empty() || self.interpreters.node.is_empty() {
            return Err(Error::InvalidInput("interpreter names must not be empty".to_string()));
        }
        Ok(())
    }
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("coderun")
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Sandbox options shared by the `serve` and `run` subcommands.
#[derive(Args, Debug, Clone)]
pub struct SandboxArgs {
    /// Isolation mode (namespace requires root)
    #[arg(long, value_enum, default_value = "process", env = "CODERUN_ISOLATION")]
    pub isolation: Isolation,

    /// Directory under which per-request workspaces are created
    #[arg(long, env = "CODERUN_WORKSPACE_ROOT")]
    pub workspace_root: Option<PathBuf>,

    /// Wall-clock limit in milliseconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS, env = "CODERUN_TIMEOUT_MS")]
    pub timeout_ms: u64,

    /// Address space limit in KB
    #[arg(long, default_value = "524288", env = "CODERUN_MEMORY_KB")]
    pub memory_kb: u64,

    /// Maximum size of a file the program may write, in KB
    #[arg(long, default_value = "10240", env = "CODERUN_FILE_SIZE_KB")]
    pub file_size_kb: u64,

    /// Maximum number of open files
    #[arg(long, default_value = "64", env = "CODERUN_OPEN_FILES")]
    pub open_files: u64,

    /// Maximum number of processes
    #[arg(long, default_value = "64", env = "CODERUN_PROCESSES")]
    pub processes: u64,

    /// Output ceiling in bytes, per stream and for the merged text
    #[arg(long, default_value = "65536", env = "CODERUN_MAX_OUTPUT_BYTES")]
    pub max_output_bytes: usize,

    /// Largest accepted source file in bytes
    #[arg(long, default_value = "65536", env = "CODERUN_MAX_CODE_BYTES")]
    pub max_code_bytes: usize,

    /// Largest accepted stdin in bytes
    #[arg(long, default_value = "1048576", env = "CODERUN_MAX_INPUT_BYTES")]
    pub max_input_bytes: usize,

    /// Executions allowed to run at once (defaults to available CPUs)
    #[arg(long, env = "CODERUN_MAX_CONCURRENT")]
    pub max_concurrent: Option<usize>,

    /// Requests allowed to wait for a free slot
    #[arg(long, default_value = "64", env = "CODERUN_MAX_QUEUE")]
    pub max_queue: usize,

    /// How long to keep draining pipes after the process group is killed
    #[arg(long, default_value = "100", env = "CODERUN_KILL_GRACE_MS")]
    pub kill_grace_ms: u64,

    /// Python interpreter
    #[arg(long, default_value = "python3", env = "CODERUN_PYTHON")]
    pub python: String,

    /// JavaScript interpreter
    #[arg(long, default_value = "node", env = "CODERUN_NODE")]
    pub node: String,

    /// Report rejected requests as 200 with the error in `output`
    #[arg(long, env = "CODERUN_LEGACY_ERRORS")]
    pub legacy_errors: bool,
}

impl From<SandboxArgs> for Config {
    fn from(args: SandboxArgs) -> Self {
        Self {
            isolation: args.isolation,
            workspace_root: args.workspace_root.unwrap_or_else(default_workspace_root),
            limits: ResourceLimits {
                time_ms: args.timeout_ms,
                memory_kb: args.memory_kb,
                file_size_kb: args.file_size_kb,
                open_files: args.open_files,
                processes: args.processes,
                output_bytes: args.max_output_bytes,
            },
            max_code_bytes: args.max_code_bytes,
            max_input_bytes: args.max_input_bytes,
            max_concurrent: args.max_concurrent.unwrap_or_else(default_concurrency),
            max_queue: args.max_queue,
            kill_grace_ms: args.kill_grace_ms,
            interpreters: Interpreters {
                python: args.python,
                node: args.node,
            },
            legacy_errors: args.legacy_errors,
        }
    }
}
