//! Core sandbox execution logic.
//!
//! A request is run by cloning a child that becomes the leader of a new
//! process group (and, in namespace mode, PID 1 of fresh PID/mount/network
//! namespaces chrooted into the workspace). The parent supervises the child
//! from a single `poll` loop: it feeds stdin, drains stdout/stderr into
//! bounded buffers and enforces the wall-clock deadline. Whatever happens, the
//! whole process group is killed and reaped before the workspace is removed.

use crate::config::{Config, Interpreters, Isolation, ResourceLimits};
use crate::error::{Error, Result};
use crate::language::{self, Language};
use crate::output::BoundedBuffer;
use crate::workspace::Workspace;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sched::{clone, CloneFlags};
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::sys::wait::{waitid, waitpid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::{getuid, pipe2, Pid};
use serde::Serialize;
use std::ffi::{c_char, CString};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const STACK_SIZE: usize = 1024 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(20);
const READ_CHUNK: usize = 8192;

/// A validated submission, immutable once admitted.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub request_id: String,
    pub code: String,
    pub stdin: String,
    pub language: Language,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitStatus {
    /// The program exited on its own, with any exit code.
    Completed,
    /// The wall-clock limit fired and the process group was killed.
    TimedOut,
    /// A signal ended the program (CPU, file size or other limits).
    Killed,
    /// The workspace or the interpreter could not be set up.
    SetupError,
}

/// Outcome of one execution. Produced exactly once per request.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub request_id: String,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub status: ExitStatus,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub truncated: bool,
    /// Output ceiling in effect for this request, after clamping.
    pub output_limit: usize,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn setup_error(request_id: &str, message: &str, output_limit: usize, duration_ms: u64) -> Self {
        Self {
            request_id: request_id.to_string(),
            stdout: Vec::new(),
            stderr: message.as_bytes().to_vec(),
            status: ExitStatus::SetupError,
            exit_code: None,
            signal: None,
            truncated: false,
            output_limit,
            duration_ms,
        }
    }

    /// Completed with exit code zero.
    pub fn success(&self) -> bool {
        self.status == ExitStatus::Completed && self.exit_code == Some(0)
    }
}

/// Runs requests. Cheap to clone; holds only read-only configuration.
#[derive(Debug, Clone)]
pub struct Sandbox {
    isolation: Isolation,
    workspace_root: PathBuf,
    interpreters: Interpreters,
    kill_grace: Duration,
}

impl Sandbox {
    pub fn new(config: &Config) -> Self {
        Self {
            isolation: config.isolation,
            workspace_root: config.workspace_root.clone(),
            interpreters: config.interpreters.clone(),
            kill_grace: Duration::from_millis(config.kill_grace_ms),
        }
    }

    /// Run one request to completion. Blocks the calling thread.
    ///
    /// Setup failures are reported as a [`ExitStatus::SetupError`] result.
    /// Returns [`Error::Cancelled`] if `cancel` is raised while the program
    /// is still running; the process group is killed first.
    pub fn run(&self, request: &ExecutionRequest, cancel: &AtomicBool) -> Result<ExecutionResult> {
        let started = Instant::now();
        info!(language = %request.language, code_len = request.code.len(),
              stdin_len = request.stdin.len(), "Running submission");

        match self.run_inner(request, cancel, started) {
            Err(Error::Setup(message)) => {
                warn!(error = %message, "Sandbox setup failed");
                Ok(ExecutionResult::setup_error(
                    &request.request_id,
                    &message,
                    request.limits.output_bytes,
                    elapsed_ms(started),
                ))
            }
            other => other,
        }
    }

    fn run_inner(
        &self,
        request: &ExecutionRequest,
        cancel: &AtomicBool,
        started: Instant,
    ) -> Result<ExecutionResult> {
        let workspace = Workspace::create(&self.workspace_root, &request.request_id, self.isolation)?;
        let source = request.language.source_file();
        workspace.write_source(source, request.code.as_bytes())?;

        let program = self.resolve_interpreter(request.language)?;
        let argv = request.language.command(&program, source, request.limits.memory_kb);
        let spec = ChildSpec::new(&program, &argv, &workspace, self.isolation, request)?;

        let (mut handle, pipes) = SandboxHandle::spawn(&spec, workspace, request.limits, self.isolation)?;
        info!(pid = handle.pid().as_raw(), "Child spawned");

        let deadline = started + Duration::from_millis(request.limits.time_ms);
        let outcome = handle.supervise(pipes, request.stdin.as_bytes(), deadline, cancel, self.kill_grace)?;

        let (status, exit_code, signal) = match outcome.wait_status {
            _ if outcome.timed_out => (ExitStatus::TimedOut, None, Some(Signal::SIGKILL as i32)),
            WaitStatus::Exited(_, code) => (ExitStatus::Completed, Some(code), None),
            WaitStatus::Signaled(_, sig, _) => (ExitStatus::Killed, None, Some(sig as i32)),
            other => {
                warn!(status = ?other, "Unexpected wait status");
                (ExitStatus::Killed, None, None)
            }
        };

        let truncated = outcome.stdout.truncated() || outcome.stderr.truncated();
        let result = ExecutionResult {
            request_id: request.request_id.clone(),
            stdout: outcome.stdout.into_bytes(),
            stderr: outcome.stderr.into_bytes(),
            status,
            exit_code,
            signal,
            truncated,
            output_limit: request.limits.output_bytes,
            duration_ms: elapsed_ms(started),
        };
        info!(status = ?result.status, exit_code = ?result.exit_code, signal = ?result.signal,
              stdout_len = result.stdout.len(), stderr_len = result.stderr.len(),
              duration_ms = result.duration_ms, "Child finished");
        // `handle` drops here: the group is already reaped, the workspace goes away.
        Ok(result)
    }

    fn resolve_interpreter(&self, language: Language) -> Result<PathBuf> {
        let name = language.interpreter(&self.interpreters);
        language::resolve_program(name)
            .ok_or_else(|| Error::Setup(format!("interpreter not found: {}", name)))
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Everything the child needs, prepared before clone so the child never allocates.
struct ChildSpec {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    workdir: CString,
    chroot: Option<CString>,
    limits: ResourceLimits,
    /// RLIMIT_AS in bytes, if the interpreter tolerates one.
    address_space: Option<u64>,
    /// RLIMIT_NPROC, counted against every task of our real uid.
    nproc: u64,
}

impl ChildSpec {
    fn new(
        program: &Path,
        argv: &[String],
        workspace: &Workspace,
        isolation: Isolation,
        request: &ExecutionRequest,
    ) -> Result<Self> {
        let limits = request.limits;
        let program_dir = workspace.program_dir();
        let home = program_dir.to_string_lossy().into_owned();
        let tmp = match isolation {
            Isolation::Process => home.clone(),
            Isolation::Namespace => "/tmp".to_string(),
        };
        let env = [
            ("PATH", "/usr/local/bin:/usr/bin:/bin"),
            ("HOME", home.as_str()),
            ("TMPDIR", tmp.as_str()),
            ("LANG", "C.UTF-8"),
            ("PYTHONIOENCODING", "utf-8"),
            ("PYTHONDONTWRITEBYTECODE", "1"),
        ];

        Ok(Self {
            program: path_cstring(program)?,
            argv: argv.iter().map(|a| cstring(a)).collect::<Result<_>>()?,
            envp: env
                .iter()
                .map(|(k, v)| cstring(&format!("{}={}", k, v)))
                .collect::<Result<_>>()?,
            workdir: path_cstring(&program_dir)?,
            chroot: match isolation {
                Isolation::Process => None,
                Isolation::Namespace => Some(path_cstring(workspace.path())?),
            },
            limits,
            address_space: request
                .language
                .caps_address_space()
                .then_some(limits.memory_kb * 1024),
            nproc: nproc_ceiling(limits.processes),
        })
    }
}

fn cstring(s: &str) -> Result<CString> {
    CString::new(s).map_err(|e| Error::setup("argument", e))
}

fn path_cstring(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|e| Error::setup("path", e))
}

/// Parent-side ends of the child's standard streams.
struct ParentPipes {
    stdin: Option<File>,
    stdout: Option<File>,
    stderr: Option<File>,
}

struct Outcome {
    wait_status: WaitStatus,
    timed_out: bool,
    stdout: BoundedBuffer,
    stderr: BoundedBuffer,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

/// One running child and the workspace it lives in. Owned by exactly one
/// execution; dropping it kills and reaps the process group if that has not
/// happened yet, then removes the workspace.
#[derive(Debug)]
pub struct SandboxHandle {
    pid: Pid,
    reaped: bool,
    limits: ResourceLimits,
    // Removed once Drop has reaped the child.
    _workspace: Workspace,
}

impl SandboxHandle {
    fn spawn(
        spec: &ChildSpec,
        workspace: Workspace,
        limits: ResourceLimits,
        isolation: Isolation,
    ) -> Result<(Self, ParentPipes)> {
        let (stdin_read, stdin_write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::setup("pipe", e))?;
        let (stdout_read, stdout_write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::setup("pipe", e))?;
        let (stderr_read, stderr_write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::setup("pipe", e))?;
        let (error_read, error_write) = pipe2(OFlag::O_CLOEXEC).map_err(|e| Error::setup("pipe", e))?;

        let fds = ChildFds {
            stdin: stdin_read.as_raw_fd(),
            stdout: stdout_write.as_raw_fd(),
            stderr: stderr_write.as_raw_fd(),
            error: error_write.as_raw_fd(),
        };

        let argv = null_terminated(&spec.argv);
        let envp = null_terminated(&spec.envp);

        let clone_flags = match isolation {
            Isolation::Process => CloneFlags::empty(),
            Isolation::Namespace => {
                CloneFlags::CLONE_NEWPID
                    | CloneFlags::CLONE_NEWNS
                    | CloneFlags::CLONE_NEWNET
                    | CloneFlags::CLONE_NEWIPC
                    | CloneFlags::CLONE_NEWUTS
            }
        };

        let mut stack = vec![0u8; STACK_SIZE];
        let child_fn = Box::new(|| child_main(&fds, spec, &argv, &envp));

        let pid = unsafe { clone(child_fn, &mut stack, clone_flags, Some(Signal::SIGCHLD as i32)) }
            .map_err(|e| Error::setup("clone", e))?;

        // Child-side ends belong to the child now.
        drop(stdin_read);
        drop(stdout_write);
        drop(stderr_write);
        drop(error_write);

        let mut handle = Self {
            pid,
            reaped: false,
            limits,
            _workspace: workspace,
        };

        // EOF on the error pipe means execve succeeded and closed it.
        let mut errno = [0u8; 4];
        match File::from(error_read).read_exact(&mut errno) {
            Ok(()) => {
                handle.reap()?;
                let err = std::io::Error::from_raw_os_error(i32::from_ne_bytes(errno));
                return Err(Error::Setup(format!(
                    "exec {}: {}",
                    spec.program.to_string_lossy(),
                    err
                )));
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {}
            Err(e) => return Err(Error::setup("read exec status", e)),
        }

        let pipes = ParentPipes {
            stdin: Some(nonblocking(stdin_write)?),
            stdout: Some(nonblocking(stdout_read)?),
            stderr: Some(nonblocking(stderr_read)?),
        };
        Ok((handle, pipes))
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn supervise(
        &mut self,
        mut pipes: ParentPipes,
        input: &[u8],
        deadline: Instant,
        cancel: &AtomicBool,
        grace: Duration,
    ) -> Result<Outcome> {
        let mut stdout = BoundedBuffer::new(self.limits.output_bytes);
        let mut stderr = BoundedBuffer::new(self.limits.output_bytes);
        let mut written = 0;
        let mut wait_status = None;
        let mut timed_out = false;
        let mut drain_until: Option<Instant> = None;

        if input.is_empty() {
            pipes.stdin = None;
        }

        loop {
            let now = Instant::now();
            if wait_status.is_some() && pipes.stdout.is_none() && pipes.stderr.is_none() {
                break;
            }
            if drain_until.is_some_and(|until| now >= until) {
                debug!("Output pipes still open after kill, abandoning them");
                break;
            }

            let horizon = drain_until.unwrap_or(deadline);
            let wait = horizon.saturating_duration_since(now).min(POLL_INTERVAL);
            for (stream, revents) in wait_ready(&pipes, wait)? {
                match stream {
                    Stream::Stdout => drain(&mut pipes.stdout, &mut stdout),
                    Stream::Stderr => drain(&mut pipes.stderr, &mut stderr),
                    Stream::Stdin => {
                        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP) {
                            pipes.stdin = None;
                        } else {
                            feed(&mut pipes.stdin, input, &mut written);
                        }
                    }
                }
            }

            if wait_status.is_some() {
                continue;
            }
            if self.has_exited()? {
                // Take down anything the program left running in its group.
                self.kill_group();
                wait_status = Some(self.reap()?);
                drain_until = Some(Instant::now() + grace);
            } else if cancel.load(Ordering::Relaxed) {
                info!(pid = self.pid.as_raw(), "Execution cancelled, killing process group");
                self.kill_group();
                self.reap()?;
                return Err(Error::Cancelled);
            } else if Instant::now() >= deadline {
                info!(pid = self.pid.as_raw(), time_ms = self.limits.time_ms,
                      "Wall-clock limit reached, killing process group");
                self.kill_group();
                timed_out = true;
                wait_status = Some(self.reap()?);
                drain_until = Some(Instant::now() + grace);
            }
        }

        Ok(Outcome {
            // The loop only exits once the child has been reaped.
            wait_status: wait_status.unwrap_or(WaitStatus::StillAlive),
            timed_out,
            stdout,
            stderr,
        })
    }

    /// Whether the direct child has terminated, without reaping it. Leaving it
    /// a zombie keeps its pid (and so its process group id) from being reused
    /// until the group has been killed.
    fn has_exited(&self) -> Result<bool> {
        let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
        loop {
            match waitid(Id::Pid(self.pid), flags) {
                Ok(WaitStatus::StillAlive) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(Error::Internal(format!("waitid: {}", e))),
            }
        }
    }

    fn kill_group(&self) {
        if self.reaped {
            return;
        }
        if let Err(e) = killpg(self.pid, Signal::SIGKILL) {
            // ESRCH: the group is already empty.
            if e != Errno::ESRCH {
                warn!(pid = self.pid.as_raw(), error = %e, "killpg failed");
            }
        }
    }

    fn reap(&mut self) -> Result<WaitStatus> {
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    self.reaped = true;
                    return Ok(status);
                }
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    self.reaped = true;
                    return Err(Error::Internal(format!("waitpid: {}", e)));
                }
            }
        }
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if !self.reaped {
            self.kill_group();
            let _ = self.reap();
        }
    }
}

/// Poll the open pipes for up to `wait`, returning the ones that are ready.
fn wait_ready(pipes: &ParentPipes, wait: Duration) -> Result<Vec<(Stream, PollFlags)>> {
    let mut streams = Vec::with_capacity(3);
    let mut fds = Vec::with_capacity(3);
    let open = [
        (Stream::Stdout, &pipes.stdout, PollFlags::POLLIN),
        (Stream::Stderr, &pipes.stderr, PollFlags::POLLIN),
        (Stream::Stdin, &pipes.stdin, PollFlags::POLLOUT),
    ];
    for (stream, file, events) in open {
        if let Some(file) = file {
            streams.push(stream);
            fds.push(PollFd::new(file.as_fd(), events));
        }
    }

    if fds.is_empty() {
        std::thread::sleep(wait);
        return Ok(Vec::new());
    }

    let timeout = PollTimeout::from(wait.as_millis().min(u16::MAX as u128) as u16);
    match poll(&mut fds, timeout) {
        Ok(_) | Err(Errno::EINTR) => {}
        Err(e) => return Err(Error::Internal(format!("poll: {}", e))),
    }

    Ok(streams
        .into_iter()
        .zip(fds.iter())
        .filter_map(|(stream, fd)| {
            fd.revents()
                .filter(|revents| !revents.is_empty())
                .map(|revents| (stream, revents))
        })
        .collect())
}

/// Read everything currently available. Closes the slot on EOF or error.
fn drain(slot: &mut Option<File>, buffer: &mut BoundedBuffer) {
    let Some(file) = slot.as_mut() else { return };
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match file.read(&mut chunk) {
            Ok(0) => {
                *slot = None;
                return;
            }
            Ok(n) => buffer.extend(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => {
                *slot = None;
                return;
            }
        }
    }
}

/// Write as much pending input as the pipe accepts. Closes the slot once
/// all input is written so the program sees EOF.
fn feed(slot: &mut Option<File>, input: &[u8], written: &mut usize) {
    let Some(file) = slot.as_mut() else { return };
    while *written < input.len() {
        match file.write(&input[*written..]) {
            Ok(n) => *written += n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            // EPIPE: the program stopped reading.
            Err(_) => break,
        }
    }
    *slot = None;
}

fn nonblocking(fd: OwnedFd) -> Result<File> {
    let raw = fd.as_raw_fd();
    let flags = fcntl(raw, FcntlArg::F_GETFL).map_err(|e| Error::setup("fcntl", e))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(raw, FcntlArg::F_SETFL(flags)).map_err(|e| Error::setup("fcntl", e))?;
    Ok(File::from(fd))
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

#[derive(Clone, Copy)]
struct ChildFds {
    stdin: RawFd,
    stdout: RawFd,
    stderr: RawFd,
    error: RawFd,
}

/// Entry point of the cloned child. Only async-signal-safe calls from here on:
/// on failure the errno goes down the error pipe and the child exits 127.
fn child_main(fds: &ChildFds, spec: &ChildSpec, argv: &[*const c_char], envp: &[*const c_char]) -> isize {
    let errno = exec_child(fds, spec, argv, envp);
    let bytes = errno.to_ne_bytes();
    unsafe {
        libc::write(fds.error, bytes.as_ptr().cast(), bytes.len());
        libc::_exit(127)
    }
}

fn exec_child(fds: &ChildFds, spec: &ChildSpec, argv: &[*const c_char], envp: &[*const c_char]) -> i32 {
    unsafe {
        if libc::dup2(fds.stdin, 0) < 0 || libc::dup2(fds.stdout, 1) < 0 || libc::dup2(fds.stderr, 2) < 0 {
            return last_errno();
        }
        // The server ignores SIGPIPE; the program should not inherit that.
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);

        if libc::setsid() < 0 {
            return last_errno();
        }
        if let Some(root) = &spec.chroot {
            if libc::chroot(root.as_ptr()) < 0 {
                return last_errno();
            }
        }
        if libc::chdir(spec.workdir.as_ptr()) < 0 {
            return last_errno();
        }
    }

    if let Err(e) = set_resource_limits(spec) {
        return e as i32;
    }

    unsafe {
        libc::execve(spec.program.as_ptr(), argv.as_ptr(), envp.as_ptr());
    }
    last_errno()
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL)
}

fn set_resource_limits(spec: &ChildSpec) -> nix::Result<()> {
    let limits = &spec.limits;
    let cpu = limits.cpu_seconds();
    setrlimit(Resource::RLIMIT_CPU, cpu, cpu)?;

    if let Some(bytes) = spec.address_space {
        setrlimit(Resource::RLIMIT_AS, bytes, bytes)?;
    }

    let fsize_bytes = limits.file_size_kb * 1024;
    setrlimit(Resource::RLIMIT_FSIZE, fsize_bytes, fsize_bytes)?;

    setrlimit(Resource::RLIMIT_NOFILE, limits.open_files, limits.open_files)?;
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    setrlimit(Resource::RLIMIT_NPROC, spec.nproc, spec.nproc)?;
    Ok(())
}

/// RLIMIT_NPROC counts every task owned by the real uid, including the
/// server's own threads and other running submissions. The program gets
/// `processes` on top of whatever that uid already runs.
fn nproc_ceiling(processes: u64) -> u64 {
    let uid = getuid().as_raw();
    let entries = match std::fs::read_dir("/proc") {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "Cannot read /proc, process limit ignores existing tasks");
            return processes;
        }
    };
    let existing: u64 = entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()))
        })
        .filter_map(|entry| std::fs::read_to_string(entry.path().join("status")).ok())
        .filter_map(|status| threads_owned_by(&status, uid))
        .sum();
    existing + processes
}

/// Thread count from a `/proc/<pid>/status` file, if its real uid is `uid`.
fn threads_owned_by(status: &str, uid: u32) -> Option<u64> {
    let mut real_uid = None;
    let mut threads = None;
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("Uid:") {
            real_uid = rest.split_whitespace().next().and_then(|v| v.parse::<u32>().ok());
        } else if let Some(rest) = line.strip_prefix("Threads:") {
            threads = rest.trim().parse().ok();
        }
    }
    (real_uid? == uid).then_some(threads?)
}
