//! coderun - sandboxed code execution with an HTTP API.
//!
//! Usage:
//!   coderun serve [--port 5000]             # Start HTTP server
//!   coderun run main.py [--input in.txt]    # Run one file locally

use clap::{Parser, Subcommand};
use coderun::config::{Config, Isolation, SandboxArgs};
use coderun::{http_server, workspace, AppState, Error, ExitStatus, Executor, Submission};
use std::io::{IsTerminal, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::exit;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "coderun")]
#[command(about = "Sandboxed code execution service")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0", env = "CODERUN_HOST")]
        host: IpAddr,

        /// Port to listen on
        #[arg(long, default_value = "5000", env = "CODERUN_PORT")]
        port: u16,

        #[command(flatten)]
        sandbox: SandboxArgs,
    },
    /// Run a single source file in the sandbox and print its output
    Run {
        /// Source file to run
        file: PathBuf,

        /// Language of the file (python, javascript)
        #[arg(long, default_value = "python")]
        language: String,

        /// File to feed on stdin (defaults to our own stdin)
        #[arg(long)]
        input: Option<PathBuf>,

        #[command(flatten)]
        sandbox: SandboxArgs,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_filter = match args.command {
        Commands::Serve { .. } => "coderun=info,tower_http=info",
        Commands::Run { .. } => "coderun=warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Commands::Serve { host, port, sandbox } => {
            let config = load_config(sandbox);
            if let Err(e) = std::fs::create_dir_all(&config.workspace_root) {
                eprintln!("Error: cannot create {}: {}", config.workspace_root.display(), e);
                exit(1);
            }
            match workspace::sweep_stale(&config.workspace_root) {
                Ok(0) => {}
                Ok(n) => info!(removed = n, "Removed stale workspaces"),
                Err(e) => warn!(error = %e, "Could not sweep workspace root"),
            }
            info!(isolation = ?config.isolation, workspace_root = ?config.workspace_root,
                  max_concurrent = config.max_concurrent, max_queue = config.max_queue,
                  timeout_ms = config.limits.time_ms, "Sandbox configured");

            let state = AppState::new(config);
            let addr = SocketAddr::new(host, port);
            if let Err(e) = http_server::run_server(addr, state, http_server::shutdown_signal()).await {
                eprintln!("Error: server failed: {}", e);
                exit(1);
            }
        }
        Commands::Run { file, language, input, sandbox } => {
            let config = load_config(sandbox);
            let code = match std::fs::read_to_string(&file) {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("Error: cannot read {}: {}", file.display(), e);
                    exit(1);
                }
            };
            let stdin = match read_input(input) {
                Ok(stdin) => stdin,
                Err(e) => {
                    eprintln!("Error: cannot read input: {}", e);
                    exit(1);
                }
            };
            exit(run_once(config, code, stdin, language).await);
        }
    }
}

fn load_config(args: SandboxArgs) -> Config {
    let config = Config::from(args);
    if let Err(e) = config.validate() {
        eprintln!("Error: {}", e);
        exit(2);
    }
    // Namespaces, mounts and chroot need CAP_SYS_ADMIN.
    if config.isolation == Isolation::Namespace && !nix::unistd::geteuid().is_root() {
        eprintln!("Error: namespace isolation must run as root (need CAP_SYS_ADMIN)");
        exit(1);
    }
    config
}

fn read_input(path: Option<PathBuf>) -> std::io::Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path),
        None if std::io::stdin().is_terminal() => Ok(String::new()),
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            Ok(buf)
        }
    }
}

/// Returns the process exit code to use.
async fn run_once(config: Config, code: String, stdin: String, language: String) -> i32 {
    let executor = Executor::new(config);
    let submission = Submission {
        code: Some(code),
        input: Some(stdin),
        language: Some(language),
        limits: None,
    };

    let result = match executor.submit(submission).await {
        Ok(result) => result,
        Err(Error::InvalidInput(msg)) => {
            eprintln!("Error: {}", msg);
            return 2;
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            return 1;
        }
    };

    let _ = std::io::stdout().write_all(&result.stdout);
    let _ = std::io::stderr().write_all(&result.stderr);
    if result.truncated {
        eprintln!("{}", coderun::output::TRUNCATION_MARKER.trim_start());
    }

    match result.status {
        ExitStatus::Completed => result.exit_code.unwrap_or(1),
        ExitStatus::TimedOut => {
            eprintln!("{}", coderun::output::TIMEOUT_MESSAGE);
            124
        }
        ExitStatus::Killed => 128 + result.signal.unwrap_or(9),
        ExitStatus::SetupError => 1,
    }
}
