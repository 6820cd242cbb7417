//! coderun - run untrusted source code behind an HTTP API.
//!
//! Each submission gets its own workspace and process group, bounded by a
//! wall-clock timeout, rlimits and an output ceiling. An admission queue caps
//! how many programs run at once.

#[cfg(not(target_os = "linux"))]
compile_error!("coderun only works on Linux.");

pub mod admission;
pub mod config;
pub mod error;
pub mod executor;
pub mod http_server;
pub mod language;
pub mod output;
pub mod sandbox;
pub mod state;
pub mod workspace;

#[cfg(test)]
mod test_utils;

pub use admission::Submission;
pub use config::{Config, Isolation, ResourceLimits};
pub use error::{Error, Result};
pub use executor::Executor;
pub use sandbox::{ExecutionRequest, ExecutionResult, ExitStatus};
pub use state::AppState;
