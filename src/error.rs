//! Error type shared by admission, sandbox and the HTTP layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The submission was rejected before anything ran.
    #[error("{0}")]
    InvalidInput(String),

    /// Every execution slot is busy and the wait queue is full.
    #[error("server is at capacity, try again later")]
    Overloaded,

    /// The workspace or the interpreter process could not be set up.
    #[error("{0}")]
    Setup(String),

    /// The caller went away while the program was running.
    #[error("execution cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn setup(context: &str, err: impl std::fmt::Display) -> Self {
        Error::Setup(format!("{}: {}", context, err))
    }

    /// Short machine-readable tag used in JSON bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidInput(_) => "invalid_input",
            Error::Overloaded => "overloaded",
            Error::Setup(_) => "setup_error",
            Error::Cancelled => "cancelled",
            Error::Internal(_) => "internal_error",
        }
    }
}
