//! Error taxonomy for the runner client.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by runner operations.
#[derive(Error, Debug)]
pub enum EimError {
    #[error("Model file does not exist: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Model file \"{}\" is not executable", .0.display())]
    NotExecutable(PathBuf),

    #[error("Failed to start runner ({})", format_exit_code(.code))]
    RunnerStartupFailed { code: Option<i32> },

    #[error("Runner did not create its socket within {0:?}")]
    StartupTimeout(Duration),

    #[error("Failed to connect to runner socket {}: {reason}", .path.display())]
    ConnectFailed { path: PathBuf, reason: String },

    #[error("Timed out waiting for runner: {0}")]
    Timeout(String),

    #[error("Runner closed the connection")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The runner answered with `"success": false`.
    #[error("{0}")]
    Runner(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Model is not suitable: {0}")]
    UnsuitableModel(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl EimError {
    /// Whether the connection can no longer be trusted after this error.
    ///
    /// A timed-out or half-read frame leaves the stream misaligned, so the
    /// client stops instead of retrying on the same socket.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::ConnectionClosed | Self::Protocol(_) | Self::Io(_)
        )
    }

    /// Maps a socket I/O error, turning read/write timeouts into [`EimError::Timeout`].
    pub(crate) fn from_transport(err: std::io::Error, what: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                Self::Timeout(what.to_string())
            }
            std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::NotConnected => Self::ConnectionClosed,
            _ => Self::Io(err),
        }
    }
}

fn format_exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}
