//! Error taxonomy for the sandbox core.
//!
//! Load-time failures (`Config`, `Resource`) abort before any session exists
//! and surface synchronously to the caller. Mid-run failures transition the
//! session to `Failed` with a recorded cause instead of crossing the
//! monitor/governor boundary as a panic.

use thiserror::Error;

use crate::session::SessionStatus;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or out-of-range policy/configuration. Fatal at load.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested limits exceed host capacity. Rejects `start`; no session is
    /// ever created.
    #[error("Resource error: {0}")]
    Resource(String),

    /// Operation attempted against a session in an incompatible status.
    #[error("Invalid state: {operation} not allowed while session is {status}")]
    InvalidState {
        operation: &'static str,
        status: SessionStatus,
    },

    /// The external safety check failed or timed out. Fails closed.
    #[error("Advisory check unavailable: {0}")]
    Advisory(String),

    #[error("Telemetry error: {0}")]
    Telemetry(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Cgroup error: {0}")]
    Cgroup(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(unix)]
impl From<nix::errno::Errno> for SandboxError {
    fn from(err: nix::errno::Errno) -> Self {
        SandboxError::Process(err.to_string())
    }
}
