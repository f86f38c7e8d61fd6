//! Custom error types for the application.
//!
//! This module defines the primary error type, `VnaError`, for the whole crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures that can occur while talking to the analyzer, from
//! I/O and configuration issues to protocol-level problems on the GPIB link.
//!
//! ## Error Hierarchy
//!
//! - **`Timeout`**: No response arrived within the response window. The offending command
//!   has already been dropped from the queue when this is reported.
//! - **`Framing`**: The byte stream did not match the framing rule of the outstanding
//!   command (stray leading bytes, premature terminator, malformed block header). Recovery
//!   is identical to a timeout.
//! - **`Decode`**: The response was well framed but its content is not what the command
//!   kind promises (non-numeric ASCII, float block with a ragged length, ...).
//! - **`LengthMismatch`**: Stimulus and channel traces of one sweep disagree in length.
//! - **`Io`** / **`Config`** / **`Configuration`**: environment problems. `From` impls for
//!   `std::io::Error` and `figment::Error` let `?` work throughout; the source is flattened
//!   to its message so the error stays `Clone` and can be broadcast to every subscriber.
//!
//! Nothing in the protocol core is fatal: every variant except the environment ones has
//! a defined recovery state, see [`VnaError::is_recoverable`].

use crate::protocol::command::{Channel, CommandKind};
use crate::sweep::state::SweepState;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, VnaError>;

#[allow(missing_docs)]
#[derive(Error, Debug, Clone)]
pub enum VnaError {
    #[error("No response to {kind} (channel {channel}) within the response window")]
    Timeout { kind: CommandKind, channel: Channel },

    #[error("Framing error while receiving {kind}: {reason}")]
    Framing { kind: CommandKind, reason: String },

    #[error("Could not decode {kind} response: {reason}")]
    Decode { kind: CommandKind, reason: String },

    #[error(
        "Trace length mismatch: stimulus has {stimulus} points, channel 1 has {channel1}, channel 2 has {channel2}"
    )]
    LengthMismatch {
        stimulus: usize,
        channel1: usize,
        channel2: usize,
    },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Invalid instrument parameter: {0}")]
    InvalidParameter(String),

    #[error("Bridge not connected")]
    NotConnected,

    #[error("Sequence cancelled before completion")]
    Cancelled,

    #[error("Sweep sequencer is busy ({0})")]
    Busy(SweepState),

    #[error("Instrument task has shut down")]
    ActorGone,
}

impl From<std::io::Error> for VnaError {
    fn from(value: std::io::Error) -> Self {
        VnaError::Io(value.to_string())
    }
}

impl From<figment::Error> for VnaError {
    fn from(value: figment::Error) -> Self {
        VnaError::Config(value.to_string())
    }
}

impl VnaError {
    /// Whether the core restores a consistent idle-or-next-command state after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            VnaError::Io(_) | VnaError::Config(_) | VnaError::Configuration(_) | VnaError::ActorGone
        )
    }

    /// Command kind the error is attributed to, if any.
    pub fn command_kind(&self) -> Option<CommandKind> {
        match self {
            VnaError::Timeout { kind, .. }
            | VnaError::Framing { kind, .. }
            | VnaError::Decode { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
