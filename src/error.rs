use thiserror::Error;

use crate::session::SessionState;

/// Error taxonomy for the live session and its audio pipelines.
///
/// Only [`LiveError::Connection`] is fatal to a session; the other variants
/// are local to the failed operation and leave session continuity intact.
#[derive(Debug, Error)]
pub enum LiveError {
    /// The transport failed to open or dropped unexpectedly.
    #[error("connection error: {0}")]
    Connection(String),

    /// A received frame was malformed or unexpected for the current state.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An operation was invoked in a state that does not permit it.
    #[error("{op} is not valid while {state:?}")]
    State {
        op: &'static str,
        state: SessionState,
    },

    /// A capture or playback device is unavailable or was revoked.
    #[error("audio device error: {0}")]
    Device(String),
}

pub type Result<T> = std::result::Result<T, LiveError>;
