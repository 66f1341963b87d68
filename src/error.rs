//! Error handling utils.
//!
//! Every fallible operation of the crate returns [`Result`]. Errors are
//! plain values: precondition failures (unknown id, closed channel, full
//! queue) are reported to the caller, who decides what to do about them.
//! Failures during cleanup of cross-interpreter data are suppressed by the
//! operation that triggered the cleanup and surface as log warnings instead.

use crate::interp::InterpId;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("channel {0} not found")]
    ChannelNotFound(i64),

    #[error("channel {0} is closed")]
    ChannelClosed(i64),

    /// The channel was closed while a synchronous send was waiting for the
    /// item to be received.
    #[error("channel {0} has closed while send was waiting")]
    ChannelClosedWhileWaiting(i64),

    #[error("channel {0} is empty")]
    ChannelEmpty(i64),

    #[error("channel {0} may not be closed if not empty (try force)")]
    ChannelNotEmpty(i64),

    #[error("queue {0} not found")]
    QueueNotFound(i64),

    #[error("queue {0} is full")]
    QueueFull(i64),

    #[error("queue {0} is empty")]
    QueueEmpty(i64),

    /// The queue's external reference count was never incremented, so there
    /// is nothing to release.
    #[error("queue {0} was never bound")]
    QueueNeverBound(i64),

    /// No packer is registered for the value's type (and no fallback
    /// applied, if one was requested).
    #[error("{0} is not shareable between interpreters")]
    NotShareable(String),

    /// The id counter of a registry overflowed. Ids are never reused, so
    /// this is terminal for the affected registry.
    #[error("ran out of {0} ids")]
    NoMoreIds(&'static str),

    #[error("timed out")]
    Timeout,

    #[error("interrupted")]
    Interrupted,

    /// An operation needed to run code under an interpreter that is no
    /// longer running.
    #[error("interpreter {0} not running")]
    InterpreterNotRunning(InterpId),

    /// A received item had lost its payload because the interpreter that
    /// sent it was destroyed while the item was still in flight.
    #[error("item's sender (interpreter {0}) was destroyed while the item was in flight")]
    ItemInterpreterDestroyed(InterpId),

    #[error("failed to encode fallback data: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode fallback data: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("fallback serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True for the two ways a blocking wait can end early.
    #[inline]
    pub fn is_wait_failure(&self) -> bool {
        matches!(self, Error::Timeout | Error::Interrupted)
    }
}
