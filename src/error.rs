//! Error types for packwire.
//!
//! Every fallible operation returns [`Result`]. There is no thread-local
//! "last error" slot: the error of a failed call is the `Err` it returned,
//! and the reason a session closed is handed to
//! [`Observer::on_close`](crate::Observer::on_close).

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Main error type for all packwire operations.
#[derive(Debug, Error)]
pub enum PackwireError {
    /// The session or socket is not running (not started yet, or already stopping).
    #[error("the socket is closed or not ready")]
    NotReady,

    /// Empty send payload or malformed configuration value.
    #[error("the parameter is incorrect: {0}")]
    InvalidParameter(String),

    /// The parser needs more bytes but the receive buffer is full and
    /// nothing can be compacted.
    #[error("the recv buffer of {capacity} bytes is too small to hold the packet")]
    RecvBufferTooSmall {
        /// Capacity of the receive buffer that overflowed.
        capacity: usize,
    },

    /// The parser rejected the buffered bytes (malformed or hostile peer).
    #[error("the received data is invalid")]
    RecvDataInvalid,

    /// Network or OS level failure, including peer reset and EOF.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Operation aborted by a local stop.
    #[error("operation aborted by local shutdown")]
    Cancelled,

    /// TLS (or other) handshake failed or missed its deadline.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// No bytes were received within the configured silence timeout.
    #[error("no data received for {0:?}")]
    SilenceTimeout(Duration),
}

/// Stable classification of a [`PackwireError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`PackwireError::NotReady`].
    NotReady,
    /// See [`PackwireError::InvalidParameter`].
    InvalidParameter,
    /// See [`PackwireError::RecvBufferTooSmall`].
    RecvBufferTooSmall,
    /// See [`PackwireError::RecvDataInvalid`].
    RecvDataInvalid,
    /// Transport failures and local cancellation.
    Transport,
    /// See [`PackwireError::Handshake`].
    Handshake,
    /// See [`PackwireError::SilenceTimeout`].
    Timeout,
}

impl ErrorKind {
    /// Numeric code, stable across releases.
    pub fn code(self) -> u32 {
        match self {
            ErrorKind::InvalidParameter => 0x80_0006,
            ErrorKind::RecvBufferTooSmall => 0x80_0002,
            ErrorKind::RecvDataInvalid => 0x80_0003,
            ErrorKind::NotReady => 0x80_0005,
            ErrorKind::Transport => 0x80_0010,
            ErrorKind::Handshake => 0x80_0011,
            ErrorKind::Timeout => 0x80_0012,
        }
    }

    /// Human readable description of the kind.
    pub fn description(self) -> &'static str {
        match self {
            ErrorKind::NotReady => "the socket is closed or not ready",
            ErrorKind::InvalidParameter => "the parameter is incorrect",
            ErrorKind::RecvBufferTooSmall => {
                "the recv_buffer_size is too small to hold the packet"
            }
            ErrorKind::RecvDataInvalid => "the received data is invalid",
            ErrorKind::Transport => "the transport failed or was cancelled",
            ErrorKind::Handshake => "the handshake failed",
            ErrorKind::Timeout => "the connection was silent for too long",
        }
    }

    /// Look up a kind from its numeric [`code`](Self::code).
    pub fn from_code(code: u32) -> Option<Self> {
        [
            ErrorKind::NotReady,
            ErrorKind::InvalidParameter,
            ErrorKind::RecvBufferTooSmall,
            ErrorKind::RecvDataInvalid,
            ErrorKind::Transport,
            ErrorKind::Handshake,
            ErrorKind::Timeout,
        ]
        .into_iter()
        .find(|kind| kind.code() == code)
    }
}

impl PackwireError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PackwireError::NotReady => ErrorKind::NotReady,
            PackwireError::InvalidParameter(_) => ErrorKind::InvalidParameter,
            PackwireError::RecvBufferTooSmall { .. } => ErrorKind::RecvBufferTooSmall,
            PackwireError::RecvDataInvalid => ErrorKind::RecvDataInvalid,
            PackwireError::Transport(_) | PackwireError::Cancelled => ErrorKind::Transport,
            PackwireError::Handshake(_) => ErrorKind::Handshake,
            PackwireError::SilenceTimeout(_) => ErrorKind::Timeout,
        }
    }

    /// Whether this error was caused by a local stop rather than the peer.
    ///
    /// Cancellation is expected shutdown noise and is never reported as a
    /// failure in close notifications.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, PackwireError::Cancelled)
    }

    /// Whether the error is one of the parser faults that indicate either
    /// misconfiguration or a hostile peer.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(
            self,
            PackwireError::RecvBufferTooSmall { .. } | PackwireError::RecvDataInvalid
        )
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        PackwireError::InvalidParameter(msg.into())
    }
}

/// Accept failures caused by local resource pressure (descriptor or memory
/// exhaustion). These are retried after a back-off instead of being logged
/// as listener errors.
pub(crate) fn is_resource_exhaustion(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::OutOfMemory {
        return true;
    }
    #[cfg(unix)]
    {
        matches!(
            e.raw_os_error(),
            Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
        )
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Result type alias using PackwireError.
pub type Result<T> = std::result::Result<T, PackwireError>;
