//! Transport and wire-protocol error types

use thiserror::Error;

/// Errors that can occur during transport operations
#[derive(Error, Debug)]
pub enum TransportError {
    /// The named channel does not exist (daemon not running, stale name)
    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    /// The pipe stayed busy for every attempt
    #[error("Channel busy after {attempts} attempts")]
    Busy { attempts: u32 },

    #[error("Communication timeout")]
    Timeout,

    /// Peer closed its end of the channel
    #[error("Channel disconnected")]
    Disconnected,

    /// Operation not valid for this channel's role (e.g. polling a request channel)
    #[error("Operation not supported on {0} channel")]
    WrongRole(&'static str),

    /// No transport backend exists for the current platform
    #[error("No NIHIA transport available on this platform")]
    Unsupported,

    /// Native call failed with a platform error code
    #[error("{op} failed with OS error {code}")]
    Os { op: &'static str, code: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors produced while decoding request replies
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer ended before a field could be read
    #[error("Truncated message: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    /// The daemon answered with a bare 4-byte status, which signals a protocol error
    #[error("Daemon returned an error reply (code 0x{0:08X})")]
    ErrorReply(u32),

    #[error("Unexpected success code 0x{got:08X}")]
    SuccessMismatch { got: u32 },

    /// The reply was empty where one was required
    #[error("Empty reply")]
    EmptyReply,

    #[error("Invalid channel name in reply")]
    InvalidName,
}
