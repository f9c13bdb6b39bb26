//! Wire protocol and IPC transports for the NI Host Integration Agent (NIHIA)
//!
//! This crate provides the byte-level protocol spoken with the NIHIA daemon and
//! a unified channel abstraction over its platform IPC mechanisms:
//!
//! - Named pipes with overlapped I/O (Windows)
//! - CFMessagePort message ports (macOS)
//!
//! Higher layers (connections, dispatch, the device registry) live in
//! `nihia-device`.

pub mod error;
pub mod event_parser;
pub mod named_pipe;
pub mod protocol;
pub mod types;

#[cfg(target_os = "macos")]
pub mod message_port;

pub use error::{ProtocolError, TransportError};
pub use event_parser::{encode_notification, encode_pad_touches, parse_notification};
pub use named_pipe::{pipe_path, NamedPipeTransport};
pub use protocol::{BOOTSTRAP_PORT_NAME, SUCCESS};
pub use types::{
    ChannelRole, DeviceFamily, DeviceTypeId, KeyZone, NotificationEvent, PollOutcome,
    SoftwareIdentity,
};

#[cfg(target_os = "macos")]
pub use message_port::MessagePortTransport;

use std::sync::Arc;
use std::time::Duration;

use protocol::timing;

/// One open IPC endpoint.
///
/// Request channels (`ChannelRole::Remote`) support `exchange`; notification
/// channels (`ChannelRole::Local`) support `poll_once`. Calling the other
/// operation returns [`TransportError::WrongRole`].
pub trait Channel: Send + Sync {
    /// Platform name the channel was opened with (without pipe prefix)
    fn name(&self) -> &str;

    fn role(&self) -> ChannelRole;

    /// Send one message.
    ///
    /// With `want_reply` the call waits up to the reply timeout and returns the
    /// reply bytes. Without it, returns an empty buffer once the message is sent.
    fn exchange(&self, message: &[u8], want_reply: bool) -> Result<Vec<u8>, TransportError>;

    /// Run one bounded receive slice on a notification channel
    fn poll_once(&self) -> Result<PollOutcome, TransportError>;
}

/// Opens channels by name on one IPC backend
pub trait Transport: Send + Sync {
    fn open(&self, name: &str, role: ChannelRole) -> Result<Box<dyn Channel>, TransportError>;

    /// Backend name for logging
    fn kind(&self) -> &'static str;
}

/// Shared handle to a transport
pub type BoxedTransport = Arc<dyn Transport>;

/// Timing knobs shared by all backends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    /// How long `exchange` waits for a reply
    pub reply_timeout: Duration,
    /// Length of one `poll_once` slice
    pub poll_timeout: Duration,
    /// Attempts made while a pipe reports busy (named pipes only)
    pub busy_retries: u32,
    /// Sleep between busy attempts
    pub busy_backoff: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_millis(timing::REPLY_TIMEOUT_MS),
            poll_timeout: Duration::from_millis(timing::POLL_TIMEOUT_MS),
            busy_retries: timing::PIPE_BUSY_RETRIES,
            busy_backoff: Duration::from_millis(timing::PIPE_BUSY_BACKOFF_MS),
        }
    }
}

/// Transport backend for the current platform
#[cfg(windows)]
pub fn platform_transport(options: TransportOptions) -> Result<BoxedTransport, TransportError> {
    Ok(Arc::new(NamedPipeTransport::win32(options)))
}

/// Transport backend for the current platform
#[cfg(target_os = "macos")]
pub fn platform_transport(options: TransportOptions) -> Result<BoxedTransport, TransportError> {
    Ok(Arc::new(MessagePortTransport::new(options)))
}

/// Transport backend for the current platform
///
/// NIHIA only ships for Windows and macOS.
#[cfg(not(any(windows, target_os = "macos")))]
pub fn platform_transport(_options: TransportOptions) -> Result<BoxedTransport, TransportError> {
    Err(TransportError::Unsupported)
}
