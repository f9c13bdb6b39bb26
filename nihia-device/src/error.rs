//! Connection error types

use nihia_transport::{ProtocolError, TransportError};
use thiserror::Error;

/// Why the bootstrap sequence could not produce a ready connection
#[derive(Error, Debug)]
pub enum BootstrapFailure {
    /// The bootstrap port answered with nothing
    #[error("No handshake reply from daemon")]
    NoReply,

    #[error("Handshake rejected: {0}")]
    Handshake(#[source] ProtocolError),

    /// ACKNOWLEDGE_PORT was not answered with SUCCESS
    #[error("Notification port not acknowledged: {0}")]
    Acknowledge(#[source] ProtocolError),

    #[error("Could not open {role} channel {name}: {source}")]
    Channel {
        role: &'static str,
        name: String,
        #[source]
        source: TransportError,
    },

    #[error("Bootstrap exchange failed: {0}")]
    Transport(#[source] TransportError),
}

/// Errors from connection operations
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapFailure),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A reply was required but none came back
    #[error("Empty reply to {0}")]
    EmptyReply(&'static str),

    #[error("Connection is shut down")]
    ShutDown,

    #[error("Failed to spawn dispatcher thread: {0}")]
    Spawn(#[source] std::io::Error),
}
