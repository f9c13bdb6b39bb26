//! Connections to the NI Host Integration Agent
//!
//! Builds on `nihia-transport` to provide:
//!
//! - [`Client`]: connection cache keyed by device type and serial
//! - [`Connection`]: bootstrap handshake plus request operations
//! - [`Dispatcher`]: background notification loop with stall recovery
//! - [`DeviceRegistry`]: which serials of which models are attached
//! - [`EventHandler`] / [`EventSink`]: delivery of decoded events to the host

pub mod client;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod registry;

pub use client::Client;
pub use connection::{resubscribe_message, Connection, ConnectionOptions, ConnectionState};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{BootstrapFailure, ConnectionError};
pub use handler::{dispatch_event, event_queue, EventHandler, EventQueue, EventSink, HostScheduler};
pub use registry::{device_registry, DeviceRegistry};

// Re-export the types callers need alongside connections
pub use nihia_transport::{DeviceTypeId, KeyZone, NotificationEvent, SoftwareIdentity};
