// NIHIA client - shared library
// Configuration and the display pipeline on top of nihia-device

pub mod config;
pub mod display;

pub use config::{default_config_path, ClientConfig, ConfigError};
pub use display::{
    quantize, BitmapSource, DisplayError, DisplayFrame, DisplaySender, FrameBuffers, FrameTarget,
    RawBitmap,
};

pub use nihia_device::{
    dispatch_event, event_queue, Client, Connection, ConnectionError, DeviceRegistry,
    EventHandler, EventQueue, EventSink, HostScheduler,
};
pub use nihia_transport::{
    platform_transport, DeviceTypeId, KeyZone, NotificationEvent, SoftwareIdentity,
};

use std::sync::Arc;

/// Client on the platform transport, configured from `config`
pub fn connect_client(config: &ClientConfig) -> Result<Client, nihia_transport::TransportError> {
    let transport = platform_transport(config.transport_options())?;
    Ok(Client::new(transport, config.connection_options()))
}

/// Client over an arbitrary transport (fakes, replay tooling)
pub fn client_with_transport(
    transport: nihia_transport::BoxedTransport,
    config: &ClientConfig,
) -> Client {
    Client::with_registry(
        transport,
        Arc::new(DeviceRegistry::new()),
        config.connection_options(),
    )
}
