//! Process-level entry point: connection cache over one transport

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nihia_transport::{BoxedTransport, Channel, ChannelRole, DeviceTypeId, BOOTSTRAP_PORT_NAME};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::connection::{Connection, ConnectionOptions};
use crate::error::{BootstrapFailure, ConnectionError};
use crate::handler::EventSink;
use crate::registry::{device_registry, DeviceRegistry};

const SERIAL_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Owns the transport, the device registry and every connection made through it.
///
/// Global (type-scoped) connections are created once per device type and
/// always exist before any device-scoped connection of the same type, since
/// the daemon only reports attached serials on the global one.
pub struct Client {
    transport: BoxedTransport,
    registry: Arc<DeviceRegistry>,
    options: ConnectionOptions,
    bootstrap: Mutex<Option<Arc<dyn Channel>>>,
    globals: Mutex<HashMap<DeviceTypeId, Arc<Connection>>>,
    devices: Mutex<HashMap<(DeviceTypeId, String), Arc<Connection>>>,
}

impl Client {
    /// Client using the process-wide device registry
    pub fn new(transport: BoxedTransport, options: ConnectionOptions) -> Self {
        Self::with_registry(transport, device_registry(), options)
    }

    pub fn with_registry(
        transport: BoxedTransport,
        registry: Arc<DeviceRegistry>,
        options: ConnectionOptions,
    ) -> Self {
        Self {
            transport,
            registry,
            options,
            bootstrap: Mutex::new(None),
            globals: Mutex::new(HashMap::new()),
            devices: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    fn bootstrap_channel(&self) -> Result<Arc<dyn Channel>, ConnectionError> {
        let mut cached = self.bootstrap.lock();
        if let Some(channel) = cached.as_ref() {
            return Ok(channel.clone());
        }
        debug!(
            "Opening bootstrap port {} via {}",
            BOOTSTRAP_PORT_NAME,
            self.transport.kind()
        );
        let channel: Arc<dyn Channel> = Arc::from(
            self.transport
                .open(BOOTSTRAP_PORT_NAME, ChannelRole::Remote)
                .map_err(|source| BootstrapFailure::Channel {
                    role: "bootstrap",
                    name: BOOTSTRAP_PORT_NAME.to_string(),
                    source,
                })?,
        );
        *cached = Some(channel.clone());
        Ok(channel)
    }

    fn create(
        &self,
        device_type: DeviceTypeId,
        serial: &str,
        sink: EventSink,
    ) -> Result<Arc<Connection>, ConnectionError> {
        let bootstrap = self.bootstrap_channel()?;
        Connection::bootstrap(
            self.transport.as_ref(),
            bootstrap.as_ref(),
            self.registry.clone(),
            device_type,
            serial,
            sink,
            &self.options,
        )
        .map(Arc::new)
    }

    fn global_with(
        &self,
        device_type: DeviceTypeId,
        sink: EventSink,
    ) -> Result<Arc<Connection>, ConnectionError> {
        // Held across the handshake so racing callers bootstrap a type once
        let mut globals = self.globals.lock();
        if let Some(conn) = globals.get(&device_type) {
            debug!("Reusing global connection for {}", device_type);
            return Ok(conn.clone());
        }
        let conn = self.create(device_type, "", sink)?;
        globals.insert(device_type, conn.clone());
        Ok(conn)
    }

    /// The type-scoped connection for `device_type`, created if missing.
    ///
    /// Its events are discarded; use [`Client::connect`] with an empty serial
    /// to receive them.
    pub fn global(&self, device_type: DeviceTypeId) -> Result<Arc<Connection>, ConnectionError> {
        self.global_with(device_type, EventSink::Discard)
    }

    /// Connect to a device type (empty `serial`) or to one device.
    ///
    /// Connections are memoized; when one already exists it is returned and
    /// `sink` is dropped.
    pub fn connect(
        &self,
        device_type: DeviceTypeId,
        serial: &str,
        sink: EventSink,
    ) -> Result<Arc<Connection>, ConnectionError> {
        if serial.is_empty() {
            return self.global_with(device_type, sink);
        }

        self.global(device_type)?;

        let key = (device_type, serial.to_string());
        // Same here; connects to other serials wait behind one handshake
        let mut devices = self.devices.lock();
        if let Some(conn) = devices.get(&key) {
            debug!("Reusing connection for {} serial {}", device_type, serial);
            return Ok(conn.clone());
        }
        let conn = self.create(device_type, serial, sink)?;
        devices.insert(key, conn.clone());
        Ok(conn)
    }

    /// Wait until exactly one unit of `device_type` is known to be attached.
    ///
    /// Opens the global connection so attach notifications start flowing.
    pub fn wait_for_unique_serial(
        &self,
        device_type: DeviceTypeId,
        timeout: Duration,
    ) -> Result<Option<String>, ConnectionError> {
        self.global(device_type)?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(serial) = self.registry.unique_serial(device_type) {
                return Ok(Some(serial));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(SERIAL_POLL_INTERVAL);
        }
    }

    /// Shut down every cached connection, device-scoped ones first
    pub fn shutdown_all(&self) {
        let devices: Vec<_> = self.devices.lock().drain().map(|(_, c)| c).collect();
        let globals: Vec<_> = self.globals.lock().drain().map(|(_, c)| c).collect();
        if !devices.is_empty() || !globals.is_empty() {
            info!(
                "Closing {} device and {} global connection(s)",
                devices.len(),
                globals.len()
            );
        }
        for conn in devices.iter().chain(globals.iter()) {
            conn.shutdown();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}
