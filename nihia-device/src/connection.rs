//! Connection to the daemon for one device type or one device
//!
//! A connection owns a request channel and a notification channel. Both are
//! handed out by the daemon in reply to a handshake on the bootstrap port; the
//! notification channel is then acknowledged and a dispatcher thread starts
//! polling it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use nihia_transport::protocol::{
    check_success_reply, encode_ack_port, encode_handshake, encode_keyzones, encode_led_colors,
    encode_simple, message_id, msg, parse_handshake_reply,
};
use nihia_transport::{
    Channel, ChannelRole, DeviceTypeId, KeyZone, ProtocolError, SoftwareIdentity, Transport,
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, DispatcherConfig};
use crate::error::{BootstrapFailure, ConnectionError};
use crate::handler::EventSink;
use crate::registry::DeviceRegistry;

/// Connection behaviour knobs
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Identity presented in the handshake; chosen per device family when unset
    pub software_identity: Option<SoftwareIdentity>,
    /// Leave the controls in MIDI mode instead of claiming them
    pub midi_fallback: bool,
    /// Consecutive empty polls before re-subscribing
    pub stall_threshold: u32,
    /// Sleep after a failed notification poll
    pub poll_error_backoff: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            software_identity: None,
            midi_fallback: false,
            stall_threshold: nihia_transport::protocol::timing::STALL_TIMEOUT_THRESHOLD,
            poll_error_backoff: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Ready,
    ShutDown,
}

/// Request channel plus the lock that keeps sends whole
pub struct RequestPath {
    channel: Box<dyn Channel>,
    lock: Mutex<()>,
}

impl RequestPath {
    pub fn new(channel: Box<dyn Channel>) -> Self {
        Self {
            channel,
            lock: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        self.channel.name()
    }

    /// Send and require a non-empty reply
    pub fn send(&self, message: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        let _guard = self.lock.lock();
        let reply = self.channel.exchange(message, true)?;
        if reply.is_empty() {
            return Err(ConnectionError::EmptyReply(msg::name(
                message_id(message).unwrap_or(0),
            )));
        }
        Ok(reply)
    }

    /// Send without waiting for a reply
    pub fn push(&self, message: &[u8]) -> Result<(), ConnectionError> {
        let _guard = self.lock.lock();
        self.channel.exchange(message, false)?;
        Ok(())
    }
}

/// Push that re-establishes the subscription for this kind of connection
pub fn resubscribe_message(is_global: bool, midi_fallback: bool) -> Option<u32> {
    if is_global {
        Some(msg::REQUEST_DEVICE_STATE)
    } else if midi_fallback {
        None
    } else {
        Some(msg::ACQUIRE_CONTROL)
    }
}

/// A ready connection to the daemon
pub struct Connection {
    device_type: DeviceTypeId,
    serial: String,
    requests: Arc<RequestPath>,
    notification_channel: String,
    resubscribe: Option<u32>,
    shutdown: Arc<AtomicBool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    /// Run the bootstrap sequence and start dispatching.
    ///
    /// An empty `serial` makes a type-scoped (global) connection. Nothing is
    /// retried: any failure along the way is returned as
    /// [`ConnectionError::Bootstrap`].
    pub fn bootstrap(
        transport: &dyn Transport,
        bootstrap: &dyn Channel,
        registry: Arc<DeviceRegistry>,
        device_type: DeviceTypeId,
        serial: &str,
        sink: EventSink,
        options: &ConnectionOptions,
    ) -> Result<Self, ConnectionError> {
        let is_global = serial.is_empty();
        let software = options
            .software_identity
            .unwrap_or_else(|| SoftwareIdentity::for_device(device_type));
        debug!(
            "Handshake for {} serial {:?} as 0x{:08X}",
            device_type, serial, software.0
        );

        let hello = encode_handshake(device_type, software, serial);
        let reply = bootstrap
            .exchange(&hello, true)
            .map_err(BootstrapFailure::Transport)?;
        if reply.is_empty() {
            return Err(BootstrapFailure::NoReply.into());
        }
        let names = parse_handshake_reply(&reply).map_err(BootstrapFailure::Handshake)?;

        let open = |name: &str, role: ChannelRole| {
            transport
                .open(name, role)
                .map_err(|source| BootstrapFailure::Channel {
                    role: role.as_str(),
                    name: name.to_string(),
                    source,
                })
        };
        let requests = Arc::new(RequestPath::new(open(
            &names.request_channel,
            ChannelRole::Remote,
        )?));
        let notifications: Arc<dyn Channel> =
            Arc::from(open(&names.notification_channel, ChannelRole::Local)?);

        let ack = match requests.send(&encode_ack_port(&names.notification_channel)) {
            Ok(ack) => ack,
            Err(ConnectionError::Transport(e)) => return Err(BootstrapFailure::Transport(e).into()),
            Err(_) => return Err(BootstrapFailure::Acknowledge(ProtocolError::EmptyReply).into()),
        };
        check_success_reply(&ack).map_err(BootstrapFailure::Acknowledge)?;

        let resubscribe = resubscribe_message(is_global, options.midi_fallback);
        let shutdown = Arc::new(AtomicBool::new(false));
        let label = if is_global {
            format!("{:04x}", device_type.0)
        } else {
            format!("{:04x}-{}", device_type.0, serial)
        };
        let dispatcher = Dispatcher::new(
            DispatcherConfig {
                label,
                stall_threshold: options.stall_threshold,
                error_backoff: options.poll_error_backoff,
                resubscribe,
            },
            notifications,
            requests.clone(),
            registry,
            sink,
            shutdown.clone(),
        )
        .spawn()
        .map_err(ConnectionError::Spawn)?;

        let conn = Self {
            device_type,
            serial: serial.to_string(),
            requests,
            notification_channel: names.notification_channel,
            resubscribe,
            shutdown,
            dispatcher: Mutex::new(Some(dispatcher)),
        };
        info!(
            "Connected to {}{} (requests: {}, notifications: {})",
            device_type,
            if is_global {
                String::new()
            } else {
                format!(" serial {serial}")
            },
            conn.requests.name(),
            conn.notification_channel
        );

        if let Some(id) = resubscribe {
            let _ = conn.push(&encode_simple(id));
        }
        Ok(conn)
    }

    pub fn device_type(&self) -> DeviceTypeId {
        self.device_type
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn is_global(&self) -> bool {
        self.serial.is_empty()
    }

    pub fn state(&self) -> ConnectionState {
        if self.shutdown.load(Ordering::Relaxed) {
            ConnectionState::ShutDown
        } else {
            ConnectionState::Ready
        }
    }

    pub fn notification_channel(&self) -> &str {
        &self.notification_channel
    }

    fn ensure_ready(&self) -> Result<(), ConnectionError> {
        match self.state() {
            ConnectionState::Ready => Ok(()),
            ConnectionState::ShutDown => Err(ConnectionError::ShutDown),
        }
    }

    /// Send a request that must be answered
    pub fn send(&self, message: &[u8]) -> Result<Vec<u8>, ConnectionError> {
        self.ensure_ready()?;
        self.requests.send(message)
    }

    /// Fire-and-forget send. Failures are logged and returned.
    pub fn push(&self, message: &[u8]) -> Result<(), ConnectionError> {
        self.ensure_ready()?;
        self.requests.push(message).inspect_err(|e| {
            let id = message_id(message).unwrap_or(0);
            warn!("{} push to {} failed: {}", msg::name(id), self.device_type, e);
        })
    }

    /// Ask the daemon to route the hardware to this client
    pub fn request_focus(&self) -> Result<(), ConnectionError> {
        self.push(&encode_simple(msg::REQUEST_FOCUS))
    }

    /// One palette index per key/LED, in hardware order
    pub fn set_led_colors(&self, colors: &[u8]) -> Result<(), ConnectionError> {
        self.push(&encode_led_colors(colors))
    }

    pub fn configure_keyzones(&self, zones: &[KeyZone]) -> Result<(), ConnectionError> {
        self.push(&encode_keyzones(zones))
    }

    /// Send the subscription push again (no-op in MIDI fallback mode)
    pub fn resubscribe(&self) -> Result<(), ConnectionError> {
        match self.resubscribe {
            Some(id) => self.push(&encode_simple(id)),
            None => Ok(()),
        }
    }

    /// Stop the dispatcher and wait for it to exit (at most one poll slice)
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::Relaxed) {
            return;
        }
        debug!("Shutting down connection to {}", self.device_type);
        let handle = self.dispatcher.lock().take();
        if let Some(handle) = handle {
            // A handler calling shutdown from the dispatcher thread must not join itself
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Dispatcher thread for {} panicked", self.device_type);
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
