//! Command handlers for the CLI application.
//!
//! - `devices`: list attached hardware
//! - `watch`: print hardware events
//! - `control`: focus, LED colors, key zones
//! - `display`: push images to the device screens

pub mod control;
pub mod devices;
pub mod display;
pub mod watch;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use nihia::{Client, Connection, DeviceTypeId, EventSink};

/// How long to wait for the daemon to report the attached serial
const SERIAL_WAIT: Duration = Duration::from_secs(2);

/// Device selection from the global CLI flags
pub struct Target {
    pub device_type: DeviceTypeId,
    pub serial: Option<String>,
}

impl Target {
    /// The explicit serial, else the only attached unit of the model
    pub fn resolve_serial(&self, client: &Client) -> anyhow::Result<String> {
        if let Some(serial) = &self.serial {
            return Ok(serial.clone());
        }
        let found = client
            .wait_for_unique_serial(self.device_type, SERIAL_WAIT)
            .with_context(|| format!("connect to {}", self.device_type))?;
        match found {
            Some(serial) => Ok(serial),
            None => {
                let attached = client.registry().serials(self.device_type);
                if attached.is_empty() {
                    bail!("no {} attached", self.device_type);
                }
                bail!(
                    "{} units of {} attached ({}); pass --serial",
                    attached.len(),
                    self.device_type,
                    attached.join(", ")
                )
            }
        }
    }

    /// Device-scoped connection for the resolved serial
    pub fn connect(&self, client: &Client, sink: EventSink) -> anyhow::Result<Arc<Connection>> {
        let serial = self.resolve_serial(client)?;
        client
            .connect(self.device_type, &serial, sink)
            .with_context(|| format!("connect to {} serial {}", self.device_type, serial))
    }
}

/// Set up a Ctrl-C handler that sets the given flag to false when triggered.
/// Returns the Arc<AtomicBool> for use in the main loop.
pub fn setup_interrupt_handler() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = Arc::clone(&running);

    ctrlc::set_handler(move || {
        running_clone.store(false, Ordering::SeqCst);
    })
    .ok();

    running
}
