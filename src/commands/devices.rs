//! Attached-device listing

use std::time::Duration;

use nihia::{Client, DeviceTypeId};
use tracing::warn;

/// Open the global connection of every known model, collect attach
/// notifications for `wait` seconds and print what the daemon reported.
pub fn list(client: &Client, wait: u64) -> anyhow::Result<()> {
    let mut reachable = 0;
    for &device_type in DeviceTypeId::KNOWN {
        match client.global(device_type) {
            Ok(_) => reachable += 1,
            Err(e) => warn!("{}: {}", device_type, e),
        }
    }
    if reachable == 0 {
        anyhow::bail!("daemon refused every device type");
    }

    std::thread::sleep(Duration::from_secs(wait));

    let types = client.registry().device_types();
    if types.is_empty() {
        println!("No devices attached.");
        return Ok(());
    }
    for device_type in types {
        let display = if device_type.has_displays() {
            " [displays]"
        } else {
            ""
        };
        for serial in client.registry().serials(device_type) {
            println!("{device_type}{display}  serial {serial}");
        }
    }
    Ok(())
}
