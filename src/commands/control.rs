//! One-shot device commands

use nihia::{Client, EventSink, KeyZone};

use super::Target;

pub fn focus(client: &Client, target: &Target) -> anyhow::Result<()> {
    let conn = target.connect(client, EventSink::Discard)?;
    conn.request_focus()?;
    println!("Focus requested for {} serial {}", conn.device_type(), conn.serial());
    Ok(())
}

pub fn leds(client: &Client, target: &Target, colors: &[u8]) -> anyhow::Result<()> {
    let conn = target.connect(client, EventSink::Discard)?;
    conn.set_led_colors(colors)?;
    println!("Set {} LED colors", colors.len());
    Ok(())
}

pub fn keyzones(client: &Client, target: &Target, zones: &[KeyZone]) -> anyhow::Result<()> {
    let conn = target.connect(client, EventSink::Discard)?;
    conn.configure_keyzones(zones)?;
    for zone in zones {
        println!(
            "Keys {}-{} -> color {}",
            zone.first_key, zone.last_key, zone.color
        );
    }
    Ok(())
}
