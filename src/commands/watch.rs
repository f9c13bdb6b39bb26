//! Live event monitor

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use nihia::{event_queue, Client, ClientConfig, DeviceTypeId, EventHandler};

use super::{setup_interrupt_handler, Target};

/// Prints one line per event
#[derive(Default)]
struct EventPrinter {
    seen: usize,
}

impl EventHandler for EventPrinter {
    fn on_button(&mut self, id: u32, pressed: bool) {
        self.seen += 1;
        println!("button   {:3} {}", id, if pressed { "down" } else { "up" });
    }

    fn on_knob(&mut self, index: u32, value: i32) {
        self.seen += 1;
        println!("knob     {index:3} {value:+}");
    }

    fn on_encoder(&mut self, value: i32) {
        self.seen += 1;
        println!("encoder      {value:+}");
    }

    fn on_octave_changed(&mut self, new_base: u32) {
        self.seen += 1;
        println!("octave   base note {new_base}");
    }

    fn on_pad_touch(&mut self, pad_number: u32, pressure: u32) {
        self.seen += 1;
        println!("pad      {pad_number:3} pressure {pressure}");
    }

    fn on_focus_changed(&mut self) {
        self.seen += 1;
        println!("focus    changed");
    }

    fn on_claim_acquired(&mut self) {
        self.seen += 1;
        println!("claim    acquired");
    }

    fn on_claim_changed(&mut self, has_claim: bool) {
        self.seen += 1;
        println!("claim    {}", if has_claim { "held" } else { "lost" });
    }

    fn on_device_state(&mut self, device_type: DeviceTypeId, serial: &str, attached: bool) {
        self.seen += 1;
        println!(
            "device   {} serial {} {}",
            device_type,
            serial,
            if attached { "attached" } else { "detached" }
        );
    }
}

pub async fn watch(
    client: Arc<Client>,
    config: &ClientConfig,
    target: Target,
    global: bool,
    count: Option<usize>,
) -> anyhow::Result<()> {
    let (sink, mut queue) = event_queue(config.event_queue_capacity);
    // Bootstrap and the serial wait sleep, so keep them off the runtime
    let conn = tokio::task::spawn_blocking(move || {
        if global {
            client
                .connect(target.device_type, "", sink)
                .with_context(|| format!("connect to {}", target.device_type))
        } else {
            target.connect(&client, sink)
        }
    })
    .await
    .context("connect task panicked")??;
    println!(
        "Watching {}{} (Ctrl-C to stop)",
        conn.device_type(),
        if conn.is_global() {
            String::new()
        } else {
            format!(" serial {}", conn.serial())
        }
    );

    let running = setup_interrupt_handler();
    let mut printer = EventPrinter::default();
    while running.load(Ordering::SeqCst) {
        match tokio::time::timeout(Duration::from_millis(200), queue.recv()).await {
            Ok(Some(event)) => nihia::dispatch_event(&mut printer, &event),
            Ok(None) => break,
            Err(_) => continue,
        }
        queue.drain_into(&mut printer);
        if count.is_some_and(|n| printer.seen >= n) {
            break;
        }
    }
    // Joins the dispatcher thread
    tokio::task::spawn_blocking(move || conn.shutdown())
        .await
        .context("shutdown task panicked")
}
