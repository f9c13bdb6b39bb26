//! Image to device screens

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nihia::{Client, ClientConfig, DisplayFrame, DisplaySender, EventSink, FrameTarget, RawBitmap};
use tracing::warn;

use super::{setup_interrupt_handler, Target};

pub fn show(
    client: &Client,
    config: &ClientConfig,
    target: &Target,
    image: &Path,
    once: bool,
    fit: bool,
    seconds: Option<u64>,
) -> anyhow::Result<()> {
    if !target.device_type.has_displays() {
        warn!("{} has no displays known to this client", target.device_type);
    }

    let bitmap = RawBitmap::open(image, fit)?;
    let frame = Arc::new(DisplayFrame::new());
    frame.update(&bitmap);

    let conn = target.connect(client, EventSink::Discard)?;
    if once {
        frame.send(&*conn)?;
        println!("Sent {} to {}", image.display(), conn.device_type());
        return Ok(());
    }

    let running = setup_interrupt_handler();
    let deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
    let sink: Arc<dyn FrameTarget> = conn.clone();
    let sender = DisplaySender::start(frame, sink, config.frame_interval())?;
    println!(
        "Streaming {} at {} fps (Ctrl-C to stop)",
        image.display(),
        config.display_fps
    );

    while running.load(Ordering::SeqCst) && deadline.map_or(true, |d| Instant::now() < d) {
        std::thread::sleep(Duration::from_millis(100));
    }

    let frames = sender.frames_sent();
    sender.stop();
    println!("Sent {frames} frames");
    Ok(())
}
