//! Display packets reach the target in order and at the configured rate

use std::sync::Arc;
use std::time::Duration;

use nihia::{DisplayFrame, DisplaySender, FrameTarget, RawBitmap};
use nihia_device::ConnectionError;
use nihia_transport::protocol::display::{HEADER_LEN, PACKET_LEN};
use nihia_transport::TransportError;
use parking_lot::Mutex;

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<String>>,
    fail_right: bool,
}

impl FrameTarget for Recorder {
    fn push_frame(&self, packet: &[u8]) -> Result<(), ConnectionError> {
        assert_eq!(packet.len(), PACKET_LEN);
        let side = if packet[4] == 0 { "left" } else { "right" };
        self.sent.lock().push(side.to_string());
        if self.fail_right && side == "right" {
            return Err(ConnectionError::Transport(TransportError::Disconnected));
        }
        Ok(())
    }

    fn request_focus(&self) -> Result<(), ConnectionError> {
        self.sent.lock().push("focus".to_string());
        Ok(())
    }
}

#[test]
fn test_send_order() {
    let frame = DisplayFrame::new();
    frame.update(&RawBitmap::solid(960, 272, [0, 255, 0, 255]));
    let target = Recorder::default();

    frame.send(&target).unwrap();
    assert_eq!(*target.sent.lock(), vec!["left", "right", "focus"]);

    let bufs = frame.snapshot();
    assert_eq!(&bufs.left[HEADER_LEN..HEADER_LEN + 2], &0x07E0u16.to_le_bytes());
}

#[test]
fn test_failed_push_still_sends_rest() {
    let frame = DisplayFrame::new();
    let target = Recorder {
        fail_right: true,
        ..Recorder::default()
    };
    assert!(frame.send(&target).is_err());
    assert_eq!(*target.sent.lock(), vec!["left", "right", "focus"]);
}

#[test]
fn test_sender_streams_until_stopped() {
    let frame = Arc::new(DisplayFrame::new());
    let target = Arc::new(Recorder::default());
    let sender = DisplaySender::start(
        frame.clone(),
        target.clone(),
        Duration::from_millis(5),
    )
    .unwrap();

    std::thread::sleep(Duration::from_millis(100));
    // Renderer updates while the sender is running
    frame.update(&RawBitmap::solid(4, 4, [255, 255, 255, 255]));
    std::thread::sleep(Duration::from_millis(50));
    let frames = sender.frames_sent();
    sender.stop();

    assert!(frames >= 2, "only {frames} frames sent");
    let sent = target.sent.lock().clone();
    assert_eq!(sent.len() % 3, 0);
    for chunk in sent.chunks(3) {
        assert_eq!(chunk, ["left", "right", "focus"]);
    }
}
