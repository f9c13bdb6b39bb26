//! Display frame pipeline
//!
//! Devices with screens expose two 480x272 RGB565 displays side by side. A
//! 960x272 BGRA bitmap is split down the middle and packed into one
//! DISPLAY_DATA packet per screen:
//!
//! ```text
//! [header 28 bytes][480*272 little-endian RGB565 pixels][footer 8 bytes]
//! ```
//!
//! Both packets live in one buffer pair that is refilled in place. Headers
//! and footers are written once.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use nihia_device::{Connection, ConnectionError};
use nihia_transport::protocol::display::{
    header, FOOTER, FRAME_HEIGHT, FRAME_WIDTH, HEADER_LEN, LEFT_DISPLAY_ID, PACKET_LEN,
    PAYLOAD_LEN, RIGHT_DISPLAY_ID, SCREEN_WIDTH,
};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum DisplayError {
    #[error("image: {0}")]
    Image(#[from] image::ImageError),

    #[error("send frame: {0}")]
    Send(#[source] ConnectionError),
}

/// Read-only BGRA pixel source, rows top to bottom
pub trait BitmapSource {
    fn width(&self) -> usize;
    fn height(&self) -> usize;
    /// `width * height * 4` bytes, B G R A per pixel
    fn pixels(&self) -> &[u8];
}

/// Owned BGRA bitmap
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBitmap {
    width: usize,
    height: usize,
    pixels: Vec<u8>,
}

impl RawBitmap {
    pub fn new(width: usize, height: usize, pixels: Vec<u8>) -> Self {
        Self {
            width,
            height,
            pixels,
        }
    }

    /// Bitmap filled with one BGRA color
    pub fn solid(width: usize, height: usize, bgra: [u8; 4]) -> Self {
        let pixels = bgra.repeat(width * height);
        Self::new(width, height, pixels)
    }

    pub fn from_image(img: &image::DynamicImage) -> Self {
        let rgba = img.to_rgba8();
        let (w, h) = rgba.dimensions();
        let mut pixels = rgba.into_raw();
        for px in pixels.chunks_exact_mut(4) {
            px.swap(0, 2);
        }
        Self::new(w as usize, h as usize, pixels)
    }

    /// Load an image file. With `fit` it is scaled to the full 960x272 frame,
    /// otherwise it is placed at the top-left corner unscaled.
    pub fn open(path: &Path, fit: bool) -> Result<Self, DisplayError> {
        let img = image::open(path)?;
        let img = if fit {
            img.resize_exact(
                FRAME_WIDTH as u32,
                FRAME_HEIGHT as u32,
                image::imageops::FilterType::Triangle,
            )
        } else {
            img
        };
        Ok(Self::from_image(&img))
    }
}

impl BitmapSource for RawBitmap {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn pixels(&self) -> &[u8] {
        &self.pixels
    }
}

/// 8-bit RGB to RGB565
pub fn quantize(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3)
}

/// The two screen packets
#[derive(Debug, Clone)]
pub struct FrameBuffers {
    pub left: Vec<u8>,
    pub right: Vec<u8>,
}

fn packet(display_id: u8) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PACKET_LEN);
    buf.extend_from_slice(&header(display_id));
    buf.resize(HEADER_LEN + PAYLOAD_LEN, 0);
    buf.extend_from_slice(&FOOTER);
    buf
}

/// Where display packets go
pub trait FrameTarget: Send + Sync {
    fn push_frame(&self, packet: &[u8]) -> Result<(), ConnectionError>;
    fn request_focus(&self) -> Result<(), ConnectionError>;
}

impl FrameTarget for Connection {
    fn push_frame(&self, packet: &[u8]) -> Result<(), ConnectionError> {
        self.push(packet)
    }

    fn request_focus(&self) -> Result<(), ConnectionError> {
        Connection::request_focus(self)
    }
}

/// Double-screen frame, shared between the renderer and the sender thread
pub struct DisplayFrame {
    buffers: Mutex<FrameBuffers>,
}

impl Default for DisplayFrame {
    fn default() -> Self {
        Self::new()
    }
}

impl DisplayFrame {
    /// Black frame with headers and footers in place
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(FrameBuffers {
                left: packet(LEFT_DISPLAY_ID),
                right: packet(RIGHT_DISPLAY_ID),
            }),
        }
    }

    /// Re-render both payloads from `bitmap`.
    ///
    /// Pixels the bitmap does not cover are black; anything beyond 960x272 is
    /// ignored.
    pub fn update(&self, bitmap: &dyn BitmapSource) {
        let (w, h) = (bitmap.width(), bitmap.height());
        let src = bitmap.pixels();
        let mut buffers = self.buffers.lock();
        let FrameBuffers { left, right } = &mut *buffers;

        for y in 0..FRAME_HEIGHT {
            for x in 0..FRAME_WIDTH {
                let value = if x < w && y < h {
                    let i = (y * w + x) * 4;
                    match src.get(i..i + 3) {
                        Some(bgr) => quantize(bgr[2], bgr[1], bgr[0]),
                        None => 0,
                    }
                } else {
                    0
                };

                let (dst, col) = if x < SCREEN_WIDTH {
                    (&mut *left, x)
                } else {
                    (&mut *right, x - SCREEN_WIDTH)
                };
                let off = HEADER_LEN + (y * SCREEN_WIDTH + col) * 2;
                dst[off..off + 2].copy_from_slice(&value.to_le_bytes());
            }
        }
    }

    /// Copy of the current packets
    pub fn snapshot(&self) -> FrameBuffers {
        self.buffers.lock().clone()
    }

    /// Push left, push right, then request focus.
    ///
    /// All three are attempted; failures are logged and the first is returned.
    pub fn send(&self, target: &dyn FrameTarget) -> Result<(), DisplayError> {
        let buffers = self.buffers.lock();
        let results = [
            target.push_frame(&buffers.left),
            target.push_frame(&buffers.right),
            target.request_focus(),
        ];
        drop(buffers);

        let mut first = None;
        for (step, result) in ["left", "right", "focus"].iter().zip(results) {
            if let Err(e) = result {
                warn!("Display {} send failed: {}", step, e);
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(DisplayError::Send(e)),
            None => Ok(()),
        }
    }
}

/// Background thread that re-sends the current frame at a fixed rate
pub struct DisplaySender {
    stop: Arc<AtomicBool>,
    frames: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl DisplaySender {
    pub fn start(
        frame: Arc<DisplayFrame>,
        target: Arc<dyn FrameTarget>,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let frames = Arc::new(AtomicU64::new(0));
        let stop_clone = stop.clone();
        let frames_clone = frames.clone();

        let handle = std::thread::Builder::new()
            .name("nihia-display".into())
            .spawn(move || {
                debug!("Display sender started ({:?} per frame)", interval);
                while !stop_clone.load(Ordering::Relaxed) {
                    let started = Instant::now();
                    if frame.send(target.as_ref()).is_ok() {
                        frames_clone.fetch_add(1, Ordering::Relaxed);
                    }
                    if let Some(rest) = interval.checked_sub(started.elapsed()) {
                        std::thread::sleep(rest);
                    }
                }
                debug!("Display sender stopped");
            })?;

        Ok(Self {
            stop,
            frames,
            handle: Some(handle),
        })
    }

    /// Frames sent without error so far
    pub fn frames_sent(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Stop and wait for the thread to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DisplaySender {
    fn drop(&mut self) {
        self.shutdown();
    }
}
