//! Client configuration
//!
//! Read from `client.toml` in the platform config directory
//! (`%APPDATA%\nihia` on Windows, `~/Library/Application Support/nihia` on
//! macOS) unless a path is given explicitly. Every field is optional:
//!
//! ```toml
//! software_identity = 0x4B4B694E   # present as Komplete Kontrol
//! stall_threshold = 2
//! midi_fallback = false
//! display_fps = 30
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nihia_device::{ConnectionOptions, SoftwareIdentity};
use nihia_transport::protocol::timing;
use nihia_transport::TransportOptions;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Raw identity presented in handshakes; per-family default when unset
    pub software_identity: Option<u32>,
    pub reply_timeout_ms: u64,
    pub poll_timeout_ms: u64,
    /// Silent polls before the subscription is renewed
    pub stall_threshold: u32,
    /// Do not claim the controls; leave them sending MIDI
    pub midi_fallback: bool,
    pub event_queue_capacity: usize,
    pub display_fps: u32,
    pub pipe_busy_retries: u32,
    pub pipe_busy_backoff_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            software_identity: None,
            reply_timeout_ms: timing::REPLY_TIMEOUT_MS,
            poll_timeout_ms: timing::POLL_TIMEOUT_MS,
            stall_threshold: timing::STALL_TIMEOUT_THRESHOLD,
            midi_fallback: false,
            event_queue_capacity: 256,
            display_fps: 30,
            pipe_busy_retries: timing::PIPE_BUSY_RETRIES,
            pipe_busy_backoff_ms: timing::PIPE_BUSY_BACKOFF_MS,
        }
    }
}

/// `<config dir>/nihia/client.toml`, if the platform has a config dir
pub fn default_config_path() -> Option<PathBuf> {
    let mut path = dirs::config_dir()?;
    path.push("nihia");
    path.push("client.toml");
    Some(path)
}

impl ClientConfig {
    pub fn from_toml(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content, path)
    }

    /// Load `path` if given, else the default location. A missing default
    /// file yields defaults; a missing explicit file is an error.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match default_config_path() {
            Some(path) if path.exists() => {
                debug!("Loading config from {}", path.display());
                Self::load(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            busy_retries: self.pipe_busy_retries,
            busy_backoff: Duration::from_millis(self.pipe_busy_backoff_ms),
        }
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            software_identity: self.software_identity.map(SoftwareIdentity),
            midi_fallback: self.midi_fallback,
            stall_threshold: self.stall_threshold,
            ..ConnectionOptions::default()
        }
    }

    /// Interval between display frames
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.display_fps.max(1)))
    }
}
