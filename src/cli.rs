// CLI definitions using clap

use clap::{Parser, Subcommand};
use nihia::{DeviceTypeId, KeyZone};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nihia")]
#[command(author, version, about = "Native Instruments Host Integration Agent client")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Config file (default: <config dir>/nihia/client.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Device model: product id (0x1600) or alias (mk3, mikro, s49, s61, s88)
    #[arg(short = 't', long, global = true, default_value = "mk3")]
    pub device_type: DeviceTypeId,

    /// Device serial; defaults to the only attached unit of the model
    #[arg(short, long, global = true)]
    pub serial: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List attached devices of every known model
    #[command(visible_aliases = ["list", "ls"])]
    Devices {
        /// Seconds to collect attach notifications
        #[arg(short, long, default_value = "2")]
        wait: u64,
    },

    /// Print hardware events until Ctrl-C
    #[command(visible_alias = "w")]
    Watch {
        /// Watch the type-scoped connection instead of one device
        #[arg(long)]
        global: bool,
        /// Stop after this many events
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Ask the daemon to route the device to this client
    Focus,

    /// Set per-key LED palette indices
    Leds {
        /// Comma-separated color indices in hardware order
        #[arg(long, value_delimiter = ',', required = true)]
        colors: Vec<u8>,
    },

    /// Light key ranges on the keyboard light guide
    Keyzones {
        /// first:last:color, repeatable
        #[arg(long = "zone", required = true)]
        zones: Vec<KeyZone>,
    },

    /// Show an image on the device screens
    Display {
        /// PNG or JPEG file, 960x272 for a pixel-exact frame
        image: PathBuf,
        /// Send a single frame and exit
        #[arg(long)]
        once: bool,
        /// Scale the image to the full frame
        #[arg(long)]
        fit: bool,
        /// Stop streaming after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
}
