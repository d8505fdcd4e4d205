//! CLI argument definitions using Clap

use clap::{Parser, Subcommand};

use crate::application::ports::DeviceId;
use crate::application::{CaptureConfig, PlaybackConfig};
use crate::domain::recording::{Duration, RecordingId};

/// Voxpart - record the microphone into Opus parts and play them back
#[derive(Parser, Debug)]
#[command(name = "voxpart")]
#[command(version)]
#[command(about = "Record microphone audio as Opus parts and play recordings back")]
#[command(long_about = None)]
pub struct Cli {
    /// Log debug output to stderr
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Record from an input device until Ctrl+C or the duration elapses
    Record {
        /// Input device name (see `voxpart devices`)
        #[arg(short = 'i', long, value_name = "DEVICE")]
        device: Option<String>,

        /// Stop after this long (e.g., 10s, 1m, 2m30s)
        #[arg(short = 'd', long, value_name = "TIME")]
        duration: Option<String>,

        /// Initial encoder bitrate in bits per second
        #[arg(short = 'b', long, value_name = "BPS")]
        bitrate: Option<i32>,

        /// Output budget per encoded frame in bytes
        #[arg(long, value_name = "BYTES")]
        max_payload: Option<usize>,
    },
    /// Play a stored recording
    Play {
        /// Recording id (see `voxpart list`)
        id: String,

        /// Start offset (e.g., 1m30s)
        #[arg(short = 'f', long, value_name = "TIME")]
        from: Option<String>,
    },
    /// List stored recordings, newest first
    List,
    /// List input devices
    Devices,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config action subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Create config file with defaults
    Init,
    /// Set a config value
    Set {
        /// Config key
        key: String,
        /// Config value
        value: String,
    },
    /// Get a config value
    Get {
        /// Config key
        key: String,
    },
    /// List all config values
    List,
    /// Show config file path
    Path,
}

/// Parsed record options
#[derive(Debug, Clone)]
pub struct RecordOptions {
    pub device: Option<DeviceId>,
    /// `None` records until interrupted
    pub duration: Option<Duration>,
    pub max_payload_bytes: usize,
    pub capture: CaptureConfig,
}

/// Parsed play options
#[derive(Debug, Clone)]
pub struct PlayOptions {
    pub recording_id: RecordingId,
    pub from: Duration,
    pub playback: PlaybackConfig,
}

/// Valid config keys
pub const VALID_CONFIG_KEYS: &[&str] = &[
    "storage_dir",
    "input_device",
    "max_payload_bytes",
    "bitrate",
    "look_ahead",
    "lead_in",
    "refill_ratio",
    "play_debounce",
];

/// Check if a config key is valid
pub fn is_valid_config_key(key: &str) -> bool {
    VALID_CONFIG_KEYS.contains(&key)
}
