//! Application configuration value object

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::domain::recording::Duration;

/// Default encoder output budget per frame, in bytes
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 4000;

/// Default initial encoder bitrate, in bits per second
pub const DEFAULT_BITRATE: i32 = 32_000;

/// Default played/scheduled ratio that triggers the next window
pub const DEFAULT_REFILL_RATIO: f64 = 0.8;

/// Application configuration.
/// All fields are optional to support partial configs and merging.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub storage_dir: Option<String>,
    pub input_device: Option<String>,
    pub max_payload_bytes: Option<usize>,
    pub bitrate: Option<i32>,
    pub look_ahead: Option<String>,
    pub lead_in: Option<String>,
    pub refill_ratio: Option<f64>,
    pub play_debounce: Option<String>,
}

impl AppConfig {
    /// Create config with default values
    pub fn defaults() -> Self {
        Self {
            storage_dir: None,
            input_device: None,
            max_payload_bytes: Some(DEFAULT_MAX_PAYLOAD_BYTES),
            bitrate: Some(DEFAULT_BITRATE),
            look_ahead: Some(Duration::default_look_ahead().to_string()),
            lead_in: Some(Duration::default_lead_in().to_string()),
            refill_ratio: Some(DEFAULT_REFILL_RATIO),
            play_debounce: Some(Duration::default_play_debounce().to_string()),
        }
    }

    /// Create an empty config (all None)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Merge this config with another, where other takes precedence.
    /// Only non-None values from other will override this.
    pub fn merge(self, other: Self) -> Self {
        Self {
            storage_dir: other.storage_dir.or(self.storage_dir),
            input_device: other.input_device.or(self.input_device),
            max_payload_bytes: other.max_payload_bytes.or(self.max_payload_bytes),
            bitrate: other.bitrate.or(self.bitrate),
            look_ahead: other.look_ahead.or(self.look_ahead),
            lead_in: other.lead_in.or(self.lead_in),
            refill_ratio: other.refill_ratio.or(self.refill_ratio),
            play_debounce: other.play_debounce.or(self.play_debounce),
        }
    }

    /// Directory holding recordings; `$XDG_DATA_HOME/voxpart/recordings` by default
    pub fn storage_dir_or_default(&self) -> PathBuf {
        match &self.storage_dir {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("~/.local/share"))
                .join("voxpart")
                .join("recordings"),
        }
    }

    pub fn max_payload_bytes_or_default(&self) -> usize {
        self.max_payload_bytes
            .filter(|&b| b > 0)
            .unwrap_or(DEFAULT_MAX_PAYLOAD_BYTES)
    }

    pub fn bitrate_or_default(&self) -> i32 {
        self.bitrate.filter(|&b| b > 0).unwrap_or(DEFAULT_BITRATE)
    }

    /// Look-ahead window; zero or invalid values fall back to the default
    pub fn look_ahead_or_default(&self) -> Duration {
        Self::parse_duration(&self.look_ahead)
            .filter(|d| !d.is_zero())
            .unwrap_or_else(Duration::default_look_ahead)
    }

    pub fn lead_in_or_default(&self) -> Duration {
        Self::parse_duration(&self.lead_in).unwrap_or_else(Duration::default_lead_in)
    }

    /// Refill ratio, clamped into (0, 1]
    pub fn refill_ratio_or_default(&self) -> f64 {
        self.refill_ratio
            .filter(|r| *r > 0.0 && *r <= 1.0)
            .unwrap_or(DEFAULT_REFILL_RATIO)
    }

    pub fn play_debounce_or_default(&self) -> Duration {
        Self::parse_duration(&self.play_debounce).unwrap_or_else(Duration::default_play_debounce)
    }

    fn parse_duration(value: &Option<String>) -> Option<Duration> {
        value.as_ref().and_then(|s| s.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_have_expected_values() {
        let config = AppConfig::defaults();
        assert_eq!(config.max_payload_bytes, Some(4000));
        assert_eq!(config.bitrate, Some(32_000));
        assert_eq!(config.look_ahead, Some("10s".to_string()));
        assert_eq!(config.lead_in, Some("2s".to_string()));
        assert_eq!(config.refill_ratio, Some(0.8));
        assert_eq!(config.play_debounce, Some("100ms".to_string()));
        assert!(config.storage_dir.is_none());
    }

    #[test]
    fn empty_has_all_none() {
        let config = AppConfig::empty();
        assert!(config.storage_dir.is_none());
        assert!(config.input_device.is_none());
        assert!(config.look_ahead.is_none());
        assert!(config.refill_ratio.is_none());
    }

    #[test]
    fn merge_other_takes_precedence() {
        let base = AppConfig {
            input_device: Some("base mic".to_string()),
            look_ahead: Some("10s".to_string()),
            bitrate: Some(24_000),
            ..Default::default()
        };

        let other = AppConfig {
            input_device: Some("usb mic".to_string()),
            look_ahead: None,
            bitrate: Some(64_000),
            ..Default::default()
        };

        let merged = base.merge(other);

        assert_eq!(merged.input_device, Some("usb mic".to_string()));
        assert_eq!(merged.look_ahead, Some("10s".to_string()));
        assert_eq!(merged.bitrate, Some(64_000));
    }

    #[test]
    fn invalid_values_fall_back_to_defaults() {
        let config = AppConfig {
            look_ahead: Some("0s".to_string()),
            lead_in: Some("soon".to_string()),
            refill_ratio: Some(1.5),
            bitrate: Some(-1),
            max_payload_bytes: Some(0),
            ..Default::default()
        };
        assert_eq!(config.look_ahead_or_default().as_secs(), 10);
        assert_eq!(config.lead_in_or_default().as_secs(), 2);
        assert_eq!(config.refill_ratio_or_default(), 0.8);
        assert_eq!(config.bitrate_or_default(), 32_000);
        assert_eq!(config.max_payload_bytes_or_default(), 4000);
    }

    #[test]
    fn durations_parse() {
        let config = AppConfig {
            look_ahead: Some("20s".to_string()),
            play_debounce: Some("250ms".to_string()),
            ..Default::default()
        };
        assert_eq!(config.look_ahead_or_default().as_secs(), 20);
        assert_eq!(config.play_debounce_or_default().as_millis(), 250);
    }

    #[test]
    fn storage_dir_override() {
        let config = AppConfig {
            storage_dir: Some("/tmp/voxpart".to_string()),
            ..Default::default()
        };
        assert_eq!(config.storage_dir_or_default(), PathBuf::from("/tmp/voxpart"));
        assert!(AppConfig::empty()
            .storage_dir_or_default()
            .to_string_lossy()
            .contains("voxpart"));
    }
}
