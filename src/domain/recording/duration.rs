//! Duration value object

use std::fmt;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use crate::domain::error::DurationParseError;

/// Default playback look-ahead window (10 seconds)
pub const DEFAULT_LOOK_AHEAD_MS: u64 = 10_000;

/// Default lead-in before the first scheduled buffer starts (2 seconds)
pub const DEFAULT_LEAD_IN_MS: u64 = 2_000;

/// Default coalescing window for repeated `play` calls (100 milliseconds)
pub const DEFAULT_PLAY_DEBOUNCE_MS: u64 = 100;

/// Value object representing a time span with millisecond precision.
/// Immutable and validated on creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Duration {
    milliseconds: u64,
}

impl Duration {
    /// Zero-length duration
    pub const ZERO: Self = Self::from_millis(0);

    /// Create a Duration from milliseconds
    pub const fn from_millis(ms: u64) -> Self {
        Self { milliseconds: ms }
    }

    /// Create a Duration from seconds
    pub const fn from_secs(secs: u64) -> Self {
        Self {
            milliseconds: secs * 1000,
        }
    }

    /// Create a Duration from fractional seconds, rounded to the nearest millisecond.
    /// Negative and non-finite inputs clamp to zero.
    pub fn from_secs_f64(secs: f64) -> Self {
        if !secs.is_finite() || secs <= 0.0 {
            return Self::ZERO;
        }
        Self::from_millis((secs * 1000.0).round() as u64)
    }

    pub const fn default_look_ahead() -> Self {
        Self::from_millis(DEFAULT_LOOK_AHEAD_MS)
    }

    pub const fn default_lead_in() -> Self {
        Self::from_millis(DEFAULT_LEAD_IN_MS)
    }

    pub const fn default_play_debounce() -> Self {
        Self::from_millis(DEFAULT_PLAY_DEBOUNCE_MS)
    }

    /// Get duration in whole seconds
    pub const fn as_secs(&self) -> u64 {
        self.milliseconds / 1000
    }

    /// Get duration in milliseconds
    pub const fn as_millis(&self) -> u64 {
        self.milliseconds
    }

    /// Get duration as fractional seconds (the playback clock unit)
    pub fn as_secs_f64(&self) -> f64 {
        self.milliseconds as f64 / 1000.0
    }

    pub const fn is_zero(&self) -> bool {
        self.milliseconds == 0
    }

    /// Convert to std::time::Duration
    pub const fn as_std(&self) -> StdDuration {
        StdDuration::from_millis(self.milliseconds)
    }
}

impl FromStr for Duration {
    type Err = DurationParseError;

    /// Parse a duration string made of `<number><unit>` groups.
    /// Units: `m` (minutes), `s` (seconds), `ms` (milliseconds).
    /// Examples: "150ms", "10s", "2m30s", "1s500ms", "0s".
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || DurationParseError {
            input: s.to_string(),
        };
        let input = s.trim().to_lowercase();
        let bytes = input.as_bytes();

        let mut total_ms: u64 = 0;
        let mut pos = 0;

        if bytes.is_empty() {
            return Err(err());
        }

        while pos < bytes.len() {
            let digits_start = pos;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                pos += 1;
            }
            if pos == digits_start {
                return Err(err());
            }
            let value: u64 = input[digits_start..pos].parse().map_err(|_| err())?;

            let unit_ms = if input[pos..].starts_with("ms") {
                pos += 2;
                1
            } else if input[pos..].starts_with('s') {
                pos += 1;
                1_000
            } else if input[pos..].starts_with('m') {
                pos += 1;
                60_000
            } else {
                return Err(err());
            };

            total_ms = value
                .checked_mul(unit_ms)
                .and_then(|v| total_ms.checked_add(v))
                .ok_or_else(err)?;
        }

        Ok(Self {
            milliseconds: total_ms,
        })
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let minutes = self.milliseconds / 60_000;
        let seconds = (self.milliseconds / 1000) % 60;
        let millis = self.milliseconds % 1000;

        if self.milliseconds == 0 {
            return write!(f, "0s");
        }
        if minutes > 0 {
            write!(f, "{}m", minutes)?;
        }
        if seconds > 0 {
            write!(f, "{}s", seconds)?;
        }
        if millis > 0 {
            write!(f, "{}ms", millis)?;
        }
        Ok(())
    }
}

impl From<StdDuration> for Duration {
    fn from(value: StdDuration) -> Self {
        Self::from_millis(value.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_seconds_only() {
        let d: Duration = "30s".parse().unwrap();
        assert_eq!(d, Duration::from_secs(30));
        assert_eq!(d.as_secs(), 30);
        assert_eq!(d.as_millis(), 30000);
    }

    #[test]
    fn parse_milliseconds() {
        let d: Duration = "150ms".parse().unwrap();
        assert_eq!(d.as_millis(), 150);
    }

    #[test]
    fn parse_mixed_units() {
        let d: Duration = "1m2s500ms".parse().unwrap();
        assert_eq!(d.as_millis(), 62_500);
    }

    #[test]
    fn parse_zero_is_allowed_for_offsets() {
        let d: Duration = "0s".parse().unwrap();
        assert!(d.is_zero());
    }

    #[test]
    fn parse_case_and_whitespace() {
        let d: Duration = "  1M30S ".parse().unwrap();
        assert_eq!(d.as_secs(), 90);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<Duration>().is_err());
        assert!("30".parse::<Duration>().is_err());
        assert!("abc".parse::<Duration>().is_err());
        assert!("30x".parse::<Duration>().is_err());
        assert!("s30".parse::<Duration>().is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for text in ["0s", "150ms", "10s", "2m", "2m30s", "1m0s250ms"] {
            let d: Duration = text.parse().unwrap();
            let again: Duration = d.to_string().parse().unwrap();
            assert_eq!(d, again, "{}", text);
        }
        assert_eq!(Duration::from_millis(90_250).to_string(), "1m30s250ms");
    }

    #[test]
    fn fractional_seconds() {
        assert_eq!(Duration::from_secs_f64(2.5).as_millis(), 2500);
        assert_eq!(Duration::from_secs_f64(-1.0), Duration::ZERO);
        assert_eq!(Duration::from_millis(1500).as_secs_f64(), 1.5);
    }

    #[test]
    fn default_values() {
        assert_eq!(Duration::default_look_ahead().as_secs(), 10);
        assert_eq!(Duration::default_lead_in().as_secs(), 2);
        assert_eq!(Duration::default_play_debounce().as_millis(), 100);
    }
}
