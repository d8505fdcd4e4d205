//! Playback scheduler states

use std::fmt;

/// Playback states. `Paused` is both initial and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PlaybackState {
    #[default]
    Paused,
    Preparing,
    Playing,
}

impl PlaybackState {
    /// Get the string representation
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Paused => "paused",
            Self::Preparing => "preparing",
            Self::Playing => "playing",
        }
    }
}

impl fmt::Display for PlaybackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_paused() {
        assert_eq!(PlaybackState::default(), PlaybackState::Paused);
    }

    #[test]
    fn state_display() {
        assert_eq!(PlaybackState::Paused.to_string(), "paused");
        assert_eq!(PlaybackState::Preparing.to_string(), "preparing");
        assert_eq!(PlaybackState::Playing.to_string(), "playing");
    }
}
