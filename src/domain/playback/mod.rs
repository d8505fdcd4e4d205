//! Playback state and look-ahead window arithmetic

mod state;
mod timeline;

pub use state::PlaybackState;
pub use timeline::{PlaybackTimeline, WindowCursor, WindowStep};
