//! Capture state snapshot

mod state;

pub use state::{RecorderPhase, RecorderStatus};
