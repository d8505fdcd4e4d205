//! Voxpart - microphone capture into stored Opus parts, and playback
//!
//! Audio from an input device is cut into 100 ms frames, encoded one frame
//! at a time and persisted as ordered parts. Stored recordings are played
//! back by decoding a look-ahead window of parts into an output graph.
//!
//! # Architecture
//!
//! The crate follows hexagonal (ports & adapters) architecture:
//!
//! - **Domain**: Value objects, recorder and playback state, timeline arithmetic
//! - **Application**: Capture state machine, encode pipeline, playback scheduler,
//!   event bus and port interfaces (traits)
//! - **Infrastructure**: Adapter implementations (libopus, cpal, rodio, filesystem)
//! - **CLI**: Command-line interface, argument parsing, and signal handling

pub mod application;
pub mod cli;
pub mod domain;
pub mod infrastructure;
