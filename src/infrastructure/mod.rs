//! Infrastructure layer - Adapter implementations
//!
//! Contains concrete implementations of the port interfaces,
//! integrating with libopus, cpal, rodio and the filesystem.

pub mod codec;
pub mod config;
pub mod input;
pub mod output;
pub mod store;

// Re-export adapters
pub use codec::OpusCodecService;
pub use config::XdgConfigStore;
pub use input::CpalInput;
pub use output::RodioOutput;
pub use store::{FsPartStore, MemoryPartStore};
