//! Port interfaces (traits) for external systems
//!
//! These traits define the boundaries between the application
//! and infrastructure layers.

pub mod codec;
pub mod config;
pub mod input;
pub mod output;
pub mod part_store;

// Re-export common types
pub use codec::{CodecFailure, CodecService, DecoderOptions, EncodedPacket, EncoderOptions};
pub use config::ConfigStore;
pub use input::{DeviceId, DeviceInfo, InputError, InputSource, InputStream};
pub use output::{
    OutputError, OutputGraph, OutputNode, PcmBuffer, ScheduledBuffer, VoiceControl,
};
pub use part_store::{PartStore, PartStream, StoreError};
