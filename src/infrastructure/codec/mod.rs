//! Codec service adapter

mod opus_service;

pub use opus_service::OpusCodecService;
