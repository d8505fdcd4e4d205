//! Microphone input adapters

mod cpal_input;

pub use cpal_input::CpalInput;
