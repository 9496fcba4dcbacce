//! Soundbox Core - Packed sound effect playback engine
//!
//! This crate provides the core functionality for sound playback,
//! including resource lookup, decoding, mixing, output, and session
//! management with fade-out on stop.

pub mod config;
pub mod decoder;
pub mod handles;
pub mod mixer;
pub mod output;
pub mod player;
pub mod resample;
pub mod resource;
pub mod stream;

#[cfg( test )]
mod fixtures;

pub use config::{ FadeConfig, FadeCurve, PlayerConfig };
pub use decoder::{ Container, DecodeError, Format };
pub use handles::{ HandleError, PlaybackHandle, PlaybackSession, SessionState };
pub use output::{ CpalDevice, DeviceError, DeviceFormat, HeadlessDevice, OutputDevice };
pub use player::{ Fade, PlayError, Player };
pub use resource::{ ResourceError, ResourceStore };
