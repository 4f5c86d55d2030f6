//! audio - Microphone capture, AAC/ADTS encoding and sound-source localization
//!
//! Uses ALSA for capture and FDK-AAC for encoding (both behind the
//! `hardware` feature). The streaming pipeline and the localizer only see
//! the `CaptureBackend` / `CodecBackend` traits.

mod aac_codec;
#[cfg(feature = "hardware")]
mod alsa_device;
mod capture;
#[cfg(feature = "hardware")]
mod fdk;
mod frame_queue;
pub mod localization;
mod streamer;
#[cfg(test)]
pub(crate) mod testing;

pub use aac_codec::CodecBackend;
#[cfg(feature = "hardware")]
pub use alsa_device::AlsaCapture;
pub use capture::CaptureBackend;
#[cfg(feature = "hardware")]
pub use fdk::FdkAac;
pub use streamer::{
    AdtsPacket, LocalizationResult, MicrophoneAdtsStreamer, StreamControl, StreamerConfig,
};
