//! # Audio Processing Module
//!
//! Everything that touches PCM samples on their way between the telephony leg
//! and the AI leg.
//!
//! ## Key Components:
//! - **Frames**: immutable, rate-tagged PCM slices (`frame`)
//! - **Codec**: resampling, RMS, gain and silence detection (`codec`)
//! - **Buffers**: frame reassembly and paced playout (`buffer`)
//!
//! ## Audio Format:
//! - **Encoding**: signed 16-bit little-endian linear PCM
//! - **Channels**: mono
//! - **Telephony leg**: the PBX's native rate (8 kHz by default, 20 ms frames)
//! - **AI leg**: the provider's rate (24 kHz by default)

pub mod buffer;
pub mod codec;
pub mod frame;

pub use frame::AudioFrame;
