//! # External Media
//!
//! The raw PCM leg between the bridge and the PBX. See `transport` for the
//! socket lifecycle and framing rules.

pub mod transport;

pub use transport::{MediaConnection, MediaFormat, MediaListener, MediaReceiver, MediaSender, MediaTimeouts};
