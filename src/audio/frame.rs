//! # Audio Frames
//!
//! An `AudioFrame` is a fixed-duration slice of 16-bit linear PCM, tagged with
//! its sample rate, channel count and capture time. Frames are immutable once
//! built; every codec operation produces a new frame, and ownership moves from
//! producer to consumer (transport → codec → AI adapter and back).

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
#[cfg(test)]
use std::time::Duration;
use std::time::Instant;

use crate::error::BridgeError;

#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<i16>,
    sample_rate: u32,
    channels: u8,
    captured_at: Instant,
}

impl AudioFrame {
    /// Build a mono frame captured now.
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self::with_channels(samples, sample_rate, 1)
    }

    pub fn with_channels(samples: Vec<i16>, sample_rate: u32, channels: u8) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
            captured_at: Instant::now(),
        }
    }

    /// A frame of digital silence.
    #[cfg(test)]
    pub fn silence(sample_count: usize, sample_rate: u32) -> Self {
        Self::new(vec![0; sample_count], sample_rate)
    }

    /// Decode little-endian 16-bit PCM bytes.
    ///
    /// ## Returns:
    /// - **Err(Decode)**: odd byte count (a sample was split)
    pub fn from_pcm_bytes(data: &[u8], sample_rate: u32) -> Result<Self, BridgeError> {
        if data.len() % 2 != 0 {
            return Err(BridgeError::Decode(format!(
                "PCM payload of {} bytes is not a whole number of 16-bit samples",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        let mut samples = Vec::with_capacity(data.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample);
        }

        Ok(Self::new(samples, sample_rate))
    }

    /// Encode as little-endian 16-bit PCM bytes.
    pub fn to_pcm_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for &sample in &self.samples {
            // Writing into a Vec cannot fail.
            let _ = out.write_i16::<LittleEndian>(sample);
        }
        out
    }

    /// Same capture metadata, new samples and rate, so a transformed frame
    /// keeps its original timestamp.
    pub(crate) fn derive(&self, samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: self.channels,
            captured_at: self.captured_at,
        }
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn captured_at(&self) -> Instant {
        self.captured_at
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration of this frame.
    #[cfg(test)]
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let per_channel = self.samples.len() as u64 / self.channels as u64;
        Duration::from_micros(per_channel * 1_000_000 / self.sample_rate as u64)
    }
}
