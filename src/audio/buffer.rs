//! # Audio Buffer Management
//!
//! Two buffers sit between the raw socket and the codec:
//!
//! - **FrameAssembler**: reassembles an unframed byte stream into fixed-size
//!   PCM frames. Socket reads return arbitrary lengths; only whole frames
//!   leave the assembler, partial data waits for the next read.
//! - **PlayoutBuffer**: bounded sample queue for AI speech headed to the PBX.
//!   The AI delivers audio in bursts faster than real time; the buffer lets
//!   the downlink release exactly one frame per frame interval. When full, the
//!   oldest samples are discarded so memory stays bounded.

use std::collections::VecDeque;

use crate::audio::frame::AudioFrame;

/// Reassembles fixed-size frames from a byte stream.
#[derive(Debug)]
pub struct FrameAssembler {
    pending: Vec<u8>,
    frame_bytes: usize,
}

impl FrameAssembler {
    /// ## Parameters:
    /// - **frame_bytes**: size of one frame on the wire (must be even and non-zero)
    pub fn new(frame_bytes: usize) -> Self {
        Self {
            pending: Vec::with_capacity(frame_bytes * 2),
            frame_bytes: frame_bytes.max(2),
        }
    }

    /// Append bytes read from the socket.
    pub fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    /// Take the next complete frame, if one is available.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.pending.len() < self.frame_bytes {
            return None;
        }
        let rest = self.pending.split_off(self.frame_bytes);
        Some(std::mem::replace(&mut self.pending, rest))
    }

    /// Bytes of an incomplete frame still waiting for more data.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Bounded queue of samples awaiting playback to the caller.
#[derive(Debug)]
pub struct PlayoutBuffer {
    samples: VecDeque<i16>,
    sample_rate: u32,
    samples_per_frame: usize,
    max_samples: usize,
    dropped_samples: u64,
}

impl PlayoutBuffer {
    /// ## Calculations:
    /// - **samples_per_frame**: `sample_rate * frame_ms / 1000`
    /// - **max_samples**: `sample_rate * max_ms / 1000`, at least one frame
    pub fn new(sample_rate: u32, frame_ms: u32, max_ms: u32) -> Self {
        let samples_per_frame = (sample_rate as usize * frame_ms as usize) / 1000;
        let max_samples = ((sample_rate as usize * max_ms as usize) / 1000).max(samples_per_frame);

        Self {
            samples: VecDeque::with_capacity(max_samples),
            sample_rate,
            samples_per_frame,
            max_samples,
            dropped_samples: 0,
        }
    }

    /// Queue a frame that is already at the playout rate.
    pub fn push(&mut self, frame: &AudioFrame) {
        self.samples.extend(frame.samples().iter().copied());

        let overflow = self.samples.len().saturating_sub(self.max_samples);
        if overflow > 0 {
            self.samples.drain(..overflow);
            self.dropped_samples += overflow as u64;
        }
    }

    /// Release one full frame, or `None` while less than a frame is queued.
    pub fn pop_frame(&mut self) -> Option<AudioFrame> {
        if self.samples_per_frame == 0 || self.samples.len() < self.samples_per_frame {
            return None;
        }
        let chunk: Vec<i16> = self.samples.drain(..self.samples_per_frame).collect();
        Some(AudioFrame::new(chunk, self.sample_rate))
    }

    /// Pad a trailing partial frame with silence so it is released on the
    /// next `pop_frame`. Used at the end of an AI response so its tail is not
    /// stranded. Returns the number of samples added.
    pub fn pad_tail(&mut self) -> usize {
        if self.samples_per_frame == 0 {
            return 0;
        }
        let partial = self.samples.len() % self.samples_per_frame;
        if partial == 0 {
            return 0;
        }
        let padding = self.samples_per_frame - partial;
        self.samples.extend(std::iter::repeat(0).take(padding));
        padding
    }

    /// Drop everything queued (caller barge-in).
    pub fn clear(&mut self) -> usize {
        let cleared = self.samples.len();
        self.samples.clear();
        cleared
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples
    }
}
