//! Audio sources

use super::FRAME_SIZE;
use std::collections::VecDeque;

/// Supplies one 20 ms frame per call
pub trait AudioSource: Send {
    /// Next frame, or `None` when the stream is over
    fn read(&mut self) -> Option<Vec<u8>>;

    /// Whether frames are already encoded and skip the encoder
    fn is_encoded(&self) -> bool {
        false
    }

    /// Called once after playback ends
    fn cleanup(&mut self) {}
}

/// In-memory 16-bit 48 kHz stereo PCM
///
/// A trailing partial frame is dropped.
#[derive(Debug, Clone)]
pub struct PcmSource {
    data: Vec<u8>,
    position: usize,
}

impl PcmSource {
    #[must_use]
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, position: 0 }
    }

    /// Whole frames left to read
    #[must_use]
    pub fn remaining_frames(&self) -> usize {
        (self.data.len() - self.position) / FRAME_SIZE
    }
}

impl AudioSource for PcmSource {
    fn read(&mut self) -> Option<Vec<u8>> {
        let end = self.position + FRAME_SIZE;
        let frame = self.data.get(self.position..end)?.to_vec();
        self.position = end;
        Some(frame)
    }
}

/// Pre-encoded frames
#[derive(Debug, Clone, Default)]
pub struct EncodedFrames {
    frames: VecDeque<Vec<u8>>,
}

impl EncodedFrames {
    #[must_use]
    pub fn new(frames: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            frames: frames.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl AudioSource for EncodedFrames {
    fn read(&mut self) -> Option<Vec<u8>> {
        self.frames.pop_front()
    }

    fn is_encoded(&self) -> bool {
        true
    }
}
