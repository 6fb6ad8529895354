//! Outbound audio
//!
//! Frames flow source -> encoder -> RTP header -> encryption -> UDP at one
//! frame per 20 ms.

mod encoder;
mod player;
mod sender;
mod source;

pub use encoder::AudioEncoder;
pub use player::{AudioPlayer, PlaybackState, SpeakingHook};
pub use sender::AudioSender;
pub use source::{AudioSource, EncodedFrames, PcmSource};

use std::time::Duration;

pub const SAMPLING_RATE: u32 = 48_000;
pub const CHANNELS: u32 = 2;
/// Duration of one frame
pub const FRAME_LENGTH: Duration = Duration::from_millis(20);
pub const SAMPLES_PER_FRAME: u32 = SAMPLING_RATE / 1000 * 20;
/// Bytes per sample across all channels (16-bit PCM)
pub const SAMPLE_SIZE: usize = 2 * CHANNELS as usize;
/// Bytes of PCM in one frame
pub const FRAME_SIZE: usize = SAMPLES_PER_FRAME as usize * SAMPLE_SIZE;
/// Encoded silence, sent on stop so receivers do not interpolate
pub const SILENCE_FRAME: [u8; 3] = [0xF8, 0xFF, 0xFE];
pub const SILENCE_FRAMES: usize = 5;
