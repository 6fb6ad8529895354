//! Audio codec seam
//!
//! The codec itself lives outside this crate. Whether one exists is decided
//! once at startup and carried in `VoiceConfig::encoder_available`.

use crate::error::VoiceResult;

/// Turns one frame of 16-bit stereo PCM into an encoded packet payload
pub trait AudioEncoder: Send {
    fn encode(&mut self, pcm: &[u8], samples_per_frame: u32) -> VoiceResult<Vec<u8>>;
}

impl<E: AudioEncoder + ?Sized> AudioEncoder for Box<E> {
    fn encode(&mut self, pcm: &[u8], samples_per_frame: u32) -> VoiceResult<Vec<u8>> {
        (**self).encode(pcm, samples_per_frame)
    }
}
