//! Packetizing and sending encoded frames

use super::{SAMPLES_PER_FRAME, SILENCE_FRAME, SILENCE_FRAMES};
use crate::crypto::PacketCipher;
use crate::error::{VoiceError, VoiceResult};
use crate::udp::RtpCounters;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Outbound half of the media plane
///
/// The socket must already be connected to the voice server. A sender
/// given a close signal refuses to send once the signal fires or its
/// owner goes away.
#[derive(Debug)]
pub struct AudioSender {
    socket: Arc<UdpSocket>,
    cipher: PacketCipher,
    counters: RtpCounters,
    closed: Option<watch::Receiver<bool>>,
}

impl AudioSender {
    #[must_use]
    pub fn new(socket: Arc<UdpSocket>, cipher: PacketCipher, ssrc: u32) -> Self {
        Self {
            socket,
            cipher,
            counters: RtpCounters::new(ssrc),
            closed: None,
        }
    }

    /// Tie the sender to a connection's lifetime
    #[must_use]
    pub fn with_close_signal(mut self, closed: watch::Receiver<bool>) -> Self {
        self.closed = Some(closed);
        self
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
            .as_ref()
            .is_some_and(|closed| *closed.borrow() || closed.has_changed().is_err())
    }

    /// Resolves once the close signal fires; never for a sender without one
    pub async fn closed(&self) {
        match &self.closed {
            Some(closed) => {
                let mut closed = closed.clone();
                let _ = closed.wait_for(|is_closed| *is_closed).await;
            }
            None => std::future::pending().await,
        }
    }

    /// Build the encrypted packet for one encoded frame
    pub fn packetize(&mut self, encoded: &[u8]) -> VoiceResult<Vec<u8>> {
        let header = self.counters.next_header(SAMPLES_PER_FRAME);
        self.cipher.seal(&header.to_bytes(), encoded)
    }

    pub async fn send_frame(&mut self, encoded: &[u8]) -> VoiceResult<()> {
        if self.is_closed() {
            return Err(VoiceError::NotConnected);
        }
        let packet = self.packetize(encoded)?;
        self.socket.send(&packet).await?;
        Ok(())
    }

    /// Send the trailing silence frames
    pub async fn send_silence(&mut self) -> VoiceResult<()> {
        for _ in 0..SILENCE_FRAMES {
            self.send_frame(&SILENCE_FRAME).await?;
        }
        Ok(())
    }

    #[must_use]
    pub fn ssrc(&self) -> u32 {
        self.counters.ssrc()
    }
}
