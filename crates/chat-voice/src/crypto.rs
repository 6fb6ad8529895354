//! Transport encryption for voice packets
//!
//! All modes use XSalsa20-Poly1305 and differ only in where the 24-byte
//! nonce comes from and what is appended to the packet.

use crate::error::{VoiceError, VoiceResult};
use crate::udp::RTP_HEADER_LEN;
use crypto_secretbox::aead::generic_array::GenericArray;
use crypto_secretbox::aead::{Aead, KeyInit};
use crypto_secretbox::XSalsa20Poly1305;
use rand::RngCore;
use std::fmt;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const MAC_LEN: usize = 16;
const LITE_NONCE_LEN: usize = 4;

/// Encryption modes, in order of preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionMode {
    /// 4-byte incrementing counter appended
    Lite,
    /// Random 24-byte nonce appended
    Suffix,
    /// Nonce is the RTP header, nothing appended
    Normal,
}

impl EncryptionMode {
    pub const PREFERENCE: [Self; 3] = [Self::Lite, Self::Suffix, Self::Normal];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Lite => "xsalsa20_poly1305_lite",
            Self::Suffix => "xsalsa20_poly1305_suffix",
            Self::Normal => "xsalsa20_poly1305",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::PREFERENCE.into_iter().find(|mode| mode.as_str() == name)
    }

    /// Bytes added to the payload besides the RTP header
    #[must_use]
    pub const fn overhead(self) -> usize {
        MAC_LEN
            + match self {
                Self::Lite => LITE_NONCE_LEN,
                Self::Suffix => NONCE_LEN,
                Self::Normal => 0,
            }
    }

    /// Pick the most preferred mode the server offers
    pub fn select<S: AsRef<str>>(offered: &[S]) -> VoiceResult<Self> {
        Self::PREFERENCE
            .into_iter()
            .find(|mode| offered.iter().any(|o| o.as_ref() == mode.as_str()))
            .ok_or_else(|| {
                let offered: Vec<&str> = offered.iter().map(AsRef::as_ref).collect();
                VoiceError::Negotiation(format!(
                    "no supported encryption mode in [{}]",
                    offered.join(", ")
                ))
            })
    }
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Seals and opens RTP packets for one session
pub struct PacketCipher {
    cipher: XSalsa20Poly1305,
    mode: EncryptionMode,
    lite_nonce: u32,
}

impl PacketCipher {
    pub fn new(mode: EncryptionMode, secret_key: &[u8]) -> VoiceResult<Self> {
        if secret_key.len() != KEY_LEN {
            return Err(VoiceError::Negotiation(format!(
                "secret key must be {KEY_LEN} bytes, got {}",
                secret_key.len()
            )));
        }
        let cipher = XSalsa20Poly1305::new_from_slice(secret_key).map_err(|_| VoiceError::Crypto)?;
        Ok(Self {
            cipher,
            mode,
            lite_nonce: 0,
        })
    }

    #[must_use]
    pub fn mode(&self) -> EncryptionMode {
        self.mode
    }

    /// Encrypt `payload` and build the full packet behind `header`
    pub fn seal(&mut self, header: &[u8; RTP_HEADER_LEN], payload: &[u8]) -> VoiceResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        let suffix: Vec<u8> = match self.mode {
            EncryptionMode::Normal => {
                nonce[..RTP_HEADER_LEN].copy_from_slice(header);
                Vec::new()
            }
            EncryptionMode::Suffix => {
                rand::thread_rng().fill_bytes(&mut nonce);
                nonce.to_vec()
            }
            EncryptionMode::Lite => {
                let counter = self.lite_nonce.to_be_bytes();
                self.lite_nonce = self.lite_nonce.wrapping_add(1);
                nonce[..LITE_NONCE_LEN].copy_from_slice(&counter);
                counter.to_vec()
            }
        };

        let ciphertext = self
            .cipher
            .encrypt(GenericArray::from_slice(&nonce), payload)
            .map_err(|_| VoiceError::Crypto)?;

        let mut packet = Vec::with_capacity(RTP_HEADER_LEN + ciphertext.len() + suffix.len());
        packet.extend_from_slice(header);
        packet.extend_from_slice(&ciphertext);
        packet.extend_from_slice(&suffix);
        Ok(packet)
    }

    /// Decrypt a packet sealed with the same mode and key
    pub fn open(&self, packet: &[u8]) -> VoiceResult<Vec<u8>> {
        if packet.len() < RTP_HEADER_LEN + self.mode.overhead() {
            return Err(VoiceError::Crypto);
        }
        let (header, body) = packet.split_at(RTP_HEADER_LEN);

        let mut nonce = [0u8; NONCE_LEN];
        let ciphertext = match self.mode {
            EncryptionMode::Normal => {
                nonce[..RTP_HEADER_LEN].copy_from_slice(header);
                body
            }
            EncryptionMode::Suffix => {
                let (ciphertext, tail) = body.split_at(body.len() - NONCE_LEN);
                nonce.copy_from_slice(tail);
                ciphertext
            }
            EncryptionMode::Lite => {
                let (ciphertext, tail) = body.split_at(body.len() - LITE_NONCE_LEN);
                nonce[..LITE_NONCE_LEN].copy_from_slice(tail);
                ciphertext
            }
        };

        self.cipher
            .decrypt(GenericArray::from_slice(&nonce), ciphertext)
            .map_err(|_| VoiceError::Crypto)
    }
}

impl fmt::Debug for PacketCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PacketCipher")
            .field("mode", &self.mode)
            .field("lite_nonce", &self.lite_nonce)
            .finish()
    }
}
