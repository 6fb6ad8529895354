//! # chat-voice
//!
//! Voice sessions: the voice gateway handshake, UDP IP discovery, RTP
//! framing, packet encryption and paced audio playback, plus the manager
//! that pairs the credentials shards relay.

pub mod audio;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod gateway_link;
pub mod manager;
pub mod protocol;
pub mod udp;

pub use audio::{AudioEncoder, AudioPlayer, AudioSource, EncodedFrames, PcmSource, PlaybackState};
pub use connection::{DisconnectReason, VoiceConnection, VoiceEvent, VoiceServerInfo};
pub use crypto::{EncryptionMode, PacketCipher};
pub use error::{VoiceError, VoiceResult, VoiceSessionError};
pub use gateway_link::VoiceStateSender;
pub use manager::{CredentialBuffer, HandshakeOutcome, PendingHandshake, VoiceManager};
