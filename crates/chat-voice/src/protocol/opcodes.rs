//! Voice gateway operation codes (version 4)

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum VoiceOpCode {
    /// Begin a voice session (send)
    Identify = 0,
    /// Choose the UDP protocol and encryption mode (send)
    SelectProtocol = 1,
    /// SSRC, UDP endpoint and offered modes (receive)
    Ready = 2,
    /// Keep the connection alive (send)
    Heartbeat = 3,
    /// Negotiated mode and secret key (receive)
    SessionDescription = 4,
    /// Speaking state (send/receive)
    Speaking = 5,
    /// Heartbeat acknowledged (receive)
    HeartbeatAck = 6,
    /// Resume a voice session (send)
    Resume = 7,
    /// Heartbeat interval (receive)
    Hello = 8,
    /// Resume succeeded (receive)
    Resumed = 9,
    /// Another client left the channel (receive)
    ClientDisconnect = 13,
}

impl VoiceOpCode {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Identify),
            1 => Some(Self::SelectProtocol),
            2 => Some(Self::Ready),
            3 => Some(Self::Heartbeat),
            4 => Some(Self::SessionDescription),
            5 => Some(Self::Speaking),
            6 => Some(Self::HeartbeatAck),
            7 => Some(Self::Resume),
            8 => Some(Self::Hello),
            9 => Some(Self::Resumed),
            13 => Some(Self::ClientDisconnect),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

impl Serialize for VoiceOpCode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for VoiceOpCode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = u8::deserialize(deserializer)?;
        Self::from_u8(value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid voice op code: {value}")))
    }
}

impl std::fmt::Display for VoiceOpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} ({})", self, self.as_u8())
    }
}
