//! RTP framing for outbound audio

/// Length of the fixed RTP header
pub const RTP_HEADER_LEN: usize = 12;

/// Version 2, no padding, extension or CSRCs
const VERSION_FLAGS: u8 = 0x80;
/// Dynamic payload type used for Opus
const PAYLOAD_TYPE: u8 = 0x78;

/// Fixed 12-byte RTP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; RTP_HEADER_LEN] {
        let mut header = [0u8; RTP_HEADER_LEN];
        header[0] = VERSION_FLAGS;
        header[1] = PAYLOAD_TYPE;
        header[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        header[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        header
    }

    /// Parse the header at the start of a packet
    #[must_use]
    pub fn parse(packet: &[u8]) -> Option<Self> {
        let header = packet.get(..RTP_HEADER_LEN)?;
        if header[0] != VERSION_FLAGS || header[1] != PAYLOAD_TYPE {
            return None;
        }
        Some(Self {
            sequence: u16::from_be_bytes([header[2], header[3]]),
            timestamp: u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
            ssrc: u32::from_be_bytes([header[8], header[9], header[10], header[11]]),
        })
    }
}

/// Sequence and timestamp counters of one outbound stream
///
/// Both wrap at their field width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpCounters {
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
}

impl RtpCounters {
    #[must_use]
    pub const fn new(ssrc: u32) -> Self {
        Self {
            ssrc,
            sequence: 0,
            timestamp: 0,
        }
    }

    /// Header for the next frame, then advance by one frame of `samples`
    pub fn next_header(&mut self, samples: u32) -> RtpHeader {
        let header = RtpHeader {
            sequence: self.sequence,
            timestamp: self.timestamp,
            ssrc: self.ssrc,
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(samples);
        header
    }

    #[must_use]
    pub const fn ssrc(&self) -> u32 {
        self.ssrc
    }
}
