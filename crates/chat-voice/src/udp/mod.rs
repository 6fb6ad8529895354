//! UDP media plane: IP discovery and RTP framing

mod discovery;
mod rtp;

pub use discovery::{
    discover, discovery_request, parse_discovery_response, DiscoveredAddress,
    DISCOVERY_PACKET_LEN,
};
pub use rtp::{RtpCounters, RtpHeader, RTP_HEADER_LEN};

#[cfg(test)]
pub(crate) use discovery::discovery_response;
