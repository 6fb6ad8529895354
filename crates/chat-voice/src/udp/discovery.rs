//! IP discovery
//!
//! The voice server echoes back the address and port it sees our UDP
//! socket on, which is what the session description must carry.

use crate::error::{VoiceError, VoiceResult};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Size of both the request and the response
pub const DISCOVERY_PACKET_LEN: usize = 74;

const REQUEST_TYPE: u16 = 0x1;
const RESPONSE_TYPE: u16 = 0x2;
/// Length field: everything after the type and length fields
const BODY_LEN: u16 = 70;
const ADDRESS_START: usize = 8;
const ADDRESS_END: usize = 72;

/// External address reported by the voice server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredAddress {
    pub ip: String,
    pub port: u16,
}

/// Build the discovery request for `ssrc`
#[must_use]
pub fn discovery_request(ssrc: u32) -> [u8; DISCOVERY_PACKET_LEN] {
    let mut packet = [0u8; DISCOVERY_PACKET_LEN];
    packet[0..2].copy_from_slice(&REQUEST_TYPE.to_be_bytes());
    packet[2..4].copy_from_slice(&BODY_LEN.to_be_bytes());
    packet[4..8].copy_from_slice(&ssrc.to_be_bytes());
    packet
}

/// Parse a discovery response into the external address
pub fn parse_discovery_response(packet: &[u8]) -> VoiceResult<DiscoveredAddress> {
    if packet.len() < DISCOVERY_PACKET_LEN {
        return Err(VoiceError::Protocol(format!(
            "discovery response too short: {} bytes",
            packet.len()
        )));
    }

    let kind = u16::from_be_bytes([packet[0], packet[1]]);
    if kind != RESPONSE_TYPE {
        return Err(VoiceError::Protocol(format!(
            "unexpected discovery packet type {kind:#x}"
        )));
    }

    let field = &packet[ADDRESS_START..ADDRESS_END];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    let ip = std::str::from_utf8(&field[..end])
        .map_err(|_| VoiceError::Protocol("discovery address is not valid text".to_string()))?
        .to_string();
    if ip.is_empty() {
        return Err(VoiceError::Protocol("discovery address is empty".to_string()));
    }

    let port = u16::from_be_bytes([packet[ADDRESS_END], packet[ADDRESS_END + 1]]);
    Ok(DiscoveredAddress { ip, port })
}

/// Run the discovery exchange on a connected socket
pub async fn discover(
    socket: &UdpSocket,
    ssrc: u32,
    wait: Duration,
) -> VoiceResult<DiscoveredAddress> {
    socket.send(&discovery_request(ssrc)).await?;

    let mut buf = [0u8; DISCOVERY_PACKET_LEN];
    let len = timeout(wait, socket.recv(&mut buf))
        .await
        .map_err(|_| VoiceError::Timeout("IP discovery"))??;

    let address = parse_discovery_response(&buf[..len])?;
    tracing::debug!(ssrc, ip = %address.ip, port = address.port, "Discovered external address");
    Ok(address)
}

#[cfg(test)]
pub(crate) fn discovery_response(ssrc: u32, ip: &str, port: u16) -> [u8; DISCOVERY_PACKET_LEN] {
    let mut packet = discovery_request(ssrc);
    packet[0..2].copy_from_slice(&RESPONSE_TYPE.to_be_bytes());
    packet[ADDRESS_START..ADDRESS_START + ip.len()].copy_from_slice(ip.as_bytes());
    packet[ADDRESS_END..].copy_from_slice(&port.to_be_bytes());
    packet
}
